use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::frame::{Frame, Observation};

// =============================================================================
// State Recognition Seam
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Recognition {
    /// `None` when the recognizer could not place the frame
    pub label: Option<usize>,
    pub quality: f32,
}

impl Recognition {
    pub const UNKNOWN: Recognition = Recognition {
        label: None,
        quality: 0.0,
    };
}

/// Maps a (native-size) frame to a game-state label.
pub trait StateRecognizer {
    fn recognize(&mut self, frame: &Frame) -> Recognition;
}

/// Per-frame labels produced ahead of time by an offline recognizer.
///
/// Stored as a JSON array with one integer per video frame; `-1` marks frames
/// the recognizer could not label.
pub struct LabelTrack {
    labels: Vec<Option<usize>>,
    cursor: usize,
}

impl LabelTrack {
    pub fn new(raw: &[i64]) -> Self {
        Self {
            labels: raw
                .iter()
                .map(|&l| usize::try_from(l).ok())
                .collect(),
            cursor: 0,
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Failed to open label track: {}", path.display()))?;
        let raw: Vec<i64> = serde_json::from_reader(std::io::BufReader::new(file))
            .with_context(|| format!("Failed to parse label track: {}", path.display()))?;
        Ok(Self::new(&raw))
    }

    /// `<video>.labels.json` next to the video
    pub fn sidecar_path(video: &Path) -> PathBuf {
        let mut name = video.as_os_str().to_owned();
        name.push(".labels.json");
        PathBuf::from(name)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

impl StateRecognizer for LabelTrack {
    fn recognize(&mut self, _frame: &Frame) -> Recognition {
        let label = self.labels.get(self.cursor).copied().flatten();
        self.cursor += 1;
        match label {
            Some(_) => Recognition {
                label,
                quality: 1.0,
            },
            None => Recognition::UNKNOWN,
        }
    }
}

// =============================================================================
// Transition Filter
// =============================================================================

/// Training example: the frame before a state change, labelled with the new state
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub observation: Observation,
    pub label: usize,
}

/// Emits a [`Transition`] only when a recognised, non-excluded label differs
/// from the last recognised one. Unknown frames never emit and never count as
/// a state, but still become the prior observation for the next frame.
pub struct TransitionExtractor {
    excluded: HashSet<usize>,
    previous: Option<Observation>,
    last_label: Option<usize>,
}

impl TransitionExtractor {
    pub fn new(excluded: impl IntoIterator<Item = usize>) -> Self {
        Self {
            excluded: excluded.into_iter().collect(),
            previous: None,
            last_label: None,
        }
    }

    /// Forget the previous frame, e.g. between videos
    pub fn reset(&mut self) {
        self.previous = None;
        self.last_label = None;
    }

    pub fn step(&mut self, observation: Observation, label: Option<usize>) -> Option<Transition> {
        let previous = self.previous.replace(observation);
        let label = label?;
        let changed = self.last_label != Some(label);
        self.last_label = Some(label);
        match previous {
            Some(prior) if changed && !self.excluded.contains(&label) => Some(Transition {
                observation: prior,
                label,
            }),
            _ => None,
        }
    }

    /// Observe and label one raw video frame
    pub fn process<R: StateRecognizer>(
        &mut self,
        frame: &Frame,
        recognizer: &mut R,
    ) -> (Option<Transition>, Recognition) {
        let native = frame.to_native();
        let recognition = recognizer.recognize(&native);
        let observation = Observation::from_frame(&native);
        (self.step(observation, recognition.label), recognition)
    }
}
