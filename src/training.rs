use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::emulator::CancelToken;
use crate::extract::{LabelTrack, StateRecognizer, Transition, TransitionExtractor};
use crate::frame::Observation;
use crate::model::{FitHistory, Model};
use crate::screen::Screen;
use crate::video::{FfmpegVideo, VideoSource};

// =============================================================================
// Training Settings
// =============================================================================

#[derive(Debug, Clone)]
pub struct TrainConfig {
    /// Transitions per fit call
    pub batch_size: usize,
    pub epochs: usize,
    pub model_path: PathBuf,
    pub log_dir: PathBuf,
    pub log_name: String,
    /// Labels never used as transition targets
    pub excluded: Vec<usize>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            epochs: 50,
            model_path: PathBuf::from("models/pilot.safetensors"),
            log_dir: PathBuf::from("logs"),
            log_name: "training".to_string(),
            excluded: Vec::new(),
        }
    }
}

// =============================================================================
// Batch
// =============================================================================

pub struct Batch {
    observations: Vec<Observation>,
    labels: Vec<usize>,
    capacity: usize,
}

impl Batch {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "batch capacity must be positive");
        Self {
            observations: Vec::with_capacity(capacity),
            labels: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, transition: Transition) {
        self.observations.push(transition.observation);
        self.labels.push(transition.label);
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.observations.clear();
        self.labels.clear();
    }

    /// Move the contents out, leaving the batch empty
    pub fn take(&mut self) -> (Vec<Observation>, Vec<usize>) {
        (
            std::mem::take(&mut self.observations),
            std::mem::take(&mut self.labels),
        )
    }
}

// =============================================================================
// Training Log
// =============================================================================

/// One fit call, as written to the training log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitRecord {
    pub timestamp: String,
    pub accuracy: Vec<f32>,
    pub loss: Vec<f32>,
    pub labels: Vec<usize>,
    pub batch_size: usize,
    pub epochs: usize,
    pub video: String,
}

impl FitRecord {
    pub fn new(video: &str, history: FitHistory, labels: &[usize], batch_size: usize, epochs: usize) -> Self {
        Self {
            timestamp: chrono::Local::now().to_rfc3339(),
            accuracy: history.accuracy,
            loss: history.loss,
            labels: labels.to_vec(),
            batch_size,
            epochs,
            video: video.to_string(),
        }
    }
}

/// Append-only JSON-lines log, one [`FitRecord`] per line.
pub struct TrainingLog {
    path: PathBuf,
}

impl TrainingLog {
    pub fn open(dir: &Path, name: &str) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
        Ok(Self {
            path: dir.join(format!("{name}.jsonl")),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &FitRecord) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open training log: {}", self.path.display()))?;
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    pub fn records(&self) -> Result<Vec<FitRecord>> {
        let file = File::open(&self.path)?;
        BufReader::new(file)
            .lines()
            .map(|line| -> Result<FitRecord> { Ok(serde_json::from_str(&line?)?) })
            .collect()
    }
}

// =============================================================================
// Epoch Extension
// =============================================================================

/// Decides after each fit whether to keep training on the same batch.
pub trait EpochExtension {
    /// Additional epochs to run, or `None` to move on
    fn additional_epochs(&mut self, last: &FitRecord) -> Option<usize>;
}

/// Never extends
pub struct NoExtension;

impl EpochExtension for NoExtension {
    fn additional_epochs(&mut self, _last: &FitRecord) -> Option<usize> {
        None
    }
}

/// Asks the operator on the terminal after every fit
pub struct StdinPrompt<R> {
    input: R,
}

impl StdinPrompt<std::io::StdinLock<'static>> {
    pub fn stdin() -> Self {
        Self::new(std::io::stdin().lock())
    }
}

impl<R: BufRead> StdinPrompt<R> {
    pub fn new(input: R) -> Self {
        Self { input }
    }
}

/// Positive integer extends; anything else stops
pub fn parse_epochs(answer: &str) -> Option<usize> {
    answer.trim().parse::<usize>().ok().filter(|&n| n > 0)
}

impl<R: BufRead> EpochExtension for StdinPrompt<R> {
    fn additional_epochs(&mut self, last: &FitRecord) -> Option<usize> {
        eprint!(
            "\nloss {:.4}, accuracy {:.2}%. More epochs? [empty to continue]: ",
            last.loss.last().copied().unwrap_or(f32::NAN),
            last.accuracy.last().copied().unwrap_or(0.0) * 100.0
        );
        let mut answer = String::new();
        match self.input.read_line(&mut answer) {
            Ok(0) | Err(_) => None,
            Ok(_) => parse_epochs(&answer),
        }
    }
}

// =============================================================================
// Progress
// =============================================================================

/// Point-in-time training progress for one video
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    pub frame: u64,
    pub total_frames: Option<u64>,
    pub percent: Option<f32>,
    pub mean_quality: f32,
    pub mean_frame_time: Duration,
}

impl fmt::Display for ProgressSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const WIDTH: usize = 25;
        match self.percent {
            Some(percent) => {
                let done = ((percent / 100.0) * WIDTH as f32) as usize;
                let done = done.min(WIDTH);
                write!(
                    f,
                    "[{}>{}] {percent:5.1}%",
                    "#".repeat(done),
                    ".".repeat(WIDTH - done)
                )?;
            }
            None => write!(f, "frame {}", self.frame)?,
        }
        write!(
            f,
            " quality {:.2} {:.1}ms/frame",
            self.mean_quality,
            self.mean_frame_time.as_secs_f64() * 1000.0
        )
    }
}

pub struct ProgressTracker {
    total_frames: Option<u64>,
    frames: u64,
    quality_sum: f64,
    elapsed: Duration,
    last: Instant,
}

impl ProgressTracker {
    pub fn new(total_frames: Option<u64>) -> Self {
        Self {
            total_frames: total_frames.filter(|&t| t > 0),
            frames: 0,
            quality_sum: 0.0,
            elapsed: Duration::ZERO,
            last: Instant::now(),
        }
    }

    /// Count one frame, timed since the previous update
    pub fn update(&mut self, quality: f32) -> ProgressSnapshot {
        let now = Instant::now();
        let frame_time = now.duration_since(self.last);
        self.last = now;
        self.record(quality, frame_time)
    }

    pub fn record(&mut self, quality: f32, frame_time: Duration) -> ProgressSnapshot {
        self.frames += 1;
        self.quality_sum += f64::from(quality);
        self.elapsed += frame_time;
        let frames = self.frames;
        ProgressSnapshot {
            frame: frames,
            total_frames: self.total_frames,
            percent: self
                .total_frames
                .map(|total| (frames.min(total) as f32 / total as f32) * 100.0),
            mean_quality: (self.quality_sum / frames as f64) as f32,
            mean_frame_time: mean_frame_time(self.elapsed, frames),
        }
    }
}

fn mean_frame_time(elapsed: Duration, frames: u64) -> Duration {
    elapsed.div_f64(frames as f64)
}

// =============================================================================
// Training Controller
// =============================================================================

/// What happened while training on one video
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VideoSummary {
    pub frames: u64,
    pub transitions: u64,
    pub fits: u64,
    pub interrupted: bool,
}

pub struct TrainingController<M: Model, E: EpochExtension> {
    model: M,
    extension: E,
    config: TrainConfig,
    log: TrainingLog,
    batch: Batch,
    extractor: TransitionExtractor,
    interrupt: CancelToken,
}

impl<M: Model, E: EpochExtension> TrainingController<M, E> {
    pub fn new(model: M, extension: E, config: TrainConfig) -> Result<Self> {
        let log = TrainingLog::open(&config.log_dir, &config.log_name)?;
        Ok(Self {
            batch: Batch::new(config.batch_size.max(1)),
            extractor: TransitionExtractor::new(config.excluded.iter().copied()),
            interrupt: CancelToken::new(),
            model,
            extension,
            config,
            log,
        })
    }

    /// Cancelling this token stops the current video the same way an
    /// operator quit does. It is re-armed once the stop is handled.
    pub fn interrupt(&self) -> CancelToken {
        self.interrupt.clone()
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn log(&self) -> &TrainingLog {
        &self.log
    }

    pub fn into_model(self) -> M {
        self.model
    }

    /// Train on every video in order, saving the model after each one.
    /// Labels for `video` are read from its sidecar label track.
    pub fn run<S: Screen + ?Sized>(&mut self, videos: &[PathBuf], screen: &mut S) -> Result<Vec<VideoSummary>> {
        let mut summaries = Vec::with_capacity(videos.len());
        for path in videos {
            eprintln!("Starting training on {}", path.display());
            let mut video = FfmpegVideo::open(path)?;
            let mut labels = LabelTrack::load(LabelTrack::sidecar_path(path))?;
            let name = path.to_string_lossy();
            let summary = self.train_video(&name, &mut video, &mut labels, screen)?;
            if summary.interrupted {
                eprintln!("\nInterrupted by operator.");
            }
            eprintln!(
                "\nFinished {}: {} frames, {} transitions, {} fits",
                path.display(),
                summary.frames,
                summary.transitions,
                summary.fits
            );
            self.model.save(&self.config.model_path)?;
            summaries.push(summary);
        }
        screen.close();
        Ok(summaries)
    }

    /// Stream one video through the extractor, fitting whenever the batch
    /// fills and once more at end of stream. An operator quit or a cancelled
    /// interrupt token drops the partial batch.
    pub fn train_video<V, R, S>(
        &mut self,
        name: &str,
        video: &mut V,
        recognizer: &mut R,
        screen: &mut S,
    ) -> Result<VideoSummary>
    where
        V: VideoSource,
        R: StateRecognizer,
        S: Screen + ?Sized,
    {
        self.extractor.reset();
        self.batch.clear();
        let mut progress = ProgressTracker::new(video.frame_count());
        let mut summary = VideoSummary::default();

        while let Some(frame) = video.next_frame()? {
            summary.frames += 1;
            let (transition, recognition) = self.extractor.process(&frame, recognizer);
            if let Some(transition) = transition {
                summary.transitions += 1;
                self.batch.push(transition);
                if self.batch.is_full() {
                    summary.fits += self.flush(name)?;
                }
            }

            let snapshot = progress.update(recognition.quality);
            let status = format!("{snapshot} {}/{}", self.batch.len(), self.batch.capacity());
            eprint!("\r{status}");
            screen.set_status(&status);
            if screen.show(&frame)? || self.interrupt.is_cancelled() {
                self.interrupt.reset();
                tracing::info!(video = name, dropped = self.batch.len(), "training interrupted");
                self.batch.clear();
                summary.interrupted = true;
                return Ok(summary);
            }
        }

        if !self.batch.is_empty() {
            summary.fits += self.flush(name)?;
        }
        Ok(summary)
    }

    /// Fit on the current batch, then as long as the extension asks for more.
    /// Returns the number of fit calls.
    fn flush(&mut self, video: &str) -> Result<u64> {
        let (observations, labels) = self.batch.take();
        let mut epochs = self.config.epochs;
        let mut fits = 0;
        loop {
            let history = self
                .model
                .fit(&observations, &labels, self.config.batch_size, epochs)
                .context("Model fit failed")?;
            fits += 1;
            let record = FitRecord::new(video, history, &labels, self.config.batch_size, epochs);
            tracing::info!(
                samples = labels.len(),
                epochs,
                loss = record.loss.last().copied().unwrap_or(f32::NAN),
                accuracy = record.accuracy.last().copied().unwrap_or(0.0),
                "fit complete"
            );
            self.log.append(&record)?;
            match self.extension.additional_epochs(&record) {
                Some(more) if more > 0 => epochs = more,
                _ => break,
            }
        }
        Ok(fits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Frame, RollingWindow};
    use crate::{NES_HEIGHT, NES_WIDTH};
    use std::collections::VecDeque;

    struct FrameList(VecDeque<Frame>);

    impl FrameList {
        fn blank(n: usize) -> Self {
            let frame = Frame::new(image::RgbImage::new(NES_WIDTH, NES_HEIGHT));
            Self((0..n).map(|_| frame.clone()).collect())
        }
    }

    impl VideoSource for FrameList {
        fn next_frame(&mut self) -> Result<Option<Frame>> {
            Ok(self.0.pop_front())
        }

        fn frame_count(&self) -> Option<u64> {
            Some(self.0.len() as u64)
        }
    }

    #[derive(Default)]
    struct RecordingModel {
        /// (samples, epochs) per fit call
        fits: Vec<(usize, usize)>,
    }

    impl Model for RecordingModel {
        fn num_classes(&self) -> usize {
            8
        }

        fn predict(&self, _: &RollingWindow) -> Result<Vec<f32>> {
            Ok(vec![0.125; 8])
        }

        fn fit(&mut self, obs: &[Observation], labels: &[usize], _: usize, epochs: usize) -> Result<FitHistory> {
            assert_eq!(obs.len(), labels.len());
            self.fits.push((labels.len(), epochs));
            Ok(FitHistory {
                loss: vec![1.0; epochs],
                accuracy: vec![0.5; epochs],
            })
        }

        fn save(&self, _: &Path) -> Result<()> {
            Ok(())
        }
    }

    struct Answers(VecDeque<Option<usize>>);

    impl EpochExtension for Answers {
        fn additional_epochs(&mut self, _: &FitRecord) -> Option<usize> {
            self.0.pop_front().flatten()
        }
    }

    struct Headless;

    impl Screen for Headless {
        fn show(&mut self, _: &Frame) -> Result<bool> {
            Ok(false)
        }
    }

    struct QuitAfter(usize);

    impl Screen for QuitAfter {
        fn show(&mut self, _: &Frame) -> Result<bool> {
            if self.0 == 0 {
                return Ok(true);
            }
            self.0 -= 1;
            Ok(false)
        }
    }

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("platformer-pilot-train-{}-{name}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    fn controller<E: EpochExtension>(name: &str, batch_size: usize, extension: E) -> TrainingController<RecordingModel, E> {
        let config = TrainConfig {
            batch_size,
            epochs: 3,
            log_dir: scratch(name),
            log_name: "fits".to_string(),
            ..TrainConfig::default()
        };
        TrainingController::new(RecordingModel::default(), extension, config).unwrap()
    }

    /// Label sequence with a change on every frame: 0,1,0,1,...
    fn alternating(n: usize) -> LabelTrack {
        let raw: Vec<i64> = (0..n as i64).map(|i| i % 2).collect();
        LabelTrack::new(&raw)
    }

    #[test]
    fn full_batches_then_remainder_at_end_of_stream() {
        let mut train = controller("remainder", 4, NoExtension);
        // 10 frames → 9 transitions → fits of 4, 4, 1
        let summary = train
            .train_video("clip", &mut FrameList::blank(10), &mut alternating(10), &mut Headless)
            .unwrap();
        assert_eq!(summary, VideoSummary { frames: 10, transitions: 9, fits: 3, interrupted: false });
        assert_eq!(train.model().fits, vec![(4, 3), (4, 3), (1, 3)]);
    }

    #[test]
    fn exact_multiple_has_no_trailing_fit() {
        let mut train = controller("exact", 3, NoExtension);
        train
            .train_video("clip", &mut FrameList::blank(7), &mut alternating(7), &mut Headless)
            .unwrap();
        assert_eq!(train.model().fits, vec![(3, 3), (3, 3)]);
    }

    #[test]
    fn no_transitions_means_no_fit() {
        let mut train = controller("static", 4, NoExtension);
        let summary = train
            .train_video("clip", &mut FrameList::blank(5), &mut LabelTrack::new(&[2; 5]), &mut Headless)
            .unwrap();
        assert_eq!(summary.fits, 0);
        assert!(train.model().fits.is_empty());
    }

    #[test]
    fn extension_refits_same_batch_and_logs_each_fit() {
        let mut train = controller("extend", 2, Answers(VecDeque::from([Some(5), Some(1), None])));
        train
            .train_video("clip", &mut FrameList::blank(3), &mut alternating(3), &mut Headless)
            .unwrap();
        assert_eq!(train.model().fits, vec![(2, 3), (2, 5), (2, 1)]);

        let records = train.log().records().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[1].epochs, 5);
        assert_eq!(records[1].labels, vec![1, 0]);
        assert_eq!(records[2].loss.len(), 1);
        assert!(records.iter().all(|r| r.video == "clip" && r.batch_size == 2));
    }

    #[test]
    fn operator_quit_drops_partial_batch() {
        let mut train = controller("quit", 4, NoExtension);
        let summary = train
            .train_video("clip", &mut FrameList::blank(10), &mut alternating(10), &mut QuitAfter(6))
            .unwrap();
        assert!(summary.interrupted);
        // 6 transitions seen: one full batch fitted, the other two dropped
        assert_eq!(train.model().fits, vec![(4, 3)]);
    }

    struct CancelAfter {
        token: CancelToken,
        frames: usize,
    }

    impl Screen for CancelAfter {
        fn show(&mut self, _: &Frame) -> Result<bool> {
            self.frames = self.frames.saturating_sub(1);
            if self.frames == 0 {
                self.token.cancel();
            }
            Ok(false)
        }
    }

    #[test]
    fn interrupt_token_stops_video_and_rearms() {
        let mut train = controller("interrupt", 4, NoExtension);
        let token = train.interrupt();
        let mut screen = CancelAfter { token: token.clone(), frames: 7 };
        let summary = train
            .train_video("clip", &mut FrameList::blank(10), &mut alternating(10), &mut screen)
            .unwrap();
        assert!(summary.interrupted);
        assert_eq!(summary.frames, 7);
        // 6 transitions seen: one full batch fitted, the other two dropped
        assert_eq!(train.model().fits, vec![(4, 3)]);
        assert!(!token.is_cancelled());

        let summary = train
            .train_video("next", &mut FrameList::blank(5), &mut alternating(5), &mut Headless)
            .unwrap();
        assert!(!summary.interrupted);
        assert_eq!(summary.frames, 5);
        assert_eq!(train.model().fits, vec![(4, 3), (4, 3)]);
    }

    #[test]
    fn prompt_accepts_only_positive_integers() {
        assert_eq!(parse_epochs("10\n"), Some(10));
        assert_eq!(parse_epochs(" 3 "), Some(3));
        assert_eq!(parse_epochs("\n"), None);
        assert_eq!(parse_epochs("0"), None);
        assert_eq!(parse_epochs("more"), None);
        assert_eq!(parse_epochs("-2"), None);

        let record = FitRecord::new("clip", FitHistory::default(), &[], 1, 1);
        let mut prompt = StdinPrompt::new("7\nnope\n".as_bytes());
        assert_eq!(prompt.additional_epochs(&record), Some(7));
        assert_eq!(prompt.additional_epochs(&record), None);
        assert_eq!(prompt.additional_epochs(&record), None);
    }

    #[test]
    fn progress_snapshot_averages() {
        let mut progress = ProgressTracker::new(Some(4));
        progress.record(1.0, Duration::from_secs(1));
        let snap = progress.record(0.0, Duration::from_secs(3));
        assert_eq!(snap.frame, 2);
        assert_eq!(snap.percent, Some(50.0));
        assert_eq!(snap.mean_quality, 0.5);
        assert_eq!(snap.mean_frame_time, Duration::from_secs(2));

        let unknown = ProgressTracker::new(None).record(1.0, Duration::ZERO);
        assert_eq!(unknown.percent, None);
        assert!(unknown.to_string().starts_with("frame 1"));
    }

    #[test]
    fn mean_frame_time_handles_long_runs() {
        let frames = 1u64 << 32;
        let elapsed = Duration::from_secs(1 << 32);
        assert_eq!(mean_frame_time(elapsed, frames), Duration::from_secs(1));
        assert_eq!(mean_frame_time(elapsed * 3, frames), Duration::from_secs(3));
    }
}
