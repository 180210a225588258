use image::imageops::{self, FilterType};
use image::{GrayImage, RgbImage};
use std::borrow::Cow;
use std::collections::VecDeque;

use crate::{DARK_THRESHOLD, NES_HEIGHT, NES_WIDTH, OBS_DIM, OBS_HEIGHT, OBS_WIDTH};

// =============================================================================
// Frame
// =============================================================================

/// One decoded screen image.
#[derive(Debug, Clone)]
pub struct Frame {
    image: RgbImage,
}

impl Frame {
    pub fn new(image: RgbImage) -> Self {
        Self { image }
    }

    /// Wrap a packed rgb24 buffer; `None` if the length does not match.
    pub fn from_rgb24(width: u32, height: u32, data: Vec<u8>) -> Option<Self> {
        RgbImage::from_raw(width, height, data).map(Self::new)
    }

    /// Decode an encoded image (PNG, BMP, JPEG) from memory
    pub fn decode(bytes: &[u8]) -> image::ImageResult<Self> {
        Ok(Self::new(image::load_from_memory(bytes)?.to_rgb8()))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    /// Frame rescaled to the NES native 256×240; borrowed if it already is
    pub fn to_native(&self) -> Cow<'_, Frame> {
        if self.width() == NES_WIDTH && self.height() == NES_HEIGHT {
            return Cow::Borrowed(self);
        }
        Cow::Owned(Frame::new(imageops::resize(
            &self.image,
            NES_WIDTH,
            NES_HEIGHT,
            FilterType::Nearest,
        )))
    }

    /// Pack pixels as 0RGB u32 for minifb
    pub fn blit_to_u32(&self, out: &mut Vec<u32>) {
        out.clear();
        out.extend(
            self.image
                .pixels()
                .map(|p| ((p[0] as u32) << 16) | ((p[1] as u32) << 8) | (p[2] as u32)),
        );
    }
}

// =============================================================================
// Observation
// =============================================================================

/// Grayscale, downsampled, dark-clamped view of a frame (`OBS_WIDTH`×`OBS_HEIGHT`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation(Vec<u8>);

impl Observation {
    pub fn from_frame(frame: &Frame) -> Self {
        let native = frame.to_native();
        let gray: GrayImage = imageops::grayscale(native.image());
        let small = imageops::resize(&gray, OBS_WIDTH, OBS_HEIGHT, FilterType::Triangle);
        let pixels = small
            .into_raw()
            .into_iter()
            .map(|v| if v <= DARK_THRESHOLD { 0 } else { v })
            .collect();
        Self(pixels)
    }

    pub fn zeros() -> Self {
        Self(vec![0; OBS_DIM])
    }

    /// Build from raw intensities; `None` unless exactly `OBS_DIM` values
    pub fn from_pixels(pixels: Vec<u8>) -> Option<Self> {
        (pixels.len() == OBS_DIM).then_some(Self(pixels))
    }

    pub fn pixels(&self) -> &[u8] {
        &self.0
    }

    /// Intensities scaled into [0, 1]
    pub fn normalized(&self) -> impl Iterator<Item = f32> + '_ {
        self.0.iter().map(|&v| v as f32 / 255.0)
    }
}

// =============================================================================
// Rolling Window
// =============================================================================

/// FIFO of the most recent observations, bounded to `capacity`.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    items: VecDeque<Observation>,
    capacity: usize,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "window capacity must be positive");
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Window pre-filled with `capacity - 1` blank observations, so the first
    /// real frame completes it.
    pub fn primed(capacity: usize) -> Self {
        let mut window = Self::new(capacity);
        for _ in 1..capacity {
            window.items.push_back(Observation::zeros());
        }
        window
    }

    pub fn push(&mut self, obs: Observation) {
        if self.items.len() >= self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(obs);
    }

    pub fn evict_oldest(&mut self) -> Option<Observation> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &Observation> {
        self.items.iter()
    }

    /// Oldest-first, normalized, flattened to `len * OBS_DIM` values
    pub fn to_normalized_vec(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.items.len() * OBS_DIM);
        for obs in &self.items {
            out.extend(obs.normalized());
        }
        out
    }
}
