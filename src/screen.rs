use anyhow::Result;

use crate::frame::Frame;
use crate::{NES_HEIGHT, NES_WIDTH};

/// Operator-facing view of the frames being processed.
pub trait Screen {
    /// Show a frame. Returns true when the operator asked to quit.
    fn show(&mut self, frame: &Frame) -> Result<bool>;

    fn set_status(&mut self, _status: &str) {}

    fn close(&mut self) {}
}

/// No-op screen for unattended runs
#[derive(Default)]
pub struct Headless;

impl Screen for Headless {
    fn show(&mut self, _frame: &Frame) -> Result<bool> {
        Ok(false)
    }
}

/// minifb window at 2× NES resolution; `Q` or closing the window quits.
pub struct Window {
    window: Option<minifb::Window>,
    title: String,
    buf: Vec<u32>,
}

impl Window {
    pub fn new(title: &str) -> Result<Self> {
        let window = minifb::Window::new(
            title,
            NES_WIDTH as usize,
            NES_HEIGHT as usize,
            minifb::WindowOptions {
                resize: true,
                scale: minifb::Scale::X2,
                ..Default::default()
            },
        )?;
        Ok(Self {
            window: Some(window),
            title: title.to_string(),
            buf: vec![0u32; (NES_WIDTH * NES_HEIGHT) as usize],
        })
    }
}

impl Screen for Window {
    fn show(&mut self, frame: &Frame) -> Result<bool> {
        let Some(window) = self.window.as_mut() else {
            return Ok(true);
        };
        frame.to_native().blit_to_u32(&mut self.buf);
        window.update_with_buffer(&self.buf, NES_WIDTH as usize, NES_HEIGHT as usize)?;
        Ok(!window.is_open() || window.is_key_pressed(minifb::Key::Q, minifb::KeyRepeat::No))
    }

    fn set_status(&mut self, status: &str) {
        if let Some(window) = self.window.as_mut() {
            window.set_title(&format!("{} — {status}", self.title));
        }
    }

    fn close(&mut self) {
        self.window = None;
    }
}
