//! Synthetic frame backend (`stub://`).
//!
//! - `stub://<label>`: endless frames at the configured rate
//! - `stub://dead`: fails before the first frame (unresponsive camera)
//! - `stub://limit/<n>`: `n` frames, then fails (stream death)

use anyhow::{anyhow, Result};
use std::time::Duration;

use super::{Grabber, SourceSettings};
use crate::frame::Frame;

pub(crate) const STUB_SCHEME: &str = "stub://";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyntheticMode {
    Endless,
    Dead,
    Limit(u64),
}

impl SyntheticMode {
    pub(crate) fn parse(rest: &str) -> Self {
        if rest == "dead" {
            return SyntheticMode::Dead;
        }
        if let Some(n) = rest.strip_prefix("limit/") {
            if let Ok(n) = n.parse() {
                return SyntheticMode::Limit(n);
            }
        }
        SyntheticMode::Endless
    }
}

pub(crate) struct SyntheticGrabber {
    mode: SyntheticMode,
    width: u32,
    height: u32,
    interval: Duration,
    /// Simulated scene state; shifts every 50 frames.
    scene_state: u8,
}

impl SyntheticGrabber {
    pub(crate) fn new(mode: SyntheticMode, settings: &SourceSettings) -> Self {
        let interval = if settings.target_fps == 0 {
            Duration::from_millis(40)
        } else {
            Duration::from_millis(u64::from(1000 / settings.target_fps).max(1))
        };
        Self {
            mode,
            width: settings.width,
            height: settings.height,
            interval,
            scene_state: 0,
        }
    }

    fn generate_pixels(&mut self, seq: u64) -> Vec<u8> {
        if seq % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        let mut pixels = vec![0u8; Frame::byte_len_for(self.width, self.height)];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + seq + self.scene_state as u64) % 256) as u8;
        }
        pixels
    }
}

impl Grabber for SyntheticGrabber {
    fn grab(&mut self, seq: u64) -> Result<Frame> {
        match self.mode {
            SyntheticMode::Dead => return Err(anyhow!("synthetic source is dead")),
            SyntheticMode::Limit(n) if seq > n => {
                return Err(anyhow!("synthetic source ended after {} frames", n))
            }
            _ => {}
        }
        std::thread::sleep(self.interval);
        let pixels = self.generate_pixels(seq);
        Ok(Frame::new(pixels, self.width, self.height, seq))
    }
}
