use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::detect::backend::Detector;
use crate::detect::result::{BoundingBox, Detection};
use crate::frame::Frame;

/// Stub detector for demos and tests.
///
/// Derives one detection per frame from a hash of the pixels, so identical
/// frames always produce identical output. Frames whose digest starts with a
/// byte below `skip_below` produce nothing.
#[derive(Clone, Debug)]
pub struct StubDetector {
    skip_below: u8,
}

impl StubDetector {
    pub fn new() -> Self {
        Self { skip_below: 0 }
    }

    /// Emit nothing for roughly `skip_below / 256` of frames.
    pub fn with_empty_fraction(skip_below: u8) -> Self {
        Self { skip_below }
    }
}

impl Default for StubDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl Detector for StubDetector {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&self, frame: &Frame) -> Result<Vec<Detection>> {
        let digest: [u8; 32] = Sha256::digest(frame.pixels()).into();
        if digest[0] < self.skip_below {
            return Ok(Vec::new());
        }

        let unit = |b: u8| f32::from(b) / 255.0;
        let x = unit(digest[1]) * 0.5;
        let y = unit(digest[2]) * 0.5;
        Ok(vec![Detection {
            bbox: BoundingBox {
                x,
                y,
                w: 0.1 + unit(digest[3]) * 0.4,
                h: 0.1 + unit(digest[4]) * 0.4,
            },
            score: 0.5 + unit(digest[5]) * 0.5,
            label: "object".to_string(),
        }])
    }
}
