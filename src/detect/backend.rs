use anyhow::Result;

use super::result::Detection;
use crate::frame::Frame;

/// Detector trait.
///
/// Shared by every worker in the dispatch pool, so implementations take
/// `&self` and keep any mutable state behind their own locks.
pub trait Detector: Send + Sync {
    /// Detector identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame.
    ///
    /// Implementations must treat the pixels as read-only and must not retain
    /// the frame after returning.
    fn detect(&self, frame: &Frame) -> Result<Vec<Detection>>;

    /// Optional warm-up hook, called once before the first frame.
    fn warm_up(&self) -> Result<()> {
        Ok(())
    }
}
