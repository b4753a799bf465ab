//! Inference collaborator boundary.
//!
//! The detector itself is opaque to the rest of the crate: it takes a frame and
//! returns zero or more detections, may be slow, and may fail. Failures are
//! contained per call by the dispatcher.

mod backend;
mod backends;
mod result;

pub use backend::Detector;
pub use backends::StubDetector;
pub use result::{BoundingBox, Detection};
