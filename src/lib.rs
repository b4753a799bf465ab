//! feedwatch
//!
//! Multi-camera frame acquisition with a crash-tolerant lifecycle timeline and
//! throttled inference dispatch.
//!
//! # Architecture
//!
//! - `ingest`: one `FrameSource` per running camera, each with a background
//!   acquisition loop writing a single-slot latest-frame mailbox.
//! - `registry`: `CameraRegistry` owns camera configuration lookups, the map of
//!   running sources, and the single active feed. Every lifecycle transition
//!   is written to the event log.
//! - `timeline`: append-only event log discipline and reconstruction of
//!   start/stop events into reportable periods.
//! - `dispatch` / `sampling`: drop-if-busy, drop-if-too-soon submission onto a
//!   fixed worker pool, and duty-cycle sampling in front of the detector.
//! - `pump`: the fixed-cadence read → submit loop with its health check.
//!
//! Storage sits behind the `CameraStore` / `EventStore` traits with SQLite and
//! in-memory implementations.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod config;
pub mod detect;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod pump;
pub mod registry;
pub mod sampling;
pub mod storage;
pub mod timeline;

pub use config::FeedwatchConfig;
pub use detect::{BoundingBox, Detection, Detector, StubDetector};
pub use dispatch::{Dispatcher, DispatchSettings, FrameProcessor, Submission};
pub use error::CameraError;
pub use frame::{Frame, FrameSlot};
pub use ingest::{FrameSource, SourceKind, SourceSettings};
pub use pump::{FeedSink, FramePump, PumpHandle, PumpSettings};
pub use registry::{
    CameraRegistry, CameraSeed, CameraStatus, ProbeSettings, StartOutcome, StopOutcome,
};
pub use sampling::{
    FrameOrigin, OverlayMode, ProcessedFrame, SamplingPolicy, SamplingSettings, SamplingStats,
};
pub use storage::{CameraStore, EventStore, InMemoryStore, SqliteStore, Store};
pub use timeline::{EventTimeline, Period, TimelineReport};

/// Milliseconds since the Unix epoch, UTC.
pub type TimestampMs = i64;

pub fn now_ms() -> TimestampMs {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as TimestampMs)
        .unwrap_or(0)
}

// -------------------- Cameras --------------------

/// A configured camera. The store owns the canonical row; the registry only
/// looks it up by name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Camera {
    pub id: i64,
    pub name: String,
    /// Stream URL, or `"0"` for the local capture device.
    pub source: String,
    pub tag: String,
}

/// Camera names are short local identifiers: 1..=50 characters of
/// `[A-Za-z0-9_.-]`, starting with a letter or digit.
pub fn validate_camera_name(name: &str) -> Result<(), CameraError> {
    static NAME_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = NAME_RE.get_or_init(|| {
        regex::Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]{0,49}$").expect("static camera name regex")
    });
    if !re.is_match(name) {
        return Err(CameraError::InvalidInput(format!(
            "camera name '{}' must match ^[A-Za-z0-9][A-Za-z0-9_.-]{{0,49}}$",
            name
        )));
    }
    Ok(())
}

// -------------------- Event Types --------------------

/// What a lifecycle event is about.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// The camera's acquisition was running.
    Camera,
    /// The camera was the active live feed.
    Feed,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Camera => "camera",
            EventKind::Feed => "feed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "camera" => Some(EventKind::Camera),
            "feed" => Some(EventKind::Feed),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventAction {
    Start,
    Stop,
}

impl EventAction {
    pub fn as_str(self) -> &'static str {
        match self {
            EventAction::Start => "start",
            EventAction::Stop => "stop",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "start" => Some(EventAction::Start),
            "stop" => Some(EventAction::Stop),
            _ => None,
        }
    }
}

impl fmt::Display for EventAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One append-only lifecycle record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraEvent {
    pub id: i64,
    pub camera_id: i64,
    pub kind: EventKind,
    pub action: EventAction,
    pub timestamp_ms: TimestampMs,
}
