//! Error kinds returned by registry operations.
//!
//! Registry callers (the API layer) match on these to pick a response; the
//! `Storage` variant carries whatever the backing store reported.

use std::fmt;

#[derive(Debug)]
pub enum CameraError {
    /// No camera configuration with this name.
    NotFound(String),
    /// A camera with this name already exists.
    Conflict(String),
    /// The readiness probe ran out of attempts without receiving a frame.
    NotResponding(String),
    /// Feed requested for a camera that is not currently started.
    NotRunning(String),
    /// `stop_feed` called while no feed is active.
    NoActiveFeed,
    /// Request rejected before touching any state.
    InvalidInput(String),
    /// Configuration or event store failure.
    Storage(anyhow::Error),
}

impl fmt::Display for CameraError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CameraError::NotFound(name) => write!(f, "camera '{}' not found", name),
            CameraError::Conflict(name) => write!(f, "camera '{}' already exists", name),
            CameraError::NotResponding(name) => write!(f, "camera '{}' not responding", name),
            CameraError::NotRunning(name) => write!(f, "camera '{}' is not running", name),
            CameraError::NoActiveFeed => write!(f, "no feed is active"),
            CameraError::InvalidInput(reason) => write!(f, "invalid input: {}", reason),
            CameraError::Storage(err) => write!(f, "storage error: {:#}", err),
        }
    }
}

impl std::error::Error for CameraError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CameraError::Storage(err) => Some(&**err),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for CameraError {
    fn from(err: anyhow::Error) -> Self {
        CameraError::Storage(err)
    }
}

impl From<rusqlite::Error> for CameraError {
    fn from(err: rusqlite::Error) -> Self {
        CameraError::Storage(anyhow::Error::new(err))
    }
}

/// True when a SQLite error is a UNIQUE/constraint violation.
pub(crate) fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}
