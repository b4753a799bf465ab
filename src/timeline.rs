//! Lifecycle event log discipline and period reconstruction.
//!
//! For each `(camera, kind)` the log alternates start/stop in timestamp order,
//! with at most one trailing unmatched start (an open period). `append` keeps
//! that true even when a stop was never written (crash, killed process): a
//! stale open period is closed at the current time before the next start.

use serde::Serialize;

use crate::error::CameraError;
use crate::storage::{CameraStore, EventStore};
use crate::{now_ms, CameraEvent, EventAction, EventKind, TimestampMs};

/// A reconstructed interval during which a camera was running (or was the
/// active feed).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Period {
    pub start: TimestampMs,
    pub end: TimestampMs,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraTimeline {
    pub camera: String,
    pub active_periods: Vec<Period>,
    pub feeds: Vec<Period>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct TimeRange {
    pub min: TimestampMs,
    pub max: TimestampMs,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineReport {
    pub cameras: Vec<CameraTimeline>,
    pub range: TimeRange,
}

pub struct EventTimeline;

impl EventTimeline {
    /// Append a lifecycle event stamped with the current time.
    ///
    /// A start first closes any open period for `(camera_id, kind)`. A stop
    /// with no open period is not written. Returns the event written for
    /// `action`, if any.
    pub fn append<S: EventStore + ?Sized>(
        store: &mut S,
        camera_id: i64,
        kind: EventKind,
        action: EventAction,
    ) -> Result<Option<CameraEvent>, CameraError> {
        Self::append_at(store, camera_id, kind, action, now_ms())
    }

    pub fn append_at<S: EventStore + ?Sized>(
        store: &mut S,
        camera_id: i64,
        kind: EventKind,
        action: EventAction,
        at: TimestampMs,
    ) -> Result<Option<CameraEvent>, CameraError> {
        let last = store.last_event(camera_id, kind)?;
        let open_since = last
            .as_ref()
            .filter(|event| event.action == EventAction::Start)
            .map(|event| event.timestamp_ms);
        // Never write behind the previous event, even if the wall clock stepped back.
        let at = last.as_ref().map_or(at, |event| at.max(event.timestamp_ms));

        match action {
            EventAction::Start => {
                if let Some(since) = open_since {
                    store.insert_event(camera_id, kind, EventAction::Stop, at)?;
                    log::info!(
                        "camera #{}: open {} period since {} closed before new start",
                        camera_id,
                        kind,
                        since
                    );
                }
                Ok(Some(store.insert_event(camera_id, kind, EventAction::Start, at)?))
            }
            EventAction::Stop => {
                if open_since.is_none() {
                    log::debug!(
                        "camera #{}: {} stop without open period skipped",
                        camera_id,
                        kind
                    );
                    return Ok(None);
                }
                Ok(Some(store.insert_event(camera_id, kind, EventAction::Stop, at)?))
            }
        }
    }

    /// Fold ordered events into periods. A trailing unmatched start is
    /// reported as open until `window_end`. A stop with nothing open is
    /// ignored; a start while one is open restarts the candidate.
    pub fn periods(events: &[CameraEvent], window_end: TimestampMs) -> Vec<Period> {
        let mut periods = Vec::new();
        let mut current: Option<TimestampMs> = None;
        for event in events {
            match event.action {
                EventAction::Start => current = Some(event.timestamp_ms),
                EventAction::Stop => {
                    if let Some(start) = current.take() {
                        periods.push(Period {
                            start,
                            end: event.timestamp_ms,
                        });
                    }
                }
            }
        }
        if let Some(start) = current {
            periods.push(Period {
                start,
                end: window_end,
            });
        }
        periods
    }

    /// Periods of `kind` for one camera within `[from, to]`.
    pub fn camera_periods<S: EventStore + ?Sized>(
        store: &mut S,
        camera_id: i64,
        kind: EventKind,
        from: TimestampMs,
        to: TimestampMs,
    ) -> Result<Vec<Period>, CameraError> {
        let events = store.events_between(camera_id, kind, from, to)?;
        Ok(Self::periods(&events, to))
    }

    /// Running and feed periods for every configured camera, plus the span
    /// covered by all returned periods (`[from, to]` when there are none).
    pub fn report<S: CameraStore + EventStore + ?Sized>(
        store: &mut S,
        from: TimestampMs,
        to: TimestampMs,
    ) -> Result<TimelineReport, CameraError> {
        if to < from {
            return Err(CameraError::InvalidInput(format!(
                "timeline end {} is before start {}",
                to, from
            )));
        }

        let mut cameras = Vec::new();
        let mut min: Option<TimestampMs> = None;
        let mut max: Option<TimestampMs> = None;

        for camera in store.cameras()? {
            let active_periods =
                Self::camera_periods(store, camera.id, EventKind::Camera, from, to)?;
            let feeds = Self::camera_periods(store, camera.id, EventKind::Feed, from, to)?;

            for period in active_periods.iter().chain(feeds.iter()) {
                min = Some(min.map_or(period.start, |m| m.min(period.start)));
                max = Some(max.map_or(period.end, |m| m.max(period.end)));
            }

            cameras.push(CameraTimeline {
                camera: camera.name,
                active_periods,
                feeds,
            });
        }

        Ok(TimelineReport {
            cameras,
            range: TimeRange {
                min: min.unwrap_or(from),
                max: max.unwrap_or(to),
            },
        })
    }
}
