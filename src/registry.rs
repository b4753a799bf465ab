//! Camera lifecycle: configuration lookups, the running-source map, and the
//! single active feed.
//!
//! Lock order is `active_feed` → `streams` → `store`. No lock is held while a
//! source is probed or joined. Lifecycle events are appended while the lock
//! guarding the state they describe is held.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::error::CameraError;
use crate::ingest::{FrameSource, SourceSettings};
use crate::storage::Store;
use crate::timeline::{EventTimeline, TimelineReport};
use crate::{validate_camera_name, Camera, CameraEvent, EventAction, EventKind, TimestampMs};

const DEFAULT_PROBE_ATTEMPTS: u32 = 7;
const DEFAULT_PROBE_BACKOFF: Duration = Duration::from_millis(500);

/// Readiness probe for a freshly started source.
#[derive(Clone, Debug)]
pub struct ProbeSettings {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_PROBE_ATTEMPTS,
            backoff: DEFAULT_PROBE_BACKOFF,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    NotRunning,
}

pub type StartResult = Result<StartOutcome, CameraError>;
pub type StopResult = Result<StopOutcome, CameraError>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CameraStatus {
    #[serde(flatten)]
    pub camera: Camera,
    pub running: bool,
}

/// A camera to register at startup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CameraSeed {
    pub name: String,
    pub source: String,
    pub tag: String,
}

pub struct CameraRegistry {
    store: Mutex<Box<dyn Store>>,
    streams: Mutex<HashMap<String, Arc<FrameSource>>>,
    active_feed: Mutex<Option<String>>,
    source_settings: SourceSettings,
    probe: ProbeSettings,
}

impl CameraRegistry {
    pub fn new(
        store: Box<dyn Store>,
        source_settings: SourceSettings,
        probe: ProbeSettings,
    ) -> Self {
        Self {
            store: Mutex::new(store),
            streams: Mutex::new(HashMap::new()),
            active_feed: Mutex::new(None),
            source_settings,
            probe,
        }
    }

    // -------------------- Configuration --------------------

    pub fn get(&self, name: &str) -> Result<Camera, CameraError> {
        lock(&self.store)
            .camera(name)?
            .ok_or_else(|| CameraError::NotFound(name.to_string()))
    }

    /// Persist a new camera and start it.
    ///
    /// If the camera does not come up, the configuration row is kept so the
    /// camera can be started later, and the start error is returned.
    pub fn add(&self, name: &str, source: &str, tag: &str) -> Result<Camera, CameraError> {
        let (name, source, tag) = (name.trim(), source.trim(), tag.trim());
        if name.is_empty() || source.is_empty() || tag.is_empty() {
            return Err(CameraError::InvalidInput(
                "name, source and tag are required".to_string(),
            ));
        }
        validate_camera_name(name)?;

        let camera = lock(&self.store).insert_camera(name, source, tag)?;
        log::info!("camera {} added (tag {})", name, tag);

        self.start(name)?;
        Ok(camera)
    }

    /// Stop the camera if it runs, then delete its configuration and events.
    pub fn remove(&self, name: &str) -> Result<(), CameraError> {
        let camera = self.get(name)?;
        self.stop(name)?;
        lock(&self.store).delete_camera(camera.id)?;
        log::info!("camera {} removed", name);
        Ok(())
    }

    /// Rename and/or retag a camera.
    ///
    /// A running camera is restarted under its new name without lifecycle
    /// events (events are keyed by camera id, which does not change), and the
    /// active feed follows the rename. If the restart fails, the camera is
    /// recorded as stopped, the rename is kept, and `NotResponding` is
    /// returned. Passing nothing new is a no-op.
    pub fn edit(
        &self,
        name: &str,
        new_name: Option<&str>,
        new_tag: Option<&str>,
    ) -> Result<Camera, CameraError> {
        let mut camera = self.get(name)?;
        let rename = new_name
            .map(str::trim)
            .filter(|n| !n.is_empty() && *n != camera.name)
            .map(str::to_string);
        let retag = new_tag
            .map(str::trim)
            .filter(|t| !t.is_empty() && *t != camera.tag)
            .map(str::to_string);

        if rename.is_none() && retag.is_none() {
            return Ok(camera);
        }
        if let Some(tag) = retag {
            camera.tag = tag;
        }

        let Some(new_name) = rename else {
            lock(&self.store).update_camera(&camera)?;
            log::info!("camera {} retagged to {}", camera.name, camera.tag);
            return Ok(camera);
        };

        validate_camera_name(&new_name)?;
        if lock(&self.store).camera(&new_name)?.is_some() {
            return Err(CameraError::Conflict(new_name));
        }
        let old_name = std::mem::replace(&mut camera.name, new_name.clone());

        let previous = {
            let mut feed = lock(&self.active_feed);
            let mut streams = lock(&self.streams);
            lock(&self.store).update_camera(&camera)?;
            if feed.as_deref() == Some(old_name.as_str()) {
                *feed = Some(new_name.clone());
            }
            streams.remove(&old_name)
        };
        log::info!("camera {} renamed to {}", old_name, new_name);

        let Some(previous) = previous else {
            return Ok(camera);
        };
        previous.stop();

        match self.open_and_probe(&camera) {
            Ok(source) => {
                let raced = {
                    let mut streams = lock(&self.streams);
                    if streams.contains_key(&new_name) {
                        Some(source)
                    } else {
                        streams.insert(new_name.clone(), source);
                        None
                    }
                };
                if let Some(source) = raced {
                    source.stop();
                }
                log::info!("camera {} restarted after rename", new_name);
                Ok(camera)
            }
            Err(err) => {
                log::warn!("camera {} did not come back after rename", new_name);
                self.append(camera.id, EventKind::Camera, EventAction::Stop)?;
                self.stop_feed_of(&camera)?;
                Err(err)
            }
        }
    }

    /// Every configured camera with its running flag.
    pub fn list(&self) -> Result<Vec<CameraStatus>, CameraError> {
        let cameras = lock(&self.store).cameras()?;
        let streams = lock(&self.streams);
        Ok(cameras
            .into_iter()
            .map(|camera| {
                let running = streams.contains_key(&camera.name);
                CameraStatus { camera, running }
            })
            .collect())
    }

    // -------------------- Lifecycle --------------------

    pub fn start(&self, name: &str) -> Result<StartOutcome, CameraError> {
        let camera = self.get(name)?;
        if self.is_running(name) {
            log::info!("camera {} already started", name);
            return Ok(StartOutcome::AlreadyRunning);
        }

        let source = self.open_and_probe(&camera)?;

        let mut streams = lock(&self.streams);
        if streams.contains_key(name) {
            drop(streams);
            source.stop();
            log::info!("camera {} was started concurrently", name);
            return Ok(StartOutcome::AlreadyRunning);
        }
        streams.insert(name.to_string(), Arc::clone(&source));
        if let Err(err) = self.append(camera.id, EventKind::Camera, EventAction::Start) {
            streams.remove(name);
            drop(streams);
            source.stop();
            return Err(err);
        }
        log::info!("camera {} started", name);
        Ok(StartOutcome::Started)
    }

    pub fn stop(&self, name: &str) -> Result<StopOutcome, CameraError> {
        let camera = self.get(name)?;
        let outcome = self.stop_running(&camera, None)?;
        if outcome == StopOutcome::Stopped {
            log::info!("camera {} stopped", name);
        }
        Ok(outcome)
    }

    /// Stop a camera whose source died underneath it. Same cleanup and feed
    /// cascade as `stop`.
    pub fn handle_unexpected_stop(&self, name: &str) -> Result<StopOutcome, CameraError> {
        let camera = self.get(name)?;
        let outcome = self.stop_running(&camera, None)?;
        if outcome == StopOutcome::Stopped {
            log::warn!("camera {} auto-stopped after missed frames", name);
        }
        Ok(outcome)
    }

    /// Like `handle_unexpected_stop`, but only if `source` is still the
    /// instance registered for `name`. A camera restarted in the meantime is
    /// left alone.
    pub fn handle_stalled_source(
        &self,
        name: &str,
        source: &Arc<FrameSource>,
    ) -> Result<StopOutcome, CameraError> {
        let camera = self.get(name)?;
        let outcome = self.stop_running(&camera, Some(source))?;
        if outcome == StopOutcome::Stopped {
            log::warn!("camera {} auto-stopped after missed frames", name);
        }
        Ok(outcome)
    }

    pub fn start_all(&self) -> Result<Vec<(String, StartResult)>, CameraError> {
        let cameras = lock(&self.store).cameras()?;
        let results: Vec<_> = cameras
            .into_iter()
            .map(|camera| {
                let outcome = self.start(&camera.name);
                (camera.name, outcome)
            })
            .collect();
        let started = results.iter().filter(|(_, r)| r.is_ok()).count();
        log::info!("start all: {}/{} cameras running", started, results.len());
        Ok(results)
    }

    pub fn stop_all(&self) -> Vec<(String, StopResult)> {
        let mut names: Vec<String> = lock(&self.streams).keys().cloned().collect();
        names.sort();
        let results: Vec<_> = names
            .into_iter()
            .map(|name| {
                let outcome = self.stop(&name);
                (name, outcome)
            })
            .collect();
        log::info!("stop all: {} cameras stopped", results.len());
        results
    }

    /// Add each seed camera. A camera that already exists is started instead.
    pub fn bootstrap(&self, seeds: &[CameraSeed]) -> Vec<(String, StartResult)> {
        seeds
            .iter()
            .map(|seed| {
                let outcome = match self.add(&seed.name, &seed.source, &seed.tag) {
                    Ok(_) => Ok(StartOutcome::Started),
                    Err(CameraError::Conflict(_)) => self.start(&seed.name),
                    Err(err) => Err(err),
                };
                if let Err(err) = &outcome {
                    log::warn!("bootstrap: camera {}: {}", seed.name, err);
                }
                (seed.name.clone(), outcome)
            })
            .collect()
    }

    pub fn is_running(&self, name: &str) -> bool {
        lock(&self.streams).contains_key(name)
    }

    pub fn count_running(&self) -> usize {
        lock(&self.streams).len()
    }

    /// Snapshot of the running sources.
    pub fn streams(&self) -> HashMap<String, Arc<FrameSource>> {
        lock(&self.streams).clone()
    }

    // -------------------- Active Feed --------------------

    /// Make `name` the active feed. Re-selecting the current feed is a no-op.
    ///
    /// The feed state only moves once the matching event is written.
    pub fn start_feed(&self, name: &str) -> Result<(), CameraError> {
        let camera = self.get(name)?;

        let mut feed = lock(&self.active_feed);
        // Held until the feed start is written so a concurrent stop cannot
        // record the camera stop in between.
        let streams = lock(&self.streams);
        if !streams.contains_key(name) {
            log::error!("cannot start feed: camera {} is not running", name);
            return Err(CameraError::NotRunning(name.to_string()));
        }
        if feed.as_deref() == Some(name) {
            return Ok(());
        }

        if let Some(old) = feed.clone() {
            let previous = lock(&self.store).camera(&old)?;
            if let Some(previous) = previous {
                self.append(previous.id, EventKind::Feed, EventAction::Stop)?;
                log::info!("feed stopped for camera {}", old);
            }
            *feed = None;
        }
        self.append(camera.id, EventKind::Feed, EventAction::Start)?;
        *feed = Some(name.to_string());
        drop(streams);
        log::info!("feed started for camera {}", name);
        Ok(())
    }

    pub fn stop_feed(&self) -> Result<String, CameraError> {
        let mut feed = lock(&self.active_feed);
        let name = feed.clone().ok_or(CameraError::NoActiveFeed)?;
        let camera = lock(&self.store).camera(&name)?;
        if let Some(camera) = camera {
            self.append(camera.id, EventKind::Feed, EventAction::Stop)?;
        }
        *feed = None;
        log::info!("feed stopped for camera {}", name);
        Ok(name)
    }

    pub fn get_active_feed(&self) -> Option<String> {
        lock(&self.active_feed).clone()
    }

    // -------------------- Timeline --------------------

    pub fn timeline(
        &self,
        from: TimestampMs,
        to: TimestampMs,
    ) -> Result<TimelineReport, CameraError> {
        let mut store = lock(&self.store);
        EventTimeline::report(&mut **store, from, to)
    }

    /// Raw lifecycle events of one kind for a camera, oldest first.
    pub fn events(
        &self,
        name: &str,
        kind: EventKind,
        from: TimestampMs,
        to: TimestampMs,
    ) -> Result<Vec<CameraEvent>, CameraError> {
        let mut store = lock(&self.store);
        let camera = store
            .camera(name)?
            .ok_or_else(|| CameraError::NotFound(name.to_string()))?;
        store.events_between(camera.id, kind, from, to)
    }

    // -------------------- Internals --------------------

    fn append(
        &self,
        camera_id: i64,
        kind: EventKind,
        action: EventAction,
    ) -> Result<(), CameraError> {
        let mut store = lock(&self.store);
        EventTimeline::append(&mut **store, camera_id, kind, action)?;
        Ok(())
    }

    /// Build a fresh source, start it, and wait for its first frame.
    fn open_and_probe(&self, camera: &Camera) -> Result<Arc<FrameSource>, CameraError> {
        let source = Arc::new(FrameSource::new(
            &camera.name,
            &camera.source,
            self.source_settings.clone(),
        ));
        if let Err(err) = source.start() {
            log::error!("camera {} failed to open: {:#}", camera.name, err);
            return Err(CameraError::NotResponding(camera.name.clone()));
        }

        for attempt in 1..=self.probe.attempts {
            if source.read().is_some() {
                log::info!("camera {} responded on attempt {}", camera.name, attempt);
                return Ok(source);
            }
            // A loop that already died will never produce a frame.
            if !source.is_started() {
                break;
            }
            if attempt < self.probe.attempts {
                std::thread::sleep(self.probe.backoff);
            }
        }

        source.stop();
        log::error!(
            "camera {} failed to respond after {} attempts",
            camera.name,
            self.probe.attempts
        );
        Err(CameraError::NotResponding(camera.name.clone()))
    }

    /// Remove and stop the running source for `camera` (only if it is
    /// `expected`, when given), record the stop, and cascade to the feed.
    fn stop_running(
        &self,
        camera: &Camera,
        expected: Option<&Arc<FrameSource>>,
    ) -> Result<StopOutcome, CameraError> {
        let source = {
            let mut streams = lock(&self.streams);
            let matches = match (streams.get(&camera.name), expected) {
                (Some(current), Some(expected)) => Arc::ptr_eq(current, expected),
                (Some(_), None) => true,
                (None, _) => false,
            };
            if !matches {
                return Ok(StopOutcome::NotRunning);
            }
            // The source stays registered if the stop cannot be recorded.
            self.append(camera.id, EventKind::Camera, EventAction::Stop)?;
            streams.remove(&camera.name)
        };

        if let Some(source) = source {
            source.stop();
        }
        self.stop_feed_of(camera)?;
        Ok(StopOutcome::Stopped)
    }

    /// Clear the active feed if it is `camera`, recording the feed stop.
    fn stop_feed_of(&self, camera: &Camera) -> Result<(), CameraError> {
        let mut feed = lock(&self.active_feed);
        if feed.as_deref() != Some(camera.name.as_str()) {
            return Ok(());
        }
        self.append(camera.id, EventKind::Feed, EventAction::Stop)?;
        *feed = None;
        log::info!("feed stopped for camera {}", camera.name);
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{CameraStore, EventStore, InMemoryStore};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn registry() -> CameraRegistry {
        registry_with(Box::new(InMemoryStore::new()), "ffmpeg")
    }

    fn registry_with(store: Box<dyn Store>, decoder: &str) -> CameraRegistry {
        CameraRegistry::new(
            store,
            SourceSettings {
                width: 8,
                height: 4,
                target_fps: 100,
                decoder: decoder.to_string(),
            },
            ProbeSettings {
                attempts: 40,
                backoff: Duration::from_millis(10),
            },
        )
    }

    fn camera_actions(
        registry: &CameraRegistry,
        name: &str,
        kind: EventKind,
    ) -> Vec<EventAction> {
        registry
            .events(name, kind, 0, i64::MAX)
            .expect("events")
            .into_iter()
            .map(|e| e.action)
            .collect()
    }

    #[test]
    fn add_rejects_missing_fields_and_bad_names() {
        let registry = registry();
        assert!(matches!(
            registry.add("cam1", "", "lobby"),
            Err(CameraError::InvalidInput(_))
        ));
        assert!(matches!(
            registry.add("front door", "stub://a", "lobby"),
            Err(CameraError::InvalidInput(_))
        ));
        assert!(registry.list().expect("list").is_empty());
    }

    #[test]
    fn unresponsive_add_keeps_the_row_without_start_event() {
        let registry = registry();
        assert!(matches!(
            registry.add("cam1", "stub://dead", "lobby"),
            Err(CameraError::NotResponding(_))
        ));

        let listed = registry.list().expect("list");
        assert_eq!(listed.len(), 1);
        assert!(!listed[0].running);
        assert!(camera_actions(&registry, "cam1", EventKind::Camera).is_empty());
    }

    #[test]
    fn start_is_idempotent_and_stop_is_idempotent() -> Result<(), CameraError> {
        let registry = registry();
        registry.add("cam1", "stub://a", "lobby")?;
        assert_eq!(registry.start("cam1")?, StartOutcome::AlreadyRunning);

        assert_eq!(registry.stop("cam1")?, StopOutcome::Stopped);
        assert_eq!(registry.stop("cam1")?, StopOutcome::NotRunning);
        assert_eq!(
            camera_actions(&registry, "cam1", EventKind::Camera),
            vec![EventAction::Start, EventAction::Stop]
        );
        Ok(())
    }

    #[test]
    fn unknown_names_are_not_found() {
        let registry = registry();
        assert!(matches!(registry.start("nope"), Err(CameraError::NotFound(_))));
        assert!(matches!(registry.stop("nope"), Err(CameraError::NotFound(_))));
        assert!(matches!(registry.remove("nope"), Err(CameraError::NotFound(_))));
        assert!(matches!(registry.start_feed("nope"), Err(CameraError::NotFound(_))));
        assert!(matches!(
            registry.edit("nope", Some("x"), None),
            Err(CameraError::NotFound(_))
        ));
    }

    #[test]
    fn feed_requires_a_running_camera() -> Result<(), CameraError> {
        let registry = registry();
        registry.add("cam1", "stub://a", "lobby")?;
        registry.stop("cam1")?;
        assert!(matches!(
            registry.start_feed("cam1"),
            Err(CameraError::NotRunning(_))
        ));
        assert!(matches!(registry.stop_feed(), Err(CameraError::NoActiveFeed)));
        Ok(())
    }

    #[test]
    fn reselecting_the_active_feed_writes_nothing() -> Result<(), CameraError> {
        let registry = registry();
        registry.add("cam1", "stub://a", "lobby")?;
        registry.start_feed("cam1")?;
        registry.start_feed("cam1")?;
        assert_eq!(
            camera_actions(&registry, "cam1", EventKind::Feed),
            vec![EventAction::Start]
        );
        Ok(())
    }

    #[test]
    fn retag_only_updates_the_row() -> Result<(), CameraError> {
        let registry = registry();
        registry.add("cam1", "stub://a", "lobby")?;
        let edited = registry.edit("cam1", None, Some("dock"))?;
        assert_eq!(edited.tag, "dock");
        assert!(registry.is_running("cam1"));
        assert_eq!(
            camera_actions(&registry, "cam1", EventKind::Camera),
            vec![EventAction::Start]
        );
        Ok(())
    }

    #[test]
    fn rename_of_running_feed_camera_moves_stream_and_feed() -> Result<(), CameraError> {
        let registry = registry();
        registry.add("cam1", "stub://a", "lobby")?;
        registry.start_feed("cam1")?;

        registry.edit("cam1", Some("lobby-east"), None)?;

        assert!(!registry.is_running("cam1"));
        assert!(registry.is_running("lobby-east"));
        assert_eq!(registry.get_active_feed().as_deref(), Some("lobby-east"));
        assert_eq!(
            camera_actions(&registry, "lobby-east", EventKind::Camera),
            vec![EventAction::Start]
        );
        Ok(())
    }

    #[test]
    fn rename_onto_existing_name_conflicts() -> Result<(), CameraError> {
        let registry = registry();
        registry.add("cam1", "stub://a", "lobby")?;
        registry.add("cam2", "stub://b", "dock")?;
        assert!(matches!(
            registry.edit("cam1", Some("cam2"), None),
            Err(CameraError::Conflict(_))
        ));
        assert!(registry.is_running("cam1"));
        Ok(())
    }

    #[test]
    fn edit_with_nothing_new_is_a_noop() -> Result<(), CameraError> {
        let registry = registry();
        registry.add("cam1", "stub://a", "lobby")?;
        let same = registry.edit("cam1", Some("cam1"), Some("lobby"))?;
        assert_eq!(same.name, "cam1");
        assert_eq!(same.tag, "lobby");
        Ok(())
    }

    #[test]
    fn remove_stops_and_deletes() -> Result<(), CameraError> {
        let registry = registry();
        registry.add("cam1", "stub://a", "lobby")?;
        registry.start_feed("cam1")?;
        registry.remove("cam1")?;

        assert_eq!(registry.count_running(), 0);
        assert_eq!(registry.get_active_feed(), None);
        assert!(matches!(registry.get("cam1"), Err(CameraError::NotFound(_))));
        Ok(())
    }

    #[test]
    fn stalled_source_check_ignores_replaced_instances() -> Result<(), CameraError> {
        let registry = registry();
        registry.add("cam1", "stub://a", "lobby")?;
        let stale = registry.streams().remove("cam1").expect("running source");

        registry.stop("cam1")?;
        registry.start("cam1")?;

        assert_eq!(
            registry.handle_stalled_source("cam1", &stale)?,
            StopOutcome::NotRunning
        );
        assert!(registry.is_running("cam1"));

        let current = registry.streams().remove("cam1").expect("running source");
        assert_eq!(
            registry.handle_stalled_source("cam1", &current)?,
            StopOutcome::Stopped
        );
        assert!(!registry.is_running("cam1"));
        Ok(())
    }

    #[test]
    fn bootstrap_starts_known_cameras_instead_of_failing() -> Result<(), CameraError> {
        let registry = registry();
        registry.add("cam1", "stub://a", "lobby")?;
        registry.stop("cam1")?;

        let seeds = vec![
            CameraSeed {
                name: "cam1".into(),
                source: "stub://a".into(),
                tag: "lobby".into(),
            },
            CameraSeed {
                name: "cam2".into(),
                source: "stub://b".into(),
                tag: "dock".into(),
            },
        ];
        let results = registry.bootstrap(&seeds);
        assert!(results.iter().all(|(_, r)| r.is_ok()));
        assert_eq!(registry.count_running(), 2);

        let stopped = registry.stop_all();
        assert_eq!(stopped.len(), 2);
        assert_eq!(registry.count_running(), 0);
        Ok(())
    }

    /// In-memory store whose event writes can be switched to fail.
    struct FlakyStore {
        inner: InMemoryStore,
        fail_events: Arc<AtomicBool>,
    }

    impl CameraStore for FlakyStore {
        fn camera(&mut self, name: &str) -> Result<Option<Camera>, CameraError> {
            self.inner.camera(name)
        }

        fn cameras(&mut self) -> Result<Vec<Camera>, CameraError> {
            self.inner.cameras()
        }

        fn insert_camera(
            &mut self,
            name: &str,
            source: &str,
            tag: &str,
        ) -> Result<Camera, CameraError> {
            self.inner.insert_camera(name, source, tag)
        }

        fn update_camera(&mut self, camera: &Camera) -> Result<(), CameraError> {
            self.inner.update_camera(camera)
        }

        fn delete_camera(&mut self, id: i64) -> Result<(), CameraError> {
            self.inner.delete_camera(id)
        }
    }

    impl EventStore for FlakyStore {
        fn insert_event(
            &mut self,
            camera_id: i64,
            kind: EventKind,
            action: EventAction,
            timestamp_ms: TimestampMs,
        ) -> Result<CameraEvent, CameraError> {
            if self.fail_events.load(Ordering::SeqCst) {
                return Err(CameraError::Storage(anyhow::anyhow!("disk full")));
            }
            self.inner.insert_event(camera_id, kind, action, timestamp_ms)
        }

        fn last_event(
            &mut self,
            camera_id: i64,
            kind: EventKind,
        ) -> Result<Option<CameraEvent>, CameraError> {
            self.inner.last_event(camera_id, kind)
        }

        fn events_between(
            &mut self,
            camera_id: i64,
            kind: EventKind,
            from: TimestampMs,
            to: TimestampMs,
        ) -> Result<Vec<CameraEvent>, CameraError> {
            self.inner.events_between(camera_id, kind, from, to)
        }
    }

    fn flaky_registry() -> (CameraRegistry, Arc<AtomicBool>) {
        let fail_events = Arc::new(AtomicBool::new(false));
        let store = FlakyStore {
            inner: InMemoryStore::new(),
            fail_events: Arc::clone(&fail_events),
        };
        (registry_with(Box::new(store), "ffmpeg"), fail_events)
    }

    #[test]
    fn unrecorded_stop_leaves_the_camera_running() -> Result<(), CameraError> {
        let (registry, fail_events) = flaky_registry();
        registry.add("cam1", "stub://a", "lobby")?;

        fail_events.store(true, Ordering::SeqCst);
        assert!(matches!(registry.stop("cam1"), Err(CameraError::Storage(_))));
        assert!(registry.is_running("cam1"));
        assert!(registry.streams()["cam1"].is_started());
        assert_eq!(
            camera_actions(&registry, "cam1", EventKind::Camera),
            vec![EventAction::Start]
        );

        fail_events.store(false, Ordering::SeqCst);
        assert_eq!(registry.stop("cam1")?, StopOutcome::Stopped);
        assert_eq!(
            camera_actions(&registry, "cam1", EventKind::Camera),
            vec![EventAction::Start, EventAction::Stop]
        );
        Ok(())
    }

    #[test]
    fn unrecorded_feed_changes_leave_the_feed_as_logged() -> Result<(), CameraError> {
        let (registry, fail_events) = flaky_registry();
        registry.add("cam1", "stub://a", "lobby")?;
        registry.add("cam2", "stub://b", "dock")?;

        fail_events.store(true, Ordering::SeqCst);
        assert!(registry.start_feed("cam1").is_err());
        assert_eq!(registry.get_active_feed(), None);

        fail_events.store(false, Ordering::SeqCst);
        registry.start_feed("cam1")?;

        fail_events.store(true, Ordering::SeqCst);
        assert!(registry.start_feed("cam2").is_err());
        assert_eq!(registry.get_active_feed().as_deref(), Some("cam1"));
        assert!(registry.stop_feed().is_err());
        assert_eq!(registry.get_active_feed().as_deref(), Some("cam1"));

        fail_events.store(false, Ordering::SeqCst);
        assert_eq!(registry.stop_feed()?, "cam1");
        assert_eq!(
            camera_actions(&registry, "cam1", EventKind::Feed),
            vec![EventAction::Start, EventAction::Stop]
        );
        assert!(camera_actions(&registry, "cam2", EventKind::Feed).is_empty());
        Ok(())
    }

    #[test]
    fn start_all_reports_each_configured_camera() -> Result<(), CameraError> {
        let registry = registry();
        registry.add("cam1", "stub://a", "lobby")?;
        assert!(registry.add("cam2", "stub://dead", "dock").is_err());
        registry.stop_all();

        let results = registry.start_all()?;
        assert_eq!(results.len(), 2);
        for (name, outcome) in &results {
            match name.as_str() {
                "cam1" => assert_eq!(outcome.as_ref().ok(), Some(&StartOutcome::Started)),
                "cam2" => assert!(matches!(outcome, Err(CameraError::NotResponding(_)))),
                other => panic!("unexpected camera {}", other),
            }
        }
        assert_eq!(registry.count_running(), 1);

        let again = registry.start_all()?;
        assert!(again
            .iter()
            .any(|(name, r)| name == "cam1" && r.as_ref().ok() == Some(&StartOutcome::AlreadyRunning)));
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn failed_restart_after_rename_records_the_stop() -> Result<(), CameraError> {
        use crate::frame::Frame;
        use std::os::unix::fs::PermissionsExt;

        // Serves frames on its first run only; every later run exits at once.
        let dir = tempfile::tempdir().expect("tempdir");
        let marker = dir.path().join("opened");
        let decoder = dir.path().join("decoder.sh");
        let script = format!(
            "#!/bin/sh\nif [ -e '{marker}' ]; then exit 1; fi\ntouch '{marker}'\nhead -c {bytes} /dev/zero\nexec sleep 30\n",
            marker = marker.display(),
            bytes = 5 * Frame::byte_len_for(8, 4)
        );
        std::fs::write(&decoder, script).expect("write decoder");
        std::fs::set_permissions(&decoder, std::fs::Permissions::from_mode(0o755))
            .expect("chmod decoder");

        let registry = registry_with(
            Box::new(InMemoryStore::new()),
            &decoder.display().to_string(),
        );
        registry.add("cam1", "rtsp://cam/1", "lobby")?;
        registry.start_feed("cam1")?;

        assert!(matches!(
            registry.edit("cam1", Some("gate"), None),
            Err(CameraError::NotResponding(_))
        ));

        assert_eq!(registry.get("gate")?.name, "gate");
        assert!(!registry.is_running("gate"));
        assert!(!registry.is_running("cam1"));
        assert_eq!(registry.get_active_feed(), None);
        assert_eq!(
            camera_actions(&registry, "gate", EventKind::Camera),
            vec![EventAction::Start, EventAction::Stop]
        );
        assert_eq!(
            camera_actions(&registry, "gate", EventKind::Feed),
            vec![EventAction::Start, EventAction::Stop]
        );
        Ok(())
    }
}
