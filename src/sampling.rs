//! Duty-cycle sampling in front of the detector.
//!
//! Each camera has a frame counter. The counter is bumped first, then frame `n`
//! goes to the detector only when `n % cycle_length < process_count`. Frames
//! skipped this way are either passed through untouched (`Raw`) or carry the
//! camera's last non-empty detections if those are younger than the freshness
//! window (`Cached`).

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::detect::{Detection, Detector};
use crate::dispatch::FrameProcessor;
use crate::error::CameraError;
use crate::frame::Frame;

pub const DEFAULT_PROCESS_COUNT: u32 = 2;
pub const DEFAULT_CYCLE_LENGTH: u32 = 10;
pub const DEFAULT_FRESHNESS: Duration = Duration::from_secs(2);

/// What to emit for frames the duty cycle skips.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverlayMode {
    /// Re-apply the last detections while they are younger than `freshness`.
    Cached { freshness: Duration },
    /// Emit the frame with no detections.
    Raw,
}

impl OverlayMode {
    /// `"cached"` or `"raw"`.
    pub fn parse(value: &str, freshness: Duration) -> Result<Self, CameraError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "cached" => Ok(OverlayMode::Cached { freshness }),
            "raw" => Ok(OverlayMode::Raw),
            other => Err(CameraError::InvalidInput(format!(
                "overlay mode '{}' (expected cached or raw)",
                other
            ))),
        }
    }
}

impl Default for OverlayMode {
    fn default() -> Self {
        OverlayMode::Cached {
            freshness: DEFAULT_FRESHNESS,
        }
    }
}

/// Where a processed frame's detections came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameOrigin {
    Inference,
    Cached,
    Passthrough,
}

/// Result handed to the completion callback.
#[derive(Clone, Debug)]
pub struct ProcessedFrame {
    pub camera: String,
    pub frame: Arc<Frame>,
    pub detections: Vec<Detection>,
    pub origin: FrameOrigin,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SamplingSettings {
    pub process_count: u32,
    pub cycle_length: u32,
    pub overlay: OverlayMode,
}

impl SamplingSettings {
    pub fn validate(&self) -> Result<(), CameraError> {
        if self.cycle_length == 0 {
            return Err(CameraError::InvalidInput(
                "sampling cycle length must be > 0".to_string(),
            ));
        }
        if self.process_count > self.cycle_length {
            return Err(CameraError::InvalidInput(format!(
                "sampling process count {} exceeds cycle length {}",
                self.process_count, self.cycle_length
            )));
        }
        Ok(())
    }

    fn cycle_label(&self) -> String {
        format!("{}/{}", self.process_count, self.cycle_length)
    }
}

impl Default for SamplingSettings {
    fn default() -> Self {
        Self {
            process_count: DEFAULT_PROCESS_COUNT,
            cycle_length: DEFAULT_CYCLE_LENGTH,
            overlay: OverlayMode::default(),
        }
    }
}

/// Per-camera sampling counters.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SamplingStats {
    pub camera: String,
    pub total_frames: u64,
    pub inference_frames: u64,
    pub cached_frames: u64,
    /// Inference calls per second since the camera's first inference.
    pub inference_fps: f64,
    /// `"<process>/<cycle>"`.
    pub cycle: String,
}

#[derive(Default)]
struct CameraSampling {
    counter: u64,
    cache: Option<(Vec<Detection>, Instant)>,
    inference_frames: u64,
    cached_frames: u64,
    first_inference: Option<Instant>,
}

enum Decision {
    Infer,
    Reuse(Vec<Detection>),
    Passthrough,
}

pub struct SamplingPolicy {
    detector: Arc<dyn Detector>,
    settings: Mutex<SamplingSettings>,
    cameras: Mutex<HashMap<String, CameraSampling>>,
}

impl SamplingPolicy {
    /// Validate the settings and warm the detector up once.
    pub fn new(detector: Arc<dyn Detector>, settings: SamplingSettings) -> Result<Self> {
        settings.validate()?;
        detector
            .warm_up()
            .with_context(|| format!("warm up detector '{}'", detector.name()))?;
        log::info!(
            "sampling: detector '{}', cycle {}, overlay {:?}",
            detector.name(),
            settings.cycle_label(),
            settings.overlay
        );
        Ok(Self {
            detector,
            settings: Mutex::new(settings),
            cameras: Mutex::new(HashMap::new()),
        })
    }

    pub fn settings(&self) -> SamplingSettings {
        *lock(&self.settings)
    }

    /// Change the duty cycle. Frame counters keep running.
    pub fn set_cycle(&self, process_count: u32, cycle_length: u32) -> Result<(), CameraError> {
        let mut settings = lock(&self.settings);
        let updated = SamplingSettings {
            process_count,
            cycle_length,
            overlay: settings.overlay,
        };
        updated.validate()?;
        *settings = updated;
        log::info!("sampling: cycle set to {}", updated.cycle_label());
        Ok(())
    }

    pub fn set_overlay(&self, overlay: OverlayMode) {
        lock(&self.settings).overlay = overlay;
        log::info!("sampling: overlay set to {:?}", overlay);
    }

    pub fn stats(&self) -> Vec<SamplingStats> {
        let cycle = lock(&self.settings).cycle_label();
        let cameras = lock(&self.cameras);
        let mut stats: Vec<_> = cameras
            .iter()
            .map(|(camera, state)| {
                let inference_fps = state
                    .first_inference
                    .map(|since| since.elapsed().as_secs_f64())
                    .filter(|elapsed| *elapsed > 0.0)
                    .map_or(0.0, |elapsed| state.inference_frames as f64 / elapsed);
                SamplingStats {
                    camera: camera.clone(),
                    total_frames: state.counter,
                    inference_frames: state.inference_frames,
                    cached_frames: state.cached_frames,
                    inference_fps,
                    cycle: cycle.clone(),
                }
            })
            .collect();
        stats.sort_by(|a, b| a.camera.cmp(&b.camera));
        stats
    }

    /// Drop a camera's counter and cache.
    pub fn forget(&self, camera: &str) {
        lock(&self.cameras).remove(camera);
    }

    fn decide(&self, camera: &str) -> Decision {
        let settings = *lock(&self.settings);
        let mut cameras = lock(&self.cameras);
        let state = cameras.entry(camera.to_string()).or_default();
        state.counter += 1;

        if state.counter % u64::from(settings.cycle_length) < u64::from(settings.process_count) {
            return Decision::Infer;
        }

        match settings.overlay {
            OverlayMode::Raw => Decision::Passthrough,
            OverlayMode::Cached { freshness } => match &state.cache {
                Some((detections, at)) if at.elapsed() < freshness => {
                    state.cached_frames += 1;
                    Decision::Reuse(detections.clone())
                }
                _ => Decision::Passthrough,
            },
        }
    }

    fn record_inference(&self, camera: &str, detections: &[Detection]) {
        let mut cameras = lock(&self.cameras);
        // Forgotten while the detector ran.
        let Some(state) = cameras.get_mut(camera) else {
            return;
        };
        state.inference_frames += 1;
        state.first_inference.get_or_insert_with(Instant::now);
        if !detections.is_empty() {
            state.cache = Some((detections.to_vec(), Instant::now()));
        }
    }
}

impl FrameProcessor for SamplingPolicy {
    fn forget(&self, camera: &str) {
        SamplingPolicy::forget(self, camera);
    }

    fn process(&self, camera: &str, frame: Arc<Frame>) -> Result<ProcessedFrame> {
        let (detections, origin) = match self.decide(camera) {
            Decision::Infer => {
                // No lock is held across the detector call.
                let started = Instant::now();
                let detections = self.detector.detect(&frame)?;
                log::debug!(
                    "sampling[{}]: {} detections in {:?}",
                    camera,
                    detections.len(),
                    started.elapsed()
                );
                self.record_inference(camera, &detections);
                (detections, FrameOrigin::Inference)
            }
            Decision::Reuse(detections) => (detections, FrameOrigin::Cached),
            Decision::Passthrough => (Vec::new(), FrameOrigin::Passthrough),
        };
        Ok(ProcessedFrame {
            camera: camera.to_string(),
            frame,
            detections,
            origin,
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::BoundingBox;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts calls; returns one detection unless `empty` is set.
    struct CountingDetector {
        calls: AtomicUsize,
        warm_ups: AtomicUsize,
        empty: bool,
    }

    impl CountingDetector {
        fn new(empty: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                warm_ups: AtomicUsize::new(0),
                empty,
            })
        }
    }

    impl Detector for CountingDetector {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn warm_up(&self) -> Result<()> {
            self.warm_ups.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn detect(&self, _frame: &Frame) -> Result<Vec<Detection>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.empty {
                return Ok(Vec::new());
            }
            Ok(vec![Detection {
                bbox: BoundingBox {
                    x: 0.1,
                    y: 0.1,
                    w: 0.2,
                    h: 0.2,
                },
                score: 0.9,
                label: "face".to_string(),
            }])
        }
    }

    struct FailingDetector;

    impl Detector for FailingDetector {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn detect(&self, _frame: &Frame) -> Result<Vec<Detection>> {
            anyhow::bail!("model unavailable")
        }
    }

    struct ColdDetector;

    impl Detector for ColdDetector {
        fn name(&self) -> &'static str {
            "cold"
        }

        fn detect(&self, _frame: &Frame) -> Result<Vec<Detection>> {
            Ok(Vec::new())
        }

        fn warm_up(&self) -> Result<()> {
            anyhow::bail!("weights missing")
        }
    }

    fn frame() -> Arc<Frame> {
        Arc::new(Frame::new(vec![0; Frame::byte_len_for(2, 2)], 2, 2, 1))
    }

    fn policy(
        detector: Arc<dyn Detector>,
        process: u32,
        cycle: u32,
        overlay: OverlayMode,
    ) -> SamplingPolicy {
        SamplingPolicy::new(
            detector,
            SamplingSettings {
                process_count: process,
                cycle_length: cycle,
                overlay,
            },
        )
        .expect("valid settings")
    }

    #[test]
    fn inference_runs_on_counter_mod_cycle_below_process_count() -> Result<()> {
        let detector = CountingDetector::new(false);
        let policy = policy(detector.clone(), 2, 10, OverlayMode::Raw);

        let origins: Vec<_> = (0..20)
            .map(|_| policy.process("cam1", frame()).map(|p| p.origin))
            .collect::<Result<_>>()?;

        // Counter runs 1..=20; 10, 11, 20 hit `n % 10 < 2`.
        let inferred: Vec<_> = origins
            .iter()
            .enumerate()
            .filter(|(_, o)| **o == FrameOrigin::Inference)
            .map(|(i, _)| i + 1)
            .collect();
        assert_eq!(inferred, vec![10, 11, 20]);
        assert_eq!(detector.calls.load(Ordering::SeqCst), 3);
        Ok(())
    }

    #[test]
    fn cameras_have_independent_counters() -> Result<()> {
        let detector = CountingDetector::new(false);
        let policy = policy(detector.clone(), 1, 2, OverlayMode::Raw);

        // Counter 1 for each camera: 1 % 2 = 1, not < 1.
        assert_eq!(policy.process("a", frame())?.origin, FrameOrigin::Passthrough);
        assert_eq!(policy.process("b", frame())?.origin, FrameOrigin::Passthrough);
        assert_eq!(policy.process("a", frame())?.origin, FrameOrigin::Inference);
        assert_eq!(policy.process("b", frame())?.origin, FrameOrigin::Inference);
        Ok(())
    }

    #[test]
    fn cached_mode_reuses_fresh_detections() -> Result<()> {
        let detector = CountingDetector::new(false);
        let policy = policy(
            detector.clone(),
            1,
            2,
            OverlayMode::Cached {
                freshness: Duration::from_secs(60),
            },
        );

        assert_eq!(policy.process("cam1", frame())?.origin, FrameOrigin::Passthrough);
        let inferred = policy.process("cam1", frame())?;
        assert_eq!(inferred.origin, FrameOrigin::Inference);
        let reused = policy.process("cam1", frame())?;
        assert_eq!(reused.origin, FrameOrigin::Cached);
        assert_eq!(reused.detections, inferred.detections);
        Ok(())
    }

    #[test]
    fn stale_cache_falls_back_to_raw_frame() -> Result<()> {
        let detector = CountingDetector::new(false);
        let policy = policy(
            detector,
            1,
            2,
            OverlayMode::Cached {
                freshness: Duration::from_millis(10),
            },
        );

        policy.process("cam1", frame())?;
        policy.process("cam1", frame())?;
        std::thread::sleep(Duration::from_millis(30));
        let skipped = policy.process("cam1", frame())?;
        assert_eq!(skipped.origin, FrameOrigin::Passthrough);
        assert!(skipped.detections.is_empty());
        Ok(())
    }

    #[test]
    fn empty_results_do_not_replace_cache() -> Result<()> {
        let detector = CountingDetector::new(true);
        let policy = policy(detector, 1, 2, OverlayMode::default());

        policy.process("cam1", frame())?;
        policy.process("cam1", frame())?;
        assert_eq!(policy.process("cam1", frame())?.origin, FrameOrigin::Passthrough);
        Ok(())
    }

    #[test]
    fn detector_failure_propagates_and_counter_still_advances() {
        let policy = policy(Arc::new(FailingDetector), 1, 1, OverlayMode::Raw);
        assert!(policy.process("cam1", frame()).is_err());
        assert!(policy.process("cam1", frame()).is_err());
        let stats = policy.stats();
        assert_eq!(stats[0].total_frames, 2);
        assert_eq!(stats[0].inference_frames, 0);
    }

    #[test]
    fn set_cycle_validates_and_applies() -> Result<()> {
        let detector = CountingDetector::new(false);
        let policy = policy(detector.clone(), 2, 10, OverlayMode::Raw);

        assert!(matches!(policy.set_cycle(3, 2), Err(CameraError::InvalidInput(_))));
        assert!(matches!(policy.set_cycle(0, 0), Err(CameraError::InvalidInput(_))));

        policy.set_cycle(1, 1)?;
        for _ in 0..5 {
            assert_eq!(policy.process("cam1", frame())?.origin, FrameOrigin::Inference);
        }
        assert_eq!(policy.stats()[0].cycle, "1/1");
        Ok(())
    }

    #[test]
    fn zero_process_count_never_infers() -> Result<()> {
        let detector = CountingDetector::new(false);
        let policy = policy(detector.clone(), 0, 3, OverlayMode::default());
        for _ in 0..9 {
            policy.process("cam1", frame())?;
        }
        assert_eq!(detector.calls.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[test]
    fn overlay_parse_accepts_known_modes() {
        let freshness = Duration::from_secs(2);
        assert_eq!(
            OverlayMode::parse("Cached", freshness).ok(),
            Some(OverlayMode::Cached { freshness })
        );
        assert_eq!(OverlayMode::parse("raw", freshness).ok(), Some(OverlayMode::Raw));
        assert!(OverlayMode::parse("boxes", freshness).is_err());
    }

    #[test]
    fn stats_count_cache_hits() -> Result<()> {
        let detector = CountingDetector::new(false);
        let policy = policy(
            detector,
            1,
            3,
            OverlayMode::Cached {
                freshness: Duration::from_secs(60),
            },
        );
        // Counters 1..=6: 3 and 6 infer; 4 and 5 reuse.
        for _ in 0..6 {
            policy.process("cam1", frame())?;
        }
        let stats = &policy.stats()[0];
        assert_eq!(stats.total_frames, 6);
        assert_eq!(stats.inference_frames, 2);
        assert_eq!(stats.cached_frames, 2);
        Ok(())
    }

    #[test]
    fn detector_is_warmed_up_once_at_construction() -> Result<()> {
        let detector = CountingDetector::new(false);
        let policy = policy(detector.clone(), 1, 1, OverlayMode::Raw);
        policy.process("cam1", frame())?;
        policy.process("cam1", frame())?;
        assert_eq!(detector.warm_ups.load(Ordering::SeqCst), 1);

        let err = SamplingPolicy::new(Arc::new(ColdDetector), SamplingSettings::default())
            .err()
            .expect("warm-up failure");
        assert!(format!("{:#}", err).contains("weights missing"));
        Ok(())
    }

    #[test]
    fn overlay_can_be_switched_at_runtime() -> Result<()> {
        let detector = CountingDetector::new(false);
        let policy = policy(
            detector,
            1,
            2,
            OverlayMode::Cached {
                freshness: Duration::from_secs(60),
            },
        );
        // Counter 2 infers, counter 3 reuses the cache.
        policy.process("cam1", frame())?;
        policy.process("cam1", frame())?;
        assert_eq!(policy.process("cam1", frame())?.origin, FrameOrigin::Cached);

        policy.set_overlay(OverlayMode::Raw);
        assert_eq!(policy.settings().overlay, OverlayMode::Raw);
        // Counter 4 infers, counter 5 is skipped and now passes through.
        assert_eq!(policy.process("cam1", frame())?.origin, FrameOrigin::Inference);
        let skipped = policy.process("cam1", frame())?;
        assert_eq!(skipped.origin, FrameOrigin::Passthrough);
        assert!(skipped.detections.is_empty());
        Ok(())
    }

    #[test]
    fn forgotten_camera_leaves_stats_and_restarts_its_counter() -> Result<()> {
        let detector = CountingDetector::new(false);
        let policy = policy(detector, 1, 2, OverlayMode::Raw);
        policy.process("cam1", frame())?;
        policy.process("cam2", frame())?;

        policy.forget("cam1");
        let cameras: Vec<_> = policy.stats().into_iter().map(|s| s.camera).collect();
        assert_eq!(cameras, vec!["cam2".to_string()]);
        // Counter 1 again: 1 % 2 is not below 1.
        assert_eq!(policy.process("cam1", frame())?.origin, FrameOrigin::Passthrough);
        Ok(())
    }
}
