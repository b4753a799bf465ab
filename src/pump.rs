//! Fixed-cadence read → submit loop.
//!
//! Each tick walks a snapshot of the running sources, reads the latest frame
//! of each, and offers it to the dispatcher. A source that yields no frame for
//! `max_missed_reads` consecutive ticks is handed to the registry as an
//! unexpected stop. Completed frames reach the `FeedSink` only while their
//! camera is still running and still the active feed.

use anyhow::{anyhow, Context, Result};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::dispatch::{Dispatcher, Submission};
use crate::registry::{CameraRegistry, StopOutcome};
use crate::sampling::ProcessedFrame;

pub const DEFAULT_CADENCE: Duration = Duration::from_millis(40);
pub const DEFAULT_MAX_MISSED_READS: u32 = 10;

/// Receives processed frames for the active feed.
pub trait FeedSink: Send + Sync {
    fn emit(&self, frame: &ProcessedFrame);
}

#[derive(Clone, Debug)]
pub struct PumpSettings {
    pub cadence: Duration,
    pub max_missed_reads: u32,
}

impl Default for PumpSettings {
    fn default() -> Self {
        Self {
            cadence: DEFAULT_CADENCE,
            max_missed_reads: DEFAULT_MAX_MISSED_READS,
        }
    }
}

/// What one tick did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub frames_read: usize,
    pub submitted: usize,
    pub missed: usize,
    pub auto_stopped: Vec<String>,
}

pub struct FramePump {
    registry: Arc<CameraRegistry>,
    dispatcher: Arc<Dispatcher>,
    sink: Arc<dyn FeedSink>,
    settings: PumpSettings,
    missed_reads: HashMap<String, u32>,
    /// Cameras seen running on the previous tick.
    known: HashSet<String>,
}

impl FramePump {
    pub fn new(
        registry: Arc<CameraRegistry>,
        dispatcher: Arc<Dispatcher>,
        sink: Arc<dyn FeedSink>,
        settings: PumpSettings,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            sink,
            settings,
            missed_reads: HashMap::new(),
            known: HashSet::new(),
        }
    }

    /// Run the loop on its own thread until the handle is stopped.
    pub fn spawn(
        registry: Arc<CameraRegistry>,
        dispatcher: Arc<Dispatcher>,
        sink: Arc<dyn FeedSink>,
        settings: PumpSettings,
    ) -> Result<PumpHandle> {
        let mut pump = Self::new(registry, dispatcher, sink, settings);
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let join = std::thread::Builder::new()
            .name("frame-pump".to_string())
            .spawn(move || pump.run(&flag))
            .context("spawn frame pump")?;
        Ok(PumpHandle {
            shutdown,
            join: Some(join),
        })
    }

    fn run(&mut self, shutdown: &AtomicBool) {
        log::info!(
            "frame pump: cadence {:?}, auto-stop after {} missed reads",
            self.settings.cadence,
            self.settings.max_missed_reads
        );
        while !shutdown.load(Ordering::SeqCst) {
            let started = Instant::now();
            self.tick();
            std::thread::sleep(self.settings.cadence.saturating_sub(started.elapsed()));
        }
        log::info!("frame pump: stopped");
    }

    /// One pass over the running sources.
    pub fn tick(&mut self) -> TickSummary {
        let mut summary = TickSummary::default();
        let streams = self.registry.streams();
        self.missed_reads.retain(|name, _| streams.contains_key(name));
        for gone in self.known.iter().filter(|name| !streams.contains_key(*name)) {
            log::debug!("frame pump: {} no longer running, dropping its state", gone);
            self.dispatcher.forget(gone);
        }
        self.known = streams.keys().cloned().collect();

        for (name, source) in streams {
            let Some(frame) = source.read() else {
                summary.missed += 1;
                let misses = self.missed_reads.entry(name.clone()).or_insert(0);
                *misses += 1;
                if *misses < self.settings.max_missed_reads {
                    continue;
                }
                self.missed_reads.remove(&name);
                match self.registry.handle_stalled_source(&name, &source) {
                    Ok(StopOutcome::Stopped) => summary.auto_stopped.push(name),
                    Ok(StopOutcome::NotRunning) => {}
                    Err(err) => log::error!("frame pump: auto-stop of {} failed: {}", name, err),
                }
                continue;
            };

            summary.frames_read += 1;
            self.missed_reads.remove(&name);

            let registry = Arc::clone(&self.registry);
            let sink = Arc::clone(&self.sink);
            let submission = self.dispatcher.submit(&name, frame, move |camera, processed| {
                emit_if_live(&registry, sink.as_ref(), camera, &processed);
            });
            if submission == Submission::Accepted {
                summary.submitted += 1;
            }
        }
        summary
    }
}

fn emit_if_live(
    registry: &CameraRegistry,
    sink: &dyn FeedSink,
    camera: &str,
    processed: &ProcessedFrame,
) {
    let is_feed = registry.get_active_feed().as_deref() == Some(camera);
    if !is_feed || !registry.is_running(camera) {
        log::debug!("frame pump: {} is not the live feed, frame dropped", camera);
        return;
    }
    sink.emit(processed);
}

pub struct PumpHandle {
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl PumpHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("frame pump thread panicked"))?;
        }
        Ok(())
    }
}

impl Drop for PumpHandle {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}
