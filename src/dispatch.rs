//! Throttled, deduplicating work submission onto a fixed worker pool.
//!
//! Per camera key, at most one submission is in flight and accepted
//! submissions are at least `min_interval` apart. Anything else is dropped on
//! the spot: the pump will offer a newer frame on its next tick anyway.
//!
//! Worker failures stay inside the worker. A processor error or panic is
//! logged, the key is released, and the callback is not invoked.

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::frame::Frame;
use crate::sampling::ProcessedFrame;

pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_millis(100);

/// The expensive per-frame step run on the pool.
pub trait FrameProcessor: Send + Sync {
    fn process(&self, camera: &str, frame: Arc<Frame>) -> Result<ProcessedFrame>;

    /// Drop any per-camera state. Called once the camera is no longer running.
    fn forget(&self, _camera: &str) {}
}

#[derive(Clone, Debug)]
pub struct DispatchSettings {
    pub workers: usize,
    pub min_interval: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            min_interval: DEFAULT_MIN_INTERVAL,
        }
    }
}

/// What `submit` did with a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Submission {
    Accepted,
    /// A previous submission for the key has not finished.
    DroppedBusy,
    /// The last accepted submission for the key is younger than `min_interval`.
    DroppedTooSoon,
    /// The dispatcher has been shut down.
    Closed,
}

type DoneCallback = Box<dyn FnOnce(&str, ProcessedFrame) + Send + 'static>;

struct Job {
    camera: String,
    frame: Arc<Frame>,
    on_done: DoneCallback,
}

#[derive(Default)]
struct KeyState {
    pending: bool,
    last_accepted: Option<Instant>,
}

type KeyMap = Arc<Mutex<HashMap<String, KeyState>>>;

pub struct Dispatcher {
    settings: DispatchSettings,
    processor: Arc<dyn FrameProcessor>,
    sender: Mutex<Option<Sender<Job>>>,
    keys: KeyMap,
    cancelled: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(processor: Arc<dyn FrameProcessor>, settings: DispatchSettings) -> Result<Self> {
        anyhow::ensure!(settings.workers > 0, "dispatcher needs at least one worker");

        // Queue depth is bounded by the number of keys: one pending job each.
        let (sender, receiver) = crossbeam_channel::unbounded::<Job>();
        let keys: KeyMap = Arc::new(Mutex::new(HashMap::new()));
        let cancelled = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(settings.workers);
        for index in 0..settings.workers {
            let receiver = receiver.clone();
            let processor = Arc::clone(&processor);
            let keys = Arc::clone(&keys);
            let cancelled = Arc::clone(&cancelled);
            let handle = std::thread::Builder::new()
                .name(format!("dispatch-{}", index))
                .spawn(move || worker_loop(receiver, processor, keys, cancelled))
                .with_context(|| format!("spawn dispatch worker {}", index))?;
            workers.push(handle);
        }

        log::info!(
            "dispatcher: {} workers, min interval {:?}",
            settings.workers,
            settings.min_interval
        );
        Ok(Self {
            settings,
            processor,
            sender: Mutex::new(Some(sender)),
            keys,
            cancelled,
            workers: Mutex::new(workers),
        })
    }

    /// Offer `frame` for `camera`. Never blocks on the pool.
    ///
    /// On acceptance, `on_done` runs on a worker thread exactly once if the
    /// processor succeeds, and never otherwise.
    pub fn submit<F>(&self, camera: &str, frame: Arc<Frame>, on_done: F) -> Submission
    where
        F: FnOnce(&str, ProcessedFrame) + Send + 'static,
    {
        if self.cancelled.load(Ordering::Acquire) {
            return Submission::Closed;
        }

        {
            let mut keys = lock(&self.keys);
            let state = keys.entry(camera.to_string()).or_default();
            if state.pending {
                return Submission::DroppedBusy;
            }
            if let Some(last) = state.last_accepted {
                if last.elapsed() < self.settings.min_interval {
                    return Submission::DroppedTooSoon;
                }
            }
            state.pending = true;
            state.last_accepted = Some(Instant::now());
        }

        let job = Job {
            camera: camera.to_string(),
            frame,
            on_done: Box::new(on_done),
        };
        let sent = match lock(&self.sender).as_ref() {
            Some(sender) => sender.send(job).is_ok(),
            None => false,
        };
        if !sent {
            release(&self.keys, camera);
            return Submission::Closed;
        }
        Submission::Accepted
    }

    /// True while a submission for `camera` is queued or running.
    pub fn is_pending(&self, camera: &str) -> bool {
        lock(&self.keys)
            .get(camera)
            .is_some_and(|state| state.pending)
    }

    /// Drop the throttle state for `camera` and the processor's state for it.
    /// An in-flight job still finishes and keeps its key until then.
    pub fn forget(&self, camera: &str) {
        {
            let mut keys = lock(&self.keys);
            if keys.get(camera).is_some_and(|state| !state.pending) {
                keys.remove(camera);
            }
        }
        self.processor.forget(camera);
    }

    /// Stop accepting work, discard queued jobs, and join the pool. Jobs
    /// already running finish, but their results are dropped.
    pub fn shutdown(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        lock(&self.sender).take();

        let current = std::thread::current().id();
        let workers = std::mem::take(&mut *lock(&self.workers));
        for handle in workers {
            // A callback may be the one shutting us down.
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                log::error!("dispatcher: worker thread panicked");
            }
        }
        log::info!("dispatcher: shut down");
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    receiver: Receiver<Job>,
    processor: Arc<dyn FrameProcessor>,
    keys: KeyMap,
    cancelled: Arc<AtomicBool>,
) {
    for job in receiver.iter() {
        let Job {
            camera,
            frame,
            on_done,
        } = job;

        if cancelled.load(Ordering::Acquire) {
            release(&keys, &camera);
            continue;
        }

        let started = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| processor.process(&camera, frame)));
        // Released before the callback so the callback may resubmit.
        release(&keys, &camera);

        match outcome {
            Ok(Ok(processed)) => {
                if cancelled.load(Ordering::Acquire) {
                    continue;
                }
                log::debug!("dispatch[{}]: processed in {:?}", camera, started.elapsed());
                if catch_unwind(AssertUnwindSafe(|| on_done(&camera, processed))).is_err() {
                    log::error!("dispatch[{}]: completion callback panicked", camera);
                }
            }
            Ok(Err(err)) => {
                log::error!("dispatch[{}]: processing failed: {:#}", camera, err);
            }
            Err(_) => {
                log::error!("dispatch[{}]: processing panicked", camera);
            }
        }
    }
}

fn release(keys: &Mutex<HashMap<String, KeyState>>, camera: &str) {
    if let Some(state) = lock(keys).get_mut(camera) {
        state.pending = false;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
