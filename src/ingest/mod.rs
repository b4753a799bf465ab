//! Per-camera frame acquisition.
//!
//! A `FrameSource` owns one background loop that pulls frames from a backend
//! and overwrites a single-slot mailbox. Backends:
//! - Local capture device (`"0"`), V4L2 behind the `ingest-v4l2` feature
//! - Remote stream decoded by an external process writing raw BGR24 frames to a pipe
//! - Synthetic frames (`stub://...`) for tests and demos
//!
//! The backend is resolved once from the source token when the `FrameSource`
//! is built. Backend failures never reach callers: the loop marks itself
//! stopped and exits, and `read()` starts returning `None`. Restarting is the
//! owner's job.

mod decoder;
mod synthetic;
mod v4l2;

use anyhow::{anyhow, Result};
use std::process::Child;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use crate::frame::{Frame, FrameSlot};

pub use synthetic::SyntheticMode;

/// Source token reserved for the local capture device.
pub const LOCAL_DEVICE_TOKEN: &str = "0";

const DEFAULT_WIDTH: u32 = 960;
const DEFAULT_HEIGHT: u32 = 540;
const DEFAULT_TARGET_FPS: u32 = 25;
const DEFAULT_DECODER: &str = "ffmpeg";

/// Backend selected from a camera's source token.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceKind {
    LocalDevice { index: u32 },
    RemoteDecodedStream { url: String },
    Synthetic(SyntheticMode),
}

impl SourceKind {
    pub fn from_token(token: &str) -> Self {
        let token = token.trim();
        if token == LOCAL_DEVICE_TOKEN {
            return SourceKind::LocalDevice { index: 0 };
        }
        if let Some(rest) = token.strip_prefix(synthetic::STUB_SCHEME) {
            return SourceKind::Synthetic(SyntheticMode::parse(rest));
        }
        SourceKind::RemoteDecodedStream {
            url: token.to_string(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SourceKind::LocalDevice { .. } => "local-device",
            SourceKind::RemoteDecodedStream { .. } => "remote-decoded",
            SourceKind::Synthetic(_) => "synthetic",
        }
    }
}

/// Frame geometry and decoder settings shared by all sources.
#[derive(Clone, Debug)]
pub struct SourceSettings {
    pub width: u32,
    pub height: u32,
    /// Pacing for synthetic sources and the requested device rate.
    pub target_fps: u32,
    /// Executable used to decode remote streams.
    pub decoder: String,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            target_fps: DEFAULT_TARGET_FPS,
            decoder: DEFAULT_DECODER.to_string(),
        }
    }
}

/// One blocking frame pull at a time. Runs on the acquisition thread only.
pub(crate) trait Grabber: Send {
    fn grab(&mut self, seq: u64) -> Result<Frame>;
}

/// An opened backend: the grabber moves into the loop, the decoder process (if
/// any) stays with the `FrameSource` so `stop()` can kill it and unblock the read.
pub(crate) struct OpenedBackend {
    grabber: Box<dyn Grabber>,
    process: Option<Child>,
}

fn open_backend(kind: &SourceKind, settings: &SourceSettings) -> Result<OpenedBackend> {
    match kind {
        SourceKind::LocalDevice { index } => Ok(OpenedBackend {
            grabber: v4l2::open_device(*index, settings)?,
            process: None,
        }),
        SourceKind::RemoteDecodedStream { url } => {
            let (grabber, child) = decoder::spawn_decoder(url, settings)?;
            Ok(OpenedBackend {
                grabber: Box::new(grabber),
                process: Some(child),
            })
        }
        SourceKind::Synthetic(mode) => Ok(OpenedBackend {
            grabber: Box::new(synthetic::SyntheticGrabber::new(mode.clone(), settings)),
            process: None,
        }),
    }
}

/// Statistics for one frame source.
#[derive(Clone, Debug)]
pub struct FrameSourceStats {
    pub frames_captured: u64,
    pub source: String,
    pub backend: &'static str,
}

/// Background frame acquisition for one running camera.
///
/// Instances are single-use: once stopped (or once the loop has died) a new
/// `FrameSource` must be built to capture again.
pub struct FrameSource {
    camera: String,
    source: String,
    kind: SourceKind,
    settings: SourceSettings,
    slot: Arc<FrameSlot>,
    running: Arc<AtomicBool>,
    /// Set by `stop`, never cleared.
    stopped: AtomicBool,
    frames_captured: Arc<AtomicU64>,
    worker: Mutex<Option<JoinHandle<()>>>,
    process: Mutex<Option<Child>>,
}

impl FrameSource {
    pub fn new(camera: &str, source: &str, settings: SourceSettings) -> Self {
        Self {
            camera: camera.to_string(),
            source: source.to_string(),
            kind: SourceKind::from_token(source),
            settings,
            slot: Arc::new(FrameSlot::new()),
            running: Arc::new(AtomicBool::new(false)),
            stopped: AtomicBool::new(false),
            frames_captured: Arc::new(AtomicU64::new(0)),
            worker: Mutex::new(None),
            process: Mutex::new(None),
        }
    }

    pub fn is_started(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Open the backend and spawn the acquisition loop.
    ///
    /// No-op if the loop is already running. Fails if the backend cannot be
    /// opened, or if this instance has already been used or stopped.
    pub fn start(&self) -> Result<()> {
        let mut worker = lock(&self.worker);
        if self.running.load(Ordering::SeqCst) {
            log::debug!("FrameSource[{}]: already started", self.camera);
            return Ok(());
        }
        if worker.is_some() || self.stopped.load(Ordering::SeqCst) {
            return Err(anyhow!(
                "frame source for '{}' has already run; build a new one",
                self.camera
            ));
        }

        let OpenedBackend { grabber, process } = open_backend(&self.kind, &self.settings)?;
        *lock(&self.process) = process;

        // Either `stop` sees the process and running flag set here, or this
        // sees its stopped flag and backs out.
        self.running.store(true, Ordering::SeqCst);
        if self.stopped.load(Ordering::SeqCst) {
            self.running.store(false, Ordering::SeqCst);
            if let Some(child) = lock(&self.process).take() {
                reap(&self.camera, child);
            }
            return Err(anyhow!(
                "frame source for '{}' was stopped while opening",
                self.camera
            ));
        }
        let camera = self.camera.clone();
        let slot = Arc::clone(&self.slot);
        let running = Arc::clone(&self.running);
        let frames = Arc::clone(&self.frames_captured);
        let spawned = std::thread::Builder::new()
            .name(format!("acquire-{}", self.camera))
            .spawn(move || acquisition_loop(camera, grabber, slot, running, frames));

        match spawned {
            Ok(handle) => {
                *worker = Some(handle);
                log::info!(
                    "FrameSource[{}]: started ({} backend)",
                    self.camera,
                    self.kind.label()
                );
                Ok(())
            }
            Err(err) => {
                self.running.store(false, Ordering::Release);
                if let Some(child) = lock(&self.process).take() {
                    reap(&self.camera, child);
                }
                Err(anyhow::Error::new(err).context("spawn acquisition thread"))
            }
        }
    }

    /// Latest frame, or `None` if nothing has arrived yet or the loop is not
    /// running. Never blocks beyond the slot's pointer swap.
    pub fn read(&self) -> Option<Arc<Frame>> {
        if !self.running.load(Ordering::Acquire) {
            return None;
        }
        self.slot.latest()
    }

    /// Signal the loop, release the OS resource, and join. Safe to call any
    /// number of times, including after the loop has exited on its own.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);

        // A decoder blocked in a pipe read only wakes up once the process is gone.
        if let Some(child) = lock(&self.process).take() {
            reap(&self.camera, child);
        }

        if let Some(handle) = lock(&self.worker).take() {
            if handle.join().is_err() {
                log::error!("FrameSource[{}]: acquisition thread panicked", self.camera);
            }
            log::info!("FrameSource[{}]: stopped", self.camera);
        }
        self.slot.clear();
    }

    pub fn stats(&self) -> FrameSourceStats {
        FrameSourceStats {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            source: self.source.clone(),
            backend: self.kind.label(),
        }
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn acquisition_loop(
    camera: String,
    mut grabber: Box<dyn Grabber>,
    slot: Arc<FrameSlot>,
    running: Arc<AtomicBool>,
    frames: Arc<AtomicU64>,
) {
    let mut seq = 0u64;
    while running.load(Ordering::Acquire) {
        seq += 1;
        match grabber.grab(seq) {
            Ok(frame) => {
                slot.publish(frame);
                frames.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                if running.load(Ordering::Acquire) {
                    log::warn!(
                        "FrameSource[{}]: acquisition failed after {} frames: {:#}",
                        camera,
                        seq - 1,
                        err
                    );
                } else {
                    log::debug!("FrameSource[{}]: backend closed during stop", camera);
                }
                break;
            }
        }
    }
    running.store(false, Ordering::Release);
}

fn reap(camera: &str, mut child: Child) {
    if let Err(err) = child.kill() {
        // Already exited; wait() below still collects it.
        log::debug!("FrameSource[{}]: decoder kill: {}", camera, err);
    }
    match child.wait() {
        Ok(status) => log::debug!("FrameSource[{}]: decoder exited ({})", camera, status),
        Err(err) => log::warn!("FrameSource[{}]: failed to reap decoder: {}", camera, err),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
