//! feedwatchd - multi-camera acquisition daemon
//!
//! This daemon:
//! 1. Opens the camera store and registers the configured cameras
//! 2. Starts one acquisition loop per responsive camera
//! 3. Pumps the latest frame of each camera through the sampling dispatcher
//! 4. Emits processed frames of the active feed
//! 5. On Ctrl-C, stops the pump and every camera, closing their periods

use anyhow::{anyhow, Result};
use std::sync::{mpsc, Arc};

use feedwatch::{
    CameraRegistry, Dispatcher, FeedSink, FeedwatchConfig, FramePump, ProcessedFrame,
    SamplingPolicy, SqliteStore, StubDetector,
};

/// Logs feed frames instead of shipping them anywhere.
struct LogSink;

impl FeedSink for LogSink {
    fn emit(&self, frame: &ProcessedFrame) {
        log::debug!(
            "feed {}: frame #{} ({:?}, {} detections)",
            frame.camera,
            frame.frame.seq,
            frame.origin,
            frame.detections.len()
        );
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = FeedwatchConfig::load()?;
    let store = SqliteStore::open(&config.db_path)?;
    log::info!("feedwatchd: store {}", config.db_path);

    let registry = Arc::new(CameraRegistry::new(
        Box::new(store),
        config.frames.clone(),
        config.probe.clone(),
    ));
    for (name, outcome) in registry.bootstrap(&config.cameras) {
        match outcome {
            Ok(outcome) => log::info!("bootstrap: {} {:?}", name, outcome),
            Err(err) => log::warn!("bootstrap: {} not running: {}", name, err),
        }
    }
    // Cameras already in the store but not in the config come up too.
    registry.start_all()?;
    log::info!("feedwatchd: {} cameras running", registry.count_running());

    let policy = SamplingPolicy::new(Arc::new(StubDetector::new()), config.sampling)?;
    let dispatcher = Arc::new(Dispatcher::new(Arc::new(policy), config.dispatch.clone())?);
    let pump = FramePump::spawn(
        Arc::clone(&registry),
        Arc::clone(&dispatcher),
        Arc::new(LogSink),
        config.pump.clone(),
    )?;

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!("feedwatchd waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping cameras...");

    pump.stop()?;
    for (name, outcome) in registry.stop_all() {
        if let Err(err) = outcome {
            log::warn!("shutdown: failed to stop {}: {}", name, err);
        }
    }
    dispatcher.shutdown();
    Ok(())
}
