use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::dispatch::{DispatchSettings, DEFAULT_MIN_INTERVAL, DEFAULT_WORKERS};
use crate::ingest::SourceSettings;
use crate::pump::{PumpSettings, DEFAULT_CADENCE, DEFAULT_MAX_MISSED_READS};
use crate::registry::{CameraSeed, ProbeSettings};
use crate::sampling::{
    OverlayMode, SamplingSettings, DEFAULT_CYCLE_LENGTH, DEFAULT_FRESHNESS, DEFAULT_PROCESS_COUNT,
};

const DEFAULT_DB_PATH: &str = "feedwatch.db";
const DEFAULT_OVERLAY: &str = "cached";

#[derive(Debug, Deserialize, Default)]
struct FeedwatchConfigFile {
    db_path: Option<String>,
    frames: Option<FramesConfigFile>,
    probe: Option<ProbeConfigFile>,
    dispatch: Option<DispatchConfigFile>,
    sampling: Option<SamplingConfigFile>,
    pump: Option<PumpConfigFile>,
    cameras: Option<Vec<CameraConfigFile>>,
}

#[derive(Debug, Deserialize, Default)]
struct FramesConfigFile {
    width: Option<u32>,
    height: Option<u32>,
    target_fps: Option<u32>,
    decoder: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ProbeConfigFile {
    attempts: Option<u32>,
    backoff_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct DispatchConfigFile {
    workers: Option<usize>,
    min_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct SamplingConfigFile {
    process_count: Option<u32>,
    cycle_length: Option<u32>,
    overlay: Option<String>,
    freshness_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct PumpConfigFile {
    cadence_ms: Option<u64>,
    max_missed_reads: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct CameraConfigFile {
    name: String,
    source: String,
    tag: String,
}

/// `CAMERA_SOURCES` entry: `{ "<name>": { "url": ..., "tag": ... } }`.
#[derive(Debug, Deserialize)]
struct EnvCameraSource {
    url: String,
    tag: String,
}

#[derive(Debug, Clone)]
pub struct FeedwatchConfig {
    pub db_path: String,
    pub frames: SourceSettings,
    pub probe: ProbeSettings,
    pub dispatch: DispatchSettings,
    pub sampling: SamplingSettings,
    pub pump: PumpSettings,
    /// Cameras registered at startup.
    pub cameras: Vec<CameraSeed>,
}

impl FeedwatchConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("FEEDWATCH_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: FeedwatchConfigFile) -> Result<Self> {
        let db_path = file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string());

        let defaults = SourceSettings::default();
        let frames = file.frames.unwrap_or_default();
        let frames = SourceSettings {
            width: frames.width.unwrap_or(defaults.width),
            height: frames.height.unwrap_or(defaults.height),
            target_fps: frames.target_fps.unwrap_or(defaults.target_fps),
            decoder: frames.decoder.unwrap_or(defaults.decoder),
        };

        let defaults = ProbeSettings::default();
        let probe = file.probe.unwrap_or_default();
        let probe = ProbeSettings {
            attempts: probe.attempts.unwrap_or(defaults.attempts),
            backoff: probe
                .backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.backoff),
        };

        let dispatch = file.dispatch.unwrap_or_default();
        let dispatch = DispatchSettings {
            workers: dispatch.workers.unwrap_or(DEFAULT_WORKERS),
            min_interval: dispatch
                .min_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_MIN_INTERVAL),
        };

        let sampling = file.sampling.unwrap_or_default();
        let freshness = sampling
            .freshness_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_FRESHNESS);
        let overlay = OverlayMode::parse(
            sampling.overlay.as_deref().unwrap_or(DEFAULT_OVERLAY),
            freshness,
        )?;
        let sampling = SamplingSettings {
            process_count: sampling.process_count.unwrap_or(DEFAULT_PROCESS_COUNT),
            cycle_length: sampling.cycle_length.unwrap_or(DEFAULT_CYCLE_LENGTH),
            overlay,
        };

        let pump = file.pump.unwrap_or_default();
        let pump = PumpSettings {
            cadence: pump
                .cadence_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_CADENCE),
            max_missed_reads: pump.max_missed_reads.unwrap_or(DEFAULT_MAX_MISSED_READS),
        };

        let cameras = file
            .cameras
            .unwrap_or_default()
            .into_iter()
            .map(|camera| CameraSeed {
                name: camera.name,
                source: camera.source,
                tag: camera.tag,
            })
            .collect();

        Ok(Self {
            db_path,
            frames,
            probe,
            dispatch,
            sampling,
            pump,
            cameras,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("FEEDWATCH_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(decoder) = std::env::var("FEEDWATCH_DECODER") {
            if !decoder.trim().is_empty() {
                self.frames.decoder = decoder;
            }
        }
        if let Ok(workers) = std::env::var("FEEDWATCH_WORKERS") {
            self.dispatch.workers = workers
                .trim()
                .parse()
                .map_err(|_| anyhow!("FEEDWATCH_WORKERS must be a positive integer"))?;
        }
        if let Ok(interval) = std::env::var("FEEDWATCH_MIN_INTERVAL_MS") {
            let millis: u64 = interval.trim().parse().map_err(|_| {
                anyhow!("FEEDWATCH_MIN_INTERVAL_MS must be an integer number of milliseconds")
            })?;
            self.dispatch.min_interval = Duration::from_millis(millis);
        }
        if let Ok(cycle) = std::env::var("FEEDWATCH_SKIP_CYCLE") {
            let (process_count, cycle_length) = parse_cycle(&cycle)?;
            self.sampling.process_count = process_count;
            self.sampling.cycle_length = cycle_length;
        }
        if let Ok(overlay) = std::env::var("FEEDWATCH_OVERLAY") {
            let freshness = match self.sampling.overlay {
                OverlayMode::Cached { freshness } => freshness,
                OverlayMode::Raw => DEFAULT_FRESHNESS,
            };
            self.sampling.overlay = OverlayMode::parse(&overlay, freshness)?;
        }
        if let Ok(cadence) = std::env::var("FEEDWATCH_PUMP_CADENCE_MS") {
            let millis: u64 = cadence.trim().parse().map_err(|_| {
                anyhow!("FEEDWATCH_PUMP_CADENCE_MS must be an integer number of milliseconds")
            })?;
            self.pump.cadence = Duration::from_millis(millis);
        }
        if let Ok(sources) = std::env::var("CAMERA_SOURCES") {
            if !sources.trim().is_empty() {
                self.merge_camera_sources(&sources)?;
            }
        }
        Ok(())
    }

    /// Entries from `CAMERA_SOURCES` replace file entries of the same name.
    fn merge_camera_sources(&mut self, raw: &str) -> Result<()> {
        let parsed: BTreeMap<String, EnvCameraSource> = serde_json::from_str(raw)
            .map_err(|e| anyhow!("CAMERA_SOURCES must be a JSON object of {{url, tag}}: {}", e))?;
        for (name, source) in parsed {
            let seed = CameraSeed {
                name,
                source: source.url,
                tag: source.tag,
            };
            match self.cameras.iter_mut().find(|c| c.name == seed.name) {
                Some(existing) => *existing = seed,
                None => self.cameras.push(seed),
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.frames.width == 0 || self.frames.height == 0 {
            return Err(anyhow!("frame width and height must be greater than zero"));
        }
        if self.probe.attempts == 0 {
            return Err(anyhow!("probe attempts must be greater than zero"));
        }
        if self.dispatch.workers == 0 {
            return Err(anyhow!("dispatch workers must be greater than zero"));
        }
        if self.pump.max_missed_reads == 0 {
            return Err(anyhow!("pump max_missed_reads must be greater than zero"));
        }
        self.sampling.validate()?;
        for camera in &self.cameras {
            crate::validate_camera_name(&camera.name)?;
            if camera.source.trim().is_empty() || camera.tag.trim().is_empty() {
                return Err(anyhow!("camera {} needs a source and a tag", camera.name));
            }
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<FeedwatchConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

/// `"<process>/<cycle>"`, e.g. `"2/10"`.
fn parse_cycle(value: &str) -> Result<(u32, u32)> {
    let (process, cycle) = value
        .trim()
        .split_once('/')
        .ok_or_else(|| anyhow!("FEEDWATCH_SKIP_CYCLE must look like <process>/<cycle>"))?;
    let process = process
        .trim()
        .parse()
        .map_err(|_| anyhow!("FEEDWATCH_SKIP_CYCLE process count must be an integer"))?;
    let cycle = cycle
        .trim()
        .parse()
        .map_err(|_| anyhow!("FEEDWATCH_SKIP_CYCLE cycle length must be an integer"))?;
    Ok((process, cycle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gets_every_default() -> Result<()> {
        let cfg = FeedwatchConfig::from_file(FeedwatchConfigFile::default())?;
        assert_eq!(cfg.db_path, "feedwatch.db");
        assert_eq!((cfg.frames.width, cfg.frames.height), (960, 540));
        assert_eq!(cfg.frames.decoder, "ffmpeg");
        assert_eq!(cfg.probe.attempts, 7);
        assert_eq!(cfg.probe.backoff, Duration::from_millis(500));
        assert_eq!(cfg.dispatch.workers, 4);
        assert_eq!(cfg.dispatch.min_interval, Duration::from_millis(100));
        assert_eq!((cfg.sampling.process_count, cfg.sampling.cycle_length), (2, 10));
        assert_eq!(
            cfg.sampling.overlay,
            OverlayMode::Cached {
                freshness: Duration::from_secs(2)
            }
        );
        assert_eq!(cfg.pump.cadence, Duration::from_millis(40));
        assert_eq!(cfg.pump.max_missed_reads, 10);
        assert!(cfg.cameras.is_empty());
        cfg.validate()
    }

    #[test]
    fn cycle_strings_parse() -> Result<()> {
        assert_eq!(parse_cycle("2/10")?, (2, 10));
        assert_eq!(parse_cycle(" 1 / 3 ")?, (1, 3));
        assert!(parse_cycle("2:10").is_err());
        assert!(parse_cycle("a/10").is_err());
        Ok(())
    }

    #[test]
    fn env_camera_sources_replace_same_named_entries() -> Result<()> {
        let mut cfg = FeedwatchConfig::from_file(FeedwatchConfigFile::default())?;
        cfg.cameras.push(CameraSeed {
            name: "cam1".into(),
            source: "rtsp://old".into(),
            tag: "lobby".into(),
        });
        cfg.merge_camera_sources(
            r#"{"cam1": {"url": "rtsp://new", "tag": "lobby"}, "cam2": {"url": "0", "tag": "desk"}}"#,
        )?;
        assert_eq!(cfg.cameras.len(), 2);
        assert_eq!(cfg.cameras[0].source, "rtsp://new");
        assert_eq!(cfg.cameras[1].name, "cam2");
        assert!(cfg.merge_camera_sources("[1, 2]").is_err());
        Ok(())
    }

    #[test]
    fn validation_rejects_inconsistent_sampling() -> Result<()> {
        let mut cfg = FeedwatchConfig::from_file(FeedwatchConfigFile::default())?;
        cfg.sampling.process_count = 11;
        assert!(cfg.validate().is_err());
        cfg.sampling.process_count = 2;
        cfg.cameras.push(CameraSeed {
            name: "bad name".into(),
            source: "0".into(),
            tag: "desk".into(),
        });
        assert!(cfg.validate().is_err());
        Ok(())
    }
}
