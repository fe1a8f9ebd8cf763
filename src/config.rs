use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::frame::{BufferCapacity, CropRect, DEFAULT_QUEUE_SIZE};
use crate::ingest::CaptureMethod;
use crate::manager::ManagerOptions;

const DEFAULT_SOURCES_PATH: &str = "sources.txt";
const DEFAULT_RECONNECT_SECS: u64 = 20;
const DEFAULT_PRODUCER_PAUSE_THRESHOLD: usize = 10;

#[derive(Debug, Deserialize, Default)]
struct ManagerConfigFile {
    sources: Option<PathBuf>,
    method: Option<CaptureMethod>,
    queue_size: Option<QueueSizeFile>,
    recording_dir: Option<PathBuf>,
    max_height: Option<u32>,
    crop: Option<Vec<i64>>,
    reconnect: Option<ReconnectConfigFile>,
    rtsp: Option<RtspConfigFile>,
    producer_pause_threshold: Option<usize>,
}

/// `queue_size = 5` or `queue_size = "unbounded"`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum QueueSizeFile {
    Size(usize),
    Named(String),
}

#[derive(Debug, Deserialize, Default)]
struct ReconnectConfigFile {
    enabled: Option<bool>,
    threshold_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct RtspConfigFile {
    tcp: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Source list file (`name,type:address[,fps]` per line).
    pub sources: PathBuf,
    pub method: CaptureMethod,
    /// `None` leaves the choice to the manager (unbounded for all-file lists).
    pub queue_size: Option<BufferCapacity>,
    pub recording_dir: Option<PathBuf>,
    pub max_height: Option<u32>,
    pub frame_crop: Option<CropRect>,
    pub reconnect: ReconnectSettings,
    pub rtsp_tcp: bool,
    pub producer_pause_threshold: usize,
}

#[derive(Debug, Clone)]
pub struct ReconnectSettings {
    pub enabled: bool,
    pub threshold: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            sources: PathBuf::from(DEFAULT_SOURCES_PATH),
            method: CaptureMethod::default(),
            queue_size: None,
            recording_dir: None,
            max_height: None,
            frame_crop: None,
            reconnect: ReconnectSettings {
                enabled: true,
                threshold: Duration::from_secs(DEFAULT_RECONNECT_SECS),
            },
            rtsp_tcp: true,
            producer_pause_threshold: DEFAULT_PRODUCER_PAUSE_THRESHOLD,
        }
    }
}

impl ManagerConfig {
    /// Load `MULTICAM_CONFIG` (if set), then apply `MULTICAM_*` overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("MULTICAM_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load a config file without consulting the environment.
    pub fn from_path(path: &Path) -> Result<Self> {
        let cfg = Self::from_file(read_config_file(path)?)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ManagerConfigFile) -> Result<Self> {
        let defaults = Self::default();
        let queue_size = match file.queue_size {
            Some(QueueSizeFile::Size(size)) => Some(BufferCapacity::Bounded(size)),
            Some(QueueSizeFile::Named(name)) => Some(parse_queue_size(&name)?),
            None => None,
        };
        let frame_crop = match file.crop {
            Some(values) => Some(CropRect::from_ltrb(&values)?),
            None => None,
        };
        let reconnect = ReconnectSettings {
            enabled: file
                .reconnect
                .as_ref()
                .and_then(|reconnect| reconnect.enabled)
                .unwrap_or(defaults.reconnect.enabled),
            threshold: file
                .reconnect
                .and_then(|reconnect| reconnect.threshold_secs)
                .map(Duration::from_secs)
                .unwrap_or(defaults.reconnect.threshold),
        };
        Ok(Self {
            sources: file.sources.unwrap_or(defaults.sources),
            method: file.method.unwrap_or(defaults.method),
            queue_size,
            recording_dir: file.recording_dir,
            max_height: file.max_height,
            frame_crop,
            reconnect,
            rtsp_tcp: file.rtsp.and_then(|rtsp| rtsp.tcp).unwrap_or(defaults.rtsp_tcp),
            producer_pause_threshold: file
                .producer_pause_threshold
                .unwrap_or(defaults.producer_pause_threshold),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(sources) = env_value("MULTICAM_SOURCES") {
            self.sources = PathBuf::from(sources);
        }
        if let Some(method) = env_value("MULTICAM_METHOD") {
            self.method = method.parse()?;
        }
        if let Some(size) = env_value("MULTICAM_QUEUE_SIZE") {
            self.queue_size = Some(parse_queue_size(&size)?);
        }
        if let Some(dir) = env_value("MULTICAM_RECORDING_DIR") {
            self.recording_dir = Some(PathBuf::from(dir));
        }
        if let Some(secs) = env_value("MULTICAM_RECONNECT_SECS") {
            let seconds: u64 = secs.parse().map_err(|_| {
                anyhow!("MULTICAM_RECONNECT_SECS must be an integer number of seconds")
            })?;
            self.reconnect.threshold = Duration::from_secs(seconds);
        }
        if let Some(flag) = env_value("MULTICAM_DO_RECONNECT") {
            self.reconnect.enabled = parse_bool("MULTICAM_DO_RECONNECT", &flag)?;
        }
        if let Some(height) = env_value("MULTICAM_MAX_HEIGHT") {
            let height: u32 = height
                .parse()
                .map_err(|_| anyhow!("MULTICAM_MAX_HEIGHT must be a pixel count"))?;
            self.max_height = Some(height);
        }
        if let Some(flag) = env_value("MULTICAM_RTSP_TCP") {
            self.rtsp_tcp = parse_bool("MULTICAM_RTSP_TCP", &flag)?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.reconnect.threshold.is_zero() {
            return Err(anyhow!("reconnect threshold must be greater than zero"));
        }
        if self.queue_size == Some(BufferCapacity::Bounded(0)) {
            return Err(anyhow!("queue size must be greater than zero"));
        }
        if self.max_height == Some(0) {
            return Err(anyhow!("max height must be greater than zero"));
        }
        Ok(())
    }

    pub fn to_options(&self) -> ManagerOptions {
        ManagerOptions {
            buffer_capacity: self.queue_size,
            recording_dir: self.recording_dir.clone(),
            reconnect_threshold: self.reconnect.threshold,
            do_reconnect: self.reconnect.enabled,
            max_height: self.max_height,
            method: self.method,
            frame_crop: self.frame_crop,
            rtsp_tcp: self.rtsp_tcp,
            producer_pause_threshold: self.producer_pause_threshold,
            resize_fn: None,
        }
    }
}

/// `unbounded`, or a positive integer.
pub fn parse_queue_size(value: &str) -> Result<BufferCapacity> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("unbounded") {
        return Ok(BufferCapacity::Unbounded);
    }
    let size: usize = value.parse().map_err(|_| {
        anyhow!(
            "queue size must be an integer or \"unbounded\" (default {})",
            DEFAULT_QUEUE_SIZE
        )
    })?;
    Ok(BufferCapacity::Bounded(size))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(anyhow!("{} must be true or false", key)),
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn read_config_file(path: &Path) -> Result<ManagerConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let cfg = if is_json {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
