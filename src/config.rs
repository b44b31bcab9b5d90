use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::api::ApiConfig;
use crate::event_log::RecorderConfig;
use crate::ingest::SourceConfig;
use crate::pipeline::{CaptureConfig, DetectionConfig};
use crate::stream::StreamConfig;
use crate::toggle::DetectionToggles;

const DEFAULT_API_ADDR: &str = "0.0.0.0:5000";
const DEFAULT_SOURCE_URI: &str = "stub://camera";
const DEFAULT_SOURCE_WIDTH: u32 = 640;
const DEFAULT_SOURCE_HEIGHT: u32 = 480;
const DEFAULT_SOURCE_FPS: u32 = 30;
const DEFAULT_CAPTURE_INTERVAL_MS: u64 = 33;
const DEFAULT_JPEG_QUALITY: u8 = 80;
const DEFAULT_ACTIVE_INTERVAL_MS: u64 = 150;
const DEFAULT_IDLE_INTERVAL_MS: u64 = 500;
const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.45;
const DEFAULT_NMS_THRESHOLD: f32 = 0.4;
const DEFAULT_STREAM_INTERVAL_MS: u64 = 50;
const DEFAULT_STREAM_WAIT_MS: u64 = 100;
const DEFAULT_DB_PATH: &str = "access_log.db";
const DEFAULT_IMAGES_DIR: &str = "access_images";
const DEFAULT_COOLDOWN_SECS: u64 = 30;
const DEFAULT_TRIGGER_LABELS: &[&str] = &["person", "face"];
const DEFAULT_MAX_ENTRIES: usize = 500;

#[derive(Debug, Deserialize, Default)]
struct CamwatchConfigFile {
    api: Option<ApiConfigFile>,
    source: Option<SourceConfigFile>,
    capture: Option<CaptureConfigFile>,
    detection: Option<DetectionConfigFile>,
    stream: Option<StreamConfigFile>,
    access_log: Option<AccessLogConfigFile>,
    overlay: Option<OverlayConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    uri: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    target_fps: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    interval_ms: Option<u64>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    active_interval_ms: Option<u64>,
    idle_interval_ms: Option<u64>,
    faces: Option<bool>,
    objects: Option<bool>,
    faces_model: Option<PathBuf>,
    objects_model: Option<PathBuf>,
    labels_path: Option<PathBuf>,
    confidence_threshold: Option<f32>,
    nms_threshold: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    interval_ms: Option<u64>,
    wait_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct AccessLogConfigFile {
    db_path: Option<String>,
    images_dir: Option<PathBuf>,
    cooldown_secs: Option<u64>,
    trigger_labels: Option<Vec<String>>,
    max_entries: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct OverlayConfigFile {
    font_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct CamwatchConfig {
    pub api_addr: String,
    pub source: SourceConfig,
    pub capture: CaptureSettings,
    pub detection: DetectionSettings,
    pub stream: StreamSettings,
    pub access_log: AccessLogSettings,
    pub font_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub interval: Duration,
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone)]
pub struct DetectionSettings {
    pub active_interval: Duration,
    pub idle_interval: Duration,
    pub faces: bool,
    pub objects: bool,
    pub faces_model: Option<PathBuf>,
    pub objects_model: Option<PathBuf>,
    pub labels_path: Option<PathBuf>,
    pub confidence_threshold: f32,
    pub nms_threshold: f32,
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub interval: Duration,
    pub wait: Duration,
}

#[derive(Debug, Clone)]
pub struct AccessLogSettings {
    pub db_path: String,
    pub images_dir: PathBuf,
    pub cooldown: Duration,
    pub trigger_labels: Vec<String>,
    pub max_entries: usize,
}

impl CamwatchConfig {
    /// Defaults, overlaid by the JSON file named in `CAMWATCH_CONFIG`, then by
    /// individual env overrides, then validated.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CAMWATCH_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Like `load`, with an explicit config file instead of `CAMWATCH_CONFIG`.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => CamwatchConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: CamwatchConfigFile) -> Self {
        let api = file.api.unwrap_or_default();
        let source = file.source.unwrap_or_default();
        let capture = file.capture.unwrap_or_default();
        let detection = file.detection.unwrap_or_default();
        let stream = file.stream.unwrap_or_default();
        let access_log = file.access_log.unwrap_or_default();
        let overlay = file.overlay.unwrap_or_default();

        Self {
            api_addr: api.addr.unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
            source: SourceConfig {
                uri: source.uri.unwrap_or_else(|| DEFAULT_SOURCE_URI.to_string()),
                width: source.width.unwrap_or(DEFAULT_SOURCE_WIDTH),
                height: source.height.unwrap_or(DEFAULT_SOURCE_HEIGHT),
                target_fps: source.target_fps.unwrap_or(DEFAULT_SOURCE_FPS),
            },
            capture: CaptureSettings {
                interval: Duration::from_millis(
                    capture.interval_ms.unwrap_or(DEFAULT_CAPTURE_INTERVAL_MS),
                ),
                jpeg_quality: capture.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
            },
            detection: DetectionSettings {
                active_interval: Duration::from_millis(
                    detection
                        .active_interval_ms
                        .unwrap_or(DEFAULT_ACTIVE_INTERVAL_MS),
                ),
                idle_interval: Duration::from_millis(
                    detection.idle_interval_ms.unwrap_or(DEFAULT_IDLE_INTERVAL_MS),
                ),
                faces: detection.faces.unwrap_or(true),
                objects: detection.objects.unwrap_or(true),
                faces_model: detection.faces_model,
                objects_model: detection.objects_model,
                labels_path: detection.labels_path,
                confidence_threshold: detection
                    .confidence_threshold
                    .unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD),
                nms_threshold: detection.nms_threshold.unwrap_or(DEFAULT_NMS_THRESHOLD),
            },
            stream: StreamSettings {
                interval: Duration::from_millis(
                    stream.interval_ms.unwrap_or(DEFAULT_STREAM_INTERVAL_MS),
                ),
                wait: Duration::from_millis(stream.wait_ms.unwrap_or(DEFAULT_STREAM_WAIT_MS)),
            },
            access_log: AccessLogSettings {
                db_path: access_log
                    .db_path
                    .unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
                images_dir: access_log
                    .images_dir
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_IMAGES_DIR)),
                cooldown: Duration::from_secs(
                    access_log.cooldown_secs.unwrap_or(DEFAULT_COOLDOWN_SECS),
                ),
                trigger_labels: access_log.trigger_labels.unwrap_or_else(|| {
                    DEFAULT_TRIGGER_LABELS
                        .iter()
                        .map(|label| label.to_string())
                        .collect()
                }),
                max_entries: access_log.max_entries.unwrap_or(DEFAULT_MAX_ENTRIES),
            },
            font_path: overlay.font_path,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(addr) = non_empty_env("CAMWATCH_API_ADDR") {
            self.api_addr = addr;
        }
        if let Some(uri) = non_empty_env("CAMWATCH_SOURCE") {
            self.source.uri = uri;
        }
        if let Some(path) = non_empty_env("CAMWATCH_DB_PATH") {
            self.access_log.db_path = path;
        }
        if let Some(dir) = non_empty_env("CAMWATCH_IMAGES_DIR") {
            self.access_log.images_dir = PathBuf::from(dir);
        }
        if let Some(cooldown) = non_empty_env("CAMWATCH_COOLDOWN_SECS") {
            let seconds: u64 = cooldown.trim().parse().map_err(|_| {
                anyhow!("CAMWATCH_COOLDOWN_SECS must be an integer number of seconds")
            })?;
            self.access_log.cooldown = Duration::from_secs(seconds);
        }
        if let Ok(labels) = std::env::var("CAMWATCH_TRIGGER_LABELS") {
            let parsed = split_csv(&labels);
            if !parsed.is_empty() {
                self.access_log.trigger_labels = parsed;
            }
        }
        if let Some(path) = non_empty_env("CAMWATCH_FONT_PATH") {
            self.font_path = Some(PathBuf::from(path));
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if !(1..=100).contains(&self.capture.jpeg_quality) {
            return Err(anyhow!(
                "capture.jpeg_quality must be within 1..=100, got {}",
                self.capture.jpeg_quality
            ));
        }
        if self.access_log.cooldown.is_zero() {
            return Err(anyhow!("access_log.cooldown_secs must be greater than zero"));
        }
        for (name, interval) in [
            ("capture.interval_ms", self.capture.interval),
            ("detection.active_interval_ms", self.detection.active_interval),
            ("detection.idle_interval_ms", self.detection.idle_interval),
            ("stream.interval_ms", self.stream.interval),
            ("stream.wait_ms", self.stream.wait),
        ] {
            if interval.is_zero() {
                return Err(anyhow!("{} must be greater than zero", name));
            }
        }
        if self.detection.idle_interval < self.detection.active_interval {
            return Err(anyhow!(
                "detection.idle_interval_ms must not be shorter than detection.active_interval_ms"
            ));
        }
        if self.source.width == 0 || self.source.height == 0 {
            return Err(anyhow!("source width and height must be greater than zero"));
        }
        if self.access_log.max_entries == 0 {
            return Err(anyhow!("access_log.max_entries must be greater than zero"));
        }
        for (name, value) in [
            ("detection.confidence_threshold", self.detection.confidence_threshold),
            ("detection.nms_threshold", self.detection.nms_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow!("{} must be within 0..=1, got {}", name, value));
            }
        }

        self.access_log.trigger_labels = self
            .access_log
            .trigger_labels
            .iter()
            .map(|label| label.trim().to_lowercase())
            .filter(|label| !label.is_empty())
            .collect();
        let mut seen = HashSet::new();
        self.access_log
            .trigger_labels
            .retain(|label| seen.insert(label.clone()));
        if self.access_log.trigger_labels.is_empty() {
            return Err(anyhow!("access_log.trigger_labels must not be empty"));
        }
        Ok(())
    }

    pub fn api_config(&self) -> ApiConfig {
        ApiConfig {
            addr: self.api_addr.clone(),
            stream: StreamConfig {
                interval: self.stream.interval,
                wait: self.stream.wait,
            },
        }
    }

    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            interval: self.capture.interval,
            jpeg_quality: self.capture.jpeg_quality,
        }
    }

    pub fn detection_config(&self) -> DetectionConfig {
        DetectionConfig {
            active_interval: self.detection.active_interval,
            idle_interval: self.detection.idle_interval,
        }
    }

    pub fn initial_toggles(&self) -> DetectionToggles {
        DetectionToggles {
            faces: self.detection.faces,
            objects: self.detection.objects,
        }
    }

    pub fn recorder_config(&self) -> RecorderConfig {
        RecorderConfig {
            trigger_labels: self.access_log.trigger_labels.clone(),
            cooldown: self.access_log.cooldown,
            jpeg_quality: self.capture.jpeg_quality,
        }
    }
}

fn read_config_file(path: &Path) -> Result<CamwatchConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
