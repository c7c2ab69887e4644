use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::detect::{DetectionFilter, LabelTable, TensorSchema};
use crate::detect::debounce::{DEFAULT_DEBOUNCE_WINDOW, DEFAULT_MIN_CONSECUTIVE};
use crate::frame::{DEFAULT_BUFFER_FRAMES, DEFAULT_MAX_AGE_SECS};

const DEFAULT_CAPTURE_PROGRAM: &str = "rpicam-vid";
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_FRAMERATE: u32 = 15;
const DEFAULT_METADATA_PATH: &str = "/tmp/imx500_stream_detections.json";
const DEFAULT_STOP_GRACE_MS: u64 = 5_000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
const DEFAULT_RETRY_INTERVAL_MS: u64 = 500;
const DEFAULT_REPLAY_FPS: u32 = 15;
const DEFAULT_ENCODER_PROGRAM: &str = "ffmpeg";
const DEFAULT_ENCODE_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Deserialize, Default)]
struct EngineConfigFile {
    capture: Option<CaptureConfigFile>,
    metadata: Option<MetadataConfigFile>,
    detection: Option<DetectionConfigFile>,
    debounce: Option<DebounceConfigFile>,
    buffer: Option<BufferConfigFile>,
    replay: Option<ReplayConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    program: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    framerate: Option<u32>,
    post_process_file: Option<PathBuf>,
    metadata_path: Option<PathBuf>,
    stop_grace_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct MetadataConfigFile {
    poll_interval_ms: Option<u64>,
    retry_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    confidence_threshold: Option<f32>,
    min_width: Option<f32>,
    min_height: Option<f32>,
    min_area: Option<f32>,
    classes: Option<Vec<String>>,
    labels: Option<Vec<String>>,
    schema: Option<TensorSchema>,
}

#[derive(Debug, Deserialize, Default)]
struct DebounceConfigFile {
    window: Option<usize>,
    min_consecutive: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct BufferConfigFile {
    capacity: Option<usize>,
    max_age_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ReplayConfigFile {
    fps: Option<u32>,
    encoder_program: Option<String>,
    encoder_args: Option<Vec<String>>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub capture: CaptureSettings,
    pub metadata: MetadataSettings,
    pub detection: DetectionSettings,
    pub debounce: DebounceSettings,
    pub buffer: BufferSettings,
    pub replay: ReplaySettings,
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub program: String,
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    /// Accelerator post-processing config (model and output tensor setup).
    pub post_process_file: Option<PathBuf>,
    /// Side file the capture process appends per-frame metadata to.
    pub metadata_path: PathBuf,
    /// Time allowed between SIGTERM and SIGKILL on stop.
    pub stop_grace: Duration,
}

#[derive(Debug, Clone)]
pub struct MetadataSettings {
    pub poll_interval: Duration,
    /// Back-off after a metadata read error.
    pub retry_interval: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct DetectionSettings {
    pub schema: TensorSchema,
    pub labels: LabelTable,
    pub filter: DetectionFilter,
}

#[derive(Debug, Clone)]
pub struct DebounceSettings {
    pub window: usize,
    pub min_consecutive: u32,
}

#[derive(Debug, Clone)]
pub struct BufferSettings {
    pub capacity: usize,
    pub max_age: Duration,
}

#[derive(Debug, Clone)]
pub struct ReplaySettings {
    pub fps: u32,
    pub encoder_program: String,
    /// Arguments placed before the encoder arguments, for wrapping the
    /// encoder (`encoder_program = "nice"`, `encoder_args = ["-n", "10", "ffmpeg"]`).
    pub encoder_args: Vec<String>,
    pub timeout: Duration,
}

impl EngineConfig {
    /// Load from `$CAMSTREAM_CONFIG` (when set), then apply env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CAMSTREAM_CONFIG").ok().map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    /// Load from an explicit config file (JSON, or TOML by extension), then
    /// apply env overrides.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: EngineConfigFile) -> Self {
        let capture = file.capture.unwrap_or_default();
        let metadata = file.metadata.unwrap_or_default();
        let detection = file.detection.unwrap_or_default();
        let debounce = file.debounce.unwrap_or_default();
        let buffer = file.buffer.unwrap_or_default();
        let replay = file.replay.unwrap_or_default();
        let default_filter = DetectionFilter::default();

        Self {
            capture: CaptureSettings {
                program: capture
                    .program
                    .unwrap_or_else(|| DEFAULT_CAPTURE_PROGRAM.to_string()),
                width: capture.width.unwrap_or(DEFAULT_WIDTH),
                height: capture.height.unwrap_or(DEFAULT_HEIGHT),
                framerate: capture.framerate.unwrap_or(DEFAULT_FRAMERATE),
                post_process_file: capture.post_process_file,
                metadata_path: capture
                    .metadata_path
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_METADATA_PATH)),
                stop_grace: Duration::from_millis(
                    capture.stop_grace_ms.unwrap_or(DEFAULT_STOP_GRACE_MS),
                ),
            },
            metadata: MetadataSettings {
                poll_interval: Duration::from_millis(
                    metadata.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS),
                ),
                retry_interval: Duration::from_millis(
                    metadata
                        .retry_interval_ms
                        .unwrap_or(DEFAULT_RETRY_INTERVAL_MS),
                ),
            },
            detection: DetectionSettings {
                schema: detection.schema.unwrap_or_default(),
                labels: detection
                    .labels
                    .map(LabelTable::new)
                    .unwrap_or_else(LabelTable::coco),
                filter: DetectionFilter {
                    confidence_threshold: detection
                        .confidence_threshold
                        .unwrap_or(default_filter.confidence_threshold),
                    min_width: detection.min_width.unwrap_or(default_filter.min_width),
                    min_height: detection.min_height.unwrap_or(default_filter.min_height),
                    min_area: detection.min_area.unwrap_or(default_filter.min_area),
                    classes: detection.classes.unwrap_or(default_filter.classes),
                },
            },
            debounce: DebounceSettings {
                window: debounce.window.unwrap_or(DEFAULT_DEBOUNCE_WINDOW),
                min_consecutive: debounce.min_consecutive.unwrap_or(DEFAULT_MIN_CONSECUTIVE),
            },
            buffer: BufferSettings {
                capacity: buffer.capacity.unwrap_or(DEFAULT_BUFFER_FRAMES),
                max_age: Duration::from_secs(buffer.max_age_secs.unwrap_or(DEFAULT_MAX_AGE_SECS)),
            },
            replay: ReplaySettings {
                fps: replay.fps.unwrap_or(DEFAULT_REPLAY_FPS),
                encoder_program: replay
                    .encoder_program
                    .unwrap_or_else(|| DEFAULT_ENCODER_PROGRAM.to_string()),
                encoder_args: replay.encoder_args.unwrap_or_default(),
                timeout: Duration::from_secs(
                    replay.timeout_secs.unwrap_or(DEFAULT_ENCODE_TIMEOUT_SECS),
                ),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(width) = env_parse::<u32>("CAMSTREAM_WIDTH")? {
            self.capture.width = width;
        }
        if let Some(height) = env_parse::<u32>("CAMSTREAM_HEIGHT")? {
            self.capture.height = height;
        }
        if let Some(framerate) = env_parse::<u32>("CAMSTREAM_FRAMERATE")? {
            self.capture.framerate = framerate;
        }
        if let Ok(program) = std::env::var("CAMSTREAM_CAPTURE_PROGRAM") {
            if !program.trim().is_empty() {
                self.capture.program = program;
            }
        }
        if let Ok(path) = std::env::var("CAMSTREAM_METADATA_PATH") {
            if !path.trim().is_empty() {
                self.capture.metadata_path = PathBuf::from(path);
            }
        }
        if let Ok(path) = std::env::var("CAMSTREAM_POST_PROCESS_FILE") {
            if !path.trim().is_empty() {
                self.capture.post_process_file = Some(PathBuf::from(path));
            }
        }
        if let Some(confidence) = env_parse::<f32>("CAMSTREAM_CONFIDENCE")? {
            self.detection.filter.confidence_threshold = confidence;
        }
        if let Ok(classes) = std::env::var("CAMSTREAM_CLASSES") {
            self.detection.filter.classes = split_csv(&classes);
        }
        if let Some(fps) = env_parse::<u32>("CAMSTREAM_REPLAY_FPS")? {
            self.replay.fps = fps;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.capture.width == 0 || self.capture.height == 0 {
            return Err(anyhow!("capture width and height must be greater than zero"));
        }
        if self.capture.framerate == 0 {
            return Err(anyhow!("capture framerate must be greater than zero"));
        }
        if self.capture.program.trim().is_empty() {
            return Err(anyhow!("capture program must not be empty"));
        }
        if self.metadata.poll_interval.is_zero() {
            return Err(anyhow!("metadata poll interval must be greater than zero"));
        }

        let filter = &self.detection.filter;
        for (name, value) in [
            ("confidence_threshold", filter.confidence_threshold),
            ("min_width", filter.min_width),
            ("min_height", filter.min_height),
            ("min_area", filter.min_area),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow!("detection {} must be within 0..=1, got {}", name, value));
            }
        }
        let schema = &self.detection.schema;
        if schema.slots == 0 {
            return Err(anyhow!("tensor schema must have at least one slot"));
        }
        if !schema.sentinel.is_finite() {
            return Err(anyhow!("tensor schema sentinel must be a finite number"));
        }

        if self.debounce.window == 0 {
            return Err(anyhow!("debounce window must be at least 1"));
        }
        if self.debounce.min_consecutive == 0
            || self.debounce.min_consecutive as usize > self.debounce.window
        {
            return Err(anyhow!(
                "debounce min_consecutive must be within 1..={}",
                self.debounce.window
            ));
        }

        if self.buffer.capacity == 0 {
            return Err(anyhow!("buffer capacity must be greater than zero"));
        }
        if self.buffer.max_age.is_zero() {
            return Err(anyhow!("buffer max age must be greater than zero"));
        }
        if self.replay.fps == 0 {
            return Err(anyhow!("replay fps must be greater than zero"));
        }
        if self.replay.encoder_program.trim().is_empty() {
            return Err(anyhow!("replay encoder program must not be empty"));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_file(EngineConfigFile::default())
    }
}

fn read_config_file(path: &Path) -> Result<EngineConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} has an invalid value '{}'", key, value)),
        _ => Ok(None),
    }
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
