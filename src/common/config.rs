use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::common::error::{DoorError, Result};

pub const DEFAULT_CONFIG_PATH: &str = "configs/smart-door.toml";

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub models: ModelConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub embedder: EmbedderConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub recognition: RecognitionConfig,
    #[serde(default)]
    pub enrollment: EnrollmentConfig,
    #[serde(default)]
    pub service: ServiceConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CameraConfig {
    /// Device to open on startup; falls back to the first enumerable camera.
    #[serde(default)]
    pub device_index: Option<u32>,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default)]
    pub warmup_frames: u32,
    #[serde(default = "default_warmup_delay")]
    pub warmup_delay_ms: u64,
    /// Pause between stop and start when switching devices, so the OS can
    /// release the previous one.
    #[serde(default = "default_switch_delay")]
    pub switch_delay_ms: u64,
}

fn default_width() -> u32 {
    640
}
fn default_height() -> u32 {
    480
}
fn default_warmup_delay() -> u64 {
    50
}
fn default_switch_delay() -> u64 {
    500
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device_index: None,
            width: default_width(),
            height: default_height(),
            warmup_frames: 0,
            warmup_delay_ms: default_warmup_delay(),
            switch_delay_ms: default_switch_delay(),
        }
    }
}

impl CameraConfig {
    pub fn warmup_delay(&self) -> Duration {
        Duration::from_millis(self.warmup_delay_ms)
    }

    pub fn switch_delay(&self) -> Duration {
        Duration::from_millis(self.switch_delay_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ModelConfig {
    #[serde(default = "default_detector_path")]
    pub detector_path: PathBuf,
    #[serde(default = "default_embedder_path")]
    pub embedder_path: PathBuf,
}

fn default_detector_path() -> PathBuf {
    PathBuf::from("models/face-detector.onnx")
}
fn default_embedder_path() -> PathBuf {
    PathBuf::from("models/face-embedder.onnx")
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            detector_path: default_detector_path(),
            embedder_path: default_embedder_path(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DetectorConfig {
    #[serde(default = "default_detector_input")]
    pub input_width: u32,
    #[serde(default = "default_detector_input")]
    pub input_height: u32,
}

fn default_detector_input() -> u32 {
    640
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            input_width: default_detector_input(),
            input_height: default_detector_input(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EmbedderConfig {
    #[serde(default = "default_embedder_input")]
    pub input_size: u32,
    #[serde(default = "default_normalization")]
    pub normalization_value: f32,
}

fn default_embedder_input() -> u32 {
    112
}
fn default_normalization() -> f32 {
    127.5
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            input_size: default_embedder_input(),
            normalization_value: default_normalization(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DetectionConfig {
    /// Cadence of the face-detection poller.
    #[serde(default = "default_detection_interval")]
    pub interval_ms: u64,
    #[serde(default = "default_confidence")]
    pub confidence: f32,
}

fn default_detection_interval() -> u64 {
    300
}
fn default_confidence() -> f32 {
    0.6
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_detection_interval(),
            confidence: default_confidence(),
        }
    }
}

impl DetectionConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RecognitionConfig {
    /// Cadence of the attempt controller, independent of detection.
    #[serde(default = "default_recognition_interval")]
    pub interval_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Minimum spacing between two recognition requests.
    #[serde(default = "default_min_spacing")]
    pub min_spacing_ms: u64,
    /// Enforced wait after max_attempts consecutive failures.
    #[serde(default = "default_cooldown")]
    pub cooldown_ms: u64,
    /// How long the door stays unlocked before the automatic relock.
    #[serde(default = "default_settle")]
    pub settle_ms: u64,
    /// How long the Unknown result is held before returning to Idle.
    #[serde(default = "default_unknown_hold")]
    pub unknown_hold_ms: u64,
    /// Lifetime of a pending unlock command the actuator has not picked up.
    #[serde(default = "default_unlock_ttl")]
    pub unlock_ttl_secs: u64,
}

fn default_recognition_interval() -> u64 {
    1000
}
fn default_max_attempts() -> u32 {
    10
}
fn default_min_spacing() -> u64 {
    2000
}
fn default_cooldown() -> u64 {
    30_000
}
fn default_settle() -> u64 {
    3000
}
fn default_unknown_hold() -> u64 {
    1500
}
fn default_unlock_ttl() -> u64 {
    60
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_recognition_interval(),
            max_attempts: default_max_attempts(),
            min_spacing_ms: default_min_spacing(),
            cooldown_ms: default_cooldown(),
            settle_ms: default_settle(),
            unknown_hold_ms: default_unknown_hold(),
            unlock_ttl_secs: default_unlock_ttl(),
        }
    }
}

impl RecognitionConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn min_spacing(&self) -> Duration {
        Duration::from_millis(self.min_spacing_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn unknown_hold(&self) -> Duration {
        Duration::from_millis(self.unknown_hold_ms)
    }

    pub fn unlock_ttl(&self) -> Duration {
        Duration::from_secs(self.unlock_ttl_secs)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EnrollmentConfig {
    /// Ordered capture profiles; each name must match [a-zA-Z0-9_]+.
    #[serde(default = "default_variations")]
    pub variations: Vec<String>,
    /// Whether a first default capture should offer the full session.
    #[serde(default = "default_true")]
    pub prompt_full_session: bool,
}

fn default_variations() -> Vec<String> {
    [
        "default",
        "glasses",
        "no_glasses",
        "left_angle",
        "right_angle",
        "smiling",
        "serious",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_true() -> bool {
    true
}

impl Default for EnrollmentConfig {
    fn default() -> Self {
        Self {
            variations: default_variations(),
            prompt_full_session: default_true(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServiceConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_base_url() -> String {
    "http://127.0.0.1:8000/api".to_string()
}
fn default_timeout() -> u64 {
    15
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout(),
        }
    }
}

impl ServiceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from_path(Path::new(DEFAULT_CONFIG_PATH))
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(DoorError::Config(format!(
                "config file not found: {}",
                path.display()
            )));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)
            .map_err(|e| DoorError::Config(format!("parse error in {}: {e}", path.display())))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.camera.width == 0 || self.camera.width > 4096 {
            return Err(DoorError::Config(format!(
                "camera width must be between 1 and 4096, got {}",
                self.camera.width
            )));
        }
        if self.camera.height == 0 || self.camera.height > 4096 {
            return Err(DoorError::Config(format!(
                "camera height must be between 1 and 4096, got {}",
                self.camera.height
            )));
        }
        if !(0.0..=1.0).contains(&self.detection.confidence) {
            return Err(DoorError::Config(format!(
                "detection confidence must be between 0.0 and 1.0, got {}",
                self.detection.confidence
            )));
        }
        if self.detection.interval_ms < 50 {
            return Err(DoorError::Config(format!(
                "detection interval must be at least 50 ms, got {}",
                self.detection.interval_ms
            )));
        }
        if self.recognition.max_attempts == 0 {
            return Err(DoorError::Config(
                "recognition max_attempts must be at least 1".into(),
            ));
        }
        if self.recognition.interval_ms < 100 {
            return Err(DoorError::Config(format!(
                "recognition interval must be at least 100 ms, got {}",
                self.recognition.interval_ms
            )));
        }
        if self.enrollment.variations.is_empty() {
            return Err(DoorError::Config(
                "enrollment variation catalog must not be empty".into(),
            ));
        }
        for variation in &self.enrollment.variations {
            if variation.is_empty()
                || !variation
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
            {
                return Err(DoorError::Config(format!(
                    "variation name '{variation}' may only contain letters, digits and underscore"
                )));
            }
        }
        if self.service.base_url.is_empty() {
            return Err(DoorError::Config("service base_url must be set".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.recognition.max_attempts, 10);
        assert_eq!(config.recognition.min_spacing_ms, 2000);
        assert_eq!(config.recognition.cooldown_ms, 30_000);
        assert_eq!(config.detection.interval_ms, 300);
        assert_eq!(config.enrollment.variations.len(), 7);
        assert_eq!(config.enrollment.variations[0], "default");
    }

    #[test]
    fn minimal_toml_uses_defaults() {
        let config: Config = toml::from_str("[camera]\nwidth = 1280\nheight = 720\n").unwrap();
        config.validate().unwrap();
        assert_eq!(config.camera.width, 1280);
        assert_eq!(config.camera.switch_delay_ms, 500);
        assert_eq!(config.recognition.interval_ms, 1000);
    }

    #[test]
    fn bad_variation_name_is_rejected() {
        let mut config = Config::default();
        config.enrollment.variations.push("left angle".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_attempts_is_rejected() {
        let mut config = Config::default();
        config.recognition.max_attempts = 0;
        assert!(config.validate().is_err());
    }
}
