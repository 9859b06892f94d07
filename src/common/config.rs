use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use crate::common::error::{FaceGateError, Result};

pub const DEFAULT_CONFIG_PATH: &str = "configs/facegate.toml";

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub models: ModelConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub recognizer: RecognizerConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_photo_addr")]
    pub photo_addr: SocketAddr,
    #[serde(default = "default_status_addr")]
    pub status_addr: SocketAddr,
    #[serde(default = "default_card_addr")]
    pub card_addr: SocketAddr,
}

fn default_photo_addr() -> SocketAddr { SocketAddr::from(([0, 0, 0, 0], 80)) }
fn default_status_addr() -> SocketAddr { SocketAddr::from(([0, 0, 0, 0], 83)) }
fn default_card_addr() -> SocketAddr { SocketAddr::from(([0, 0, 0, 0], 84)) }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            photo_addr: default_photo_addr(),
            status_addr: default_status_addr(),
            card_addr: default_card_addr(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StorageConfig {
    /// Scratch directory for incoming submissions
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
    /// Durable identity store, one reference image per enrolled person
    #[serde(default = "default_identity_dir")]
    pub identity_dir: PathBuf,
}

fn default_temp_dir() -> PathBuf { PathBuf::from("temp_photos") }
fn default_identity_dir() -> PathBuf { PathBuf::from("database") }

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            temp_dir: default_temp_dir(),
            identity_dir: default_identity_dir(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CleanupConfig {
    /// Grace period for submissions rejected by validation
    #[serde(default = "default_invalid_grace")]
    pub invalid_grace_secs: u64,
    /// Grace period for recognition submissions
    #[serde(default = "default_recognition_grace")]
    pub recognition_grace_secs: u64,
}

fn default_invalid_grace() -> u64 { 5 }
fn default_recognition_grace() -> u64 { 30 }

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            invalid_grace_secs: default_invalid_grace(),
            recognition_grace_secs: default_recognition_grace(),
        }
    }
}

impl CleanupConfig {
    pub fn grace_policy(&self) -> GracePolicy {
        GracePolicy {
            invalid: Duration::from_secs(self.invalid_grace_secs),
            recognition: Duration::from_secs(self.recognition_grace_secs),
        }
    }
}

/// Deletion delays applied to submissions that are not promoted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GracePolicy {
    pub invalid: Duration,
    pub recognition: Duration,
}

impl Default for GracePolicy {
    fn default() -> Self {
        CleanupConfig::default().grace_policy()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AnalysisConfig {
    /// Maximum number of concurrent validate/recognize calls
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_workers() -> usize { 2 }

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self { workers: default_workers() }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BroadcastConfig {
    /// Events queued per dashboard. A dashboard this far behind loses each
    /// new event (never blocks the publisher) until it drains its queue.
    #[serde(default = "default_observer_buffer")]
    pub observer_buffer: usize,
}

fn default_observer_buffer() -> usize { 32 }

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self { observer_buffer: default_observer_buffer() }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ModelConfig {
    #[serde(default = "default_detector_path")]
    pub detector_path: PathBuf,
    #[serde(default = "default_recognizer_path")]
    pub recognizer_path: PathBuf,
}

fn default_detector_path() -> PathBuf { PathBuf::from("models/face_detector.onnx") }
fn default_recognizer_path() -> PathBuf { PathBuf::from("models/face_embedding.onnx") }

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            detector_path: default_detector_path(),
            recognizer_path: default_recognizer_path(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DetectorConfig {
    #[serde(default = "default_detector_dim")]
    pub input_width: u32,
    #[serde(default = "default_detector_dim")]
    pub input_height: u32,
    /// Lowest score still reported as a candidate face
    #[serde(default = "default_candidate_confidence")]
    pub candidate_confidence: f32,
    #[serde(default = "default_nms_iou")]
    pub nms_iou: f32,
}

fn default_detector_dim() -> u32 { 640 }
fn default_candidate_confidence() -> f32 { 0.25 }
fn default_nms_iou() -> f32 { 0.45 }

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            input_width: default_detector_dim(),
            input_height: default_detector_dim(),
            candidate_confidence: default_candidate_confidence(),
            nms_iou: default_nms_iou(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RecognizerConfig {
    #[serde(default = "default_input_size")]
    pub input_size: u32,
    #[serde(default = "default_normalization_value")]
    pub normalization_value: f32,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
}

fn default_input_size() -> u32 { 112 }
fn default_normalization_value() -> f32 { 127.5 }
fn default_similarity_threshold() -> f32 { 0.6 }

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            input_size: default_input_size(),
            normalization_value: default_normalization_value(),
            similarity_threshold: default_similarity_threshold(),
        }
    }
}

impl Config {
    /// Load the config at `path`, or the default location when `path` is None.
    ///
    /// A missing file at the default location yields the built-in defaults; a
    /// missing file that was asked for explicitly is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_path(path),
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_PATH);
                if default_path.exists() {
                    Self::load_from_path(default_path)
                } else {
                    tracing::info!("No config at {}, using defaults", default_path.display());
                    let config = Config::default();
                    config.validate()?;
                    Ok(config)
                }
            }
        }
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(FaceGateError::Config(format!(
                "Config file not found: {}", path.display()
            )));
        }

        tracing::info!("Loading config from: {}", path.display());
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)
            .map_err(|e| FaceGateError::Config(format!("Config parse error: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.analysis.workers == 0 || self.analysis.workers > 64 {
            return Err(FaceGateError::Config(format!(
                "Analysis workers must be between 1 and 64, got {}", self.analysis.workers
            )));
        }
        if self.broadcast.observer_buffer == 0 {
            return Err(FaceGateError::Config(
                "Observer buffer must be at least 1".to_string()
            ));
        }
        if self.storage.temp_dir == self.storage.identity_dir {
            return Err(FaceGateError::Config(format!(
                "Temp dir and identity dir must differ, both are {}",
                self.storage.temp_dir.display()
            )));
        }

        if self.detector.input_width == 0 || self.detector.input_width > 4096 {
            return Err(FaceGateError::Config(format!(
                "Detector input width must be between 1 and 4096, got {}",
                self.detector.input_width
            )));
        }
        if self.detector.input_height == 0 || self.detector.input_height > 4096 {
            return Err(FaceGateError::Config(format!(
                "Detector input height must be between 1 and 4096, got {}",
                self.detector.input_height
            )));
        }
        if !(0.0..=1.0).contains(&self.detector.candidate_confidence) {
            return Err(FaceGateError::Config(format!(
                "Candidate confidence must be between 0.0 and 1.0, got {}",
                self.detector.candidate_confidence
            )));
        }
        if !(0.0..=1.0).contains(&self.detector.nms_iou) {
            return Err(FaceGateError::Config(format!(
                "NMS IoU must be between 0.0 and 1.0, got {}",
                self.detector.nms_iou
            )));
        }

        if self.recognizer.input_size == 0 || self.recognizer.input_size > 1024 {
            return Err(FaceGateError::Config(format!(
                "Recognizer input size must be between 1 and 1024, got {}",
                self.recognizer.input_size
            )));
        }
        if !(0.0..=1.0).contains(&self.recognizer.similarity_threshold) {
            return Err(FaceGateError::Config(format!(
                "Similarity threshold must be between 0.0 and 1.0, got {}",
                self.recognizer.similarity_threshold
            )));
        }

        Ok(())
    }
}
