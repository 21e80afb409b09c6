use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub recognizer: RecognizerConfig,
    pub detection: DetectionConfig,
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub video: VideoConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    pub storage: StorageConfig,
}

/// Parameters that decide how stored embeddings are compared.
///
/// Both values are written into the identity database; on load the stored
/// values take precedence over these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognizerConfig {
    /// Maximum L2 distance for a match (strictly less than)
    pub threshold: f32,
    pub model_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    pub model_path: PathBuf,
    /// Anchor score cutoff inside the detector
    pub confidence_threshold: f32,

    // Performance: downscale images for faster detection
    #[serde(default = "default_detection_scale")]
    pub scale: f32, // 0.5 = half resolution, 1.0 = full res
}

fn default_detection_scale() -> f32 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub model_path: PathBuf,
    #[serde(default = "default_normalize")]
    pub normalize: bool,
}

fn default_normalize() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_intra_threads")]
    pub intra_threads: usize,
}

fn default_intra_threads() -> usize {
    4
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            intra_threads: default_intra_threads(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoConfig {
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: String,
    #[serde(default = "default_ffprobe")]
    pub ffprobe: String,
    /// Recognition reruns detection on every Nth frame
    #[serde(default = "default_frame_skip")]
    pub frame_skip: u32,
    /// Enrollment samples every Nth frame
    #[serde(default = "default_enroll_frame_interval")]
    pub enroll_frame_interval: u32,
    #[serde(default = "default_enroll_max_frames")]
    pub enroll_max_frames: Option<u32>,
}

fn default_ffmpeg() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe() -> String {
    "ffprobe".to_string()
}

fn default_frame_skip() -> u32 {
    5
}

fn default_enroll_frame_interval() -> u32 {
    10
}

fn default_enroll_max_frames() -> Option<u32> {
    Some(30)
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            ffmpeg: default_ffmpeg(),
            ffprobe: default_ffprobe(),
            frame_skip: default_frame_skip(),
            enroll_frame_interval: default_enroll_frame_interval(),
            enroll_max_frames: default_enroll_max_frames(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    pub device: String,
    pub width: u32,
    pub height: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            width: 640,
            height: 480,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub database_path: PathBuf,
}

impl Config {
    /// Load configuration with fallback chain:
    /// 1. $FACETRAIL_CONFIG
    /// 2. /etc/facetrail/facetrail.toml (system-wide)
    /// 3. ~/.config/facetrail/facetrail.toml (user)
    /// 4. Compiled defaults
    pub fn load() -> Result<Self, ConfigError> {
        if let Some(path) = std::env::var_os("FACETRAIL_CONFIG") {
            return Self::load_file(PathBuf::from(path));
        }

        if let Ok(config) = Self::load_from_path("/etc/facetrail/facetrail.toml") {
            config.validate()?;
            return Ok(config);
        }

        if let Some(home) = std::env::var_os("HOME") {
            let user_config = PathBuf::from(home)
                .join(".config")
                .join("facetrail")
                .join("facetrail.toml");
            if let Ok(config) = Self::load_from_path(&user_config) {
                config.validate()?;
                return Ok(config);
            }
        }

        let config = Self::default();
        config.validate()?;
        Ok(config)
    }

    /// Load and validate one explicit file; errors are not masked by fallbacks
    pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load_from_path(path)?;
        config.validate()?;
        Ok(config)
    }

    fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.recognizer.threshold.is_finite() || self.recognizer.threshold <= 0.0 {
            return Err(ConfigError::Validation(
                "Recognizer threshold must be a positive distance".to_string(),
            ));
        }

        if self.recognizer.model_name.trim().is_empty() {
            return Err(ConfigError::Validation(
                "Recognizer model name cannot be empty".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.detection.confidence_threshold) {
            return Err(ConfigError::Validation(
                "Detection confidence threshold must be between 0.0 and 1.0".to_string(),
            ));
        }

        if !(self.detection.scale > 0.0 && self.detection.scale <= 1.0) {
            return Err(ConfigError::Validation(
                "Detection scale must be in (0.0, 1.0]".to_string(),
            ));
        }

        if self.video.frame_skip == 0 || self.video.enroll_frame_interval == 0 {
            return Err(ConfigError::Validation(
                "Frame skip and enrollment frame interval must be greater than 0".to_string(),
            ));
        }

        if self.video.enroll_max_frames == Some(0) {
            return Err(ConfigError::Validation(
                "Enrollment max frames must be greater than 0 when set".to_string(),
            ));
        }

        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(ConfigError::Validation(
                "Camera dimensions must be non-zero".to_string(),
            ));
        }

        if self.storage.database_path.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "Database path cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            recognizer: RecognizerConfig {
                threshold: 1.0,                  // L2 on unit-length ArcFace vectors
                model_name: "arcface_mobilefacenet".to_string(),
            },
            detection: DetectionConfig {
                model_path: PathBuf::from("models/scrfd_500m.onnx"),
                confidence_threshold: 0.5,
                scale: default_detection_scale(),
            },
            embedding: EmbeddingConfig {
                model_path: PathBuf::from("models/arcface_mobilefacenet.onnx"),
                normalize: default_normalize(),
            },
            runtime: RuntimeConfig::default(),
            video: VideoConfig::default(),
            camera: CameraConfig::default(),
            storage: StorageConfig {
                database_path: PathBuf::from("/var/lib/facetrail/face_db.bin"),
            },
        }
    }
}
