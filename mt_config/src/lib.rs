//! ABOUTME: Configuration management with validation and environment loading
//! ABOUTME: Defaults, then an optional TOML/YAML/JSON file, then MOTRACK__* variables

use config::{Config as ConfigBuilder, Environment, File};
use mt_analysis::{AnalyzerConfig, DetectorKind};
use mt_core::{Error, Result};
use mt_record::{RecorderConfig, RecordingSettings};
use mt_vision::{
    AdaptationConfig, BackgroundConfig, DenseFlowConfig, ProcessingConfig, Rotation,
    StabilizationConfig, VisionBackend,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use validator::{Validate, ValidationError};

/// Environment variable prefix, e.g. `MOTRACK__CAPTURE__FPS=15`
pub const ENV_PREFIX: &str = "MOTRACK";

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Config {
    #[validate(nested)]
    pub detection: DetectionConfig,
    #[validate(nested)]
    pub processing: ProcessingConfig,
    #[validate(nested)]
    pub stabilization: StabilizationConfig,
    #[validate(nested)]
    pub adaptation: AdaptationConfig,
    #[validate(nested)]
    pub background: BackgroundConfig,
    #[validate(nested)]
    pub dense_flow: DenseFlowConfig,
    #[validate(nested)]
    pub recorder: RecorderConfig,
    #[validate(nested)]
    pub recording: RecordingSettings,
    #[validate(nested)]
    pub capture: CaptureConfig,
    #[validate(nested)]
    pub telemetry: TelemetryConfig,
}

/// Detector strategy and the implementation behind it
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct DetectionConfig {
    pub detector: DetectorKind,
    /// `opencv` needs a build with the heavy_opencv feature, otherwise native is used
    pub backend: VisionBackend,
}

/// Frame source pacing and orientation
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct CaptureConfig {
    #[validate(range(min = 1, max = 120))]
    pub fps: u32,
    /// Clockwise rotation applied to every captured frame
    #[validate(custom(function = "validate_rotation"))]
    pub rotation_degrees: i32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            fps: 30,
            rotation_degrees: 0,
        }
    }
}

fn validate_rotation(degrees: i32) -> std::result::Result<(), ValidationError> {
    Rotation::try_from(degrees)
        .map(|_| ())
        .map_err(|_| ValidationError::new("unsupported_rotation"))
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct TelemetryConfig {
    /// `production` switches logs to JSON
    #[validate(length(min = 1))]
    pub environment: String,
    #[validate(length(min = 1))]
    pub service_name: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
            service_name: "motrack".to_string(),
        }
    }
}

impl Config {
    /// Load from defaults and environment only
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load with an optional config file layered between defaults and environment
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let defaults = ConfigBuilder::try_from(&Config::default())
            .map_err(|e| Error::Config(format!("Failed to encode defaults: {}", e)))?;

        let mut builder = ConfigBuilder::builder().add_source(defaults);

        if let Some(path) = path {
            if !path.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    path.display()
                )));
            }
            builder = builder.add_source(File::from(path).required(true));
        }

        // Environment has the highest priority
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .map_err(|e| Error::Config(format!("Failed to build config: {}", e)))?;

        let parsed: Config = config
            .try_deserialize()
            .map_err(|e| Error::Config(format!("Failed to deserialize config: {}", e)))?;

        parsed
            .validate()
            .map_err(|e| Error::Config(format!("Config validation failed: {}", e)))?;

        Ok(parsed)
    }

    /// Tuning for one frame analyzer
    pub fn analyzer_config(&self) -> AnalyzerConfig {
        AnalyzerConfig {
            detector: self.detection.detector,
            backend: self.detection.backend,
            processing: self.processing.clone(),
            stabilization: self.stabilization.clone(),
            adaptation: self.adaptation.clone(),
            background: self.background.clone(),
            dense_flow: self.dense_flow.clone(),
            recorder: RecorderConfig {
                frame_rate: self.capture.fps,
                ..self.recorder.clone()
            },
        }
    }
}
