//! ABOUTME: User-facing recording settings snapshot and recorder tuning
//! ABOUTME: Validated with validator, delay range mirrors the settings slider bounds

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use validator::Validate;

/// Recording settings as the user sees them, passed into every analysis call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RecordingSettings {
    pub enable_recording: bool,
    /// Seconds detection must persist before a session starts
    #[validate(range(min = 2, max = 10))]
    pub start_delay_seconds: u32,
    /// Seconds absence must persist before a session stops
    #[validate(range(min = 2, max = 10))]
    pub stop_delay_seconds: u32,
    /// Directory that receives one sub-directory per session
    pub save_path: PathBuf,
}

impl RecordingSettings {
    pub fn start_delay_ms(&self) -> u64 {
        self.start_delay_seconds as u64 * 1000
    }

    pub fn stop_delay_ms(&self) -> u64 {
        self.stop_delay_seconds as u64 * 1000
    }
}

impl Default for RecordingSettings {
    fn default() -> Self {
        Self {
            enable_recording: false,
            start_delay_seconds: 5,
            stop_delay_seconds: 5,
            save_path: PathBuf::from("recordings"),
        }
    }
}

/// Encoder-side parameters for recorded sessions
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RecorderConfig {
    #[validate(range(min = 1, max = 120))]
    pub frame_rate: u32,
    #[validate(range(min = 1, max = 100))]
    pub jpeg_quality: u8,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            frame_rate: 30,
            jpeg_quality: 85,
        }
    }
}
