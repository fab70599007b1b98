//! ABOUTME: Aggregate tuning for one frame analyzer instance
//! ABOUTME: Nests the per-component configs so they validate as one unit

use mt_record::RecorderConfig;
use mt_vision::{
    AdaptationConfig, BackgroundConfig, DenseFlowConfig, ProcessingConfig, StabilizationConfig,
    VisionBackend,
};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// How the moving object is found in each frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    /// Adaptive MOG2 background subtraction, the largest contour wins
    BackgroundSubtraction,
    /// Dense optical flow magnitude, the fastest contour wins
    DenseFlow,
}

impl Default for DetectorKind {
    fn default() -> Self {
        Self::BackgroundSubtraction
    }
}

/// Everything a [`crate::FrameAnalyzer`] needs besides its sink factory
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub detector: DetectorKind,
    pub backend: VisionBackend,
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
}
