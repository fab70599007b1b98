//! ABOUTME: Camera-shake detection from sparse optical flow between consecutive frames
//! ABOUTME: Classifies each frame as shaking, stable, or neutral from mean feature displacement

use crate::features::{good_features_to_track, Corner, CornerParams};
use crate::flow::{LucasKanade, PyramidalTracker, SparseFlowTracker};
use image::GrayImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use validator::{Validate, ValidationError};

/// Configuration for shake detection
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_thresholds"))]
pub struct StabilizationConfig {
    /// Mean displacement (pixels) above which the frame counts as shaking
    #[validate(range(min = 0.0))]
    pub shake_threshold: f64,
    /// Mean displacement (pixels) below which the frame counts as stable
    #[validate(range(min = 0.0))]
    pub stable_threshold: f64,
    /// Maximum number of corners re-detected per frame
    #[validate(range(min = 1, max = 1000))]
    pub max_corners: usize,
    /// Fraction of the strongest corner response a corner must reach
    #[validate(range(min = 0.0001, max = 1.0))]
    pub quality_level: f32,
    /// Minimum spacing between corners in pixels
    #[validate(range(min = 1.0))]
    pub min_distance: f32,
    /// Structure tensor window side
    #[validate(range(min = 3, max = 15))]
    pub block_size: u32,
    /// Lucas-Kanade patch half-size
    #[validate(range(min = 2, max = 31))]
    pub window_radius: u32,
    #[validate(range(min = 1, max = 6))]
    pub pyramid_levels: usize,
    #[validate(range(min = 1, max = 100))]
    pub max_iterations: u32,
    #[validate(range(min = 0.0001, max = 1.0))]
    pub epsilon: f32,
}

fn validate_thresholds(config: &StabilizationConfig) -> Result<(), ValidationError> {
    if config.stable_threshold > config.shake_threshold {
        return Err(ValidationError::new("stable_threshold_above_shake_threshold"));
    }
    Ok(())
}

impl Default for StabilizationConfig {
    fn default() -> Self {
        Self {
            shake_threshold: 5.0,
            stable_threshold: 2.0,
            max_corners: 100,
            quality_level: 0.01,
            min_distance: 10.0,
            block_size: 3,
            window_radius: 7,
            pyramid_levels: 3,
            max_iterations: 20,
            epsilon: 0.03,
        }
    }
}

impl StabilizationConfig {
    /// Native tracker with this config's window, pyramid and termination settings
    pub fn native_tracker(&self) -> PyramidalTracker {
        let lucas_kanade = LucasKanade {
            window_radius: self.window_radius,
            max_iterations: self.max_iterations,
            epsilon: self.epsilon,
        };
        PyramidalTracker::new(lucas_kanade, self.pyramid_levels)
    }

    pub(crate) fn corner_params(&self) -> CornerParams {
        CornerParams {
            max_corners: self.max_corners,
            quality_level: self.quality_level,
            min_distance: self.min_distance,
            block_size: self.block_size,
        }
    }
}

/// Per-frame camera motion classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShakeVerdict {
    /// Global motion too large, object detection must be suppressed
    Shaking,
    Stable,
    /// Could not assess or in between, no parameter nudge
    Neutral,
}

/// Result of one stabilization step
#[derive(Debug, Clone, PartialEq)]
pub struct StabilizationReport {
    pub verdict: ShakeVerdict,
    /// Mean displacement over valid points, `None` when not assessed
    pub mean_displacement: Option<f64>,
    /// Points the flow computation reported as tracked
    pub valid_points: usize,
    /// Points carried from the previous frame
    pub tracked_points: usize,
}

impl StabilizationReport {
    fn unassessed(tracked_points: usize) -> Self {
        Self {
            verdict: ShakeVerdict::Neutral,
            mean_displacement: None,
            valid_points: 0,
            tracked_points,
        }
    }
}

struct PreviousFrame {
    frame: GrayImage,
    features: Vec<Corner>,
}

/// Sparse optical-flow shake detector
pub struct StabilizationDetector {
    config: StabilizationConfig,
    tracker: Box<dyn SparseFlowTracker>,
    previous: Option<PreviousFrame>,
}

impl StabilizationDetector {
    pub fn new(config: StabilizationConfig) -> Self {
        let tracker = Box::new(config.native_tracker());
        Self::with_tracker(config, tracker)
    }

    pub fn with_tracker(config: StabilizationConfig, tracker: Box<dyn SparseFlowTracker>) -> Self {
        debug!("Shake detection using {} tracker", tracker.name());
        Self {
            config,
            tracker,
            previous: None,
        }
    }

    /// Classify `frame` against the stored previous frame, then store `frame`
    pub fn observe(&mut self, frame: &GrayImage) -> StabilizationReport {
        let report = match self.previous.take() {
            Some(prev) if prev.frame.dimensions() == frame.dimensions() => {
                self.classify(&prev, frame)
            }
            Some(prev) => {
                debug!(
                    "Previous frame is {:?} but current is {:?}, skipping shake check",
                    prev.frame.dimensions(),
                    frame.dimensions()
                );
                StabilizationReport::unassessed(0)
            }
            None => {
                debug!("No previous frame, skipping shake check");
                StabilizationReport::unassessed(0)
            }
        };

        // Always re-detect, never carry tracked points forward
        let features = good_features_to_track(frame, &self.config.corner_params());
        debug!("Detected {} corners for next frame", features.len());
        self.previous = Some(PreviousFrame {
            frame: frame.clone(),
            features,
        });

        report
    }

    fn classify(&mut self, prev: &PreviousFrame, frame: &GrayImage) -> StabilizationReport {
        let flow = match self.tracker.track(&prev.frame, frame, &prev.features) {
            Ok(flow) => flow,
            Err(e) => {
                warn!("Sparse flow failed, treating frame as neutral: {}", e);
                return StabilizationReport::unassessed(prev.features.len());
            }
        };

        let (sum, valid) = flow
            .iter()
            .filter(|v| v.is_valid())
            .fold((0.0f64, 0usize), |(s, n), v| (s + v.magnitude(), n + 1));

        if valid == 0 {
            debug!(
                "No valid flow among {} points, treating as neutral",
                prev.features.len()
            );
            return StabilizationReport::unassessed(prev.features.len());
        }

        let mean = sum / valid as f64;
        let verdict = if mean > self.config.shake_threshold {
            ShakeVerdict::Shaking
        } else if mean < self.config.stable_threshold {
            ShakeVerdict::Stable
        } else {
            ShakeVerdict::Neutral
        };

        debug!(
            "Shake check: mean_displacement={:.3}, valid={}/{}, verdict={:?}",
            mean,
            valid,
            prev.features.len(),
            verdict
        );

        StabilizationReport {
            verdict,
            mean_displacement: Some(mean),
            valid_points: valid,
            tracked_points: prev.features.len(),
        }
    }

    /// Whether a previous frame is stored for the next comparison
    pub fn has_previous(&self) -> bool {
        self.previous.is_some()
    }

    /// Features that will be tracked into the next frame
    pub fn current_features(&self) -> &[Corner] {
        self.previous
            .as_ref()
            .map(|p| p.features.as_slice())
            .unwrap_or(&[])
    }

    /// Forget the stored frame so the next call is unassessed
    pub fn reset(&mut self) {
        debug!("Resetting stabilization state");
        self.previous = None;
    }

    pub fn config(&self) -> &StabilizationConfig {
        &self.config
    }
}
