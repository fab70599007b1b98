//! ABOUTME: Closed-loop tuning of background-model and contour parameters
//! ABOUTME: Fast per-frame history/threshold control plus a slow windowed area-floor loop

use crate::stabilization::ShakeVerdict;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use validator::{Validate, ValidationError};

/// Bounds, steps, and initial values for parameter adaptation
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_bounds"))]
pub struct AdaptationConfig {
    #[validate(range(min = 1))]
    pub min_history: u32,
    pub max_history: u32,
    pub initial_history: u32,
    #[validate(range(min = 1))]
    pub history_step: u32,

    #[validate(range(min = 0.1))]
    pub min_var_threshold: f64,
    pub max_var_threshold: f64,
    pub initial_var_threshold: f64,
    /// Contrast (luminance std dev) mapped to `min_var_threshold`
    #[validate(range(min = 0.0))]
    pub min_std_dev_for_contrast: f64,
    /// Contrast (luminance std dev) mapped to `max_var_threshold`
    pub max_std_dev_for_contrast: f64,
    /// Threshold drift that forces a background model rebuild
    #[validate(range(min = 0.0))]
    pub var_threshold_epsilon: f64,

    #[validate(range(min = 0.0))]
    pub min_contour_area: f64,
    pub max_contour_area: f64,
    pub initial_contour_area: f64,
    #[validate(range(min = 0.0))]
    pub contour_area_step: f64,
    /// Frames per area-floor adjustment window
    #[validate(range(min = 1))]
    pub area_window_frames: u32,
}

fn validate_bounds(config: &AdaptationConfig) -> Result<(), ValidationError> {
    if config.min_history >= config.max_history
        || !(config.min_history..=config.max_history).contains(&config.initial_history)
    {
        return Err(ValidationError::new("history_bounds"));
    }
    if config.min_var_threshold >= config.max_var_threshold
        || config.initial_var_threshold < config.min_var_threshold
        || config.initial_var_threshold > config.max_var_threshold
    {
        return Err(ValidationError::new("var_threshold_bounds"));
    }
    if config.min_std_dev_for_contrast >= config.max_std_dev_for_contrast {
        return Err(ValidationError::new("contrast_range"));
    }
    if config.min_contour_area >= config.max_contour_area
        || config.initial_contour_area < config.min_contour_area
        || config.initial_contour_area > config.max_contour_area
    {
        return Err(ValidationError::new("contour_area_bounds"));
    }
    Ok(())
}

impl Default for AdaptationConfig {
    fn default() -> Self {
        Self {
            min_history: 100,
            max_history: 1000,
            initial_history: 500,
            history_step: 50,
            min_var_threshold: 8.0,
            max_var_threshold: 50.0,
            initial_var_threshold: 16.0,
            min_std_dev_for_contrast: 10.0,
            max_std_dev_for_contrast: 70.0,
            var_threshold_epsilon: 1.0,
            min_contour_area: 10.0,
            max_contour_area: 200.0,
            initial_contour_area: 50.0,
            contour_area_step: 10.0,
            area_window_frames: 30,
        }
    }
}

/// Current detection parameters; only the adapter can change them
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AdaptiveParameters {
    history: u32,
    var_threshold: f64,
    min_contour_area: f64,
}

impl AdaptiveParameters {
    pub fn history(&self) -> u32 {
        self.history
    }

    pub fn var_threshold(&self) -> f64 {
        self.var_threshold
    }

    pub fn min_contour_area(&self) -> f64 {
        self.min_contour_area
    }
}

/// Parameters to use for the current frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedParameters {
    pub params: AdaptiveParameters,
    /// The background model must be rebuilt before it sees this frame
    pub needs_reset: bool,
}

/// Closed-loop controller for the background model and contour filter
pub struct ParameterAdapter {
    config: AdaptationConfig,
    params: AdaptiveParameters,
    /// (history, var_threshold) the background model was last built with
    applied: Option<(u32, f64)>,
    window_frames: u32,
    window_detections: u32,
}

impl ParameterAdapter {
    pub fn new(config: AdaptationConfig) -> Self {
        let params = AdaptiveParameters {
            history: config.initial_history,
            var_threshold: config.initial_var_threshold,
            min_contour_area: config.initial_contour_area,
        };
        Self {
            config,
            params,
            applied: None,
            window_frames: 0,
            window_detections: 0,
        }
    }

    pub fn params(&self) -> AdaptiveParameters {
        self.params
    }

    /// Step history down on shake, up on stability
    pub fn apply_verdict(&mut self, verdict: ShakeVerdict) {
        let before = self.params.history;
        self.params.history = match verdict {
            ShakeVerdict::Shaking => before
                .saturating_sub(self.config.history_step)
                .max(self.config.min_history),
            ShakeVerdict::Stable => before
                .saturating_add(self.config.history_step)
                .min(self.config.max_history),
            ShakeVerdict::Neutral => before,
        };

        if before != self.params.history {
            debug!(
                "History {} -> {} after {:?}",
                before, self.params.history, verdict
            );
        }
    }

    /// Map scene contrast linearly onto the variance threshold range
    pub fn apply_contrast(&mut self, std_dev: f64) {
        let c = &self.config;
        let span = c.max_std_dev_for_contrast - c.min_std_dev_for_contrast;
        let t = ((std_dev - c.min_std_dev_for_contrast) / span).clamp(0.0, 1.0);
        self.params.var_threshold =
            c.min_var_threshold + t * (c.max_var_threshold - c.min_var_threshold);
    }

    /// Parameters for this frame and whether the model must be rebuilt first
    ///
    /// The first call only records the parameters; building the model for the
    /// first time is not a reset.
    pub fn resolve(&mut self) -> ResolvedParameters {
        let current = (self.params.history, self.params.var_threshold);
        let needs_reset = match self.applied {
            None => {
                self.applied = Some(current);
                false
            }
            Some((history, var_threshold)) => {
                // Compared with the last applied values rather than the previous
                // frame's, so sub-epsilon drift adds up until it forces a rebuild
                let changed = history != current.0
                    || (var_threshold - current.1).abs() > self.config.var_threshold_epsilon;
                if changed {
                    self.applied = Some(current);
                }
                changed
            }
        };

        ResolvedParameters {
            params: self.params,
            needs_reset,
        }
    }

    /// Record a frame's detection outcome; adjusts the area floor at window ends
    ///
    /// Returns `true` when a window closed on this frame.
    pub fn end_frame(&mut self, detected: bool) -> bool {
        self.window_frames += 1;
        if detected {
            self.window_detections += 1;
        }

        if self.window_frames < self.config.area_window_frames {
            return false;
        }

        let before = self.params.min_contour_area;
        let at_max_history = self.params.history >= self.config.max_history;
        if at_max_history && self.window_detections == 0 {
            // Quiet, settled scene: accept smaller objects
            self.params.min_contour_area =
                (before - self.config.contour_area_step).max(self.config.min_contour_area);
        } else if !at_max_history {
            // Still settling after shake: demand larger objects
            self.params.min_contour_area =
                (before + self.config.contour_area_step).min(self.config.max_contour_area);
        }

        if before != self.params.min_contour_area {
            info!(
                "Minimum contour area {:.1} -> {:.1} (history={}, detections={})",
                before, self.params.min_contour_area, self.params.history, self.window_detections
            );
        }

        self.window_frames = 0;
        self.window_detections = 0;
        true
    }

    /// Back to initial parameters; the next resolve is treated as a fresh build
    pub fn reset(&mut self) {
        *self = Self::new(self.config.clone());
    }

    pub fn config(&self) -> &AdaptationConfig {
        &self.config
    }
}
