//! ABOUTME: Per-pixel Gaussian mixture (MOG2) background subtraction in pure Rust
//! ABOUTME: Produces an eroded-then-dilated binary foreground mask for each frame

use image::{GrayImage, Luma};
use imageproc::distance_transform::Norm;
use imageproc::morphology::{dilate, erode};
use mt_core::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use validator::{Validate, ValidationError};

/// Foreground value written into masks
pub const FOREGROUND: u8 = 255;

/// Mixture model tuning that stays fixed for the model's lifetime
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_variance_bounds"))]
pub struct BackgroundConfig {
    /// Learning rate per frame; negative selects 1/min(2n, history)
    #[validate(range(min = -1.0, max = 1.0))]
    pub learning_rate: f64,
    /// Maximum Gaussians per pixel
    #[validate(range(min = 1, max = 8))]
    pub mixtures: usize,
    /// Total weight of modes considered background
    #[validate(range(min = 0.0, max = 1.0))]
    pub background_ratio: f32,
    /// Squared Mahalanobis distance for a sample to update an existing mode
    #[validate(range(min = 0.0))]
    pub var_threshold_gen: f32,
    #[validate(range(min = 0.0))]
    pub var_init: f32,
    #[validate(range(min = 0.0))]
    pub var_min: f32,
    pub var_max: f32,
    /// Complexity reduction prior, prunes weak modes
    #[validate(range(min = 0.0, max = 1.0))]
    pub complexity_reduction: f32,
    /// Radius of the square structuring element used for erode/dilate
    #[validate(range(max = 5))]
    pub morph_radius: u8,
    /// Frames after a (re)build whose masks are not trusted
    #[validate(range(max = 100))]
    pub warmup_frames: u32,
}

fn validate_variance_bounds(config: &BackgroundConfig) -> std::result::Result<(), ValidationError> {
    if config.var_min > config.var_max
        || config.var_init < config.var_min
        || config.var_init > config.var_max
    {
        return Err(ValidationError::new("variance_bounds"));
    }
    Ok(())
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.01,
            mixtures: 5,
            background_ratio: 0.9,
            var_threshold_gen: 9.0,
            var_init: 15.0,
            var_min: 4.0,
            var_max: 75.0,
            complexity_reduction: 0.05,
            morph_radius: 1,
            warmup_frames: 1,
        }
    }
}

/// Trait for background subtraction algorithms
pub trait BackgroundSubtractor: Send {
    /// Update the model with `frame` and return its cleaned foreground mask
    fn apply(&mut self, frame: &GrayImage) -> Result<GrayImage>;

    /// Discard all statistics and rebuild with new parameters
    fn reset(&mut self, history: u32, var_threshold: f64);

    /// Whether the model has seen too few frames for its mask to be trusted
    fn is_warming_up(&self) -> bool;

    /// Get algorithm name
    fn algorithm_name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, Default)]
struct Gaussian {
    weight: f32,
    mean: f32,
    variance: f32,
}

/// Adaptive Gaussian mixture background model (Zivkovic MOG2, single channel)
pub struct MixtureBackgroundModel {
    config: BackgroundConfig,
    history: u32,
    var_threshold: f32,
    width: u32,
    height: u32,
    /// `mixtures` slots per pixel, strongest first
    modes: Vec<Gaussian>,
    modes_used: Vec<u8>,
    frames_seen: u64,
}

impl MixtureBackgroundModel {
    pub fn new(config: BackgroundConfig, history: u32, var_threshold: f64) -> Self {
        debug!(
            "Created MOG2 model: history={}, var_threshold={:.2}, mixtures={}",
            history, var_threshold, config.mixtures
        );
        Self {
            config,
            history: history.max(1),
            var_threshold: var_threshold as f32,
            width: 0,
            height: 0,
            modes: Vec::new(),
            modes_used: Vec::new(),
            frames_seen: 0,
        }
    }

    pub fn history(&self) -> u32 {
        self.history
    }

    pub fn var_threshold(&self) -> f64 {
        self.var_threshold as f64
    }

    /// Frames absorbed since the last (re)build
    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }

    fn allocate(&mut self, width: u32, height: u32) {
        let pixels = width as usize * height as usize;
        self.width = width;
        self.height = height;
        self.modes = vec![Gaussian::default(); pixels * self.config.mixtures];
        self.modes_used = vec![0; pixels];
        self.frames_seen = 0;
    }

    fn effective_learning_rate(&self) -> f32 {
        if self.config.learning_rate >= 0.0 && self.frames_seen > 1 {
            self.config.learning_rate as f32
        } else {
            1.0 / (2 * self.frames_seen).min(self.history as u64).max(1) as f32
        }
    }

    /// Raw foreground mask before morphology
    fn update(&mut self, frame: &GrayImage) -> Result<GrayImage> {
        let (width, height) = frame.dimensions();
        if width != self.width || height != self.height {
            if self.frames_seen > 0 {
                info!(
                    "Frame size changed {}x{} -> {}x{}, rebuilding background model",
                    self.width, self.height, width, height
                );
            }
            self.allocate(width, height);
        }

        self.frames_seen += 1;
        let alpha = self.effective_learning_rate();
        let one_minus_alpha = 1.0 - alpha;
        let prune = -alpha * self.config.complexity_reduction;
        let k_max = self.config.mixtures;
        let tb = self.var_threshold;
        let tg = self.config.var_threshold_gen;
        let big_t = self.config.background_ratio;
        let (var_init, var_min, var_max) =
            (self.config.var_init, self.config.var_min, self.config.var_max);

        let mut mask = GrayImage::new(width, height);
        for (idx, (pixel, out)) in frame.pixels().zip(mask.pixels_mut()).enumerate() {
            let value = pixel.0[0] as f32;
            let gmm = &mut self.modes[idx * k_max..(idx + 1) * k_max];
            let mut n_modes = self.modes_used[idx] as usize;

            let mut background = false;
            let mut fits = false;
            let mut total_weight = 0.0f32;

            let mut mode = 0;
            while mode < n_modes {
                let mut weight = one_minus_alpha * gmm[mode].weight + prune;
                let mut swaps = 0;

                if !fits {
                    let var = gmm[mode].variance;
                    let diff = gmm[mode].mean - value;
                    let dist2 = diff * diff;

                    if total_weight < big_t && dist2 < tb * var {
                        background = true;
                    }

                    if dist2 < tg * var {
                        fits = true;
                        weight += alpha;
                        let k = alpha / weight;
                        gmm[mode].mean -= k * diff;
                        gmm[mode].variance = (var + k * (dist2 - var)).clamp(var_min, var_max);

                        // Keep modes sorted by weight
                        let mut i = mode;
                        while i > 0 && weight >= gmm[i - 1].weight {
                            gmm.swap(i, i - 1);
                            swaps += 1;
                            i -= 1;
                        }
                    }
                }

                if weight < -prune {
                    weight = 0.0;
                    n_modes -= 1;
                }
                gmm[mode - swaps].weight = weight;
                total_weight += weight;
                mode += 1;
            }

            if total_weight > 0.0 {
                let norm = 1.0 / total_weight;
                for g in gmm.iter_mut().take(n_modes) {
                    g.weight *= norm;
                }
            }

            if !fits {
                let slot = if n_modes == k_max {
                    k_max - 1
                } else {
                    n_modes += 1;
                    n_modes - 1
                };

                if n_modes == 1 {
                    gmm[slot].weight = 1.0;
                } else {
                    gmm[slot].weight = alpha;
                    for g in gmm.iter_mut().take(n_modes - 1) {
                        g.weight *= one_minus_alpha;
                    }
                }
                gmm[slot].mean = value;
                gmm[slot].variance = var_init;

                let mut i = n_modes - 1;
                while i > 0 && alpha >= gmm[i - 1].weight {
                    gmm.swap(i, i - 1);
                    i -= 1;
                }
            }

            if gmm.iter().take(n_modes).any(|g| !g.weight.is_finite()) {
                return Err(Error::Model(format!(
                    "non-finite mixture weight at pixel {}",
                    idx
                )));
            }

            self.modes_used[idx] = n_modes as u8;
            *out = Luma([if background { 0 } else { FOREGROUND }]);
        }

        Ok(mask)
    }
}

impl BackgroundSubtractor for MixtureBackgroundModel {
    fn apply(&mut self, frame: &GrayImage) -> Result<GrayImage> {
        let raw = self.update(frame)?;
        let cleaned = clean_mask(&raw, self.config.morph_radius);

        debug!(
            "MOG2 frame {}: raw_foreground={}, cleaned_foreground={}",
            self.frames_seen,
            count_foreground(&raw),
            count_foreground(&cleaned)
        );

        Ok(cleaned)
    }

    fn reset(&mut self, history: u32, var_threshold: f64) {
        info!(
            "Reinitializing background model: history {} -> {}, var_threshold {:.2} -> {:.2}",
            self.history, history, self.var_threshold, var_threshold
        );
        self.history = history.max(1);
        self.var_threshold = var_threshold as f32;
        // Statistics from the old parameterization are meaningless
        self.width = 0;
        self.height = 0;
        self.modes.clear();
        self.modes_used.clear();
        self.frames_seen = 0;
    }

    fn is_warming_up(&self) -> bool {
        self.frames_seen <= self.config.warmup_frames as u64
    }

    fn algorithm_name(&self) -> &'static str {
        "MOG2"
    }
}

/// Erode then dilate with a square element to drop speckle and keep blob shape
pub fn clean_mask(mask: &GrayImage, radius: u8) -> GrayImage {
    if radius == 0 {
        return mask.clone();
    }
    let eroded = erode(mask, Norm::LInf, radius);
    dilate(&eroded, Norm::LInf, radius)
}

/// Count non-zero pixels in a mask
pub fn count_foreground(mask: &GrayImage) -> u32 {
    mask.as_raw().iter().filter(|&&p| p != 0).count() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::frame_with_rect;

    fn model() -> MixtureBackgroundModel {
        MixtureBackgroundModel::new(BackgroundConfig::default(), 500, 16.0)
    }

    fn background() -> GrayImage {
        GrayImage::from_pixel(40, 40, Luma([64u8]))
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(BackgroundConfig::default().validate().is_ok());
        let bad = BackgroundConfig {
            var_init: 100.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_first_frame_is_all_foreground_and_warming_up() {
        let mut m = model();
        let mask = m.apply(&background()).unwrap();
        assert_eq!(count_foreground(&mask), 40 * 40);
        assert!(m.is_warming_up());
        assert_eq!(m.algorithm_name(), "MOG2");
    }

    #[test]
    fn test_static_scene_converges_to_empty_mask() {
        let mut m = model();
        let bg = background();
        let mut last = 0;
        for _ in 0..10 {
            last = count_foreground(&m.apply(&bg).unwrap());
        }
        assert_eq!(last, 0);
        assert!(!m.is_warming_up());
    }

    #[test]
    fn test_new_object_is_foreground() {
        let mut m = model();
        let bg = background();
        for _ in 0..20 {
            m.apply(&bg).unwrap();
        }

        let frame = frame_with_rect(40, 40, 10, 12, 8, 6, 64, 220);
        let mask = m.apply(&frame).unwrap();
        assert_eq!(mask.get_pixel(13, 14).0[0], FOREGROUND);
        assert_eq!(mask.get_pixel(2, 2).0[0], 0);
        // Erode+dilate keeps a solid rectangle intact
        assert_eq!(count_foreground(&mask), 8 * 6);
    }

    #[test]
    fn test_reset_discards_statistics() {
        let mut m = model();
        let bg = background();
        for _ in 0..20 {
            m.apply(&bg).unwrap();
        }
        assert_eq!(count_foreground(&m.apply(&bg).unwrap()), 0);

        m.reset(300, 30.0);
        assert_eq!(m.frames_seen(), 0);
        assert_eq!(m.history(), 300);
        assert_eq!(m.var_threshold(), 30.0);

        // The learned background is gone: the same frame is foreground again
        let mask = m.apply(&bg).unwrap();
        assert_eq!(count_foreground(&mask), 40 * 40);
        assert!(m.is_warming_up());
    }

    #[test]
    fn test_clean_mask_removes_speckle() {
        let mut mask = GrayImage::new(20, 20);
        mask.put_pixel(3, 3, Luma([FOREGROUND]));
        for y in 8..14 {
            for x in 8..14 {
                mask.put_pixel(x, y, Luma([FOREGROUND]));
            }
        }
        let cleaned = clean_mask(&mask, 1);
        assert_eq!(cleaned.get_pixel(3, 3).0[0], 0);
        assert_eq!(count_foreground(&cleaned), 36);
    }

    #[test]
    fn test_resolution_change_rebuilds() {
        let mut m = model();
        for _ in 0..5 {
            m.apply(&background()).unwrap();
        }
        let other = GrayImage::from_pixel(20, 30, Luma([64u8]));
        let mask = m.apply(&other).unwrap();
        assert_eq!(mask.dimensions(), (20, 30));
        assert_eq!(m.frames_seen(), 1);
    }
}
