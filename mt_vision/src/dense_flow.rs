//! ABOUTME: Dense optical-flow object detector, the alternative to background subtraction
//! ABOUTME: Thresholds per-pixel flow magnitude, opens the mask, reports the fastest region

use crate::contours::{ContourSelector, Selection};
use crate::features::Corner;
use crate::flow::{FlowStatus, LucasKanade, MagnitudeField, PyramidalTracker, SparseFlowTracker};
use image::GrayImage;
use imageproc::distance_transform::Norm;
use imageproc::morphology::open;
use mt_core::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;
use validator::Validate;

/// Configuration for dense-flow detection
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct DenseFlowConfig {
    /// Flow is sampled every `grid_step` pixels and held over the cell
    #[validate(range(min = 1, max = 16))]
    pub grid_step: u32,
    #[validate(range(min = 2, max = 31))]
    pub window_radius: u32,
    #[validate(range(min = 1, max = 6))]
    pub pyramid_levels: usize,
    #[validate(range(min = 1, max = 100))]
    pub max_iterations: u32,
    #[validate(range(min = 0.0001, max = 1.0))]
    pub epsilon: f32,
    /// Pixels per frame above which a pixel counts as moving
    #[validate(range(min = 0.0))]
    pub magnitude_threshold: f32,
    /// Radius of the elliptical opening applied to the motion mask, 2 is a 5x5 ellipse
    #[validate(range(max = 10))]
    pub open_radius: u8,
    /// Contours must be strictly larger than this
    #[validate(range(min = 0.0))]
    pub min_contour_area: f64,
}

impl Default for DenseFlowConfig {
    fn default() -> Self {
        Self {
            grid_step: 4,
            window_radius: 7,
            pyramid_levels: 3,
            max_iterations: 20,
            epsilon: 0.03,
            magnitude_threshold: 5.0,
            open_radius: 2,
            min_contour_area: 150.0,
        }
    }
}

/// Per-pixel flow magnitude between two frames of the same size
pub trait DenseFlowEstimator: Send {
    fn magnitude(&mut self, prev: &GrayImage, curr: &GrayImage) -> Result<MagnitudeField>;

    fn name(&self) -> &'static str;
}

/// Native estimator: pyramidal Lucas-Kanade on a regular grid
///
/// Cells whose patch has no usable texture report zero motion.
pub struct GridFlowEstimator {
    tracker: PyramidalTracker,
    grid_step: u32,
}

impl GridFlowEstimator {
    pub fn new(config: &DenseFlowConfig) -> Self {
        let lucas_kanade = LucasKanade {
            window_radius: config.window_radius,
            max_iterations: config.max_iterations,
            epsilon: config.epsilon,
        };
        Self {
            tracker: PyramidalTracker::new(lucas_kanade, config.pyramid_levels),
            grid_step: config.grid_step.max(1),
        }
    }
}

impl DenseFlowEstimator for GridFlowEstimator {
    fn magnitude(&mut self, prev: &GrayImage, curr: &GrayImage) -> Result<MagnitudeField> {
        let (width, height) = curr.dimensions();
        if width == 0 || height == 0 {
            return Ok(MagnitudeField::new(width, height));
        }
        let step = self.grid_step;
        let half = step / 2;
        let columns = width.div_ceil(step);

        let mut samples = Vec::with_capacity((columns * height.div_ceil(step)) as usize);
        for gy in (0..height).step_by(step as usize) {
            for gx in (0..width).step_by(step as usize) {
                samples.push(Corner {
                    x: (gx + half).min(width - 1) as f32,
                    y: (gy + half).min(height - 1) as f32,
                    score: 0.0,
                });
            }
        }

        let flow = self.tracker.track(prev, curr, &samples)?;
        Ok(MagnitudeField::from_fn(width, height, |x, y| {
            let v = &flow[((y / step) * columns + x / step) as usize];
            match v.status {
                FlowStatus::Lost => 0.0,
                _ => v.magnitude() as f32,
            }
        }))
    }

    fn name(&self) -> &'static str {
        "GridLK"
    }
}

/// Tracks the fastest moving region between consecutive frames
pub struct DenseFlowDetector {
    config: DenseFlowConfig,
    estimator: Box<dyn DenseFlowEstimator>,
    selector: ContourSelector,
    previous: Option<GrayImage>,
}

impl DenseFlowDetector {
    pub fn new(config: DenseFlowConfig) -> Self {
        let estimator = Box::new(GridFlowEstimator::new(&config));
        Self::with_estimator(config, estimator)
    }

    pub fn with_estimator(
        config: DenseFlowConfig,
        estimator: Box<dyn DenseFlowEstimator>,
    ) -> Self {
        debug!("Dense flow detection using {} estimator", estimator.name());
        Self {
            config,
            estimator,
            selector: ContourSelector::new(),
            previous: None,
        }
    }

    /// Compare `frame` with the stored previous frame, then store `frame`
    ///
    /// `Ok(None)` when there is nothing to compare against: the first frame
    /// after creation or reset, or a frame whose size differs from the last.
    /// The frame is stored even when estimation fails.
    pub fn detect(&mut self, frame: &GrayImage) -> Result<Option<Selection>> {
        let Some(prev) = self.previous.replace(frame.clone()) else {
            debug!("No previous frame, skipping dense flow");
            return Ok(None);
        };
        if prev.dimensions() != frame.dimensions() {
            debug!(
                "Previous frame is {:?} but current is {:?}, skipping dense flow",
                prev.dimensions(),
                frame.dimensions()
            );
            return Ok(None);
        }

        let field = self.estimator.magnitude(&prev, frame)?;
        let mut mask = field.threshold(self.config.magnitude_threshold);
        if self.config.open_radius > 0 {
            mask = open(&mask, Norm::L2, self.config.open_radius);
        }

        Ok(Some(self.selector.select_fastest(
            &mask,
            &field,
            self.config.min_contour_area,
        )))
    }

    pub fn has_previous(&self) -> bool {
        self.previous.is_some()
    }

    pub fn reset(&mut self) {
        debug!("Resetting dense flow state");
        self.previous = None;
    }

    pub fn estimator_name(&self) -> &'static str {
        self.estimator.name()
    }

    pub fn config(&self) -> &DenseFlowConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::{speckle_frame, textured_frame};
    use image::Luma;

    /// Static textured background with a speckled patch pasted at (x, y)
    fn scene(x: u32, y: u32) -> GrayImage {
        let mut frame = textured_frame(160, 120, 21);
        let patch = speckle_frame(40, 40, 5);
        for (px, py, p) in patch.enumerate_pixels() {
            frame.put_pixel(x + px, y + py, *p);
        }
        frame
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(DenseFlowConfig::default().validate().is_ok());
        let bad = DenseFlowConfig {
            grid_step: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_first_frame_reports_nothing() {
        let mut detector = DenseFlowDetector::new(DenseFlowConfig::default());
        assert!(detector.detect(&scene(30, 40)).unwrap().is_none());
        assert!(detector.has_previous());

        // Identical frames compare fine but nothing moves
        let selection = detector.detect(&scene(30, 40)).unwrap().unwrap();
        assert!(selection.point.is_none());
    }

    #[test]
    fn test_reset_and_resize_report_nothing() {
        let mut detector = DenseFlowDetector::new(DenseFlowConfig::default());
        detector.detect(&scene(30, 40)).unwrap();
        detector.reset();
        assert!(!detector.has_previous());
        assert!(detector.detect(&scene(30, 40)).unwrap().is_none());
        assert!(detector
            .detect(&GrayImage::from_pixel(80, 60, Luma([90u8])))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_moving_patch_is_located() {
        let mut detector = DenseFlowDetector::new(DenseFlowConfig::default());
        assert_eq!(detector.estimator_name(), "GridLK");
        detector.detect(&scene(30, 40)).unwrap();
        let selection = detector.detect(&scene(38, 40)).unwrap().unwrap();

        let point = selection.point.expect("moving patch should be selected");
        // Magnitudes sit at the patch's previous position, it moved 8px right
        assert!(point.x > 44.0 && point.x < 64.0, "x = {}", point.x);
        assert!((point.y - 59.5).abs() < 8.0, "y = {}", point.y);
        assert!(selection.speed.unwrap() > 5.0);
    }

    struct FixedField(MagnitudeField);

    impl DenseFlowEstimator for FixedField {
        fn magnitude(&mut self, _prev: &GrayImage, _curr: &GrayImage) -> Result<MagnitudeField> {
            Ok(self.0.clone())
        }

        fn name(&self) -> &'static str {
            "Fixed"
        }
    }

    #[test]
    fn test_fastest_region_wins_over_largest() {
        // Large slow region on the left, small fast region on the right
        let field = MagnitudeField::from_fn(120, 80, |x, y| {
            if (5..55).contains(&x) && (10..60).contains(&y) {
                6.0
            } else if (80..100).contains(&x) && (30..50).contains(&y) {
                15.0
            } else {
                0.0
            }
        });
        let mut detector = DenseFlowDetector::with_estimator(
            DenseFlowConfig::default(),
            Box::new(FixedField(field)),
        );

        let frame = GrayImage::new(120, 80);
        assert!(detector.detect(&frame).unwrap().is_none());
        let selection = detector.detect(&frame).unwrap().unwrap();
        assert_eq!(selection.contours_accepted, 2);
        let point = selection.point.unwrap();
        assert!((point.x - 89.5).abs() < 1.0, "x = {}", point.x);
        assert!((point.y - 39.5).abs() < 1.0, "y = {}", point.y);
    }

    #[test]
    fn test_slow_motion_stays_below_threshold() {
        let field = MagnitudeField::from_fn(64, 48, |x, _| if x < 32 { 4.0 } else { 0.0 });
        let mut detector = DenseFlowDetector::with_estimator(
            DenseFlowConfig::default(),
            Box::new(FixedField(field)),
        );
        let frame = GrayImage::new(64, 48);
        detector.detect(&frame).unwrap();
        let selection = detector.detect(&frame).unwrap().unwrap();
        assert_eq!(selection.contours_found, 0);
        assert!(selection.point.is_none());
    }
}
