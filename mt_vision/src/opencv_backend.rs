//! ABOUTME: OpenCV implementations of the background model and optical flow seams
//! ABOUTME: MOG2 subtraction, pyramidal LK and Farneback dense flow behind the native traits

use crate::background::{BackgroundConfig, BackgroundSubtractor};
use crate::dense_flow::DenseFlowEstimator;
use crate::features::Corner;
use crate::flow::{FlowStatus, FlowVector, MagnitudeField, SparseFlowTracker};
use crate::stabilization::StabilizationConfig;
use image::GrayImage;
use mt_core::{Error, Result};
use opencv::{
    core::{self, Mat, Point, Point2f, Ptr, Scalar, Size, TermCriteria, Vector, CV_8UC1},
    imgproc,
    prelude::*,
    video::{self, BackgroundSubtractorMOG2},
};
use tracing::{debug, warn};

fn cv_error(context: &str, err: opencv::Error) -> Error {
    Error::Model(format!("{}: {}", context, err))
}

/// Copy a luminance image into a fresh single-channel Mat
fn to_mat(img: &GrayImage) -> Result<Mat> {
    let (width, height) = img.dimensions();
    let mut mat =
        Mat::new_rows_cols_with_default(height as i32, width as i32, CV_8UC1, Scalar::all(0.0))
            .map_err(|e| cv_error("Failed to allocate OpenCV Mat", e))?;
    mat.data_bytes_mut()
        .map_err(|e| cv_error("Failed to access OpenCV Mat", e))?
        .copy_from_slice(img.as_raw());
    Ok(mat)
}

fn to_gray_image(mat: &Mat) -> Result<GrayImage> {
    let (width, height) = (mat.cols() as u32, mat.rows() as u32);
    let bytes = mat
        .data_bytes()
        .map_err(|e| cv_error("Failed to read OpenCV Mat", e))?
        .to_vec();
    GrayImage::from_raw(width, height, bytes)
        .ok_or_else(|| Error::Model("OpenCV mask has an unexpected layout".into()))
}

/// OpenCV MOG2 background subtractor with the native model's tuning and cleanup
pub struct OpenCvMog2 {
    config: BackgroundConfig,
    mog2: Option<Ptr<BackgroundSubtractorMOG2>>,
    kernel: Mat,
    frames_seen: u64,
}

impl OpenCvMog2 {
    pub fn new(config: BackgroundConfig, history: u32, var_threshold: f64) -> Result<Self> {
        let mog2 = Self::create(&config, history, var_threshold)?;
        let side = 2 * config.morph_radius as i32 + 1;
        let kernel = imgproc::get_structuring_element(
            imgproc::MORPH_RECT,
            Size::new(side, side),
            Point::new(-1, -1),
        )
        .map_err(|e| cv_error("Failed to create morphological kernel", e))?;

        debug!(
            "Created OpenCV MOG2 model: history={}, var_threshold={:.2}",
            history, var_threshold
        );

        Ok(Self {
            config,
            mog2: Some(mog2),
            kernel,
            frames_seen: 0,
        })
    }

    fn create(
        config: &BackgroundConfig,
        history: u32,
        var_threshold: f64,
    ) -> Result<Ptr<BackgroundSubtractorMOG2>> {
        let mut mog2 =
            video::create_background_subtractor_mog2(history as i32, var_threshold, false)
                .map_err(|e| cv_error("Failed to create MOG2 model", e))?;

        let tune = |e| cv_error("Failed to configure MOG2 model", e);
        mog2.set_n_mixtures(config.mixtures as i32).map_err(tune)?;
        mog2.set_background_ratio(config.background_ratio as f64)
            .map_err(tune)?;
        mog2.set_var_threshold_gen(config.var_threshold_gen as f64)
            .map_err(tune)?;
        mog2.set_var_init(config.var_init as f64).map_err(tune)?;
        mog2.set_var_min(config.var_min as f64).map_err(tune)?;
        mog2.set_var_max(config.var_max as f64).map_err(tune)?;
        mog2.set_complexity_reduction_threshold(config.complexity_reduction as f64)
            .map_err(tune)?;
        Ok(mog2)
    }

    fn clean(&self, raw: &Mat) -> Result<Mat> {
        if self.config.morph_radius == 0 {
            return raw
                .try_clone()
                .map_err(|e| cv_error("Failed to copy mask", e));
        }
        let border = imgproc::morphology_default_border_value()
            .map_err(|e| cv_error("Failed to get border value", e))?;

        let mut eroded = Mat::default();
        imgproc::erode(
            raw,
            &mut eroded,
            &self.kernel,
            Point::new(-1, -1),
            1,
            core::BORDER_CONSTANT,
            border,
        )
        .map_err(|e| cv_error("Failed to erode mask", e))?;

        let mut cleaned = Mat::default();
        imgproc::dilate(
            &eroded,
            &mut cleaned,
            &self.kernel,
            Point::new(-1, -1),
            1,
            core::BORDER_CONSTANT,
            border,
        )
        .map_err(|e| cv_error("Failed to dilate mask", e))?;
        Ok(cleaned)
    }
}

impl BackgroundSubtractor for OpenCvMog2 {
    fn apply(&mut self, frame: &GrayImage) -> Result<GrayImage> {
        // First frame after a (re)build seeds the model at OpenCV's automatic rate
        let learning_rate = if self.frames_seen == 0 {
            -1.0
        } else {
            self.config.learning_rate
        };
        let mog2 = self
            .mog2
            .as_mut()
            .ok_or_else(|| Error::Model("OpenCV MOG2 model unavailable".into()))?;

        let input = to_mat(frame)?;
        let mut raw = Mat::default();
        mog2.apply(&input, &mut raw, learning_rate)
            .map_err(|e| cv_error("Failed to apply MOG2", e))?;
        self.frames_seen += 1;

        to_gray_image(&self.clean(&raw)?)
    }

    fn reset(&mut self, history: u32, var_threshold: f64) {
        debug!(
            "Rebuilding OpenCV MOG2 model: history={}, var_threshold={:.2}",
            history, var_threshold
        );
        self.mog2 = match Self::create(&self.config, history, var_threshold) {
            Ok(mog2) => Some(mog2),
            Err(e) => {
                warn!("MOG2 rebuild failed, next frame will reinitialize: {}", e);
                None
            }
        };
        self.frames_seen = 0;
    }

    fn is_warming_up(&self) -> bool {
        self.frames_seen <= self.config.warmup_frames as u64
    }

    fn algorithm_name(&self) -> &'static str {
        "OpenCvMOG2"
    }
}

/// `calc_optical_flow_pyr_lk` with the native tracker's window and termination settings
pub struct OpenCvLucasKanade {
    window_radius: u32,
    pyramid_levels: usize,
    max_iterations: u32,
    epsilon: f32,
}

impl OpenCvLucasKanade {
    pub fn new(config: &StabilizationConfig) -> Self {
        Self {
            window_radius: config.window_radius,
            pyramid_levels: config.pyramid_levels,
            max_iterations: config.max_iterations,
            epsilon: config.epsilon,
        }
    }
}

impl SparseFlowTracker for OpenCvLucasKanade {
    fn track(
        &mut self,
        prev: &GrayImage,
        curr: &GrayImage,
        points: &[Corner],
    ) -> Result<Vec<FlowVector>> {
        if points.is_empty() {
            return Ok(Vec::new());
        }

        let prev_mat = to_mat(prev)?;
        let curr_mat = to_mat(curr)?;
        let from: Vector<Point2f> = points.iter().map(|p| Point2f::new(p.x, p.y)).collect();
        let mut to = Vector::<Point2f>::new();
        let mut status = Vector::<u8>::new();
        let mut err = Vector::<f32>::new();

        let side = 2 * self.window_radius as i32 + 1;
        let criteria = TermCriteria::new(
            core::TermCriteria_COUNT + core::TermCriteria_EPS,
            self.max_iterations as i32,
            self.epsilon as f64,
        )
        .map_err(|e| cv_error("Failed to build termination criteria", e))?;

        video::calc_optical_flow_pyr_lk(
            &prev_mat,
            &curr_mat,
            &from,
            &mut to,
            &mut status,
            &mut err,
            Size::new(side, side),
            self.pyramid_levels.saturating_sub(1) as i32,
            criteria,
            0,
            1e-4,
        )
        .map_err(|e| cv_error("Failed to compute sparse optical flow", e))?;

        let (width, height) = prev.dimensions();
        Ok(from
            .iter()
            .zip(to.iter())
            .zip(status.iter())
            .map(|((a, b), found)| {
                let status = if found == 0 {
                    FlowStatus::Lost
                } else if b.x >= 0.0 && b.x < width as f32 && b.y >= 0.0 && b.y < height as f32 {
                    FlowStatus::Tracked
                } else {
                    FlowStatus::OutOfBounds
                };
                FlowVector {
                    from: (a.x, a.y),
                    to: (b.x, b.y),
                    status,
                }
            })
            .collect())
    }

    fn name(&self) -> &'static str {
        "OpenCvPyrLK"
    }
}

/// Farneback dense flow: pyramid scale 0.5, 3 levels, 10px window, 3 iterations,
/// 5px polynomial neighbourhood, sigma 1.0
#[derive(Debug, Default)]
pub struct OpenCvFarneback;

impl DenseFlowEstimator for OpenCvFarneback {
    fn magnitude(&mut self, prev: &GrayImage, curr: &GrayImage) -> Result<MagnitudeField> {
        let prev_mat = to_mat(prev)?;
        let curr_mat = to_mat(curr)?;
        let mut flow = Mat::default();
        video::calc_optical_flow_farneback(
            &prev_mat, &curr_mat, &mut flow, 0.5, 3, 10, 3, 5, 1.0, 0,
        )
        .map_err(|e| cv_error("Failed to compute dense optical flow", e))?;

        let (width, height) = curr.dimensions();
        let mut field = MagnitudeField::new(width, height);
        for y in 0..height {
            for x in 0..width {
                let v: &Point2f = flow
                    .at_2d(y as i32, x as i32)
                    .map_err(|e| cv_error("Failed to read flow field", e))?;
                field.set(x, y, v.x.hypot(v.y));
            }
        }
        Ok(field)
    }

    fn name(&self) -> &'static str {
        "OpenCvFarneback"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::{frame_with_rect, shift_frame, speckle_frame, textured_frame};

    #[test]
    fn test_mog2_creation_and_reset() {
        let mut model = OpenCvMog2::new(BackgroundConfig::default(), 500, 16.0).unwrap();
        assert_eq!(model.algorithm_name(), "OpenCvMOG2");
        assert!(model.is_warming_up());

        let frame = frame_with_rect(64, 48, 0, 0, 0, 0, 80, 80);
        let mask = model.apply(&frame).unwrap();
        assert_eq!(mask.dimensions(), (64, 48));

        model.reset(1000, 20.0);
        assert_eq!(model.frames_seen, 0);
        assert!(model.is_warming_up());
    }

    #[test]
    fn test_mog2_flags_new_object() {
        let mut model = OpenCvMog2::new(BackgroundConfig::default(), 500, 16.0).unwrap();
        let background = frame_with_rect(100, 100, 0, 0, 0, 0, 64, 64);
        for _ in 0..10 {
            model.apply(&background).unwrap();
        }
        assert!(!model.is_warming_up());

        let object = frame_with_rect(100, 100, 20, 20, 30, 30, 64, 200);
        let mask = model.apply(&object).unwrap();
        assert_eq!(mask.get_pixel(35, 35)[0], 255);
        assert_eq!(mask.get_pixel(80, 80)[0], 0);
    }

    #[test]
    fn test_pyr_lk_tracks_shift() {
        let frame = textured_frame(128, 96, 5);
        let shifted = shift_frame(&frame, 3, 2);
        let points = crate::features::good_features_to_track(
            &frame,
            &StabilizationConfig::default().corner_params(),
        );
        assert!(!points.is_empty());

        let mut tracker = OpenCvLucasKanade::new(&StabilizationConfig::default());
        let flow = tracker.track(&frame, &shifted, &points).unwrap();
        assert_eq!(flow.len(), points.len());
        let valid: Vec<_> = flow.iter().filter(|v| v.is_valid()).collect();
        assert!(!valid.is_empty());
        let mean = valid.iter().map(|v| v.magnitude()).sum::<f64>() / valid.len() as f64;
        assert!((mean - 13f64.sqrt()).abs() < 1.0, "mean = {}", mean);
    }

    #[test]
    fn test_farneback_sees_moving_patch() {
        let mut prev = textured_frame(128, 96, 2);
        let mut curr = prev.clone();
        let patch = speckle_frame(32, 32, 9);
        for (x, y, p) in patch.enumerate_pixels() {
            prev.put_pixel(20 + x, 30 + y, *p);
            curr.put_pixel(28 + x, 30 + y, *p);
        }

        let field = OpenCvFarneback.magnitude(&prev, &curr).unwrap();
        assert_eq!(field.dimensions(), (128, 96));
        assert!(field.get(40, 46) > 5.0);
        assert!(field.get(110, 10) < 1.0);
    }
}
