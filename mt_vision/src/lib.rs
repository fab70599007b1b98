//! ABOUTME: Frame analysis building blocks for the motion tracker
//! ABOUTME: Shake detection, parameter adaptation, MOG2 background model, dense flow and contours

pub mod adaptive;
pub mod backend;
pub mod background;
pub mod contours;
pub mod dense_flow;
pub mod features;
pub mod flow;
pub mod frame;
#[cfg(feature = "heavy_opencv")]
pub mod opencv_backend;
pub mod stabilization;

pub use adaptive::{AdaptationConfig, AdaptiveParameters, ParameterAdapter, ResolvedParameters};
pub use backend::VisionBackend;
pub use background::{
    clean_mask, count_foreground, BackgroundConfig, BackgroundSubtractor, MixtureBackgroundModel,
};
pub use contours::{ContourSelector, Moments, Selection, TrackedPoint};
pub use dense_flow::{DenseFlowConfig, DenseFlowDetector, DenseFlowEstimator, GridFlowEstimator};
pub use features::{good_features_to_track, Corner, CornerParams};
pub use flow::{
    FlowStatus, FlowVector, LucasKanade, MagnitudeField, Pyramid, PyramidalTracker,
    SparseFlowTracker,
};
pub use frame::{
    analysis_dimensions, downscale, luminance_std_dev, normalize, ProcessingConfig, RawFrame,
    Rotation,
};
pub use stabilization::{
    ShakeVerdict, StabilizationConfig, StabilizationDetector, StabilizationReport,
};

#[cfg(feature = "heavy_opencv")]
pub use opencv_backend::{OpenCvFarneback, OpenCvLucasKanade, OpenCvMog2};

// Re-export image types for downstream crates and benchmarks
pub use image;

/// Synthetic frame generators shared by tests and benchmarks
pub mod utils {
    use image::{GrayImage, Luma};
    use imageproc::filter::gaussian_blur_f32;

    /// Uniform frame of a single intensity
    pub fn flat_frame(width: u32, height: u32, value: u8) -> GrayImage {
        GrayImage::from_pixel(width, height, Luma([value]))
    }

    /// Uniform background with one filled rectangle, clipped to the frame
    #[allow(clippy::too_many_arguments)]
    pub fn frame_with_rect(
        width: u32,
        height: u32,
        x: u32,
        y: u32,
        rect_width: u32,
        rect_height: u32,
        background: u8,
        foreground: u8,
    ) -> GrayImage {
        let mut img = flat_frame(width, height, background);
        for yy in y..(y + rect_height).min(height) {
            for xx in x..(x + rect_width).min(width) {
                img.put_pixel(xx, yy, Luma([foreground]));
            }
        }
        img
    }

    /// Deterministic blocky texture with plenty of trackable corners
    pub fn textured_frame(width: u32, height: u32, seed: u64) -> GrayImage {
        const BLOCK: u32 = 16;
        let blocks = GrayImage::from_fn(width, height, |x, y| {
            let bx = (x / BLOCK) as u64;
            let by = (y / BLOCK) as u64;
            // splitmix64 finalizer over block coordinates
            let mut h = seed
                .wrapping_add(bx.wrapping_mul(0x9E37_79B9_7F4A_7C15))
                .wrapping_add(by.wrapping_mul(0xC2B2_AE3D_27D4_EB4F));
            h = (h ^ (h >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
            h = (h ^ (h >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
            h ^= h >> 31;
            Luma([20 + (h % 216) as u8])
        });
        gaussian_blur_f32(&blocks, 1.5)
    }

    /// Fine-grained texture of 4px blocks, trackable at every position
    pub fn speckle_frame(width: u32, height: u32, seed: u64) -> GrayImage {
        const CELL: u32 = 4;
        let cells = GrayImage::from_fn(width, height, |x, y| {
            let mut h = seed
                .wrapping_add(((x / CELL) as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15))
                .wrapping_add(((y / CELL) as u64).wrapping_mul(0xC2B2_AE3D_27D4_EB4F));
            h = (h ^ (h >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
            h = (h ^ (h >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
            h ^= h >> 31;
            Luma([30 + (h % 200) as u8])
        });
        gaussian_blur_f32(&cells, 1.0)
    }

    /// Translate content by (dx, dy), replicating edge pixels into the gap
    pub fn shift_frame(img: &GrayImage, dx: i32, dy: i32) -> GrayImage {
        let (w, h) = img.dimensions();
        GrayImage::from_fn(w, h, |x, y| {
            let sx = (x as i64 - dx as i64).clamp(0, w as i64 - 1) as u32;
            let sy = (y as i64 - dy as i64).clamp(0, h as i64 - 1) as u32;
            *img.get_pixel(sx, sy)
        })
    }

    /// Frame sequence of a square moving across a flat background
    pub fn moving_square(
        width: u32,
        height: u32,
        side: u32,
        step: u32,
        frames: usize,
    ) -> Vec<GrayImage> {
        (0..frames)
            .map(|i| {
                let x = (i as u32 * step) % width.saturating_sub(side).max(1);
                let y = height.saturating_sub(side) / 2;
                frame_with_rect(width, height, x, y, side, side, 64, 220)
            })
            .collect()
    }
}
