//! ABOUTME: Raw frame validation, rotation normalization, and analysis downscaling
//! ABOUTME: Turns collaborator-supplied luminance buffers into analysis-ready images

use image::GrayImage;
use mt_core::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;
use validator::Validate;

/// A luminance frame as delivered by the capture collaborator
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Row-major single-channel pixels, `width * height` bytes
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Clockwise rotation needed to make the frame upright
    pub rotation_degrees: i32,
    /// Monotonically increasing index assigned by the source
    pub sequence_index: u64,
    /// Capture time in milliseconds on a monotonic clock
    pub timestamp_ms: u64,
}

impl RawFrame {
    /// Wrap an already upright grayscale image
    pub fn from_image(image: GrayImage, sequence_index: u64, timestamp_ms: u64) -> Self {
        let (width, height) = image.dimensions();
        Self {
            pixels: image.into_raw(),
            width,
            height,
            rotation_degrees: 0,
            sequence_index,
            timestamp_ms,
        }
    }
}

/// Supported upright-correction rotations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    None,
    Clockwise90,
    Half,
    Clockwise270,
}

impl TryFrom<i32> for Rotation {
    type Error = Error;

    fn try_from(degrees: i32) -> Result<Self> {
        match degrees.rem_euclid(360) {
            0 => Ok(Rotation::None),
            90 => Ok(Rotation::Clockwise90),
            180 => Ok(Rotation::Half),
            270 => Ok(Rotation::Clockwise270),
            _ => Err(Error::UnsupportedInput(format!(
                "unsupported rotation of {} degrees",
                degrees
            ))),
        }
    }
}

/// Analysis resolution settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Downscale factor for processing (1 = full size, 2 = half size, etc.)
    #[validate(range(min = 1, max = 16))]
    pub downscale_factor: u32,
    /// Maximum width after downscaling
    #[validate(range(min = 16, max = 4096))]
    pub max_width: u32,
    /// Maximum height after downscaling
    #[validate(range(min = 16, max = 4096))]
    pub max_height: u32,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            downscale_factor: 2,
            max_width: 320,
            max_height: 240,
        }
    }
}

/// Validate a raw frame and rotate it upright
pub fn normalize(raw: &RawFrame) -> Result<GrayImage> {
    if raw.width == 0 || raw.height == 0 {
        return Err(Error::UnsupportedInput(format!(
            "empty frame {}x{}",
            raw.width, raw.height
        )));
    }

    let rotation = Rotation::try_from(raw.rotation_degrees)?;

    let image = GrayImage::from_raw(raw.width, raw.height, raw.pixels.clone()).ok_or_else(|| {
        Error::UnsupportedInput(format!(
            "frame buffer holds {} bytes, expected {} for {}x{}",
            raw.pixels.len(),
            raw.width as usize * raw.height as usize,
            raw.width,
            raw.height
        ))
    })?;

    let upright = match rotation {
        Rotation::None => image,
        Rotation::Clockwise90 => image::imageops::rotate90(&image),
        Rotation::Half => image::imageops::rotate180(&image),
        Rotation::Clockwise270 => image::imageops::rotate270(&image),
    };

    Ok(upright)
}

/// Target analysis dimensions for a frame of the given size
pub fn analysis_dimensions(width: u32, height: u32, config: &ProcessingConfig) -> (u32, u32) {
    let factor = config.downscale_factor.max(1);
    let mut target_width = (width / factor).max(1);
    let mut target_height = (height / factor).max(1);

    // Cap while keeping the aspect ratio
    let scale = f64::min(
        config.max_width as f64 / target_width as f64,
        config.max_height as f64 / target_height as f64,
    );
    if scale < 1.0 {
        target_width = ((target_width as f64 * scale).round() as u32).max(1);
        target_height = ((target_height as f64 * scale).round() as u32).max(1);
    }

    (target_width, target_height)
}

/// Downscale image according to configuration
pub fn downscale(img: &GrayImage, config: &ProcessingConfig) -> GrayImage {
    let (orig_width, orig_height) = img.dimensions();
    let (target_width, target_height) = analysis_dimensions(orig_width, orig_height, config);

    if target_width == orig_width && target_height == orig_height {
        return img.clone();
    }

    debug!(
        "Downscaling frame from {}x{} to {}x{}",
        orig_width, orig_height, target_width, target_height
    );

    image::imageops::resize(
        img,
        target_width,
        target_height,
        image::imageops::FilterType::Triangle,
    )
}

/// Global luminance standard deviation, the scene contrast measure
pub fn luminance_std_dev(img: &GrayImage) -> f64 {
    let raw = img.as_raw();
    if raw.is_empty() {
        return 0.0;
    }

    let n = raw.len() as f64;
    let (sum, sum_sq) = raw.iter().fold((0.0f64, 0.0f64), |(s, sq), &p| {
        let v = p as f64;
        (s + v, sq + v * v)
    });
    let mean = sum / n;
    (sum_sq / n - mean * mean).max(0.0).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn raw(width: u32, height: u32, rotation_degrees: i32) -> RawFrame {
        let mut pixels = vec![0u8; (width * height) as usize];
        // Mark the top-left pixel so rotations are observable
        pixels[0] = 255;
        RawFrame {
            pixels,
            width,
            height,
            rotation_degrees,
            sequence_index: 0,
            timestamp_ms: 0,
        }
    }

    #[test]
    fn test_rotation_parsing() {
        assert_eq!(Rotation::try_from(0).unwrap(), Rotation::None);
        assert_eq!(Rotation::try_from(90).unwrap(), Rotation::Clockwise90);
        assert_eq!(Rotation::try_from(-90).unwrap(), Rotation::Clockwise270);
        assert_eq!(Rotation::try_from(450).unwrap(), Rotation::Clockwise90);
        assert!(matches!(
            Rotation::try_from(45),
            Err(Error::UnsupportedInput(_))
        ));
    }

    #[test]
    fn test_normalize_rotates_clockwise() {
        let upright = normalize(&raw(4, 2, 90)).unwrap();
        assert_eq!(upright.dimensions(), (2, 4));
        // Top-left moves to top-right under a clockwise quarter turn
        assert_eq!(upright.get_pixel(1, 0).0[0], 255);

        let flipped = normalize(&raw(4, 2, 180)).unwrap();
        assert_eq!(flipped.dimensions(), (4, 2));
        assert_eq!(flipped.get_pixel(3, 1).0[0], 255);

        let ccw = normalize(&raw(4, 2, 270)).unwrap();
        assert_eq!(ccw.dimensions(), (2, 4));
        assert_eq!(ccw.get_pixel(0, 3).0[0], 255);
    }

    #[test]
    fn test_normalize_rejects_malformed_frames() {
        let mut short = raw(4, 4, 0);
        short.pixels.truncate(10);
        assert!(matches!(normalize(&short), Err(Error::UnsupportedInput(_))));

        assert!(matches!(
            normalize(&raw(0, 4, 0)),
            Err(Error::UnsupportedInput(_))
        ));
        assert!(matches!(
            normalize(&raw(4, 4, 30)),
            Err(Error::UnsupportedInput(_))
        ));
    }

    #[test]
    fn test_analysis_dimensions() {
        let config = ProcessingConfig::default();
        assert_eq!(analysis_dimensions(640, 480, &config), (320, 240));
        assert_eq!(analysis_dimensions(1280, 720, &config), (320, 180));
        assert_eq!(analysis_dimensions(100, 80, &config), (50, 40));

        let full = ProcessingConfig {
            downscale_factor: 1,
            max_width: 4096,
            max_height: 4096,
        };
        assert_eq!(analysis_dimensions(64, 48, &full), (64, 48));
    }

    #[test]
    fn test_downscale_skips_identity() {
        let config = ProcessingConfig {
            downscale_factor: 1,
            ..Default::default()
        };
        let img = GrayImage::from_pixel(32, 32, Luma([7u8]));
        let out = downscale(&img, &config);
        assert_eq!(out.dimensions(), (32, 32));
        assert_eq!(out.get_pixel(5, 5).0[0], 7);
    }

    #[test]
    fn test_luminance_std_dev() {
        let flat = GrayImage::from_pixel(10, 10, Luma([128u8]));
        assert_eq!(luminance_std_dev(&flat), 0.0);

        // Half 0, half 200: std dev is exactly 100
        let split = GrayImage::from_fn(10, 10, |x, _| if x < 5 { Luma([0]) } else { Luma([200]) });
        assert!((luminance_std_dev(&split) - 100.0).abs() < 1e-9);
    }
}
