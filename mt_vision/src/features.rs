//! ABOUTME: Shi-Tomasi corner detection for the stabilization tracker
//! ABOUTME: Quality-ranked minimum-eigenvalue corners with a minimum spacing

use image::GrayImage;
use imageproc::gradients::{horizontal_sobel, vertical_sobel};

/// A detected corner in frame coordinates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Corner {
    pub x: f32,
    pub y: f32,
    /// Minimum eigenvalue of the local structure tensor
    pub score: f32,
}

/// Corner detector parameters
#[derive(Debug, Clone, Copy)]
pub struct CornerParams {
    pub max_corners: usize,
    /// Fraction of the strongest response a corner must reach
    pub quality_level: f32,
    pub min_distance: f32,
    /// Side of the structure-tensor window, odd
    pub block_size: u32,
}

/// Integral image over f64 values, one row/column of zero padding
struct Integral {
    width: usize,
    data: Vec<f64>,
}

impl Integral {
    fn new(values: &[f64], width: usize, height: usize) -> Self {
        let stride = width + 1;
        let mut data = vec![0.0; stride * (height + 1)];
        for y in 0..height {
            let mut row_sum = 0.0;
            for x in 0..width {
                row_sum += values[y * width + x];
                data[(y + 1) * stride + x + 1] = data[y * stride + x + 1] + row_sum;
            }
        }
        Self { width, data }
    }

    /// Sum over the inclusive window [x0, x1] x [y0, y1]
    fn sum(&self, x0: usize, y0: usize, x1: usize, y1: usize) -> f64 {
        let stride = self.width + 1;
        self.data[(y1 + 1) * stride + x1 + 1] - self.data[y0 * stride + x1 + 1]
            - self.data[(y1 + 1) * stride + x0]
            + self.data[y0 * stride + x0]
    }
}

/// Minimum-eigenvalue response map, zero near the border
fn min_eigen_response(img: &GrayImage, block_size: u32) -> Vec<f32> {
    let (w, h) = img.dimensions();
    let (width, height) = (w as usize, h as usize);
    let gx = horizontal_sobel(img);
    let gy = vertical_sobel(img);

    let n = width * height;
    let mut xx = Vec::with_capacity(n);
    let mut xy = Vec::with_capacity(n);
    let mut yy = Vec::with_capacity(n);
    for (px, py) in gx.pixels().zip(gy.pixels()) {
        let dx = px.0[0] as f64;
        let dy = py.0[0] as f64;
        xx.push(dx * dx);
        xy.push(dx * dy);
        yy.push(dy * dy);
    }

    let sxx = Integral::new(&xx, width, height);
    let sxy = Integral::new(&xy, width, height);
    let syy = Integral::new(&yy, width, height);

    let radius = (block_size / 2).max(1) as usize;
    // Sobel is unreliable on the outermost row/column
    let margin = radius + 1;
    let mut response = vec![0.0f32; n];
    if width <= 2 * margin || height <= 2 * margin {
        return response;
    }

    for y in margin..height - margin {
        for x in margin..width - margin {
            let (x0, y0, x1, y1) = (x - radius, y - radius, x + radius, y + radius);
            let a = sxx.sum(x0, y0, x1, y1);
            let b = sxy.sum(x0, y0, x1, y1);
            let c = syy.sum(x0, y0, x1, y1);
            let half_trace = (a + c) * 0.5;
            let diff = (a - c) * 0.5;
            let lambda_min = half_trace - (diff * diff + b * b).sqrt();
            response[y * width + x] = lambda_min.max(0.0) as f32;
        }
    }

    response
}

/// Detect up to `max_corners` strong corners, strongest first
pub fn good_features_to_track(img: &GrayImage, params: &CornerParams) -> Vec<Corner> {
    if params.max_corners == 0 {
        return Vec::new();
    }

    let (w, h) = img.dimensions();
    let (width, height) = (w as usize, h as usize);
    let response = min_eigen_response(img, params.block_size);

    let max_response = response.iter().cloned().fold(0.0f32, f32::max);
    if max_response <= 0.0 {
        return Vec::new();
    }
    let threshold = max_response * params.quality_level;

    // Keep 3x3 local maxima above the quality threshold
    let mut candidates = Vec::new();
    for y in 1..height.saturating_sub(1) {
        for x in 1..width.saturating_sub(1) {
            let v = response[y * width + x];
            if v <= threshold {
                continue;
            }
            let is_peak = (y - 1..=y + 1).all(|ny| {
                (x - 1..=x + 1).all(|nx| response[ny * width + nx] <= v)
            });
            if is_peak {
                candidates.push(Corner {
                    x: x as f32,
                    y: y as f32,
                    score: v,
                });
            }
        }
    }

    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

    let min_dist_sq = params.min_distance * params.min_distance;
    let mut accepted: Vec<Corner> = Vec::with_capacity(params.max_corners);
    for candidate in candidates {
        let too_close = accepted.iter().any(|c| {
            let dx = c.x - candidate.x;
            let dy = c.y - candidate.y;
            dx * dx + dy * dy < min_dist_sq
        });
        if !too_close {
            accepted.push(candidate);
            if accepted.len() == params.max_corners {
                break;
            }
        }
    }

    accepted
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn params() -> CornerParams {
        CornerParams {
            max_corners: 100,
            quality_level: 0.01,
            min_distance: 5.0,
            block_size: 3,
        }
    }

    #[test]
    fn test_flat_image_has_no_corners() {
        let img = GrayImage::from_pixel(40, 40, Luma([90u8]));
        assert!(good_features_to_track(&img, &params()).is_empty());
    }

    #[test]
    fn test_square_yields_its_four_corners() {
        let img = GrayImage::from_fn(60, 60, |x, y| {
            if (20..40).contains(&x) && (20..40).contains(&y) {
                Luma([220])
            } else {
                Luma([30])
            }
        });
        let corners = good_features_to_track(&img, &params());
        assert!(corners.len() >= 4);

        for (cx, cy) in [(20.0, 20.0), (39.0, 20.0), (20.0, 39.0), (39.0, 39.0)] {
            let near = corners
                .iter()
                .any(|c| (c.x - cx).abs() <= 2.0 && (c.y - cy).abs() <= 2.0);
            assert!(near, "no corner found near ({}, {})", cx, cy);
        }
    }

    #[test]
    fn test_min_distance_and_cap_are_enforced() {
        let img = GrayImage::from_fn(80, 80, |x, y| {
            if ((x / 4) + (y / 4)) % 2 == 0 {
                Luma([200])
            } else {
                Luma([40])
            }
        });
        let mut p = params();
        p.min_distance = 10.0;
        p.max_corners = 12;
        let corners = good_features_to_track(&img, &p);
        assert!(corners.len() <= 12);
        for (i, a) in corners.iter().enumerate() {
            for b in &corners[i + 1..] {
                let d2 = (a.x - b.x).powi(2) + (a.y - b.y).powi(2);
                assert!(d2 >= 100.0);
            }
        }
        // Strongest first
        assert!(corners.windows(2).all(|w| w[0].score >= w[1].score));
    }
}
