//! ABOUTME: Pyramidal Lucas-Kanade sparse optical flow
//! ABOUTME: Tracks corners between two luminance frames with a per-point status

use crate::features::Corner;
use image::{GrayImage, ImageBuffer, Luma};
use mt_core::Result;

type FloatImage = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Smallest level side the pyramid will build
const MIN_LEVEL_SIDE: u32 = 8;

/// Coarse-to-fine image pyramid, level 0 is full resolution
#[derive(Debug, Clone)]
pub struct Pyramid {
    levels: Vec<FloatImage>,
}

impl Pyramid {
    /// Build up to `max_levels` levels, each a binomial-smoothed half of the one below
    pub fn build(img: &GrayImage, max_levels: usize) -> Self {
        let (w, h) = img.dimensions();
        let base = FloatImage::from_fn(w, h, |x, y| Luma([img.get_pixel(x, y).0[0] as f32]));
        let mut levels = vec![base];

        while levels.len() < max_levels.max(1) {
            let prev = &levels[levels.len() - 1];
            let (pw, ph) = prev.dimensions();
            if pw / 2 < MIN_LEVEL_SIDE || ph / 2 < MIN_LEVEL_SIDE {
                break;
            }
            let next = pyr_down(prev);
            levels.push(next);
        }

        Self { levels }
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.levels[0].dimensions()
    }
}

/// 5-tap binomial kernel, sums to 16
const BINOMIAL: [f32; 5] = [1.0, 4.0, 6.0, 4.0, 1.0];

/// Smooth with the separable binomial kernel and keep every other pixel
fn pyr_down(src: &FloatImage) -> FloatImage {
    let (w, h) = src.dimensions();
    let (nw, nh) = (w / 2, h / 2);
    let clamp = |v: i64, max: u32| v.clamp(0, max as i64 - 1) as u32;

    let rows = FloatImage::from_fn(nw, h, |x, y| {
        let cx = 2 * x as i64;
        let sum: f32 = BINOMIAL
            .iter()
            .enumerate()
            .map(|(i, k)| k * src.get_pixel(clamp(cx + i as i64 - 2, w), y).0[0])
            .sum();
        Luma([sum / 16.0])
    });

    FloatImage::from_fn(nw, nh, |x, y| {
        let cy = 2 * y as i64;
        let sum: f32 = BINOMIAL
            .iter()
            .enumerate()
            .map(|(i, k)| k * rows.get_pixel(x, clamp(cy + i as i64 - 2, h)).0[0])
            .sum();
        Luma([sum / 16.0])
    })
}

/// Bilinear sample with coordinates clamped to the image
fn sample(img: &FloatImage, x: f32, y: f32) -> f32 {
    let (w, h) = img.dimensions();
    let x = x.clamp(0.0, (w - 1) as f32);
    let y = y.clamp(0.0, (h - 1) as f32);
    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(w - 1);
    let y1 = (y0 + 1).min(h - 1);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let top = img.get_pixel(x0, y0).0[0] * (1.0 - fx) + img.get_pixel(x1, y0).0[0] * fx;
    let bottom = img.get_pixel(x0, y1).0[0] * (1.0 - fx) + img.get_pixel(x1, y1).0[0] * fx;
    top * (1.0 - fy) + bottom * fy
}

/// Outcome for one tracked point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStatus {
    Tracked,
    /// Singular gradient matrix, the patch has no usable texture
    Lost,
    OutOfBounds,
}

/// Displacement of one feature between frames
#[derive(Debug, Clone, Copy)]
pub struct FlowVector {
    pub from: (f32, f32),
    pub to: (f32, f32),
    pub status: FlowStatus,
}

impl FlowVector {
    pub fn is_valid(&self) -> bool {
        self.status == FlowStatus::Tracked
    }

    pub fn magnitude(&self) -> f64 {
        let dx = (self.to.0 - self.from.0) as f64;
        let dy = (self.to.1 - self.from.1) as f64;
        (dx * dx + dy * dy).sqrt()
    }
}

enum LevelResult {
    Converged(f32, f32),
    Singular,
}

/// Forward-additive pyramidal Lucas-Kanade tracker
#[derive(Debug, Clone)]
pub struct LucasKanade {
    /// Patch half-size, the patch is (2r+1)^2
    pub window_radius: u32,
    pub max_iterations: u32,
    /// Convergence threshold in pixels
    pub epsilon: f32,
}

impl LucasKanade {
    /// Track every point from `prev` into `curr`
    pub fn track(&self, prev: &Pyramid, curr: &Pyramid, points: &[Corner]) -> Vec<FlowVector> {
        let levels = prev.num_levels().min(curr.num_levels());
        points
            .iter()
            .map(|p| self.track_point(prev, curr, p, levels))
            .collect()
    }

    fn track_point(&self, prev: &Pyramid, curr: &Pyramid, point: &Corner, levels: usize) -> FlowVector {
        let mut dx = 0.0f32;
        let mut dy = 0.0f32;

        for level in (0..levels).rev() {
            let scale = 1.0 / (1u32 << level) as f32;
            let px = point.x * scale;
            let py = point.y * scale;

            match self.refine(&prev.levels[level], &curr.levels[level], px, py, dx, dy) {
                LevelResult::Converged(ndx, ndy) => {
                    dx = ndx;
                    dy = ndy;
                }
                LevelResult::Singular => {
                    return FlowVector {
                        from: (point.x, point.y),
                        to: (point.x + dx / scale, point.y + dy / scale),
                        status: FlowStatus::Lost,
                    };
                }
            }

            if level > 0 {
                dx *= 2.0;
                dy *= 2.0;
            }
        }

        let to = (point.x + dx, point.y + dy);
        let (w, h) = prev.dimensions();
        let status = if to.0 >= 0.0 && to.0 < w as f32 && to.1 >= 0.0 && to.1 < h as f32 {
            FlowStatus::Tracked
        } else {
            FlowStatus::OutOfBounds
        };

        FlowVector {
            from: (point.x, point.y),
            to,
            status,
        }
    }

    /// Gauss-Newton refinement of the displacement at one level
    fn refine(
        &self,
        prev: &FloatImage,
        curr: &FloatImage,
        fx: f32,
        fy: f32,
        mut dx: f32,
        mut dy: f32,
    ) -> LevelResult {
        let r = self.window_radius as i32;

        for _ in 0..self.max_iterations {
            let (mut h00, mut h01, mut h11) = (0.0f32, 0.0f32, 0.0f32);
            let (mut b0, mut b1) = (0.0f32, 0.0f32);

            for oy in -r..=r {
                for ox in -r..=r {
                    let (ox, oy) = (ox as f32, oy as f32);
                    let template = sample(prev, fx + ox, fy + oy);
                    let wx = fx + dx + ox;
                    let wy = fy + dy + oy;
                    let warped = sample(curr, wx, wy);
                    let err = template - warped;

                    let gx = 0.5 * (sample(curr, wx + 1.0, wy) - sample(curr, wx - 1.0, wy));
                    let gy = 0.5 * (sample(curr, wx, wy + 1.0) - sample(curr, wx, wy - 1.0));

                    h00 += gx * gx;
                    h01 += gx * gy;
                    h11 += gy * gy;
                    b0 += gx * err;
                    b1 += gy * err;
                }
            }

            let det = h00 * h11 - h01 * h01;
            if det.abs() < 1e-6 {
                return LevelResult::Singular;
            }
            let inv_det = 1.0 / det;
            let step_x = inv_det * (h11 * b0 - h01 * b1);
            let step_y = inv_det * (h00 * b1 - h01 * b0);
            dx += step_x;
            dy += step_y;

            if step_x * step_x + step_y * step_y < self.epsilon * self.epsilon {
                break;
            }
        }

        LevelResult::Converged(dx, dy)
    }
}

/// Sparse optical flow between two whole frames
pub trait SparseFlowTracker: Send {
    /// Track `points` from `prev` into `curr`, one vector per point in order
    fn track(
        &mut self,
        prev: &GrayImage,
        curr: &GrayImage,
        points: &[Corner],
    ) -> Result<Vec<FlowVector>>;

    fn name(&self) -> &'static str;
}

/// Native [`SparseFlowTracker`]; reuses the pyramid of the last `curr` frame
pub struct PyramidalTracker {
    lucas_kanade: LucasKanade,
    max_levels: usize,
    cached: Option<(GrayImage, Pyramid)>,
}

impl PyramidalTracker {
    pub fn new(lucas_kanade: LucasKanade, max_levels: usize) -> Self {
        Self {
            lucas_kanade,
            max_levels,
            cached: None,
        }
    }
}

impl SparseFlowTracker for PyramidalTracker {
    fn track(
        &mut self,
        prev: &GrayImage,
        curr: &GrayImage,
        points: &[Corner],
    ) -> Result<Vec<FlowVector>> {
        let prev_pyramid = match self.cached.take() {
            Some((frame, pyramid)) if frame == *prev => pyramid,
            _ => Pyramid::build(prev, self.max_levels),
        };
        let curr_pyramid = Pyramid::build(curr, self.max_levels);

        let flow = self.lucas_kanade.track(&prev_pyramid, &curr_pyramid, points);
        self.cached = Some((curr.clone(), curr_pyramid));
        Ok(flow)
    }

    fn name(&self) -> &'static str {
        "PyramidalLK"
    }
}

/// Per-pixel flow magnitude in pixels per frame
#[derive(Debug, Clone, PartialEq)]
pub struct MagnitudeField {
    width: u32,
    height: u32,
    values: Vec<f32>,
}

impl MagnitudeField {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            values: vec![0.0; (width * height) as usize],
        }
    }

    pub fn from_fn(width: u32, height: u32, mut f: impl FnMut(u32, u32) -> f32) -> Self {
        let mut values = Vec::with_capacity((width * height) as usize);
        for y in 0..height {
            for x in 0..width {
                values.push(f(x, y));
            }
        }
        Self {
            width,
            height,
            values,
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn get(&self, x: u32, y: u32) -> f32 {
        self.values[(y * self.width + x) as usize]
    }

    pub fn set(&mut self, x: u32, y: u32, value: f32) {
        self.values[(y * self.width + x) as usize] = value;
    }

    /// Binary mask of pixels moving faster than `threshold`
    pub fn threshold(&self, threshold: f32) -> GrayImage {
        GrayImage::from_fn(self.width, self.height, |x, y| {
            Luma([if self.get(x, y) > threshold { 255 } else { 0 }])
        })
    }

    /// Mean magnitude over the non-zero pixels of `region`
    ///
    /// `None` when the region is empty or does not match the field's size.
    pub fn mean_within(&self, region: &GrayImage) -> Option<f64> {
        if region.dimensions() != self.dimensions() {
            return None;
        }
        let (sum, count) = region
            .enumerate_pixels()
            .filter(|(_, _, p)| p.0[0] != 0)
            .fold((0.0f64, 0usize), |(s, n), (x, y, _)| {
                (s + self.get(x, y) as f64, n + 1)
            });
        (count > 0).then(|| sum / count as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob_frame(cx: f32, cy: f32) -> GrayImage {
        GrayImage::from_fn(64, 64, |x, y| {
            let d2 = (x as f32 - cx).powi(2) + (y as f32 - cy).powi(2);
            Luma([(40.0 + 180.0 * (-d2 / 60.0).exp()) as u8])
        })
    }

    fn tracker() -> LucasKanade {
        LucasKanade {
            window_radius: 7,
            max_iterations: 20,
            epsilon: 0.01,
        }
    }

    #[test]
    fn test_pyramid_halves_each_level() {
        let pyr = Pyramid::build(&GrayImage::new(64, 48), 3);
        assert_eq!(pyr.num_levels(), 3);
        assert_eq!(pyr.levels[1].dimensions(), (32, 24));
        assert_eq!(pyr.levels[2].dimensions(), (16, 12));

        // Too small to go deeper
        let tiny = Pyramid::build(&GrayImage::new(12, 12), 4);
        assert_eq!(tiny.num_levels(), 1);
    }

    #[test]
    fn test_tracks_translated_blob() {
        let prev = Pyramid::build(&blob_frame(30.0, 30.0), 3);
        let curr = Pyramid::build(&blob_frame(33.0, 32.0), 3);
        let point = Corner {
            x: 27.0,
            y: 27.0,
            score: 1.0,
        };

        let flow = tracker().track(&prev, &curr, &[point]);
        assert_eq!(flow.len(), 1);
        assert!(flow[0].is_valid());
        assert!((flow[0].to.0 - 30.0).abs() < 0.5, "x = {}", flow[0].to.0);
        assert!((flow[0].to.1 - 29.0).abs() < 0.5, "y = {}", flow[0].to.1);
    }

    #[test]
    fn test_flat_patch_is_lost() {
        let flat = GrayImage::from_pixel(64, 64, Luma([100u8]));
        let pyr = Pyramid::build(&flat, 2);
        let flow = tracker().track(
            &pyr,
            &pyr,
            &[Corner {
                x: 32.0,
                y: 32.0,
                score: 0.0,
            }],
        );
        assert_eq!(flow[0].status, FlowStatus::Lost);
        assert!(!flow[0].is_valid());
    }

    #[test]
    fn test_magnitude() {
        let v = FlowVector {
            from: (0.0, 0.0),
            to: (3.0, 4.0),
            status: FlowStatus::Tracked,
        };
        assert!((v.magnitude() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_pyramidal_tracker_matches_direct_tracking() {
        let prev = blob_frame(30.0, 30.0);
        let curr = blob_frame(33.0, 32.0);
        let point = Corner {
            x: 27.0,
            y: 27.0,
            score: 1.0,
        };
        let direct = tracker().track(
            &Pyramid::build(&prev, 3),
            &Pyramid::build(&curr, 3),
            &[point],
        );

        let mut cached = PyramidalTracker::new(tracker(), 3);
        let first = cached.track(&prev, &curr, &[point]).unwrap();
        assert_eq!(first[0].to, direct[0].to);

        // Second call reuses the pyramid of `curr` as its previous frame
        let back = cached.track(&curr, &prev, &[point]).unwrap();
        assert!(back[0].is_valid());
        assert_eq!(cached.name(), "PyramidalLK");
    }

    #[test]
    fn test_magnitude_field_threshold_and_region_mean() {
        let field = MagnitudeField::from_fn(10, 10, |x, _| if x < 5 { 2.0 } else { 8.0 });
        let mask = field.threshold(5.0);
        assert_eq!(mask.get_pixel(2, 3)[0], 0);
        assert_eq!(mask.get_pixel(7, 3)[0], 255);

        let mut region = GrayImage::new(10, 10);
        region.put_pixel(4, 0, Luma([255]));
        region.put_pixel(5, 0, Luma([255]));
        assert!((field.mean_within(&region).unwrap() - 5.0).abs() < 1e-9);
        assert!(field.mean_within(&GrayImage::new(10, 10)).is_none());
        assert!(field.mean_within(&GrayImage::new(4, 4)).is_none());
    }
}
