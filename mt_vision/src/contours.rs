//! ABOUTME: Picks the single most plausible moving object from a foreground mask
//! ABOUTME: External contours filtered by area; largest or fastest wins, centroid from area moments

use crate::flow::MagnitudeField;
use image::{GrayImage, Luma};
use imageproc::contours::{find_contours, BorderType, Contour};
use imageproc::drawing::draw_polygon_mut;
use imageproc::point::Point;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Object position in analysis-frame coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackedPoint {
    pub x: f64,
    pub y: f64,
}

/// Zeroth and first order area moments of a closed polygon
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Moments {
    pub m00: f64,
    pub m10: f64,
    pub m01: f64,
}

impl Moments {
    /// Green's theorem over the polygon edges, orientation independent
    pub fn of_polygon(points: &[Point<i32>]) -> Self {
        if points.len() < 3 {
            return Self::default();
        }

        let (mut a00, mut a10, mut a01) = (0.0f64, 0.0f64, 0.0f64);
        let mut prev = points[points.len() - 1];
        for &p in points {
            let (x0, y0) = (prev.x as f64, prev.y as f64);
            let (x1, y1) = (p.x as f64, p.y as f64);
            let cross = x0 * y1 - x1 * y0;
            a00 += cross;
            a10 += cross * (x0 + x1);
            a01 += cross * (y0 + y1);
            prev = p;
        }

        let sign = if a00 < 0.0 { -1.0 } else { 1.0 };
        Self {
            m00: sign * a00 / 2.0,
            m10: sign * a10 / 6.0,
            m01: sign * a01 / 6.0,
        }
    }

    /// Centroid, `None` for degenerate zero-area shapes
    pub fn centroid(&self) -> Option<TrackedPoint> {
        if self.m00 == 0.0 {
            return None;
        }
        Some(TrackedPoint {
            x: self.m10 / self.m00,
            y: self.m01 / self.m00,
        })
    }
}

/// Outcome of contour selection for one mask
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub point: Option<TrackedPoint>,
    /// Area of the selected contour, 0 when nothing was selected
    pub area: f64,
    pub contours_found: usize,
    /// Contours whose area exceeded the floor
    pub contours_accepted: usize,
    /// Mean flow magnitude inside the selected contour, fastest selection only
    pub speed: Option<f64>,
}

/// Outer borders without a parent enclose everything else, holes included
fn outer_contours(mask: &GrayImage) -> Vec<Contour<i32>> {
    find_contours::<i32>(mask)
        .into_iter()
        .filter(|c| c.border_type == BorderType::Outer && c.parent.is_none())
        .collect()
}

/// Filled interior of a contour polygon as a mask the size of the frame
fn contour_region(points: &[Point<i32>], width: u32, height: u32) -> GrayImage {
    let mut region = GrayImage::new(width, height);
    let mut polygon = points.to_vec();
    // draw_polygon_mut rejects an explicitly closed polygon
    while polygon.len() > 1 && polygon.first() == polygon.last() {
        polygon.pop();
    }

    if polygon.len() >= 3 {
        draw_polygon_mut(&mut region, &polygon, Luma([255u8]));
    } else {
        for p in polygon {
            if p.x >= 0 && p.y >= 0 && (p.x as u32) < width && (p.y as u32) < height {
                region.put_pixel(p.x as u32, p.y as u32, Luma([255u8]));
            }
        }
    }
    region
}

/// Largest-external-contour object selector
#[derive(Debug, Clone, Default)]
pub struct ContourSelector;

impl ContourSelector {
    pub fn new() -> Self {
        Self
    }

    /// Select the largest outer contour with area above `min_area`
    pub fn select(&self, mask: &GrayImage, min_area: f64) -> Selection {
        let contours = outer_contours(mask);

        let found = contours.len();
        let mut accepted = 0;
        let mut best: Option<(f64, Moments)> = None;

        for contour in &contours {
            let moments = Moments::of_polygon(&contour.points);
            let area = moments.m00;
            if area <= min_area {
                continue;
            }
            accepted += 1;
            if best.map_or(true, |(best_area, _)| area > best_area) {
                best = Some((area, moments));
            }
        }

        let (area, point) = match best {
            Some((area, moments)) => {
                let point = moments.centroid();
                if point.is_none() {
                    debug!("Selected contour has zero m00, reporting no detection");
                }
                (area, point)
            }
            None => (0.0, None),
        };

        debug!(
            "Contour selection: found={}, accepted={}, area={:.1}, point={:?}",
            found, accepted, area, point
        );

        Selection {
            point,
            area,
            contours_found: found,
            contours_accepted: accepted,
            speed: None,
        }
    }

    /// Select the outer contour above `min_area` whose interior moves fastest on average
    ///
    /// A contour must have a positive mean speed to be selected.
    pub fn select_fastest(
        &self,
        mask: &GrayImage,
        speed: &MagnitudeField,
        min_area: f64,
    ) -> Selection {
        let (width, height) = mask.dimensions();
        if speed.dimensions() != (width, height) {
            debug!(
                "Flow field is {:?} but mask is {:?}, nothing selected",
                speed.dimensions(),
                (width, height)
            );
            return Selection {
                point: None,
                area: 0.0,
                contours_found: 0,
                contours_accepted: 0,
                speed: None,
            };
        }

        let contours = outer_contours(mask);
        let found = contours.len();
        let mut accepted = 0;
        let mut best: Option<(f64, f64, Moments)> = None;

        for contour in &contours {
            let moments = Moments::of_polygon(&contour.points);
            if moments.m00 <= min_area {
                continue;
            }
            accepted += 1;

            let region = contour_region(&contour.points, width, height);
            let mean = speed.mean_within(&region).unwrap_or(0.0);
            if mean > best.map_or(0.0, |(best_mean, _, _)| best_mean) {
                best = Some((mean, moments.m00, moments));
            }
        }

        let selection = match best {
            Some((mean, area, moments)) => Selection {
                point: moments.centroid(),
                area,
                contours_found: found,
                contours_accepted: accepted,
                speed: Some(mean),
            },
            None => Selection {
                point: None,
                area: 0.0,
                contours_found: found,
                contours_accepted: accepted,
                speed: None,
            },
        };

        debug!(
            "Fastest contour selection: found={}, accepted={}, speed={:?}, point={:?}",
            found, accepted, selection.speed, selection.point
        );
        selection
    }
}
