//! ABOUTME: Shared testing utilities and helper functions
//! ABOUTME: Synthetic scenes and in-memory recording sinks for all crates

use image::{GrayImage, Luma, RgbImage};
use imageproc::filter::gaussian_blur_f32;
use mt_core::{Error, Result};
use mt_record::{FrameSink, SinkFactory, SinkSpec};
use mt_vision::RawFrame;
use std::sync::{Arc, Mutex};

pub use mt_vision::utils::{
    flat_frame, frame_with_rect, shift_frame, speckle_frame, textured_frame,
};

/// Frame interval used by the synthetic scenes, roughly 30 fps
pub const FRAME_INTERVAL_MS: u64 = 33;

/// Two-level block texture, each 16px block randomly `dark` or `light`, blurred slightly
fn block_texture(width: u32, height: u32, seed: u64, dark: u8, light: u8) -> GrayImage {
    const BLOCK: u32 = 16;
    let blocks = GrayImage::from_fn(width, height, |x, y| {
        let bx = (x / BLOCK) as u64;
        let by = (y / BLOCK) as u64;
        let mut h = seed ^ bx.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ by.wrapping_mul(0xD6E8_FEB8_6659_FD93);
        h = (h ^ (h >> 29)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        h ^= h >> 32;
        Luma([if h & 1 == 0 { dark } else { light }])
    });
    gaussian_blur_f32(&blocks, 1.0)
}

/// Black/white block texture; its contrast saturates the contrast-to-threshold
/// mapping so small objects do not move the threshold
pub fn high_contrast_texture(width: u32, height: u32, seed: u64) -> GrayImage {
    block_texture(width, height, seed, 0, 255)
}

/// Grey blocks 32 levels apart, a standard deviation of roughly 15 that sits
/// inside the contrast-to-threshold mapping rather than at either end
pub fn low_contrast_texture(width: u32, height: u32, seed: u64) -> GrayImage {
    block_texture(width, height, seed, 112, 144)
}

/// Draw a uniform square onto a copy of `background`
pub fn with_square(background: &GrayImage, x: u32, y: u32, side: u32, value: u8) -> GrayImage {
    let mut img = background.clone();
    let (w, h) = img.dimensions();
    for yy in y..(y + side).min(h) {
        for xx in x..(x + side).min(w) {
            img.put_pixel(xx, yy, Luma([value]));
        }
    }
    img
}

/// Wrap an upright luminance image as a raw frame at `index` × 33 ms
pub fn raw_frame(image: GrayImage, index: u64) -> RawFrame {
    RawFrame::from_image(image, index, index * FRAME_INTERVAL_MS)
}

/// Scripted scene: static textured background with an optional moving square
pub struct Scene {
    background: GrayImage,
    side: u32,
    step: u32,
    value: u8,
}

impl Scene {
    /// Mid-grey square over a high-contrast background
    pub fn new(width: u32, height: u32, seed: u64) -> Self {
        Self {
            background: high_contrast_texture(width, height, seed),
            side: 16,
            step: 4,
            value: 128,
        }
    }

    /// Bright square over a low-contrast background
    pub fn low_contrast(width: u32, height: u32, seed: u64) -> Self {
        Self {
            background: low_contrast_texture(width, height, seed),
            side: 16,
            step: 4,
            value: 230,
        }
    }

    pub fn background(&self) -> &GrayImage {
        &self.background
    }

    /// Background only
    pub fn empty(&self, index: u64) -> RawFrame {
        raw_frame(self.background.clone(), index)
    }

    /// Square at the position it occupies on frame `index`
    pub fn with_object(&self, index: u64) -> RawFrame {
        raw_frame(self.object_image(index), index)
    }

    /// Centre of the square on frame `index`
    pub fn object_center(&self, index: u64) -> (f64, f64) {
        let (x, y) = self.object_origin(index);
        (
            x as f64 + (self.side as f64 - 1.0) / 2.0,
            y as f64 + (self.side as f64 - 1.0) / 2.0,
        )
    }

    pub fn object_image(&self, index: u64) -> GrayImage {
        let (x, y) = self.object_origin(index);
        with_square(&self.background, x, y, self.side, self.value)
    }

    /// Sweeps left to right, dropping to a new lane on every pass so the
    /// background model never sees the object on the same pixels twice in a row
    fn object_origin(&self, index: u64) -> (u32, u32) {
        const MARGIN: u32 = 8;
        let (w, h) = self.background.dimensions();
        let travel = w.saturating_sub(self.side).max(1) as u64;
        let offset = index * self.step as u64;
        let pass = offset / travel;
        let x = (offset % travel) as u32;

        let lane_span = h.saturating_sub(self.side + 2 * MARGIN).max(1) as u64;
        let lane_pitch = (self.side + self.side / 2) as u64;
        let y = MARGIN + ((pass * lane_pitch) % lane_span) as u32;
        (x, y)
    }
}

/// Counters shared between a [`MemorySinkFactory`] and the test that owns it
#[derive(Debug, Default, Clone)]
pub struct SinkLog {
    pub created: Vec<SinkSpec>,
    pub frames: Vec<(usize, (u32, u32))>,
    pub finished: Vec<usize>,
}

impl SinkLog {
    /// Frames written to session `session`
    pub fn frames_in(&self, session: usize) -> usize {
        self.frames.iter().filter(|(s, _)| *s == session).count()
    }
}

/// In-memory sink factory recording every call; can simulate missing storage
#[derive(Clone, Default)]
pub struct MemorySinkFactory {
    log: Arc<Mutex<SinkLog>>,
    unavailable: bool,
}

impl MemorySinkFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory whose `create` always fails with `ResourceUnavailable`
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    /// Snapshot of everything recorded so far
    pub fn log(&self) -> SinkLog {
        self.log.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

impl SinkFactory for MemorySinkFactory {
    fn create(&mut self, spec: &SinkSpec) -> Result<Box<dyn FrameSink>> {
        if self.unavailable {
            return Err(Error::ResourceUnavailable("storage not mounted".into()));
        }
        let mut log = self
            .log
            .lock()
            .map_err(|_| Error::ResourceUnavailable("sink log poisoned".into()))?;
        let session = log.created.len();
        log.created.push(spec.clone());
        Ok(Box::new(MemorySink {
            log: self.log.clone(),
            session,
            frames: 0,
            closed: false,
        }))
    }
}

struct MemorySink {
    log: Arc<Mutex<SinkLog>>,
    session: usize,
    frames: u64,
    closed: bool,
}

impl FrameSink for MemorySink {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<()> {
        if self.closed {
            return Err(Error::SinkWrite("sink closed".into()));
        }
        if let Ok(mut log) = self.log.lock() {
            log.frames.push((self.session, frame.dimensions()));
        }
        self.frames += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Ok(mut log) = self.log.lock() {
            log.finished.push(self.session);
        }
        Ok(())
    }

    fn frames_written(&self) -> u64 {
        self.frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    #[test]
    fn test_high_contrast_texture_is_saturated() {
        let img = high_contrast_texture(128, 96, 1);
        assert!(mt_vision::luminance_std_dev(&img) > 70.0);
        assert_eq!(img, high_contrast_texture(128, 96, 1));
    }

    #[test]
    fn test_low_contrast_texture_is_inside_mapping() {
        let img = low_contrast_texture(160, 120, 7);
        let std = mt_vision::luminance_std_dev(&img);
        assert!(std > 10.0 && std < 20.0, "std = {}", std);
        assert!(img.pixels().all(|p| (112..=144).contains(&p.0[0])));
    }

    #[test]
    fn test_with_square_paints_clipped_square() {
        let background = flat_frame(20, 20, 10);
        let img = with_square(&background, 15, 2, 8, 200);
        assert_eq!(img.get_pixel(15, 2)[0], 200);
        assert_eq!(img.get_pixel(19, 9)[0], 200);
        assert_eq!(img.get_pixel(14, 2)[0], 10);
        assert_eq!(img.get_pixel(15, 10)[0], 10);
    }

    #[test]
    fn test_low_contrast_scene_draws_bright_object() {
        let scene = Scene::low_contrast(160, 120, 7);
        let (cx, cy) = scene.object_center(5);
        let img = scene.object_image(5);
        assert_eq!(img.get_pixel(cx as u32, cy as u32)[0], 230);
        assert_eq!(&scene.empty(5).pixels, scene.background().as_raw());
    }

    #[test]
    fn test_scene_object_moves() {
        let scene = Scene::new(160, 120, 3);
        assert_ne!(scene.object_center(0), scene.object_center(1));
        assert_eq!(scene.object_center(0), (7.5, 15.5));
        // Next pass runs on a different lane
        assert_eq!(scene.object_center(36), (7.5, 39.5));
        assert_eq!(scene.with_object(2).timestamp_ms, 66);
    }

    #[test]
    fn test_memory_sink_logs_calls() {
        let mut factory = MemorySinkFactory::new();
        let spec = SinkSpec {
            width: 4,
            height: 3,
            frame_rate: 30,
            save_path: "mem".into(),
            started_at: SystemTime::now(),
        };
        let mut sink = factory.create(&spec).unwrap();
        sink.write_frame(&RgbImage::new(4, 3)).unwrap();
        sink.finish().unwrap();
        sink.finish().unwrap();

        let log = factory.log();
        assert_eq!(log.created.len(), 1);
        assert_eq!(log.frames_in(0), 1);
        assert_eq!(log.finished, vec![0]);
        assert!(MemorySinkFactory::unavailable().create(&spec).is_err());
    }
}
