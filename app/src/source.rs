//! ABOUTME: Frame sources feeding the analysis loop
//! ABOUTME: Image directories decoded to luminance, or a generated moving-object scene

use image::{GrayImage, Luma};
use mt_core::{Error, Result};
use mt_vision::utils::textured_frame;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Produces upright-agnostic luminance frames one at a time
pub trait FrameSource: Send {
    /// Next frame, `Ok(None)` once exhausted
    fn next_frame(&mut self) -> Result<Option<GrayImage>>;

    /// Short description for logs
    fn describe(&self) -> String;
}

/// Image files in a directory, in file-name order
pub struct DirectorySource {
    root: PathBuf,
    files: Vec<PathBuf>,
    position: usize,
}

impl DirectorySource {
    pub fn open(root: &Path) -> Result<Self> {
        let mut files: Vec<PathBuf> = fs::read_dir(root)
            .map_err(|e| {
                Error::ResourceUnavailable(format!("Cannot read {}: {}", root.display(), e))
            })?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && has_image_extension(path))
            .collect();
        files.sort();

        info!("Found {} frames in {}", files.len(), root.display());
        Ok(Self {
            root: root.to_path_buf(),
            files,
            position: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

impl FrameSource for DirectorySource {
    fn next_frame(&mut self) -> Result<Option<GrayImage>> {
        let Some(path) = self.files.get(self.position) else {
            return Ok(None);
        };
        self.position += 1;

        debug!("Decoding {}", path.display());
        let image = image::open(path).map_err(|e| {
            Error::UnsupportedInput(format!("Cannot decode {}: {}", path.display(), e))
        })?;
        Ok(Some(image.to_luma8()))
    }

    fn describe(&self) -> String {
        format!("directory {}", self.root.display())
    }
}

/// Static textured scene with a square crossing it during the middle half
pub struct SyntheticSource {
    background: GrayImage,
    total: u64,
    produced: u64,
    side: u32,
}

impl SyntheticSource {
    pub const WIDTH: u32 = 320;
    pub const HEIGHT: u32 = 240;

    pub fn new(frames: u64) -> Self {
        Self {
            background: textured_frame(Self::WIDTH, Self::HEIGHT, 42),
            total: frames,
            produced: 0,
            side: 32,
        }
    }

    fn render(&self, index: u64) -> GrayImage {
        let mut frame = self.background.clone();
        let start = self.total / 4;
        let end = self.total - self.total / 4;
        if !(start..end).contains(&index) {
            return frame;
        }

        let travel = (Self::WIDTH - self.side) as u64;
        let span = (end - start).max(1);
        let x = ((index - start) * travel / span) as u32;
        let y = (Self::HEIGHT - self.side) / 2;
        for yy in y..y + self.side {
            for xx in x..x + self.side {
                frame.put_pixel(xx, yy, Luma([250]));
            }
        }
        frame
    }
}

impl FrameSource for SyntheticSource {
    fn next_frame(&mut self) -> Result<Option<GrayImage>> {
        if self.produced >= self.total {
            return Ok(None);
        }
        let frame = self.render(self.produced);
        self.produced += 1;
        Ok(Some(frame))
    }

    fn describe(&self) -> String {
        format!("synthetic scene ({} frames)", self.total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_directory_source_orders_and_filters() {
        let dir = TempDir::new().unwrap();
        for (name, value) in [("b.png", 200u8), ("a.png", 100u8)] {
            GrayImage::from_pixel(8, 6, Luma([value]))
                .save(dir.path().join(name))
                .unwrap();
        }
        fs::write(dir.path().join("notes.txt"), "skip me").unwrap();

        let mut source = DirectorySource::open(dir.path()).unwrap();
        assert_eq!(source.len(), 2);

        let first = source.next_frame().unwrap().unwrap();
        assert_eq!(first.dimensions(), (8, 6));
        assert_eq!(first.get_pixel(0, 0).0[0], 100);
        assert_eq!(source.next_frame().unwrap().unwrap().get_pixel(0, 0).0[0], 200);
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_directory_source_reports_bad_files() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("broken.jpg"), b"not a jpeg").unwrap();

        let mut source = DirectorySource::open(dir.path()).unwrap();
        assert!(matches!(
            source.next_frame(),
            Err(Error::UnsupportedInput(_))
        ));
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_missing_directory() {
        let err = DirectorySource::open(Path::new("/nonexistent/frames")).err().unwrap();
        assert!(matches!(err, Error::ResourceUnavailable(_)));
    }

    #[test]
    fn test_synthetic_source_runs_object_through_middle() {
        let mut source = SyntheticSource::new(40);
        let frames: Vec<_> = std::iter::from_fn(|| source.next_frame().unwrap()).collect();
        assert_eq!(frames.len(), 40);
        assert_eq!(frames[0], frames[5]);
        assert_ne!(frames[0], frames[15]);
        assert_ne!(frames[15], frames[16]);
        assert_eq!(frames[0], frames[39]);
    }
}
