//! ABOUTME: Output sinks for recorded sessions and the factory seam that opens them
//! ABOUTME: Default sink writes numbered JPEG frames plus a JSON manifest per session

use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use mt_core::{session_stamp, to_rfc3339, utc_now, Error, Result, SessionId};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// Everything a factory needs to open a sink for one session
#[derive(Debug, Clone)]
pub struct SinkSpec {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    /// Root directory sessions are created under
    pub save_path: PathBuf,
    pub started_at: SystemTime,
}

impl SinkSpec {
    /// Session name derived from the wall-clock start time
    pub fn session_name(&self) -> String {
        format!("Tracker_{}", session_stamp(self.started_at))
    }
}

/// An open recording destination
pub trait FrameSink: Send {
    /// Append one RGB frame
    fn write_frame(&mut self, frame: &RgbImage) -> Result<()>;

    /// Flush and close. Calling it again is a no-op.
    fn finish(&mut self) -> Result<()>;

    /// Frames successfully written so far
    fn frames_written(&self) -> u64;
}

/// Opens sinks on recording start
pub trait SinkFactory: Send {
    fn create(&mut self, spec: &SinkSpec) -> Result<Box<dyn FrameSink>>;
}

/// Manifest written next to the frames when a session closes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionManifest {
    pub id: SessionId,
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub frames_written: u64,
    pub started_at: String,
    pub finished_at: String,
}

pub const MANIFEST_FILE: &str = "session.json";

/// Sink writing `frame_000001.jpg`, `frame_000002.jpg`, ... into a session directory
pub struct JpegSequenceSink {
    id: SessionId,
    name: String,
    directory: PathBuf,
    width: u32,
    height: u32,
    frame_rate: u32,
    quality: u8,
    started_at: SystemTime,
    frames_written: u64,
    finished: bool,
}

impl JpegSequenceSink {
    /// Create the session directory under `spec.save_path`
    pub fn open(spec: &SinkSpec, quality: u8) -> Result<Self> {
        if spec.save_path.as_os_str().is_empty() {
            return Err(Error::ResourceUnavailable(
                "Recording save path is empty".to_string(),
            ));
        }
        if spec.width == 0 || spec.height == 0 {
            return Err(Error::ResourceUnavailable(format!(
                "Cannot record {}x{} frames",
                spec.width, spec.height
            )));
        }

        let name = spec.session_name();
        let directory = spec.save_path.join(&name);
        fs::create_dir_all(&directory).map_err(|e| {
            Error::ResourceUnavailable(format!(
                "Cannot create session directory {}: {}",
                directory.display(),
                e
            ))
        })?;

        debug!(
            "Opened JPEG sequence sink at {} ({}x{} @ {} fps)",
            directory.display(),
            spec.width,
            spec.height,
            spec.frame_rate
        );

        Ok(Self {
            id: SessionId::starting_at(spec.started_at),
            name,
            directory,
            width: spec.width,
            height: spec.height,
            frame_rate: spec.frame_rate,
            quality: quality.clamp(1, 100),
            started_at: spec.started_at,
            frames_written: 0,
            finished: false,
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    fn frame_path(&self, index: u64) -> PathBuf {
        self.directory.join(format!("frame_{:06}.jpg", index))
    }

    fn write_manifest(&self) -> Result<()> {
        let manifest = SessionManifest {
            id: self.id,
            name: self.name.clone(),
            width: self.width,
            height: self.height,
            frame_rate: self.frame_rate,
            frames_written: self.frames_written,
            started_at: to_rfc3339(self.started_at),
            finished_at: to_rfc3339(utc_now()),
        };

        let file = File::create(self.directory.join(MANIFEST_FILE))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &manifest)
            .map_err(|e| Error::SinkWrite(format!("Failed to write session manifest: {}", e)))?;
        writer.flush()?;
        Ok(())
    }
}

impl FrameSink for JpegSequenceSink {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<()> {
        if self.finished {
            return Err(Error::SinkWrite(format!(
                "Session {} is already closed",
                self.name
            )));
        }
        if frame.dimensions() != (self.width, self.height) {
            return Err(Error::SinkWrite(format!(
                "Frame is {}x{}, session expects {}x{}",
                frame.width(),
                frame.height(),
                self.width,
                self.height
            )));
        }

        let path = self.frame_path(self.frames_written + 1);
        let file = File::create(&path)
            .map_err(|e| Error::SinkWrite(format!("Failed to create {}: {}", path.display(), e)))?;
        let mut writer = BufWriter::new(file);
        JpegEncoder::new_with_quality(&mut writer, self.quality)
            .encode_image(frame)
            .map_err(|e| Error::SinkWrite(format!("Failed to encode JPEG: {}", e)))?;
        writer
            .flush()
            .map_err(|e| Error::SinkWrite(format!("Failed to flush {}: {}", path.display(), e)))?;

        self.frames_written += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.write_manifest()?;

        info!(
            session = %self.name,
            frames = self.frames_written,
            "Closed recording session"
        );
        Ok(())
    }

    fn frames_written(&self) -> u64 {
        self.frames_written
    }
}

impl Drop for JpegSequenceSink {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.finish() {
                warn!("Failed to close session {} on drop: {}", self.name, e);
            }
        }
    }
}

/// Factory for [`JpegSequenceSink`]
#[derive(Debug, Clone)]
pub struct JpegSequenceSinkFactory {
    quality: u8,
}

impl JpegSequenceSinkFactory {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }
}

impl SinkFactory for JpegSequenceSinkFactory {
    fn create(&mut self, spec: &SinkSpec) -> Result<Box<dyn FrameSink>> {
        Ok(Box::new(JpegSequenceSink::open(spec, self.quality)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use std::time::{Duration, UNIX_EPOCH};
    use tempfile::TempDir;

    fn spec(root: &Path) -> SinkSpec {
        SinkSpec {
            width: 32,
            height: 24,
            frame_rate: 30,
            save_path: root.to_path_buf(),
            // 2021-02-01 00:00:05 UTC
            started_at: UNIX_EPOCH + Duration::from_secs(1_612_137_605),
        }
    }

    #[test]
    fn test_session_name_format() {
        let dir = TempDir::new().unwrap();
        assert_eq!(spec(dir.path()).session_name(), "Tracker_2021_02_01_00_00_05");
    }

    #[test]
    fn test_writes_numbered_frames_and_manifest() {
        let dir = TempDir::new().unwrap();
        let mut factory = JpegSequenceSinkFactory::new(85);
        let mut sink = factory.create(&spec(dir.path())).unwrap();

        let frame = RgbImage::from_pixel(32, 24, Rgb([10, 200, 30]));
        for _ in 0..3 {
            sink.write_frame(&frame).unwrap();
        }
        sink.finish().unwrap();

        let session = dir.path().join("Tracker_2021_02_01_00_00_05");
        assert!(session.join("frame_000001.jpg").exists());
        assert!(session.join("frame_000003.jpg").exists());
        assert!(!session.join("frame_000004.jpg").exists());

        let decoded = image::open(session.join("frame_000002.jpg")).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 24));

        let manifest: SessionManifest =
            serde_json::from_reader(File::open(session.join(MANIFEST_FILE)).unwrap()).unwrap();
        assert_eq!(manifest.frames_written, 3);
        assert_eq!(manifest.frame_rate, 30);
        assert_eq!(manifest.name, "Tracker_2021_02_01_00_00_05");
        assert_eq!(manifest.started_at, "2021-02-01T00:00:05Z");
    }

    #[test]
    fn test_manifest_carries_session_id() {
        let dir = TempDir::new().unwrap();
        let spec = spec(dir.path());
        let mut sink = JpegSequenceSink::open(&spec, 90).unwrap();
        assert_eq!(sink.directory(), dir.path().join(spec.session_name()));
        assert_eq!(sink.id().started_at(), spec.started_at);

        sink.write_frame(&RgbImage::new(32, 24)).unwrap();
        sink.finish().unwrap();

        let manifest: SessionManifest = serde_json::from_reader(
            File::open(sink.directory().join(MANIFEST_FILE)).unwrap(),
        )
        .unwrap();
        assert_eq!(manifest.id, sink.id());
        assert_eq!(manifest.frames_written, 1);
        assert_eq!((manifest.width, manifest.height), (32, 24));
    }

    #[test]
    fn test_finish_is_idempotent_and_closes_sink() {
        let dir = TempDir::new().unwrap();
        let mut sink = JpegSequenceSinkFactory::new(85)
            .create(&spec(dir.path()))
            .unwrap();
        sink.finish().unwrap();
        sink.finish().unwrap();

        let frame = RgbImage::new(32, 24);
        assert!(matches!(sink.write_frame(&frame), Err(Error::SinkWrite(_))));
    }

    #[test]
    fn test_mismatched_frame_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut sink = JpegSequenceSinkFactory::new(85)
            .create(&spec(dir.path()))
            .unwrap();
        let err = sink.write_frame(&RgbImage::new(16, 16)).unwrap_err();
        assert!(matches!(err, Error::SinkWrite(_)));
        assert_eq!(sink.frames_written(), 0);
    }

    #[test]
    fn test_unavailable_storage() {
        let dir = TempDir::new().unwrap();
        // A regular file where the save directory should be
        let blocker = dir.path().join("not_a_dir");
        fs::write(&blocker, b"x").unwrap();

        let mut factory = JpegSequenceSinkFactory::new(85);
        let err = factory.create(&spec(&blocker)).err().unwrap();
        assert!(matches!(err, Error::ResourceUnavailable(_)));

        let err = factory.create(&spec(Path::new(""))).err().unwrap();
        assert!(matches!(err, Error::ResourceUnavailable(_)));
    }

    #[test]
    fn test_drop_writes_manifest() {
        let dir = TempDir::new().unwrap();
        {
            let _sink = JpegSequenceSinkFactory::new(85)
                .create(&spec(dir.path()))
                .unwrap();
        }
        assert!(dir
            .path()
            .join("Tracker_2021_02_01_00_00_05")
            .join(MANIFEST_FILE)
            .exists());
    }
}
