//! ABOUTME: End-to-end recording sessions against the filesystem JPEG sink
//! ABOUTME: Checks session directories, frame counts and manifests produced by the controller

use image::{GrayImage, Luma};
use mt_record::{
    JpegSequenceSinkFactory, RecorderConfig, RecordingController, RecordingSettings,
    SessionManifest, MANIFEST_FILE,
};
use std::fs;
use tempfile::TempDir;

fn settings(dir: &TempDir) -> RecordingSettings {
    RecordingSettings {
        enable_recording: true,
        start_delay_seconds: 2,
        stop_delay_seconds: 2,
        save_path: dir.path().to_path_buf(),
    }
}

#[test]
fn test_session_is_written_to_disk() {
    let dir = TempDir::new().unwrap();
    let settings = settings(&dir);
    let mut controller = RecordingController::new(
        RecorderConfig::default(),
        Box::new(JpegSequenceSinkFactory::new(80)),
    );
    let frame = GrayImage::from_pixel(40, 30, Luma([128]));

    // 30 fps: detection for 3 s, then absence for 3 s
    let mut t = 0u64;
    while t <= 3000 {
        controller.update(true, &settings, t, &frame);
        t += 33;
    }
    assert!(controller.is_recording());
    while t <= 6000 {
        controller.update(false, &settings, t, &frame);
        t += 33;
    }
    assert!(!controller.is_recording());

    let sessions: Vec<_> = fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(sessions.len(), 1);
    let name = sessions[0].file_name().unwrap().to_string_lossy().to_string();
    assert!(name.starts_with("Tracker_"));

    let manifest: SessionManifest =
        serde_json::from_str(&fs::read_to_string(sessions[0].join(MANIFEST_FILE)).unwrap())
            .unwrap();
    assert_eq!((manifest.width, manifest.height), (40, 30));
    assert_eq!(manifest.frames_written, controller.stats().frames_written);
    assert!(manifest.frames_written > 0);

    let jpegs = fs::read_dir(&sessions[0])
        .unwrap()
        .filter(|e| {
            e.as_ref()
                .map(|e| e.path().extension().is_some_and(|x| x == "jpg"))
                .unwrap_or(false)
        })
        .count() as u64;
    assert_eq!(jpegs, manifest.frames_written);
}

#[test]
fn test_missing_storage_keeps_controller_idle() {
    let dir = TempDir::new().unwrap();
    let blocker = dir.path().join("file");
    fs::write(&blocker, b"not a directory").unwrap();

    let settings = RecordingSettings {
        save_path: blocker,
        ..settings(&dir)
    };
    let mut controller = RecordingController::new(
        RecorderConfig::default(),
        Box::new(JpegSequenceSinkFactory::new(80)),
    );
    let frame = GrayImage::new(8, 8);

    for t in (0..5000).step_by(100) {
        assert!(!controller.update(true, &settings, t, &frame));
    }
    assert_eq!(controller.stats().sessions_started, 0);
}
