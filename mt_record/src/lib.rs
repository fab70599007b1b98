//! ABOUTME: Recording hysteresis controller and frame sinks for detected motion
//! ABOUTME: Sessions open after sustained detection and close after sustained absence

pub mod controller;
pub mod settings;
pub mod sink;

pub use controller::{RecordingController, RecordingState, RecordingStats};
pub use settings::{RecorderConfig, RecordingSettings};
pub use sink::{
    FrameSink, JpegSequenceSink, JpegSequenceSinkFactory, SessionManifest, SinkFactory, SinkSpec,
    MANIFEST_FILE,
};
