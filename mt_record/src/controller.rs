//! ABOUTME: Idle/Recording hysteresis state machine driven once per analyzed frame
//! ABOUTME: Opens a sink after sustained detection, closes it after sustained absence

use crate::settings::{RecorderConfig, RecordingSettings};
use crate::sink::{FrameSink, SinkFactory, SinkSpec};
use image::{DynamicImage, GrayImage};
use mt_core::utc_now;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Observable controller state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingState {
    Idle,
    Recording,
}

/// Counters accumulated over the controller's lifetime
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecordingStats {
    pub sessions_started: u64,
    pub sessions_closed: u64,
    pub start_failures: u64,
    pub frames_written: u64,
    pub write_failures: u64,
}

struct ActiveSession {
    sink: Box<dyn FrameSink>,
    started_at_ms: u64,
}

/// Recording hysteresis controller
///
/// Timestamps are caller-supplied milliseconds on a monotonic clock.
/// A session starts once detection has persisted for the start delay and
/// stops once absence has persisted for the stop delay. Turning recording
/// off while a session is open stops it on the next update.
pub struct RecordingController {
    config: RecorderConfig,
    factory: Box<dyn SinkFactory>,
    session: Option<ActiveSession>,
    first_seen_at: Option<u64>,
    last_detected_at: Option<u64>,
    last_undetected_at: Option<u64>,
    last_update_at: Option<u64>,
    stats: RecordingStats,
}

impl RecordingController {
    pub fn new(config: RecorderConfig, factory: Box<dyn SinkFactory>) -> Self {
        Self {
            config,
            factory,
            session: None,
            first_seen_at: None,
            last_detected_at: None,
            last_undetected_at: None,
            last_update_at: None,
            stats: RecordingStats::default(),
        }
    }

    /// Advance the state machine by one frame and return whether a session is open
    pub fn update(
        &mut self,
        detected: bool,
        settings: &RecordingSettings,
        now_ms: u64,
        frame: &GrayImage,
    ) -> bool {
        self.advance(detected, settings, now_ms, Some(frame))
    }

    /// Advance for a frame that could not be analyzed. It counts as an absence
    /// toward the stop delay and is never written.
    pub fn mark_absent(&mut self, settings: &RecordingSettings, now_ms: u64) -> bool {
        self.advance(false, settings, now_ms, None)
    }

    fn advance(
        &mut self,
        detected: bool,
        settings: &RecordingSettings,
        now_ms: u64,
        frame: Option<&GrayImage>,
    ) -> bool {
        let first_seen = *self.first_seen_at.get_or_insert(now_ms);
        self.last_update_at = Some(now_ms);
        if detected {
            self.last_detected_at = Some(now_ms);
        } else {
            self.last_undetected_at = Some(now_ms);
        }

        if self.session.is_none() {
            if let (true, true, Some(frame)) = (settings.enable_recording, detected, frame) {
                let detected_for =
                    now_ms.saturating_sub(self.last_undetected_at.unwrap_or(first_seen));
                if detected_for >= settings.start_delay_ms() {
                    self.start(settings, now_ms, frame);
                }
            }
        } else if !settings.enable_recording {
            info!("Recording disabled, closing open session");
            self.stop(now_ms);
        } else if !detected {
            let absent_for = now_ms.saturating_sub(self.last_detected_at.unwrap_or(first_seen));
            if absent_for >= settings.stop_delay_ms() {
                self.stop(now_ms);
            }
        }

        if let (true, Some(frame)) = (detected, frame) {
            self.write(frame);
        }

        self.is_recording()
    }

    pub fn is_recording(&self) -> bool {
        self.session.is_some()
    }

    pub fn state(&self) -> RecordingState {
        if self.is_recording() {
            RecordingState::Recording
        } else {
            RecordingState::Idle
        }
    }

    pub fn stats(&self) -> &RecordingStats {
        &self.stats
    }

    /// Force the controller idle, closing any open session. Safe to call repeatedly.
    pub fn close(&mut self, now_ms: u64) {
        if self.session.is_some() {
            self.stop(now_ms);
        }
    }

    /// Forget detection history; an open session is closed first
    pub fn reset(&mut self, now_ms: u64) {
        self.close(now_ms);
        self.first_seen_at = None;
        self.last_detected_at = None;
        self.last_undetected_at = None;
    }

    fn start(&mut self, settings: &RecordingSettings, now_ms: u64, frame: &GrayImage) {
        let spec = SinkSpec {
            width: frame.width(),
            height: frame.height(),
            frame_rate: self.config.frame_rate,
            save_path: settings.save_path.clone(),
            started_at: utc_now(),
        };

        match self.factory.create(&spec) {
            Ok(sink) => {
                self.stats.sessions_started += 1;
                info!(
                    session = %spec.session_name(),
                    width = spec.width,
                    height = spec.height,
                    fps = spec.frame_rate,
                    "Recording started"
                );
                self.session = Some(ActiveSession {
                    sink,
                    started_at_ms: now_ms,
                });
            }
            Err(e) => {
                self.stats.start_failures += 1;
                warn!("Recording start aborted, staying idle: {}", e);
            }
        }
    }

    fn stop(&mut self, now_ms: u64) {
        let Some(mut session) = self.session.take() else {
            return;
        };

        if let Err(e) = session.sink.finish() {
            warn!("Failed to finalize recording session: {}", e);
        }
        self.stats.sessions_closed += 1;
        info!(
            frames = session.sink.frames_written(),
            duration_ms = now_ms.saturating_sub(session.started_at_ms),
            "Recording stopped"
        );
    }

    fn write(&mut self, frame: &GrayImage) {
        let Some(session) = self.session.as_mut() else {
            return;
        };

        let rgb = DynamicImage::ImageLuma8(frame.clone()).to_rgb8();
        match session.sink.write_frame(&rgb) {
            Ok(()) => self.stats.frames_written += 1,
            Err(e) => {
                self.stats.write_failures += 1;
                debug!("Dropped frame from recording: {}", e);
            }
        }
    }
}

impl Drop for RecordingController {
    fn drop(&mut self) {
        let now_ms = self.last_update_at.unwrap_or_default();
        self.close(now_ms);
    }
}
