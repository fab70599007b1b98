//! ABOUTME: Async driver around the synchronous analyzer
//! ABOUTME: Paced producer, keep-only-latest hand-off, blocking analysis, JSON-lines output

use crate::source::FrameSource;
use mt_analysis::FrameAnalyzer;
use mt_config::Config;
use mt_core::{Error, MonotonicTimer, Result};
use mt_record::{JpegSequenceSinkFactory, RecordingSettings};
use mt_vision::RawFrame;
use serde::Serialize;
use std::future::Future;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Totals reported when a run ends
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub frames_produced: u64,
    pub frames_analyzed: u64,
    /// Frames replaced by a newer one before analysis picked them up
    pub frames_dropped: u64,
    pub detections: u64,
    pub recordings_started: u64,
}

/// Analyze every frame `source` yields until it is exhausted or `shutdown` resolves
pub async fn run<W, S>(
    config: &Config,
    settings: RecordingSettings,
    source: Box<dyn FrameSource>,
    mut out: W,
    shutdown: S,
) -> Result<RunSummary>
where
    W: Write + Send + 'static,
    S: Future<Output = ()>,
{
    info!(
        "Starting analysis of {} at {} fps (recording {})",
        source.describe(),
        config.capture.fps,
        if settings.enable_recording { "enabled" } else { "disabled" }
    );

    let (tx, mut rx) = watch::channel::<Option<RawFrame>>(None);
    let produced = Arc::new(AtomicU64::new(0));
    let producer = tokio::spawn(produce(
        source,
        tx,
        config.capture.fps,
        config.capture.rotation_degrees,
        produced.clone(),
    ));

    let factory = JpegSequenceSinkFactory::new(config.recorder.jpeg_quality);
    let mut analyzer = FrameAnalyzer::new(config.analyzer_config(), Box::new(factory));
    let mut analyzed = 0u64;

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    debug!("Frame source finished");
                    break;
                }
            }
            _ = &mut shutdown => {
                info!("Shutdown requested, stopping analysis");
                break;
            }
        }

        let Some(frame) = rx.borrow_and_update().clone() else {
            continue;
        };

        let frame_settings = settings.clone();
        let (returned, result) = tokio::task::spawn_blocking(move || {
            let result = analyzer.analyze(&frame, &frame_settings);
            (analyzer, result)
        })
        .await
        .map_err(|e| Error::Model(format!("Analysis task failed: {}", e)))?;
        analyzer = returned;
        analyzed += 1;

        serde_json::to_writer(&mut out, &result)
            .map_err(|e| Error::Validation(format!("Failed to encode result: {}", e)))?;
        out.write_all(b"\n")?;
    }

    producer.abort();
    out.flush()?;
    analyzer.shutdown();

    let stats = analyzer.stats();
    let frames_produced = produced.load(Ordering::SeqCst);
    let summary = RunSummary {
        frames_produced,
        frames_analyzed: analyzed,
        frames_dropped: frames_produced.saturating_sub(analyzed),
        detections: stats.detections,
        recordings_started: stats.recording.sessions_started,
    };

    info!(
        produced = summary.frames_produced,
        analyzed = summary.frames_analyzed,
        dropped = summary.frames_dropped,
        detections = summary.detections,
        recordings = summary.recordings_started,
        "Analysis finished"
    );
    Ok(summary)
}

/// Pace `source` at `fps`, always overwriting the pending frame
async fn produce(
    mut source: Box<dyn FrameSource>,
    tx: watch::Sender<Option<RawFrame>>,
    fps: u32,
    rotation_degrees: i32,
    produced: Arc<AtomicU64>,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs_f64(1.0 / fps.max(1) as f64));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let clock = MonotonicTimer::new();
    let mut index = 0u64;

    loop {
        ticker.tick().await;
        match source.next_frame() {
            Ok(Some(image)) => {
                let mut frame = RawFrame::from_image(image, index, clock.elapsed_ms());
                frame.rotation_degrees = rotation_degrees;
                index += 1;
                produced.fetch_add(1, Ordering::SeqCst);
                if tx.send(Some(frame)).is_err() {
                    debug!("Analysis loop gone, stopping producer");
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => warn!("Skipping unreadable frame: {}", e),
        }
    }
}
