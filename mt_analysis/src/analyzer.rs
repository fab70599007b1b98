//! ABOUTME: The per-frame analyze() pipeline and its recovery policy
//! ABOUTME: Owns all mutable tracking state; never returns an error to the caller

use crate::config::{AnalyzerConfig, DetectorKind};
use mt_core::{Error, MonotonicTimer, Result};
use mt_record::{RecordingController, RecordingSettings, RecordingStats, SinkFactory};
use mt_vision::image::GrayImage;
use mt_vision::{
    downscale, luminance_std_dev, normalize, AdaptiveParameters, BackgroundSubtractor,
    ContourSelector, DenseFlowDetector, ParameterAdapter, RawFrame, ResolvedParameters,
    ShakeVerdict, StabilizationDetector, StabilizationReport, TrackedPoint,
};
use serde::Serialize;
use tracing::{debug, error, info, warn};

/// Builds a background subtractor for the given history and variance threshold
pub type SubtractorBuilder = Box<dyn Fn(u32, f64) -> Box<dyn BackgroundSubtractor> + Send>;

/// Outcome of analyzing one frame
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisResult {
    pub sequence_index: u64,
    /// Tracked object centroid in analysis coordinates
    pub point: Option<TrackedPoint>,
    pub analysis_width: u32,
    pub analysis_height: u32,
    pub is_recording: bool,
    pub enable_recording: bool,
    pub verdict: ShakeVerdict,
    /// Adaptive parameters in force for this frame, background subtraction only
    pub parameters: Option<AdaptiveParameters>,
    /// The background model was rebuilt before this frame
    pub reinitialized: bool,
    /// The frame could not be analyzed and was dropped
    pub skipped: bool,
    pub processing_time_ms: u64,
}

impl AnalysisResult {
    pub fn detected(&self) -> bool {
        self.point.is_some()
    }
}

/// Running counters for one analyzer
#[derive(Debug, Clone, Default, Serialize)]
pub struct AnalyzerStats {
    pub frames_analyzed: u64,
    pub frames_skipped: u64,
    pub detections: u64,
    pub shake_suppressed: u64,
    pub model_resets: u64,
    pub model_failures: u64,
    pub recording: RecordingStats,
}

enum Detector {
    Background {
        build: SubtractorBuilder,
        model: Option<Box<dyn BackgroundSubtractor>>,
    },
    DenseFlow(DenseFlowDetector),
}

impl Detector {
    fn name(&self) -> &'static str {
        match self {
            Detector::Background { .. } => "background subtraction",
            Detector::DenseFlow(_) => "dense flow",
        }
    }
}

struct Detection {
    point: Option<TrackedPoint>,
    reinitialized: bool,
    parameters: Option<AdaptiveParameters>,
}

/// Motion tracker state for one camera stream
///
/// Calls to [`FrameAnalyzer::analyze`] must be strictly sequential.
pub struct FrameAnalyzer {
    config: AnalyzerConfig,
    stabilizer: StabilizationDetector,
    adapter: ParameterAdapter,
    detector: Detector,
    selector: ContourSelector,
    recorder: RecordingController,
    stats: AnalyzerStats,
    last_timestamp_ms: u64,
    shut_down: bool,
}

impl FrameAnalyzer {
    /// Analyzer using the configured detector and vision backend
    pub fn new(config: AnalyzerConfig, sink_factory: Box<dyn SinkFactory>) -> Self {
        let backend = config.backend.resolve();
        let detector = match config.detector {
            DetectorKind::BackgroundSubtraction => {
                let background = config.background.clone();
                let build: SubtractorBuilder = Box::new(move |history, var_threshold| {
                    backend.background_subtractor(&background, history, var_threshold)
                });
                Detector::Background { build, model: None }
            }
            DetectorKind::DenseFlow => Detector::DenseFlow(DenseFlowDetector::with_estimator(
                config.dense_flow.clone(),
                backend.dense_estimator(&config.dense_flow),
            )),
        };
        let stabilizer = StabilizationDetector::with_tracker(
            config.stabilization.clone(),
            backend.sparse_tracker(&config.stabilization),
        );
        Self::assemble(config, sink_factory, stabilizer, detector)
    }

    /// Background-subtraction analyzer with a custom subtractor; `config.detector` is ignored
    pub fn with_subtractor(
        config: AnalyzerConfig,
        sink_factory: Box<dyn SinkFactory>,
        build_subtractor: SubtractorBuilder,
    ) -> Self {
        let stabilizer = StabilizationDetector::new(config.stabilization.clone());
        let detector = Detector::Background {
            build: build_subtractor,
            model: None,
        };
        Self::assemble(config, sink_factory, stabilizer, detector)
    }

    fn assemble(
        config: AnalyzerConfig,
        sink_factory: Box<dyn SinkFactory>,
        stabilizer: StabilizationDetector,
        detector: Detector,
    ) -> Self {
        info!(
            "Creating frame analyzer: detector={}, downscale={}, max={}x{}, shake={:.1}px, stable={:.1}px",
            detector.name(),
            config.processing.downscale_factor,
            config.processing.max_width,
            config.processing.max_height,
            config.stabilization.shake_threshold,
            config.stabilization.stable_threshold
        );

        Self {
            stabilizer,
            adapter: ParameterAdapter::new(config.adaptation.clone()),
            recorder: RecordingController::new(config.recorder.clone(), sink_factory),
            detector,
            selector: ContourSelector::new(),
            stats: AnalyzerStats::default(),
            last_timestamp_ms: 0,
            shut_down: false,
            config,
        }
    }

    /// Analyze one frame. Never fails: degraded outcomes are `None`/`false` fields.
    pub fn analyze(&mut self, frame: &RawFrame, settings: &RecordingSettings) -> AnalysisResult {
        let timer = MonotonicTimer::new();
        self.last_timestamp_ms = frame.timestamp_ms;

        let mut result = match self.run(frame, settings) {
            Ok(result) => {
                self.stats.frames_analyzed += 1;
                if result.detected() {
                    self.stats.detections += 1;
                }
                result
            }
            Err(e) => self.recover(e, frame, settings),
        };

        result.processing_time_ms = timer.elapsed_ms();
        debug!(
            "Frame {}: point={:?}, verdict={:?}, recording={}, {}ms",
            frame.sequence_index,
            result.point,
            result.verdict,
            result.is_recording,
            result.processing_time_ms
        );
        result
    }

    fn run(&mut self, frame: &RawFrame, settings: &RecordingSettings) -> Result<AnalysisResult> {
        let upright = normalize(frame)?;
        let analysis = downscale(&upright, &self.config.processing);
        let (analysis_width, analysis_height) = analysis.dimensions();

        let report = self.stabilizer.observe(&analysis);
        let detection = match self.detector {
            Detector::Background { .. } => self.detect_background(&analysis, &report)?,
            Detector::DenseFlow(_) => self.detect_dense_flow(&analysis, &report)?,
        };

        let detected = detection.point.is_some();
        let is_recording = self
            .recorder
            .update(detected, settings, frame.timestamp_ms, &upright);

        Ok(AnalysisResult {
            sequence_index: frame.sequence_index,
            point: detection.point,
            analysis_width,
            analysis_height,
            is_recording,
            enable_recording: settings.enable_recording,
            verdict: report.verdict,
            parameters: detection.parameters,
            reinitialized: detection.reinitialized,
            skipped: false,
            processing_time_ms: 0,
        })
    }

    fn detect_background(
        &mut self,
        analysis: &GrayImage,
        report: &StabilizationReport,
    ) -> Result<Detection> {
        self.adapter.apply_verdict(report.verdict);
        self.adapter.apply_contrast(luminance_std_dev(analysis));
        // needs_reset is measured against the parameters the model was last
        // built with, so drift below the epsilon accumulates until it crosses it
        let resolved = self.adapter.resolve();

        let reinitialized = self.prepare_model(&resolved);
        let Detector::Background {
            model: Some(model), ..
        } = &mut self.detector
        else {
            return Err(Error::Model(
                "background model missing after preparation".into(),
            ));
        };
        let mask = model.apply(analysis)?;

        let point = if model.is_warming_up() {
            debug!("Background model warming up, no detection");
            None
        } else if report.verdict == ShakeVerdict::Shaking {
            self.stats.shake_suppressed += 1;
            debug!(
                "Camera shaking (mean displacement {:.2}), detection suppressed",
                report.mean_displacement.unwrap_or_default()
            );
            None
        } else {
            self.selector
                .select(&mask, resolved.params.min_contour_area())
                .point
        };

        self.adapter.end_frame(point.is_some());
        Ok(Detection {
            point,
            reinitialized,
            parameters: Some(resolved.params),
        })
    }

    fn detect_dense_flow(
        &mut self,
        analysis: &GrayImage,
        report: &StabilizationReport,
    ) -> Result<Detection> {
        let Detector::DenseFlow(detector) = &mut self.detector else {
            return Err(Error::Model("dense flow detector missing".into()));
        };

        let point = match detector.detect(analysis)? {
            None => None,
            Some(_) if report.verdict == ShakeVerdict::Shaking => {
                self.stats.shake_suppressed += 1;
                debug!(
                    "Camera shaking (mean displacement {:.2}), detection suppressed",
                    report.mean_displacement.unwrap_or_default()
                );
                None
            }
            Some(selection) => selection.point,
        };

        Ok(Detection {
            point,
            reinitialized: false,
            parameters: None,
        })
    }

    /// Create the model on first use, rebuild it when parameters moved.
    /// Returns whether an existing model was rebuilt.
    fn prepare_model(&mut self, resolved: &ResolvedParameters) -> bool {
        let Detector::Background { build, model } = &mut self.detector else {
            return false;
        };
        let history = resolved.params.history();
        let var_threshold = resolved.params.var_threshold();

        match model.as_mut() {
            None => {
                let built = build(history, var_threshold);
                debug!(
                    "Built {} background model: history={}, var_threshold={:.2}",
                    built.algorithm_name(),
                    history,
                    var_threshold
                );
                *model = Some(built);
                false
            }
            Some(existing) if resolved.needs_reset => {
                existing.reset(history, var_threshold);
                self.stats.model_resets += 1;
                true
            }
            Some(_) => false,
        }
    }

    fn recover(
        &mut self,
        err: Error,
        frame: &RawFrame,
        settings: &RecordingSettings,
    ) -> AnalysisResult {
        self.stats.frames_skipped += 1;

        let (reinitialized, is_recording) = if err.requires_reinitialization() {
            error!(
                "Analysis state corrupted on frame {}, reinitializing: {}",
                frame.sequence_index, err
            );
            self.stats.model_failures += 1;
            self.reinitialize(frame.timestamp_ms);
            (true, false)
        } else {
            warn!("Skipping frame {}: {}", frame.sequence_index, err);
            // A dropped frame is an absence, so a run of them still ends a recording
            let is_recording = self.recorder.mark_absent(settings, frame.timestamp_ms);
            (false, is_recording)
        };

        AnalysisResult {
            sequence_index: frame.sequence_index,
            point: None,
            analysis_width: 0,
            analysis_height: 0,
            is_recording,
            enable_recording: settings.enable_recording,
            verdict: ShakeVerdict::Neutral,
            parameters: None,
            reinitialized,
            skipped: true,
            processing_time_ms: 0,
        }
    }

    /// Drop all accumulated state, closing any open recording
    fn reinitialize(&mut self, now_ms: u64) {
        self.stabilizer.reset();
        self.adapter.reset();
        match &mut self.detector {
            Detector::Background { model, .. } => *model = None,
            Detector::DenseFlow(detector) => detector.reset(),
        }
        self.recorder.reset(now_ms);
    }

    pub fn stats(&self) -> AnalyzerStats {
        AnalyzerStats {
            recording: self.recorder.stats().clone(),
            ..self.stats.clone()
        }
    }

    pub fn is_recording(&self) -> bool {
        self.recorder.is_recording()
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    /// Close any open recording and log final counters. Safe to call repeatedly.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.recorder.close(self.last_timestamp_ms);

        let stats = self.stats();
        info!(
            frames_analyzed = stats.frames_analyzed,
            frames_skipped = stats.frames_skipped,
            detections = stats.detections,
            shake_suppressed = stats.shake_suppressed,
            model_resets = stats.model_resets,
            recordings = stats.recording.sessions_started,
            "Frame analyzer shut down"
        );
    }
}

impl Drop for FrameAnalyzer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
