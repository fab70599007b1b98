//! ABOUTME: Frame analyzer tying shake detection, adaptive background subtraction and recording together
//! ABOUTME: One synchronous analyze() call per frame, all errors recovered internally

pub mod analyzer;
pub mod config;

pub use analyzer::{AnalysisResult, AnalyzerStats, FrameAnalyzer, SubtractorBuilder};
pub use config::{AnalyzerConfig, DetectorKind};
