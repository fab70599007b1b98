//! ABOUTME: Runtime choice between native and OpenCV implementations of the vision seams
//! ABOUTME: OpenCV requires the heavy_opencv feature; without it requests fall back to native

use crate::background::{BackgroundConfig, BackgroundSubtractor, MixtureBackgroundModel};
use crate::dense_flow::{DenseFlowConfig, DenseFlowEstimator, GridFlowEstimator};
use crate::flow::SparseFlowTracker;
use crate::stabilization::StabilizationConfig;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Which implementation backs background subtraction and optical flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisionBackend {
    /// Pure-Rust implementations
    #[default]
    Native,
    /// OpenCV MOG2, pyramidal LK and Farneback (requires heavy_opencv feature)
    Opencv,
}

impl VisionBackend {
    /// Whether this build can run the backend
    pub fn is_available(self) -> bool {
        match self {
            Self::Native => true,
            Self::Opencv => cfg!(feature = "heavy_opencv"),
        }
    }

    /// The backend that will actually run, warning when a request cannot be honoured
    pub fn resolve(self) -> Self {
        if self.is_available() {
            info!("Using {:?} vision backend", self);
            self
        } else {
            warn!("OpenCV backend requested but heavy_opencv feature not enabled, falling back to native");
            Self::Native
        }
    }

    pub fn background_subtractor(
        self,
        config: &BackgroundConfig,
        history: u32,
        var_threshold: f64,
    ) -> Box<dyn BackgroundSubtractor> {
        #[cfg(feature = "heavy_opencv")]
        if self == Self::Opencv {
            match crate::opencv_backend::OpenCvMog2::new(config.clone(), history, var_threshold) {
                Ok(model) => return Box::new(model),
                Err(e) => warn!("OpenCV MOG2 unavailable, using native model: {}", e),
            }
        }

        Box::new(MixtureBackgroundModel::new(
            config.clone(),
            history,
            var_threshold,
        ))
    }

    pub fn sparse_tracker(self, config: &StabilizationConfig) -> Box<dyn SparseFlowTracker> {
        #[cfg(feature = "heavy_opencv")]
        if self == Self::Opencv {
            return Box::new(crate::opencv_backend::OpenCvLucasKanade::new(config));
        }

        Box::new(config.native_tracker())
    }

    pub fn dense_estimator(self, config: &DenseFlowConfig) -> Box<dyn DenseFlowEstimator> {
        #[cfg(feature = "heavy_opencv")]
        if self == Self::Opencv {
            return Box::new(crate::opencv_backend::OpenCvFarneback);
        }

        Box::new(GridFlowEstimator::new(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_backend() {
        let backend = VisionBackend::default();
        assert_eq!(backend, VisionBackend::Native);
        assert!(backend.is_available());
        assert_eq!(backend.resolve(), VisionBackend::Native);

        let model = backend.background_subtractor(&BackgroundConfig::default(), 500, 16.0);
        assert_eq!(model.algorithm_name(), "MOG2");
        let tracker = backend.sparse_tracker(&StabilizationConfig::default());
        assert_eq!(tracker.name(), "PyramidalLK");
        let dense = backend.dense_estimator(&DenseFlowConfig::default());
        assert_eq!(dense.name(), "GridLK");
    }

    #[test]
    fn test_backend_names_deserialize() {
        let backend: VisionBackend = serde_json::from_str("\"opencv\"").unwrap();
        assert_eq!(backend, VisionBackend::Opencv);
        assert_eq!(
            serde_json::to_string(&VisionBackend::Native).unwrap(),
            "\"native\""
        );
    }

    #[cfg(feature = "heavy_opencv")]
    #[test]
    fn test_opencv_backend_selected() {
        let backend = VisionBackend::Opencv;
        assert!(backend.is_available());
        assert_eq!(backend.resolve(), VisionBackend::Opencv);

        let model = backend.background_subtractor(&BackgroundConfig::default(), 500, 16.0);
        assert_eq!(model.algorithm_name(), "OpenCvMOG2");
        let tracker = backend.sparse_tracker(&StabilizationConfig::default());
        assert_eq!(tracker.name(), "OpenCvPyrLK");
        let dense = backend.dense_estimator(&DenseFlowConfig::default());
        assert_eq!(dense.name(), "OpenCvFarneback");
    }
}
