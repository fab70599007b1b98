//! ABOUTME: Error taxonomy shared by the analysis pipeline and its collaborators
//! ABOUTME: Every variant is recoverable inside analyze(); none is fatal to the host

/// Core error type for motrack
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Frame cannot be analyzed (bad rotation, malformed buffer). The frame is skipped.
    #[error("Unsupported input: {0}")]
    UnsupportedInput(String),

    /// Storage missing or sink creation failed. Recording stays idle.
    #[error("Resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// A single frame could not be appended to an open sink.
    #[error("Sink write failed: {0}")]
    SinkWrite(String),

    /// Internal model state is inconsistent and must be rebuilt from scratch.
    #[error("Model error: {0}")]
    Model(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the analyzer should throw away all accumulated state after this error
    pub fn requires_reinitialization(&self) -> bool {
        matches!(self, Error::Model(_))
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
