//! ABOUTME: Tracing subscriber setup for the tracker binary and tests
//! ABOUTME: Picks pretty or JSON output from the deployment environment, always on stderr

use std::sync::Once;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Filter used when `RUST_LOG` is unset or invalid
pub const DEFAULT_FILTER: &str = "info";

/// Output encoding for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    /// JSON in production, human-readable everywhere else
    pub fn for_environment(env: &str) -> Self {
        if env.eq_ignore_ascii_case("production") {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        }
    }
}

/// Initialize tracing - safe to call multiple times
///
/// Frame results are written to stdout, so log output goes to stderr.
pub fn init_tracing(env: &str, service: &str) {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
        let format = LogFormat::for_environment(env);

        let registry = tracing_subscriber::registry().with(filter);
        match format {
            LogFormat::Json => registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(std::io::stderr),
                )
                .init(),
            LogFormat::Pretty => registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .pretty()
                        .with_writer(std::io::stderr),
                )
                .init(),
        }

        tracing::info!(service = %service, environment = %env, ?format, "Tracing initialized");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_follows_environment() {
        assert_eq!(LogFormat::for_environment("production"), LogFormat::Json);
        assert_eq!(LogFormat::for_environment("PRODUCTION"), LogFormat::Json);
        assert_eq!(LogFormat::for_environment("development"), LogFormat::Pretty);
        assert_eq!(LogFormat::for_environment(""), LogFormat::Pretty);
    }

    #[test]
    fn test_init_tracing_idempotent() {
        init_tracing("test", "motrack-test");
        init_tracing("test", "motrack-test");
    }
}
