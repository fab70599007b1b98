//! ABOUTME: Core error taxonomy, session ids, time helpers, and tracing setup
//! ABOUTME: Foundation crate used by all other motrack components

pub mod error;
pub mod id;
pub mod telemetry;
pub mod time;

pub use error::{Error, Result};
pub use id::SessionId;
pub use time::{session_stamp, to_rfc3339, utc_now, MonotonicTimer};
