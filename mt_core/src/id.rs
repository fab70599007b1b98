use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;

/// Recording session identifier, a ULID whose timestamp is the session start
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(ulid::Ulid);

impl SessionId {
    /// Identifier for a session starting at `started_at`
    pub fn starting_at(started_at: SystemTime) -> Self {
        Self(ulid::Ulid::from_datetime(started_at))
    }

    /// Start time encoded in the identifier, millisecond precision
    pub fn started_at(&self) -> SystemTime {
        self.0.datetime()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SessionId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}
