// ABOUTME: Wall-clock formatting for recording sessions and a monotonic frame clock.
// ABOUTME: Session folders use an underscore stamp, manifests use RFC3339.
use ::time::{format_description::well_known::Rfc3339, macros::format_description, OffsetDateTime};
use std::time::{Duration, Instant, SystemTime};

/// Wall-clock time used to name and stamp recording sessions
pub fn utc_now() -> SystemTime {
    SystemTime::now()
}

/// RFC3339 rendering for session manifests
///
/// # Examples
///
/// ```
/// use mt_core::to_rfc3339;
/// use std::time::{Duration, UNIX_EPOCH};
///
/// let started = UNIX_EPOCH + Duration::from_secs(1_609_459_200 + 61);
/// assert_eq!(to_rfc3339(started), "2021-01-01T00:01:01Z");
/// ```
pub fn to_rfc3339(time: SystemTime) -> String {
    OffsetDateTime::from(time)
        .format(&Rfc3339)
        .unwrap_or_default()
}

/// `YYYY_MM_DD_HH_MM_SS` stamp used in recording folder names
///
/// # Examples
///
/// ```
/// use mt_core::session_stamp;
/// use std::time::{Duration, UNIX_EPOCH};
///
/// let time = UNIX_EPOCH + Duration::from_secs(1_609_459_200 + 3_723);
/// assert_eq!(session_stamp(time), "2021_01_01_01_02_03");
/// ```
pub fn session_stamp(time: SystemTime) -> String {
    let format = format_description!("[year]_[month]_[day]_[hour]_[minute]_[second]");
    OffsetDateTime::from(time)
        .format(&format)
        .unwrap_or_default()
}

/// Monotonic clock for frame timestamps and per-frame processing time
#[derive(Debug, Clone, Copy)]
pub struct MonotonicTimer {
    origin: Instant,
}

impl MonotonicTimer {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.origin.elapsed()
    }

    /// Whole milliseconds since the timer was created
    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

impl Default for MonotonicTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::UNIX_EPOCH;

    #[test]
    fn test_to_rfc3339_whole_seconds() {
        let time = UNIX_EPOCH + Duration::from_secs(1_609_459_200);
        assert_eq!(to_rfc3339(time), "2021-01-01T00:00:00Z");
    }

    #[test]
    fn test_session_stamp_is_zero_padded() {
        let time = UNIX_EPOCH + Duration::from_secs(1_612_137_600 + 5); // 2021-02-01 00:00:05
        assert_eq!(session_stamp(time), "2021_02_01_00_00_05");
    }

    #[test]
    fn test_elapsed_ms_is_monotonic() {
        let timer = MonotonicTimer::new();
        let first = timer.elapsed_ms();
        thread::sleep(Duration::from_millis(3));
        let second = timer.elapsed_ms();
        assert!(second >= first + 2);
        assert!(timer.elapsed() >= Duration::from_millis(3));
    }
}
