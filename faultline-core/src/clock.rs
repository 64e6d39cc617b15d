//! Relative monotonic time for history records.

use std::time::Instant;

/// The time origin of a run. All op times are nanoseconds since this origin,
/// threaded explicitly through the scheduler instead of living in global
/// state.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin: Instant,
}

impl Clock {
    pub fn start() -> Self {
        Clock {
            origin: Instant::now(),
        }
    }

    /// Nanoseconds elapsed since the origin. Saturates at `i64::MAX`, which
    /// is roughly 292 years of test run.
    pub fn now_nanos(&self) -> i64 {
        let nanos = self.origin.elapsed().as_nanos();
        i64::try_from(nanos).unwrap_or(i64::MAX)
    }
}

/// Nanoseconds in one second, the unit conversions below hinge on.
pub const NANOS_PER_SECOND: i64 = 1_000_000_000;

/// Converts a duration in (possibly fractional) seconds to nanoseconds.
pub fn secs_to_nanos(seconds: f64) -> i64 {
    (seconds * NANOS_PER_SECOND as f64) as i64
}
