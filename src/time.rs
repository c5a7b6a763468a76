//! The profiler's time base.
//!
//! All times in the profile are milliseconds relative to a single process-wide
//! reference instant, taken the first time anything in this crate asks for it.
//! The absolute "startTime" in the output document is reconstructed at emit
//! time as `now_wall - elapsed_since_reference`, so the reference never needs
//! to be convertible to wall-clock time itself.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;

static PROCESS_START: Lazy<Instant> = Lazy::new(Instant::now);

pub(crate) fn process_start() -> Instant {
    *PROCESS_START
}

/// Milliseconds since the process start reference.
pub fn profiler_time() -> f64 {
    ms_since_start(Instant::now())
}

pub(crate) fn ms_since_start(instant: Instant) -> f64 {
    instant
        .saturating_duration_since(*PROCESS_START)
        .as_secs_f64()
        * 1000.0
}

/// Wall-clock time of the process start reference, in milliseconds since the
/// Unix epoch.
pub(crate) fn wall_clock_start_ms() -> f64 {
    let now_wall = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
        * 1000.0;
    now_wall - profiler_time()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_is_monotonic_nonnegative() {
        let a = profiler_time();
        let b = profiler_time();
        assert!(a >= 0.0);
        assert!(b >= a);
    }

    #[test]
    fn wall_clock_start_is_in_the_past() {
        let start = wall_clock_start_ms();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs_f64()
            * 1000.0;
        assert!(start <= now);
    }
}
