//! Percent-aware stall policy.
//!
//! Encoders go quiet while they flush buffers and write the container
//! trailer, so the allowed silence grows as a job approaches 100%. Both the
//! server watchdog and the polling client call [`is_stuck`]; neither side
//! may carry its own copy of the thresholds.

use std::time::Duration;

const MINUTE: u64 = 60;

/// Maximum time a job may sit at `percent` without advancing.
pub fn stall_threshold(percent: u8) -> Duration {
    let minutes = match percent {
        0..50 => 3,
        50..70 => 4,
        70..90 => 5,
        _ => 10,
    };
    Duration::from_secs(minutes * MINUTE)
}

/// A job is stuck once it has been silent strictly longer than its threshold.
pub fn is_stuck(percent: u8, since_last_advance: Duration) -> bool {
    since_last_advance > stall_threshold(percent)
}

/// Tracks percent observations over time and reports when they freeze.
///
/// Time is passed in explicitly so callers can drive it from `Instant`,
/// wall-clock timestamps or tests alike.
#[derive(Debug, Clone, Default)]
pub struct StallTracker {
    last: Option<(u8, Duration)>,
}

impl StallTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a percent reading taken at offset `at` from an arbitrary epoch.
    /// Only an advance resets the clock; repeats and regressions do not.
    pub fn observe(&mut self, percent: u8, at: Duration) {
        match self.last {
            Some((prev, _)) if percent <= prev => {}
            _ => self.last = Some((percent, at)),
        }
    }

    pub fn is_stuck(&self, now: Duration) -> bool {
        self.last
            .is_some_and(|(percent, since)| is_stuck(percent, now.saturating_sub(since)))
    }

    pub fn percent(&self) -> Option<u8> {
        self.last.map(|(p, _)| p)
    }
}
