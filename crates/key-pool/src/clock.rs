//! Time source for rate windows and waits
//!
//! Wall-clock milliseconds are derived from a fixed anchor plus tokio's
//! monotonic elapsed time, so window arithmetic and `sleep_until` agree and
//! tests can drive both with tokio's paused clock.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

/// Length of the per-minute rate window.
pub const MINUTE_MILLIS: u64 = 60_000;

/// Length of the per-day rate window.
pub const DAY_MILLIS: u64 = 86_400_000;

#[derive(Debug, Clone, Copy)]
pub struct Clock {
    anchor_millis: u64,
    anchor: Instant,
}

impl Clock {
    /// Clock anchored at the current system time.
    pub fn system() -> Self {
        let anchor_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self::starting_at(anchor_millis)
    }

    /// Clock whose `now_millis()` reads `millis` at construction time.
    pub fn starting_at(millis: u64) -> Self {
        Self {
            anchor_millis: millis,
            anchor: Instant::now(),
        }
    }

    /// Current time as unix milliseconds.
    pub fn now_millis(&self) -> u64 {
        self.anchor_millis + self.anchor.elapsed().as_millis() as u64
    }

    /// Monotonic instant corresponding to the unix-millisecond timestamp `millis`.
    /// Timestamps before the anchor map to the anchor.
    pub fn instant_at(&self, millis: u64) -> Instant {
        self.anchor + Duration::from_millis(millis.saturating_sub(self.anchor_millis))
    }
}
