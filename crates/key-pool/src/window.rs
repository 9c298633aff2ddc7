//! Bucketed request counter for one rate granularity
//!
//! Windows are aligned to multiples of their period since the unix epoch
//! (minute boundaries, UTC midnight). Reset is lazy: `roll(now)` is called
//! before every read and zeroes the count once `now` falls in a later bucket.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateWindow {
    period_millis: u64,
    limit: u32,
    start_millis: u64,
    count: u32,
}

impl RateWindow {
    /// Empty window containing `now`.
    pub fn new(period_millis: u64, limit: u32, now: u64) -> Self {
        Self {
            period_millis,
            limit,
            start_millis: bucket_start(now, period_millis),
            count: 0,
        }
    }

    /// Rebuild a window from persisted state. Counts above `limit` are clamped
    /// (the limit may have been lowered since the state was written), then the
    /// window is rolled forward to `now`.
    pub fn restore(period_millis: u64, limit: u32, start_millis: u64, count: u32, now: u64) -> Self {
        let mut window = Self {
            period_millis,
            limit,
            start_millis: bucket_start(start_millis, period_millis),
            count: count.min(limit),
        };
        window.roll(now);
        window
    }

    /// Move to the bucket containing `now`, zeroing the count if it changed.
    /// Returns true when a reset happened. A clock that steps backwards never
    /// rewinds the window.
    pub fn roll(&mut self, now: u64) -> bool {
        let bucket = bucket_start(now, self.period_millis);
        if bucket > self.start_millis {
            self.start_millis = bucket;
            self.count = 0;
            true
        } else {
            false
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.count < self.limit
    }

    /// Count one request. Refuses (returns false) at the cap.
    pub fn increment(&mut self) -> bool {
        if self.has_capacity() {
            self.count += 1;
            true
        } else {
            false
        }
    }

    /// Undo one provisional increment made in the window starting at
    /// `window_start`. No-op when that window has already been replaced.
    pub fn rollback(&mut self, window_start: u64) -> bool {
        if self.start_millis == window_start && self.count > 0 {
            self.count -= 1;
            true
        } else {
            false
        }
    }

    /// Mark the window full until its boundary.
    pub fn saturate(&mut self) {
        self.count = self.limit;
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.count)
    }

    pub fn start_millis(&self) -> u64 {
        self.start_millis
    }

    /// Unix-millisecond timestamp at which this window is replaced.
    pub fn resets_at(&self) -> u64 {
        self.start_millis + self.period_millis
    }
}

fn bucket_start(now: u64, period_millis: u64) -> u64 {
    now - now % period_millis
}
