//! Daily quiet hours during which no request is dispatched

use crate::clock::DAY_MILLIS;
use crate::error::{Error, Result};

const HOUR_MILLIS: u64 = 3_600_000;

/// A UTC hour range `[start_hour, end_hour)`. A range with `start_hour >
/// end_hour` wraps past midnight, so 22..6 covers the night.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuietHours {
    start_hour: u8,
    end_hour: u8,
}

impl QuietHours {
    pub fn new(start_hour: u8, end_hour: u8) -> Result<Self> {
        if start_hour > 23 || end_hour > 23 {
            return Err(Error::Config(format!(
                "quiet hours {start_hour}..{end_hour} must be within 0..23"
            )));
        }
        if start_hour == end_hour {
            return Err(Error::Config(format!(
                "quiet hours start and end are both {start_hour}"
            )));
        }
        Ok(Self {
            start_hour,
            end_hour,
        })
    }

    pub fn start_hour(&self) -> u8 {
        self.start_hour
    }

    pub fn end_hour(&self) -> u8 {
        self.end_hour
    }

    fn contains_hour(&self, hour: u8) -> bool {
        if self.start_hour < self.end_hour {
            (self.start_hour..self.end_hour).contains(&hour)
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }

    /// When `now` falls inside the quiet range, the unix-millisecond time it ends.
    pub fn window_end(&self, now: u64) -> Option<u64> {
        let day_start = now - now % DAY_MILLIS;
        let hour = ((now - day_start) / HOUR_MILLIS) as u8;
        if !self.contains_hour(hour) {
            return None;
        }
        let end = day_start + u64::from(self.end_hour) * HOUR_MILLIS;
        Some(if end > now { end } else { end + DAY_MILLIS })
    }
}
