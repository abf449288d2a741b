//! Fixed window counter records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Time unit for rate limit windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeWindow {
    /// Per-second rate limiting
    Second,
    /// Per-minute rate limiting
    Minute,
    /// Per-hour rate limiting
    Hour,
    /// Per-day rate limiting
    Day,
}

impl TimeWindow {
    /// Get the duration of this time window.
    pub fn duration(&self) -> Duration {
        match self {
            TimeWindow::Second => Duration::from_secs(1),
            TimeWindow::Minute => Duration::from_secs(60),
            TimeWindow::Hour => Duration::from_secs(3600),
            TimeWindow::Day => Duration::from_secs(86400),
        }
    }

    /// Duration of `units` consecutive windows.
    pub fn times(&self, units: u32) -> Duration {
        self.duration() * units.max(1)
    }
}

/// The state of one key's current window.
///
/// A record is logically absent once `reset_time` has passed, even if the
/// store has not removed it yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterRecord {
    /// Requests counted in the current window (always at least 1)
    pub count: u64,
    /// When the current window ends
    pub reset_time: DateTime<Utc>,
}

impl CounterRecord {
    /// Open a new window at `now` holding a single request.
    pub fn open(now: DateTime<Utc>, window: Duration) -> Self {
        Self {
            count: 1,
            reset_time: now
                .checked_add_signed(to_chrono(window))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    /// Whether the window has elapsed at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.reset_time
    }

    /// Time left until the window resets, zero once it has elapsed.
    pub fn time_until_reset(&self, now: DateTime<Utc>) -> Duration {
        (self.reset_time - now).to_std().unwrap_or(Duration::ZERO)
    }

    /// Whole seconds until the window resets, rounded up and never below 1.
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        let remaining = self.time_until_reset(now);
        let secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
        secs.max(1)
    }

    /// Reset time as unix seconds, floored.
    pub fn reset_unix_secs(&self) -> i64 {
        self.reset_time.timestamp()
    }
}

/// Convert a std duration into a chrono one, saturating on overflow.
pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_window_duration() {
        assert_eq!(TimeWindow::Second.duration(), Duration::from_secs(1));
        assert_eq!(TimeWindow::Minute.duration(), Duration::from_secs(60));
        assert_eq!(TimeWindow::Hour.duration(), Duration::from_secs(3600));
        assert_eq!(TimeWindow::Day.duration(), Duration::from_secs(86400));
    }

    #[test]
    fn test_time_window_multiplier() {
        assert_eq!(TimeWindow::Minute.times(15), Duration::from_secs(900));
        // Zero units is treated as a single window
        assert_eq!(TimeWindow::Second.times(0), Duration::from_secs(1));
    }

    #[test]
    fn test_open_record() {
        let now = Utc::now();
        let record = CounterRecord::open(now, Duration::from_secs(60));

        assert_eq!(record.count, 1);
        assert_eq!(record.reset_time, now + chrono::Duration::seconds(60));
        assert!(!record.is_expired_at(now));
        assert!(record.is_expired_at(record.reset_time));
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let now = Utc::now();
        let record = CounterRecord {
            count: 3,
            reset_time: now + chrono::Duration::milliseconds(1500),
        };
        assert_eq!(record.retry_after_secs(now), 2);

        let record = CounterRecord {
            count: 3,
            reset_time: now + chrono::Duration::seconds(30),
        };
        assert_eq!(record.retry_after_secs(now), 30);
    }

    #[test]
    fn test_retry_after_never_zero() {
        let now = Utc::now();
        let record = CounterRecord {
            count: 1,
            reset_time: now - chrono::Duration::seconds(1),
        };
        assert_eq!(record.time_until_reset(now), Duration::ZERO);
        assert_eq!(record.retry_after_secs(now), 1);
    }
}
