//! Time bucketing for rollups
//!
//! Every view range has a fixed bucket width. A bucket is identified by its
//! start instant, which is a multiple of the width counted from the UTC
//! epoch, so bucket boundaries never depend on the local timezone.

use crate::types::{from_millis, to_millis};
use crate::{Result, ThermoError, Timestamp, ViewRange};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(60 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Bucket width per view range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BucketWidths {
    #[serde(with = "humantime_serde")]
    pub hour: Duration,
    #[serde(with = "humantime_serde")]
    pub day: Duration,
    #[serde(with = "humantime_serde")]
    pub week: Duration,
    #[serde(with = "humantime_serde")]
    pub month: Duration,
    #[serde(with = "humantime_serde")]
    pub year: Duration,
    #[serde(with = "humantime_serde")]
    pub all: Duration,
}

impl Default for BucketWidths {
    fn default() -> Self {
        Self {
            hour: MINUTE,
            day: 10 * MINUTE,
            week: HOUR,
            month: DAY,
            year: 7 * DAY,
            all: 7 * DAY,
        }
    }
}

impl BucketWidths {
    /// Bucket width for a view range
    pub fn width(&self, view: ViewRange) -> Duration {
        match view {
            ViewRange::Hour => self.hour,
            ViewRange::Day => self.day,
            ViewRange::Week => self.week,
            ViewRange::Month => self.month,
            ViewRange::Year => self.year,
            ViewRange::All => self.all,
        }
    }

    /// Replace the bucket width for a view range
    pub fn set_width(&mut self, view: ViewRange, width: Duration) {
        let slot = match view {
            ViewRange::Hour => &mut self.hour,
            ViewRange::Day => &mut self.day,
            ViewRange::Week => &mut self.week,
            ViewRange::Month => &mut self.month,
            ViewRange::Year => &mut self.year,
            ViewRange::All => &mut self.all,
        };
        *slot = width;
    }

    /// Bucket width in milliseconds
    pub fn width_ms(&self, view: ViewRange) -> i64 {
        self.width(view).as_millis() as i64
    }

    /// Reject zero or sub-millisecond widths
    pub fn validate(&self) -> Result<()> {
        for view in ViewRange::ALL {
            if self.width_ms(view) <= 0 {
                return Err(ThermoError::Config(format!(
                    "bucket width for {view} must be at least 1ms"
                )));
            }
        }
        Ok(())
    }

    /// Start of the bucket containing `t`
    pub fn bucket_start(&self, t: Timestamp, view: ViewRange) -> Result<Timestamp> {
        from_millis(floor_millis(to_millis(t), self.width_ms(view)))
    }

    /// Bucket starts `b` with `from <= b < to`
    pub fn enumerate(&self, from: Timestamp, to: Timestamp, view: ViewRange) -> Buckets {
        Buckets::new(to_millis(from), to_millis(to), self.width_ms(view))
    }
}

/// Floor `ms` to a multiple of `width_ms`, rounding toward negative infinity
pub fn floor_millis(ms: i64, width_ms: i64) -> i64 {
    ms - ms.rem_euclid(width_ms)
}

/// Lazy sequence of bucket starts over a half-open range
///
/// Clones advance independently of each other.
#[derive(Debug, Clone)]
pub struct Buckets {
    next: i64,
    end: i64,
    step: i64,
}

impl Buckets {
    fn new(from_ms: i64, to_ms: i64, step: i64) -> Self {
        let mut next = floor_millis(from_ms, step);
        if next < from_ms {
            next += step;
        }
        Self {
            next,
            end: to_ms,
            step,
        }
    }

    /// Remaining bucket starts as raw milliseconds
    pub fn millis(self) -> impl Iterator<Item = i64> {
        let Buckets { next, end, step } = self;
        std::iter::successors(Some(next), move |b| b.checked_add(step))
            .take_while(move |b| *b < end)
    }

    fn remaining(&self) -> usize {
        if self.next >= self.end {
            0
        } else {
            ((self.end - self.next - 1) / self.step + 1) as usize
        }
    }
}

impl Iterator for Buckets {
    type Item = Timestamp;

    fn next(&mut self) -> Option<Timestamp> {
        while self.next < self.end {
            let current = self.next;
            self.next = current.saturating_add(self.step);
            if let Ok(ts) = from_millis(current) {
                return Some(ts);
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn at(h: u32, m: u32, s: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2017, 8, 28, h, m, s).unwrap()
    }

    #[test]
    fn test_bucket_start() {
        let widths = BucketWidths::default();
        let t = at(14, 31, 15);

        assert_eq!(widths.bucket_start(t, ViewRange::Hour).unwrap(), at(14, 31, 0));
        assert_eq!(widths.bucket_start(t, ViewRange::Day).unwrap(), at(14, 30, 0));
        assert_eq!(widths.bucket_start(t, ViewRange::Week).unwrap(), at(14, 0, 0));
        assert_eq!(widths.bucket_start(t, ViewRange::Month).unwrap(), at(0, 0, 0));
        // 7-day buckets count from the epoch (a Thursday)
        assert_eq!(
            widths.bucket_start(t, ViewRange::Year).unwrap(),
            Utc.with_ymd_and_hms(2017, 8, 24, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_bucket_start_never_after_t() {
        let widths = BucketWidths::default();
        let base = at(0, 0, 0);
        for offset in (0..200_000).step_by(7_919) {
            let t = base + chrono::Duration::seconds(offset);
            for view in ViewRange::ALL {
                let b = widths.bucket_start(t, view).unwrap();
                assert!(b <= t);
                assert!(t - b < chrono::Duration::from_std(widths.width(view)).unwrap());
                assert_eq!(widths.bucket_start(b, view).unwrap(), b);
            }
        }
    }

    #[test]
    fn test_floor_before_epoch() {
        assert_eq!(floor_millis(-1, 60_000), -60_000);
        assert_eq!(floor_millis(-60_000, 60_000), -60_000);
        assert_eq!(floor_millis(59_999, 60_000), 0);
    }

    #[test]
    fn test_enumerate_skips_bucket_before_from() {
        let widths = BucketWidths::default();
        let buckets: Vec<_> = widths
            .enumerate(at(14, 15, 31), at(14, 21, 31), ViewRange::Day)
            .collect();
        assert_eq!(buckets, vec![at(14, 20, 0)]);
    }

    #[test]
    fn test_enumerate_year_range() {
        let widths = BucketWidths {
            year: 3 * DAY,
            ..Default::default()
        };
        let from = at(14, 0, 0);
        let to = Utc.with_ymd_and_hms(2017, 9, 3, 0, 51, 0).unwrap();
        let buckets: Vec<_> = widths.enumerate(from, to, ViewRange::Year).collect();
        assert_eq!(
            buckets,
            vec![
                Utc.with_ymd_and_hms(2017, 8, 31, 0, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2017, 9, 3, 0, 0, 0).unwrap(),
            ]
        );
    }

    #[test]
    fn test_enumerate_is_half_open_and_restartable() {
        let widths = BucketWidths::default();
        let buckets = widths.enumerate(at(14, 0, 0), at(14, 3, 0), ViewRange::Hour);
        let first: Vec<_> = buckets.clone().collect();
        let second: Vec<_> = buckets.collect();
        assert_eq!(first, vec![at(14, 0, 0), at(14, 1, 0), at(14, 2, 0)]);
        assert_eq!(first, second);

        assert_eq!(
            widths.enumerate(at(14, 3, 0), at(14, 3, 0), ViewRange::Hour).count(),
            0
        );
        assert_eq!(
            widths.enumerate(at(15, 0, 0), at(14, 0, 0), ViewRange::Hour).count(),
            0
        );
    }

    #[test]
    fn test_size_hint_matches_count() {
        let widths = BucketWidths::default();
        let buckets = widths.enumerate(at(0, 0, 1), at(23, 59, 59), ViewRange::Day);
        let (_, upper) = buckets.size_hint();
        assert_eq!(upper, Some(buckets.clone().count()));
        assert_eq!(buckets.clone().millis().count(), buckets.count());
    }

    #[test]
    fn test_validate_rejects_zero_width() {
        let widths = BucketWidths {
            week: Duration::ZERO,
            ..Default::default()
        };
        assert!(widths.validate().is_err());
        assert!(BucketWidths::default().validate().is_ok());

        let mut widths = BucketWidths::default();
        widths.set_width(ViewRange::Month, 6 * HOUR);
        assert_eq!(widths.width_ms(ViewRange::Month), 6 * 3600 * 1000);
        assert_eq!(widths.width(ViewRange::Year), 7 * DAY);
    }
}
