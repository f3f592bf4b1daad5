//! Wall-clock timestamps packed into transaction identifiers
//!
//! Layout of the 8 bytes (big-endian):
//!   [0..4] minutes since 1900-01-01 00:00 UTC, packed as
//!          ((((year - 1900) * 12 + month - 1) * 31 + day - 1) * 24 + hour) * 60 + minute
//!   [4..8] seconds within the minute, scaled by 2^32 / 60
//!
//! The packing is not dense (every month gets 31 days), but it is strictly
//! order-preserving, which is all the log needs.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::types::Tid;

const SECONDS_SCALE: f64 = 4_294_967_296.0 / 60.0;

/// Decoded calendar view of a [`Tid`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeStamp {
    pub year: i64,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
    pub minute: u32,
    pub second: f64,
}

impl TimeStamp {
    /// Timestamp for a point in time given as seconds since the Unix epoch.
    pub fn from_unix(secs: f64) -> TimeStamp {
        let whole = secs.floor();
        let frac = secs - whole;
        let whole = whole as i64;
        let days = whole.div_euclid(86_400);
        let rem = whole.rem_euclid(86_400);
        let (year, month, day) = civil_from_days(days);
        TimeStamp {
            year,
            month,
            day,
            hour: (rem / 3600) as u32,
            minute: ((rem % 3600) / 60) as u32,
            second: (rem % 60) as f64 + frac,
        }
    }

    /// Current wall-clock time.
    pub fn now() -> TimeStamp {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        TimeStamp::from_unix(secs)
    }

    /// Decode a transaction identifier.
    pub fn from_tid(tid: Tid) -> TimeStamp {
        let mut packed = tid.0 >> 32;
        let low = tid.0 & 0xFFFF_FFFF;
        let minute = (packed % 60) as u32;
        packed /= 60;
        let hour = (packed % 24) as u32;
        packed /= 24;
        let day = (packed % 31) as u32 + 1;
        packed /= 31;
        let month = (packed % 12) as u32 + 1;
        let year = (packed / 12) as i64 + 1900;
        TimeStamp { year, month, day, hour, minute, second: low as f64 / SECONDS_SCALE }
    }

    /// Encode as a transaction identifier. Dates before 1900 clamp to zero.
    pub fn to_tid(&self) -> Tid {
        if self.year < 1900 {
            return Tid::ZERO;
        }
        let packed = ((((self.year as u64 - 1900) * 12 + (self.month as u64 - 1)) * 31
            + (self.day as u64 - 1))
            * 24
            + self.hour as u64)
            * 60
            + self.minute as u64;
        let low = (self.second * SECONDS_SCALE) as u64;
        Tid((packed << 32) | low.min(0xFFFF_FFFF))
    }

    /// Seconds since the Unix epoch.
    pub fn to_unix(&self) -> f64 {
        let days = days_from_civil(self.year, self.month, self.day);
        (days * 86_400 + self.hour as i64 * 3600 + self.minute as i64 * 60) as f64 + self.second
    }
}

/// Identifier for `now`, forced strictly past `prev`.
pub fn new_tid(prev: Tid) -> Tid {
    later_than(TimeStamp::now().to_tid(), prev)
}

/// `tid` if it is greater than `prev`, otherwise the successor of `prev`.
pub fn later_than(tid: Tid, prev: Tid) -> Tid {
    if tid > prev {
        tid
    } else {
        prev.successor()
    }
}

/// Identifier for a point in time given in Unix seconds.
pub fn tid_at(secs: f64) -> Tid {
    TimeStamp::from_unix(secs).to_tid()
}

/// Unix seconds encoded by `tid`.
pub fn tid_time(tid: Tid) -> f64 {
    TimeStamp::from_tid(tid).to_unix()
}

// Howard Hinnant's civil calendar conversions (proleptic Gregorian).
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + if month <= 2 { 1 } else { 0 };
    (year, month, day)
}

fn days_from_civil(year: i64, month: u32, day: u32) -> i64 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = y.div_euclid(400);
    let yoe = y.rem_euclid(400);
    let m = month as i64;
    let doy = (153 * (if m > 2 { m - 3 } else { m + 9 }) + 2) / 5 + day as i64 - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_decodes_to_1970() {
        let ts = TimeStamp::from_unix(0.0);
        assert_eq!((ts.year, ts.month, ts.day, ts.hour, ts.minute), (1970, 1, 1, 0, 0));
        assert_eq!(ts.second, 0.0);
    }

    #[test]
    fn test_tid_preserves_time_order() {
        let a = tid_at(1_700_000_000.25);
        let b = tid_at(1_700_000_000.75);
        let c = tid_at(1_700_000_061.0);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_unix_round_trip_is_close() {
        let secs = 1_234_567_890.5;
        let back = tid_time(tid_at(secs));
        assert!((back - secs).abs() < 1e-6, "got {}", back);
    }

    #[test]
    fn test_later_than_forces_progress() {
        let prev = tid_at(2_000_000_000.0);
        let earlier = tid_at(1_000_000_000.0);
        assert_eq!(later_than(earlier, prev), prev.successor());
        let later = tid_at(2_000_000_001.0);
        assert_eq!(later_than(later, prev), later);
    }

    #[test]
    fn test_new_tid_is_monotonic() {
        let mut last = Tid::ZERO;
        for _ in 0..1000 {
            let tid = new_tid(last);
            assert!(tid > last);
            last = tid;
        }
    }

    #[test]
    fn test_leap_day() {
        let ts = TimeStamp::from_unix(951_782_400.0); // 2000-02-29
        assert_eq!((ts.year, ts.month, ts.day), (2000, 2, 29));
        assert_eq!(ts.to_unix(), 951_782_400.0);
    }
}
