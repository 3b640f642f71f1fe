//! Cycle identity: a UTC timestamp with minute resolution.

use chrono::{Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::Time;

/// A single scheduled point in time.
///
/// Always UTC and always truncated to the minute, so two cycles built from
/// timestamps inside the same minute compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cycle(Time);

impl Cycle {
    /// Create a cycle from any UTC timestamp, dropping seconds.
    pub fn new(time: Time) -> Self {
        let secs = time.timestamp();
        let floored = secs - secs.rem_euclid(60);
        Self(Utc.timestamp_opt(floored, 0).single().unwrap_or(time))
    }

    /// Build a cycle from calendar fields. Returns `None` for invalid dates.
    pub fn from_fields(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> Option<Self> {
        let naive = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, 0)?;
        Some(Self(Utc.from_utc_datetime(&naive)))
    }

    /// The Unix epoch, used as the seed when no cycle has been admitted yet.
    pub fn epoch() -> Self {
        Self(Time::default())
    }

    /// Underlying timestamp.
    pub fn time(&self) -> Time {
        self.0
    }

    /// Shift by whole minutes.
    pub fn add_minutes(&self, minutes: i64) -> Option<Self> {
        self.0.checked_add_signed(Duration::minutes(minutes)).map(Self)
    }

    /// Shift by seconds; the result is floored to the minute.
    pub fn add_seconds(&self, seconds: i64) -> Option<Self> {
        self.0.checked_add_signed(Duration::seconds(seconds)).map(Self::new)
    }

    /// Calendar year (UTC).
    pub fn year(&self) -> i32 {
        self.0.year()
    }

    /// Month, 1-12.
    pub fn month(&self) -> u32 {
        self.0.month()
    }

    /// Day of month, 1-31.
    pub fn day(&self) -> u32 {
        self.0.day()
    }

    /// Hour, 0-23.
    pub fn hour(&self) -> u32 {
        self.0.hour()
    }

    /// Minute, 0-59.
    pub fn minute(&self) -> u32 {
        self.0.minute()
    }
}

impl From<Time> for Cycle {
    fn from(time: Time) -> Self {
        Self::new(time)
    }
}

impl fmt::Display for Cycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y%m%d%H%M"))
    }
}

/// Error returned when a cycle string is not `YYYYMMDDHH` or `YYYYMMDDHHMM`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid cycle '{0}': expected YYYYMMDDHH or YYYYMMDDHHMM")]
pub struct ParseCycleError(pub String);

impl FromStr for Cycle {
    type Err = ParseCycleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseCycleError(s.to_string());
        if !s.bytes().all(|b| b.is_ascii_digit()) || (s.len() != 10 && s.len() != 12) {
            return Err(err());
        }
        let num = |range: std::ops::Range<usize>| s[range].parse::<u32>().map_err(|_| err());
        let year = s[0..4].parse::<i32>().map_err(|_| err())?;
        let minute = if s.len() == 12 { num(10..12)? } else { 0 };
        Cycle::from_fields(year, num(4..6)?, num(6..8)?, num(8..10)?, minute).ok_or_else(err)
    }
}

impl Serialize for Cycle {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Cycle {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
