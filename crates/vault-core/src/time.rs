//! Lightweight UTC timestamps (no chrono dependency).
//!
//! Timestamps are Unix milliseconds rendered as fixed-width ISO-8601
//! (`YYYY-MM-DDTHH:MM:SS.mmmZ`), so the ledger can compare them as plain
//! strings. Uses Howard Hinnant's civil calendar algorithms for date math.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

const MILLIS_PER_SECOND: i64 = 1_000;
const MILLIS_PER_HOUR: i64 = 3_600 * MILLIS_PER_SECOND;
const MILLIS_PER_DAY: i64 = 24 * MILLIS_PER_HOUR;

/// `0000-01-01T00:00:00.000Z`.
const MIN_MILLIS: i64 = -62_167_219_200_000;
/// `9999-12-31T23:59:59.999Z`.
const MAX_MILLIS: i64 = 253_402_300_799_999;
const MAX_YEAR: i64 = 9999;

/// A UTC instant with millisecond precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid timestamp '{input}': {reason}")]
pub struct TimestampError {
    input: String,
    reason: &'static str,
}

impl Timestamp {
    pub const MIN: Timestamp = Timestamp(MIN_MILLIS);
    pub const MAX: Timestamp = Timestamp(MAX_MILLIS);

    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(i64::try_from(millis).unwrap_or(i64::MAX))
    }

    pub const fn from_unix_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// `None` outside years 0000-9999, where the fixed-width text form and
    /// its string ordering stop holding.
    pub fn checked_from_unix_millis(millis: i64) -> Option<Self> {
        (MIN_MILLIS..=MAX_MILLIS).contains(&millis).then_some(Self(millis))
    }

    pub const fn unix_millis(self) -> i64 {
        self.0
    }

    pub fn add_days(self, days: i64) -> Option<Self> {
        self.offset(days.checked_mul(MILLIS_PER_DAY)?)
    }

    pub fn sub_days(self, days: i64) -> Option<Self> {
        self.add_days(days.checked_neg()?)
    }

    pub fn sub_hours(self, hours: i64) -> Option<Self> {
        self.offset(hours.checked_mul(MILLIS_PER_HOUR)?.checked_neg()?)
    }

    fn offset(self, millis: i64) -> Option<Self> {
        Self::checked_from_unix_millis(self.0.checked_add(millis)?)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0.div_euclid(MILLIS_PER_SECOND);
        let millis = self.0.rem_euclid(MILLIS_PER_SECOND);
        let days = secs.div_euclid(86_400);
        let time_of_day = secs.rem_euclid(86_400);
        let hours = time_of_day / 3600;
        let minutes = (time_of_day % 3600) / 60;
        let seconds = time_of_day % 60;

        let (y, m, d) = civil_from_days(days);
        write!(
            f,
            "{y:04}-{m:02}-{d:02}T{hours:02}:{minutes:02}:{seconds:02}.{millis:03}Z"
        )
    }
}

impl FromStr for Timestamp {
    type Err = TimestampError;

    /// Accepts `YYYY-MM-DD`, optionally followed by `T` (or a space) and
    /// `HH:MM[:SS[.fraction]]` with a `Z` or `±HH:MM` suffix. A missing
    /// suffix is read as UTC.
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let fail = |reason| TimestampError {
            input: input.to_string(),
            reason,
        };
        let s = input.trim();
        let (date, time) = match s.find(['T', 't', ' ']) {
            Some(i) => (&s[..i], Some(&s[i + 1..])),
            None => (s, None),
        };

        let mut parts = date.splitn(3, '-');
        let year: i64 = parse_field(parts.next(), 4).ok_or_else(|| fail("bad year"))?;
        let month: u32 = parse_field(parts.next(), 2).ok_or_else(|| fail("bad month"))?;
        let day: u32 = parse_field(parts.next(), 2).ok_or_else(|| fail("bad day"))?;
        if year > MAX_YEAR {
            return Err(fail("year out of range"));
        }
        if !(1..=12).contains(&month) {
            return Err(fail("month out of range"));
        }
        if day == 0 || day > days_in_month(year, month) {
            return Err(fail("day out of range"));
        }

        let mut millis = days_from_civil(year, month, day) * MILLIS_PER_DAY;
        if let Some(time) = time {
            let (clock, offset_millis) = split_offset(time).ok_or_else(|| fail("bad offset"))?;
            millis += parse_clock(clock).ok_or_else(|| fail("bad time of day"))?;
            millis -= offset_millis;
        }
        Self::checked_from_unix_millis(millis).ok_or_else(|| fail("year out of range"))
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Optional inclusive bounds on a timestamp field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateRange {
    pub start: Option<Timestamp>,
    pub end: Option<Timestamp>,
}

impl DateRange {
    pub fn new(start: Option<Timestamp>, end: Option<Timestamp>) -> Self {
        Self { start, end }
    }
}

fn parse_field<T: FromStr>(raw: Option<&str>, min_len: usize) -> Option<T> {
    let raw = raw?;
    if raw.len() < min_len || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    raw.parse().ok()
}

/// Split `HH:MM:SS.fff+05:30` into the clock part and the offset in millis.
fn split_offset(time: &str) -> Option<(&str, i64)> {
    if let Some(clock) = time.strip_suffix(['Z', 'z']) {
        return Some((clock, 0));
    }
    let Some(pos) = time.rfind(['+', '-']) else {
        return Some((time, 0));
    };
    let (clock, offset) = time.split_at(pos);
    let sign = if offset.starts_with('-') { -1 } else { 1 };
    let offset = &offset[1..];
    let (h, m) = offset.split_once(':').unwrap_or((offset, "00"));
    let h: i64 = parse_field(Some(h), 2)?;
    let m: i64 = parse_field(Some(m), 2)?;
    if h > 23 || m > 59 {
        return None;
    }
    Some((clock, sign * (h * MILLIS_PER_HOUR + m * 60 * MILLIS_PER_SECOND)))
}

fn parse_clock(clock: &str) -> Option<i64> {
    let (hms, fraction) = clock.split_once('.').unwrap_or((clock, ""));
    let mut fields = hms.splitn(3, ':');
    let h: i64 = parse_field(fields.next(), 2)?;
    let m: i64 = parse_field(fields.next(), 2)?;
    let s: i64 = match fields.next() {
        Some(raw) => parse_field(Some(raw), 2)?,
        None => 0,
    };
    if h > 23 || m > 59 || s > 60 {
        return None;
    }

    let mut millis = 0;
    if !fraction.is_empty() {
        if !fraction.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        // Sub-millisecond digits are truncated.
        let digits: String = fraction.chars().chain("000".chars()).take(3).collect();
        millis = digits.parse::<i64>().ok()?;
    }
    Some(((h * 60 + m) * 60 + s) * MILLIS_PER_SECOND + millis)
}

fn is_leap_year(y: i64) -> bool {
    (y % 4 == 0 && y % 100 != 0) || y % 400 == 0
}

fn days_in_month(y: i64, m: u32) -> u32 {
    match m {
        2 if is_leap_year(y) => 29,
        2 => 28,
        4 | 6 | 9 | 11 => 30,
        _ => 31,
    }
}

/// Howard Hinnant's days_from_civil: (year, month, day) → Unix epoch days.
fn days_from_civil(y: i64, m: u32, d: u32) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let m = i64::from(m);
    let mp = if m > 2 { m - 3 } else { m + 9 };
    let doy = (153 * mp + 2) / 5 + i64::from(d) - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

/// Howard Hinnant's civil_from_days: Unix epoch days → (year, month, day).
fn civil_from_days(days: i64) -> (i64, u64, u64) {
    let z = days + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = (z - era * 146097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };
    (y, m, d)
}
