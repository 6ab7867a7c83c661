//! Decimal UTC dates.
//!
//! Archive dates are stored as 64-bit integers whose decimal digits read
//! `YYYYMMDDHHMMSS` in UTC, e.g. `20240229T153000Z` is `20240229153000`.
//! Zero is the deletion marker; comparison order of valid dates equals
//! chronological order, which is what makes the version log cheap to check.
//!
//! Conversions are exact over 1970–2099 (the range the on-disk format
//! accepts) using four-year leap terms; no time zone is ever involved.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};

/// Smallest date the archive format accepts.
pub const MIN_DATE: i64 = 19000101000000;
/// Largest date the archive format accepts (exclusive).
pub const MAX_DATE: i64 = 30000000000000;

/// Returns true if `date` is within the representable range.
pub fn is_valid(date: i64) -> bool {
    (MIN_DATE..MAX_DATE).contains(&date)
}

/// Converts Unix seconds to a decimal date.
///
/// Valid from 1970 to 2099. Returns -1 for non-positive input, matching the
/// "unknown" convention used by directory scans.
pub fn from_unix(t: i64) -> i64 {
    if t <= 0 {
        return -1;
    }
    let second = t % 60;
    let minute = t / 60 % 60;
    let hour = t / 3600 % 24;
    let mut days = t / 86400; // days since Jan 1 1970
    let term = days / 1461; // four-year terms since 1970
    days %= 1461;
    // Insert Feb 29 on the three non-leap years so every term looks leap.
    days += (days >= 59) as i64;
    days += (days >= 425) as i64;
    days += (days >= 1157) as i64;
    let year = term * 4 + days / 366 + 1970;
    days %= 366;
    // Pad short months to 31 days so month/day fall out of division.
    days += (days >= 60) as i64 * 2;
    days += (days >= 123) as i64;
    days += (days >= 185) as i64;
    days += (days >= 278) as i64;
    days += (days >= 340) as i64;
    let month = days / 31 + 1;
    let day = days % 31 + 1;
    year * 10000000000 + month * 100000000 + day * 1000000 + hour * 10000 + minute * 100 + second
}

/// Converts a decimal date back to Unix seconds. Inverse of [`from_unix`].
pub fn to_unix(date: i64) -> i64 {
    if date <= 0 {
        return -1;
    }
    const DAYS: [i64; 12] = [0, 31, 59, 90, 120, 151, 181, 212, 243, 273, 304, 334];
    let year = date / 10000000000 % 10000;
    let month = (date / 100000000 % 100 - 1).rem_euclid(12);
    let day = date / 1000000 % 100;
    let hour = date / 10000 % 100;
    let minute = date / 100 % 100;
    let second = date % 100;
    let leap = (year % 4 == 0 && month > 1) as i64;
    (day - 1 + DAYS[month as usize] + leap + ((year - 1970) * 1461 + 1) / 4) * 86400
        + hour * 3600
        + minute * 60
        + second
}

/// The current wall-clock time as a decimal date.
pub fn now() -> Result<i64> {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| Error::Config("system clock is before 1970".into()))?
        .as_secs() as i64;
    let date = from_unix(secs);
    if !is_valid(date) {
        return Err(Error::Config(format!("system date {date} out of range")));
    }
    Ok(date)
}

/// Returns the date one second after `date`.
pub fn next_second(date: i64) -> i64 {
    from_unix(to_unix(date) + 1)
}

/// Formats a date as `"YYYY-MM-DD HH:MM:SS"`, or spaces if unset.
pub fn to_string(date: i64) -> String {
    if date <= 0 {
        return "                   ".into();
    }
    let mut s: Vec<u8> = b"0000-00-00 00:00:00".to_vec();
    const SLOT: [usize; 14] = [18, 17, 15, 14, 12, 11, 9, 8, 6, 5, 3, 2, 1, 0];
    let mut d = date;
    for &i in &SLOT {
        s[i] += (d % 10) as u8;
        d /= 10;
    }
    String::from_utf8(s).expect("ascii template")
}

/// Expands a `--until` argument.
///
/// Values up to 9999999 select a version number. Longer values are partial
/// dates: `YYYYMMDD`, `YYYYMMDDHH`, or `YYYYMMDDHHMM` are extended to the
/// end of the period they name (`23`, `59`, `59` respectively), so
/// `-until 20240229` keeps everything written on that day.
pub fn parse_until(arg: &str) -> Result<i64> {
    let mut v: i64 = arg
        .parse()
        .map_err(|_| Error::Config(format!("bad -until value: {arg}")))?;
    if (19000000..=29991231).contains(&v) {
        v = v * 100 + 23;
    }
    if (1900000000..=2999123123).contains(&v) {
        v = v * 100 + 59;
    }
    if (190000000000..=299912312359).contains(&v) {
        v = v * 100 + 59;
    }
    if v > 9999999 && !is_valid(v) {
        return Err(Error::Config(format!(
            "-until date {v} must be between 19000101000000 and 29991231235959"
        )));
    }
    Ok(v)
}
