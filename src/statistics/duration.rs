// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Duration text as stored in statistics: `1h2m3.45s`, `990ms`, `0s`.

use chrono::TimeDelta;
use std::time::Duration;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Statistics keep 10 ms resolution.
pub const SPLIT_RESOLUTION: Duration = Duration::from_millis(10);

/// Render the elapsed split: truncated to [`SPLIT_RESOLUTION`], negative
/// values (timestamp rounding artifacts) clamped to `0s`.
#[must_use]
pub fn format_time_split(split: TimeDelta) -> String {
    match split.to_std() {
        Ok(d) => format_duration(truncate(d, SPLIT_RESOLUTION)),
        Err(_) => "0s".to_string(),
    }
}

#[must_use]
pub fn truncate(d: Duration, step: Duration) -> Duration {
    let step = step.as_nanos();
    if step == 0 {
        return d;
    }
    let nanos = d.as_nanos() - d.as_nanos() % step;
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

fn fraction(value: u128, unit: u128, digits: usize) -> String {
    let whole = value / unit;
    let rem = value % unit;
    if rem == 0 {
        return whole.to_string();
    }
    let rem = format!("{:0width$}", rem, width = digits);
    format!("{}.{}", whole, rem.trim_end_matches('0'))
}

#[must_use]
pub fn format_duration(d: Duration) -> String {
    let nanos = d.as_nanos();
    if nanos == 0 {
        return "0s".to_string();
    }
    if nanos < 1_000 {
        return format!("{}ns", nanos);
    }
    if nanos < 1_000_000 {
        return format!("{}µs", fraction(nanos, 1_000, 3));
    }
    if nanos < NANOS_PER_SEC {
        return format!("{}ms", fraction(nanos, 1_000_000, 6));
    }

    let secs = nanos / NANOS_PER_SEC;
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let sub_minute = nanos % (60 * NANOS_PER_SEC);

    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{}h", hours));
    }
    if hours > 0 || minutes > 0 {
        out.push_str(&format!("{}m", minutes));
    }
    out.push_str(&format!("{}s", fraction(sub_minute, NANOS_PER_SEC, 9)));
    out
}

/// Parse the format produced by [`format_duration`]. Also accepts the
/// legacy `"1.5 seconds"` spelling.
#[must_use]
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim().replace(" seconds", "s");
    if s.is_empty() {
        return None;
    }
    if s == "0" {
        return Some(Duration::ZERO);
    }

    let mut total: u128 = 0;
    let mut rest = s.as_str();
    while !rest.is_empty() {
        let number_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_end == 0 {
            return None;
        }
        let number = &rest[..number_end];
        rest = &rest[number_end..];

        let unit_end = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit: u128 = match &rest[..unit_end] {
            "ns" => 1,
            "us" | "µs" => 1_000,
            "ms" => 1_000_000,
            "s" => NANOS_PER_SEC,
            "m" => 60 * NANOS_PER_SEC,
            "h" => 3600 * NANOS_PER_SEC,
            _ => return None,
        };
        rest = &rest[unit_end..];
        total += scaled(number, unit)?;
    }

    u64::try_from(total).ok().map(Duration::from_nanos)
}

/// `number` (decimal, optional fraction) times `unit`, in whole nanoseconds.
fn scaled(number: &str, unit: u128) -> Option<u128> {
    let (whole, frac) = number.split_once('.').unwrap_or((number, ""));
    if whole.is_empty() && frac.is_empty() {
        return None;
    }
    let whole: u128 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let mut nanos = whole.checked_mul(unit)?;

    let mut place = unit;
    for digit in frac.chars() {
        place /= 10;
        nanos += u128::from(digit.to_digit(10)?) * place;
    }
    Some(nanos)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration_units() {
        assert_eq!(format_duration(Duration::ZERO), "0s");
        assert_eq!(format_duration(Duration::from_nanos(500)), "500ns");
        assert_eq!(format_duration(Duration::from_micros(1500)), "1.5ms");
        assert_eq!(format_duration(Duration::from_millis(990)), "990ms");
        assert_eq!(format_duration(Duration::from_millis(3450)), "3.45s");
        assert_eq!(format_duration(Duration::from_secs(62)), "1m2s");
        assert_eq!(format_duration(Duration::from_secs(3600)), "1h0m0s");
    }

    #[test]
    fn test_time_split_truncates_and_clamps() {
        assert_eq!(format_time_split(TimeDelta::milliseconds(1234)), "1.23s");
        assert_eq!(format_time_split(TimeDelta::microseconds(9_999)), "0s");
        assert_eq!(format_time_split(TimeDelta::microseconds(-40)), "0s");
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("1m2s"), Some(Duration::from_secs(62)));
        assert_eq!(parse_duration("990ms"), Some(Duration::from_millis(990)));
        assert_eq!(parse_duration("1.5 seconds"), Some(Duration::from_millis(1500)));
        assert_eq!(parse_duration("0s"), Some(Duration::ZERO));
        assert_eq!(parse_duration("soon"), None);
        assert_eq!(parse_duration(""), None);
    }
}
