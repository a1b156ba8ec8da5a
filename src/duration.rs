// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Flexible TTL duration grammar: `[-]<number><unit>...` with day and larger units.

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};

use crate::error::{Error, Result};

const NANOS_PER_MICRO: i64 = 1_000;
const NANOS_PER_MILLI: i64 = 1_000_000;
const NANOS_PER_SECOND: i64 = 1_000_000_000;
const NANOS_PER_MINUTE: i64 = 60 * NANOS_PER_SECOND;
const NANOS_PER_HOUR: i64 = 60 * NANOS_PER_MINUTE;
const NANOS_PER_DAY: i64 = 24 * NANOS_PER_HOUR;

/// Nanoseconds per unit token. `m` is minutes; months need at least two
/// letters (`mo`, `mth`, `month`) to avoid colliding with it.
fn unit_nanos(unit: &str) -> Option<i64> {
    match unit {
        "ns" => Some(1),
        "us" => Some(NANOS_PER_MICRO),
        "ms" => Some(NANOS_PER_MILLI),
        "s" => Some(NANOS_PER_SECOND),
        "m" => Some(NANOS_PER_MINUTE),
        "h" => Some(NANOS_PER_HOUR),
        "d" => Some(NANOS_PER_DAY),
        "w" => Some(7 * NANOS_PER_DAY),
        "mo" | "mth" | "month" => Some(30 * NANOS_PER_DAY),
        "y" => Some(365 * NANOS_PER_DAY),
        _ => None,
    }
}

/// Parse a flexible TTL like "4h", "2d", "1h30m" or "-1w" into a signed
/// duration. Terms are summed; a leading `-` flips the sign of the sum.
/// Units match case-insensitively and internal whitespace is tolerated.
/// A bare number without a unit is rejected as ambiguous.
pub fn parse_flexible_duration(input: &str) -> Result<TimeDelta> {
    let trimmed = input.trim();
    let (negative, body) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed),
    };

    let mut chars = body.chars().peekable();
    let mut total_nanos: i64 = 0;
    let mut terms = 0usize;

    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        if chars.peek().is_none() {
            break;
        }

        let mut number = String::new();
        while let Some(c) = chars.next_if(|c| c.is_ascii_digit() || *c == '.') {
            number.push(c);
        }
        if number.is_empty() || number == "." {
            return Err(Error::InvalidDuration(format!(
                "invalid duration string: {input:?}"
            )));
        }

        let mut unit = String::new();
        while let Some(c) = chars.next_if(|c| c.is_alphabetic()) {
            unit.push(c);
        }
        if unit.is_empty() {
            return Err(Error::InvalidDuration(format!(
                "missing unit in duration element {number:?}"
            )));
        }

        // Normalize micro sign variants before the case-insensitive match.
        let normalized = unit.to_lowercase().replace(['\u{00b5}', '\u{03bc}'], "u");
        let per_unit = unit_nanos(&normalized)
            .ok_or_else(|| Error::InvalidDuration(format!("unknown duration unit {unit:?}")))?;

        let term_nanos = if number.contains('.') {
            // Fractions multiply by the unit length, truncating toward zero
            // at nanosecond resolution.
            let value: f64 = number
                .parse()
                .map_err(|_| Error::InvalidDuration(format!("invalid number {number:?}")))?;
            let product = value * per_unit as f64;
            if !product.is_finite() || product >= i64::MAX as f64 {
                return Err(overflow(input));
            }
            product as i64
        } else {
            let value: i64 = number.parse().map_err(|_| overflow(input))?;
            value.checked_mul(per_unit).ok_or_else(|| overflow(input))?
        };

        total_nanos = total_nanos
            .checked_add(term_nanos)
            .ok_or_else(|| overflow(input))?;
        terms += 1;
    }

    if terms == 0 {
        return Err(Error::InvalidDuration(format!(
            "invalid duration string: {input:?}"
        )));
    }

    if negative {
        total_nanos = -total_nanos;
    }
    Ok(TimeDelta::nanoseconds(total_nanos))
}

fn overflow(input: &str) -> Error {
    Error::InvalidDuration(format!("duration overflows: {input:?}"))
}

/// Format an instant the way lease annotations expect it: RFC3339 UTC with
/// seconds precision and a `Z` suffix.
pub fn format_rfc3339_utc(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn parse(s: &str) -> TimeDelta {
        parse_flexible_duration(s).expect(s)
    }

    #[test]
    fn test_equivalent_spellings() {
        assert_eq!(parse("1h30m"), parse("90m"));
        assert_eq!(parse("90m"), parse("5400s"));
        assert_eq!(parse("1h30m"), TimeDelta::seconds(5400));
    }

    #[test]
    fn test_single_units() {
        assert_eq!(parse("10ns"), TimeDelta::nanoseconds(10));
        assert_eq!(parse("10us"), TimeDelta::microseconds(10));
        assert_eq!(parse("10ms"), TimeDelta::milliseconds(10));
        assert_eq!(parse("10s"), TimeDelta::seconds(10));
        assert_eq!(parse("2h"), TimeDelta::hours(2));
        assert_eq!(parse("2d"), TimeDelta::hours(48));
        assert_eq!(parse("1w"), TimeDelta::days(7));
        assert_eq!(parse("1y"), TimeDelta::days(365));
    }

    #[test]
    fn test_minutes_never_months() {
        assert_eq!(parse("1m"), TimeDelta::minutes(1));
        assert_eq!(parse("1mo"), TimeDelta::days(30));
        assert_eq!(parse("1mth"), TimeDelta::days(30));
        assert_eq!(parse("1month"), TimeDelta::days(30));
    }

    #[test]
    fn test_case_insensitive() {
        assert_eq!(parse("1H"), parse("1h"));
        assert_eq!(parse("1D"), parse("1d"));
        assert_eq!(parse("1MO"), parse("1mo"));
        assert_eq!(parse("500MS"), parse("500ms"));
    }

    #[test]
    fn test_micro_sign_variants() {
        assert_eq!(parse("5\u{00b5}s"), TimeDelta::microseconds(5));
        assert_eq!(parse("5\u{03bc}s"), TimeDelta::microseconds(5));
    }

    #[test]
    fn test_negative_flips_sum() {
        assert_eq!(parse("-1h"), -parse("1h"));
        assert_eq!(parse("-1h30m"), -parse("90m"));
    }

    #[test]
    fn test_fractions_truncate() {
        assert_eq!(parse("0.5h"), TimeDelta::minutes(30));
        assert_eq!(parse("1.5d"), TimeDelta::hours(36));
        // 0.1s is not representable exactly in binary; truncation toward
        // zero keeps the result within one nanosecond below.
        let tenth = parse("0.1s").num_nanoseconds().unwrap();
        assert!((99_999_999..=100_000_000).contains(&tenth));
    }

    #[test]
    fn test_internal_whitespace_tolerated() {
        assert_eq!(parse("1h 30m"), parse("1h30m"));
        assert_eq!(parse(" 2d "), parse("2d"));
    }

    #[test]
    fn test_rejects_bare_number() {
        assert!(parse_flexible_duration("10").is_err());
    }

    #[test]
    fn test_rejects_empty() {
        assert!(parse_flexible_duration("").is_err());
        assert!(parse_flexible_duration("   ").is_err());
        assert!(parse_flexible_duration("-").is_err());
    }

    #[test]
    fn test_rejects_unknown_unit() {
        assert!(parse_flexible_duration("10x").is_err());
        assert!(parse_flexible_duration("1q30m").is_err());
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(parse_flexible_duration("totally-wrong").is_err());
        assert!(parse_flexible_duration("1h!2m").is_err());
        assert!(parse_flexible_duration(".").is_err());
    }

    #[test]
    fn test_overflow_fails() {
        assert!(parse_flexible_duration("9999999999999y").is_err());
        assert!(parse_flexible_duration("9223372036854775807s1s").is_err());
    }

    #[test]
    fn test_deterministic() {
        for input in ["1h30m", "2d", "-45s", "1mo"] {
            assert_eq!(parse(input), parse(input));
        }
    }

    #[test]
    fn test_format_rfc3339_utc() {
        let instant = Utc.with_ymd_and_hms(2026, 2, 1, 8, 30, 0).unwrap();
        assert_eq!(format_rfc3339_utc(instant), "2026-02-01T08:30:00Z");
    }
}
