//! Human-readable durations such as `1d`, `90m` or `1.5h`.

use std::time::Duration;

const SECOND: f64 = 1000.0;
const MINUTE: f64 = SECOND * 60.0;
const HOUR: f64 = MINUTE * 60.0;
const DAY: f64 = HOUR * 24.0;
const WEEK: f64 = DAY * 7.0;
const YEAR: f64 = DAY * 365.25;

/// Parses a duration string. A bare number is read as milliseconds.
///
/// Supported units: `ms`, `s`, `m`, `h`, `d`, `w`, `y` and their long
/// forms (`seconds`, `days`, ...).
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-'))
        .unwrap_or(raw.len());
    let (number, unit) = raw.split_at(split);
    let value: f64 = number.parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }

    let factor = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "ms" | "msec" | "msecs" | "millisecond" | "milliseconds" => 1.0,
        "s" | "sec" | "secs" | "second" | "seconds" => SECOND,
        "m" | "min" | "mins" | "minute" | "minutes" => MINUTE,
        "h" | "hr" | "hrs" | "hour" | "hours" => HOUR,
        "d" | "day" | "days" => DAY,
        "w" | "week" | "weeks" => WEEK,
        "y" | "yr" | "yrs" | "year" | "years" => YEAR,
        _ => return None,
    };

    Some(Duration::from_millis((value * factor).round() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("1d", 86_400 ; "one day")]
    #[test_case("2h", 7_200 ; "hours")]
    #[test_case("1.5m", 90 ; "fractional minutes")]
    #[test_case("1 week", 604_800 ; "long form with space")]
    #[test_case("30s", 30 ; "seconds")]
    #[test_case("1y", 31_557_600 ; "year")]
    fn test_parse_duration(raw: &str, secs: u64) {
        assert_eq!(parse_duration(raw), Some(Duration::from_secs(secs)));
    }

    #[test]
    fn test_bare_number_is_milliseconds() {
        assert_eq!(parse_duration("1500"), Some(Duration::from_millis(1500)));
    }

    #[test_case("" ; "empty")]
    #[test_case("d" ; "no number")]
    #[test_case("5 fortnights" ; "unknown unit")]
    #[test_case("-1d" ; "negative")]
    fn test_invalid_duration(raw: &str) {
        assert_eq!(parse_duration(raw), None);
    }
}
