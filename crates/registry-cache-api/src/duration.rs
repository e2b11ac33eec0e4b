//! Durations in Go's `time.Duration` string form ("168h0m0s", "1.5s", "0s")
//!
//! Provider configs carry durations as strings in this form, and the cache
//! binary expects the same form in its config file.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

const NANOSECOND: i64 = 1;
const MICROSECOND: i64 = 1_000 * NANOSECOND;
const MILLISECOND: i64 = 1_000 * MICROSECOND;
const SECOND: i64 = 1_000 * MILLISECOND;
const MINUTE: i64 = 60 * SECOND;
const HOUR: i64 = 60 * MINUTE;

/// Error parsing a duration string
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid duration {input:?}: {reason}")]
pub struct ParseDurationError {
    input: String,
    reason: &'static str,
}

/// A signed duration with nanosecond precision
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GoDuration(i64);

impl GoDuration {
    /// Zero duration
    pub const ZERO: GoDuration = GoDuration(0);

    /// Duration of `hours` hours
    pub const fn from_hours(hours: i64) -> Self {
        Self(hours * HOUR)
    }

    /// Duration of `secs` seconds
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs * SECOND)
    }

    /// Duration from nanoseconds
    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    /// Nanoseconds
    pub const fn as_nanos(&self) -> i64 {
        self.0
    }

    /// True for the zero duration
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// True for durations greater than zero
    pub const fn is_positive(&self) -> bool {
        self.0 > 0
    }

    /// True for durations smaller than zero
    pub const fn is_negative(&self) -> bool {
        self.0 < 0
    }
}

impl FromStr for GoDuration {
    type Err = ParseDurationError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let err = |reason| ParseDurationError {
            input: input.to_string(),
            reason,
        };

        let (negative, mut rest) = match input.as_bytes().first() {
            Some(b'-') => (true, &input[1..]),
            Some(b'+') => (false, &input[1..]),
            _ => (false, input),
        };

        if rest == "0" {
            return Ok(Self::ZERO);
        }
        if rest.is_empty() {
            return Err(err("empty duration"));
        }

        let mut total: i128 = 0;
        while !rest.is_empty() {
            let int_len = rest.bytes().take_while(u8::is_ascii_digit).count();
            let int_part = &rest[..int_len];
            rest = &rest[int_len..];

            let mut frac_part = "";
            if let Some(after_dot) = rest.strip_prefix('.') {
                let frac_len = after_dot.bytes().take_while(u8::is_ascii_digit).count();
                frac_part = &after_dot[..frac_len];
                rest = &after_dot[frac_len..];
            }
            if int_part.is_empty() && frac_part.is_empty() {
                return Err(err("expected number"));
            }

            let unit_len = rest
                .char_indices()
                .find(|(_, c)| *c == '.' || c.is_ascii_digit())
                .map(|(i, _)| i)
                .unwrap_or(rest.len());
            let unit = match &rest[..unit_len] {
                "ns" => NANOSECOND,
                "us" | "µs" | "μs" => MICROSECOND,
                "ms" => MILLISECOND,
                "s" => SECOND,
                "m" => MINUTE,
                "h" => HOUR,
                "" => return Err(err("missing unit")),
                _ => return Err(err("unknown unit")),
            };
            rest = &rest[unit_len..];

            let int_value: i128 = if int_part.is_empty() {
                0
            } else {
                int_part.parse().map_err(|_| err("number out of range"))?
            };
            let mut value = int_value
                .checked_mul(unit as i128)
                .ok_or_else(|| err("duration out of range"))?;

            let mut scale = unit as i128;
            for digit in frac_part.bytes().take(18) {
                scale /= 10;
                value += (digit - b'0') as i128 * scale;
            }

            total = total
                .checked_add(value)
                .filter(|t| *t <= i64::MAX as i128)
                .ok_or_else(|| err("duration out of range"))?;
        }

        let total = total as i64;
        Ok(Self(if negative { -total } else { total }))
    }
}

impl fmt::Display for GoDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return f.write_str("0s");
        }
        if self.0 < 0 {
            f.write_str("-")?;
        }
        let u = self.0.unsigned_abs();

        if u < SECOND as u64 {
            let (unit, suffix) = if u < MICROSECOND as u64 {
                (NANOSECOND as u64, "ns")
            } else if u < MILLISECOND as u64 {
                (MICROSECOND as u64, "µs")
            } else {
                (MILLISECOND as u64, "ms")
            };
            return write!(f, "{}{}", with_fraction(u, unit), suffix);
        }

        let minutes = u / MINUTE as u64;
        let seconds = with_fraction(u % MINUTE as u64, SECOND as u64);
        let (hours, minutes) = (minutes / 60, minutes % 60);
        if hours > 0 {
            write!(f, "{}h{}m{}s", hours, minutes, seconds)
        } else if minutes > 0 {
            write!(f, "{}m{}s", minutes, seconds)
        } else {
            write!(f, "{}s", seconds)
        }
    }
}

fn with_fraction(value: u64, unit: u64) -> String {
    let int = value / unit;
    let frac = value % unit;
    if frac == 0 {
        return int.to_string();
    }
    let width = unit.ilog10() as usize;
    let digits = format!("{:0width$}", frac, width = width);
    format!("{}.{}", int, digits.trim_end_matches('0'))
}

impl Serialize for GoDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for GoDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_like_go() {
        assert_eq!(GoDuration::from_hours(168).to_string(), "168h0m0s");
        assert_eq!(GoDuration::from_hours(336).to_string(), "336h0m0s");
        assert_eq!(GoDuration::ZERO.to_string(), "0s");
        assert_eq!(GoDuration::from_secs(90).to_string(), "1m30s");
        assert_eq!(GoDuration::from_nanos(1_500_000_000).to_string(), "1.5s");
        assert_eq!(GoDuration::from_nanos(100 * MILLISECOND).to_string(), "100ms");
        assert_eq!(GoDuration::from_nanos(1_500).to_string(), "1.5µs");
        assert_eq!(GoDuration::from_nanos(-HOUR).to_string(), "-1h0m0s");
    }

    #[test]
    fn parses_go_syntax() {
        assert_eq!("168h".parse::<GoDuration>().unwrap(), GoDuration::from_hours(168));
        assert_eq!("0".parse::<GoDuration>().unwrap(), GoDuration::ZERO);
        assert_eq!("0s".parse::<GoDuration>().unwrap(), GoDuration::ZERO);
        assert_eq!(
            "2h45m0.5s".parse::<GoDuration>().unwrap().as_nanos(),
            2 * HOUR + 45 * MINUTE + 500 * MILLISECOND
        );
        assert_eq!("1.5h".parse::<GoDuration>().unwrap().as_nanos(), HOUR + 30 * MINUTE);
        assert_eq!("-1m".parse::<GoDuration>().unwrap().as_nanos(), -MINUTE);
        assert_eq!("300ms".parse::<GoDuration>().unwrap().as_nanos(), 300 * MILLISECOND);
    }

    #[test]
    fn rejects_malformed_input() {
        for input in ["", "h", "10", "1x", ".s", "-", "1h 2m"] {
            assert!(input.parse::<GoDuration>().is_err(), "{input:?} should fail");
        }
    }

    #[test]
    fn round_trips_through_json_string() {
        let d: GoDuration = serde_json::from_str("\"168h0m0s\"").unwrap();
        assert_eq!(d, GoDuration::from_hours(168));
        assert_eq!(serde_json::to_string(&d).unwrap(), "\"168h0m0s\"");
    }
}
