use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr, time::Duration};

/// A duration written in Go's `time.ParseDuration` syntax, e.g. `15s` or
/// `1h30m`. Configuration files use this form for intervals.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct GoDuration(Duration);

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum ParseError {
    #[error("invalid unit: {}", EXPECTED_UNITS)]
    InvalidUnit,

    #[error("missing a unit: {}", EXPECTED_UNITS)]
    NoUnit,

    #[error("negative durations are not supported")]
    Negative,

    #[error("invalid floating-point number: {}", .0)]
    NotANumber(#[from] std::num::ParseFloatError),
}

const EXPECTED_UNITS: &str = "expected one of 'ns', 'us', '\u{00b5}s', 'ms', 's', 'm', or 'h'";

impl GoDuration {
    pub const fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    #[inline]
    pub fn as_duration(&self) -> Duration {
        self.0
    }
}

impl From<Duration> for GoDuration {
    fn from(d: Duration) -> Self {
        Self(d)
    }
}

impl From<GoDuration> for Duration {
    fn from(GoDuration(d): GoDuration) -> Self {
        d
    }
}

fn unit_base(unit: &str) -> Result<Duration, ParseError> {
    match unit {
        "ns" => Ok(Duration::from_nanos(1)),
        // U+00B5 is the "micro sign" while U+03BC is "Greek letter mu"
        "us" | "\u{00b5}s" | "\u{03bc}s" => Ok(Duration::from_micros(1)),
        "ms" => Ok(Duration::from_millis(1)),
        "s" => Ok(Duration::from_secs(1)),
        "m" => Ok(Duration::from_secs(60)),
        "h" => Ok(Duration::from_secs(60 * 60)),
        _ => Err(ParseError::InvalidUnit),
    }
}

impl FromStr for GoDuration {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.starts_with('-') {
            return Err(ParseError::Negative);
        }
        let mut rest = s.trim_start_matches('+');
        if rest == "0" {
            return Ok(Self::default());
        }

        let mut total = Duration::ZERO;
        while !rest.is_empty() {
            let unit_start = rest
                .find(|c: char| c.is_alphabetic())
                .ok_or(ParseError::NoUnit)?;
            let (value, tail) = rest.split_at(unit_start);
            let value = value.parse::<f64>()?;
            let unit_end = tail
                .find(|c: char| !c.is_alphabetic())
                .unwrap_or(tail.len());
            let (unit, tail) = tail.split_at(unit_end);
            total += unit_base(unit)?.mul_f64(value);
            rest = tail;
        }
        Ok(Self(total))
    }
}

impl fmt::Display for GoDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0.as_secs();
        if self.0.subsec_nanos() != 0 {
            return write!(f, "{}ms", self.0.as_millis());
        }
        let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
        if secs == 0 {
            return f.write_str("0s");
        }
        if h > 0 {
            write!(f, "{h}h")?;
        }
        if m > 0 {
            write!(f, "{m}m")?;
        }
        if s > 0 {
            write!(f, "{s}s")?;
        }
        Ok(())
    }
}

impl<'de> Deserialize<'de> for GoDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

impl Serialize for GoDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_go_durations() {
        let cases = [
            ("15s", Duration::from_secs(15)),
            ("0", Duration::ZERO),
            ("1h30m", Duration::from_secs(90 * 60)),
            ("1.5s", Duration::from_millis(1500)),
            ("250ms", Duration::from_millis(250)),
            ("+5m", Duration::from_secs(300)),
        ];
        for (input, expected) in cases {
            assert_eq!(
                input.parse::<GoDuration>().map(Duration::from),
                Ok(expected),
                "{input}"
            );
        }
    }

    #[test]
    fn rejects_malformed_durations() {
        assert_eq!("10".parse::<GoDuration>(), Err(ParseError::NoUnit));
        assert_eq!("10d".parse::<GoDuration>(), Err(ParseError::InvalidUnit));
        assert_eq!("-1s".parse::<GoDuration>(), Err(ParseError::Negative));
        assert!(matches!(
            "abcs".parse::<GoDuration>(),
            Err(ParseError::NotANumber(_)) | Err(ParseError::NoUnit)
        ));
    }

    #[test]
    fn displays_whole_units() {
        assert_eq!(GoDuration::from_secs(15).to_string(), "15s");
        assert_eq!(GoDuration::from_secs(3_661).to_string(), "1h1m1s");
        assert_eq!(GoDuration::default().to_string(), "0s");
    }
}
