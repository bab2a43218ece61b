//! Duration strings as they appear in manifests: `90s`, `5m`, `1h30m`, `250ms`.

use std::fmt;
use std::str::FromStr;
use std::time::Duration as StdDuration;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Duration(pub StdDuration);

impl Duration {
    pub const fn from_secs(secs: u64) -> Self { Self(StdDuration::from_secs(secs)) }
    pub fn as_std(&self) -> StdDuration { self.0 }
}

impl From<StdDuration> for Duration {
    fn from(d: StdDuration) -> Self { Self(d) }
}

impl From<Duration> for StdDuration {
    fn from(d: Duration) -> Self { d.0 }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid duration {0:?} (expect e.g. 30s, 5m, 1h30m)")]
pub struct ParseDurationError(pub String);

impl FromStr for Duration {
    type Err = ParseDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseDurationError(s.to_string());
        let mut rest = s.trim();
        if rest.is_empty() { return Err(err()); }
        if rest == "0" { return Ok(Self::default()); }
        let mut total = 0f64;
        while !rest.is_empty() {
            let num_end = rest.find(|c: char| !(c.is_ascii_digit() || c == '.')).ok_or_else(err)?;
            if num_end == 0 { return Err(err()); }
            let value: f64 = rest[..num_end].parse().map_err(|_| err())?;
            let after = &rest[num_end..];
            let unit_end = after.find(|c: char| c.is_ascii_digit() || c == '.').unwrap_or(after.len());
            let scale = match &after[..unit_end] {
                "ns" => 1e-9,
                "us" | "µs" => 1e-6,
                "ms" => 1e-3,
                "s" => 1.0,
                "m" => 60.0,
                "h" => 3600.0,
                _ => return Err(err()),
            };
            total += value * scale;
            rest = &after[unit_end..];
        }
        Ok(Self(StdDuration::from_secs_f64(total)))
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ms = self.0.as_millis();
        if ms == 0 { return f.write_str("0s"); }
        if ms < 1000 { return write!(f, "{}ms", ms); }
        let (h, rem) = (ms / 3_600_000, ms % 3_600_000);
        let (m, rem) = (rem / 60_000, rem % 60_000);
        if h > 0 { write!(f, "{}h", h)?; }
        if m > 0 { write!(f, "{}m", m)?; }
        if rem > 0 {
            if rem % 1000 == 0 { write!(f, "{}s", rem / 1000)?; } else { write!(f, "{}s", rem as f64 / 1000.0)?; }
        }
        Ok(())
    }
}

impl Serialize for Duration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Duration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}
