//! Bandwidth quantities
//!
//! Every rate is stored as an integer number of bits per second. Text such as
//! `"5mbps"`, `"100 kbit"` or `"2MiB/s"` is normalized through [`Rate::parse`].

use crate::error::ConfigError;
use std::fmt;
use std::str::FromStr;

/// The largest rate classic `tc` accepts without 64-bit rate support
pub const UNCAPPED_BITS_PER_SEC: u64 = u32::MAX as u64;

/// A bandwidth in bits per second
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Rate(u64);

impl Rate {
    pub const ZERO: Rate = Rate(0);

    pub const fn from_bits_per_sec(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits_per_sec(self) -> u64 {
        self.0
    }

    pub fn saturating_add(self, other: Rate) -> Rate {
        Rate(self.0.saturating_add(other.0))
    }

    /// Parse a rate such as `"5mbps"`, `"5mibps"`, `"100kbit"` or `"1MB/s"`
    ///
    /// SI prefixes (k, m, g, t) scale by powers of 1000 and IEC prefixes
    /// (ki, mi, gi, ti) by powers of 1024. Bit units are `bit`, `bits`, `bps`
    /// and `bit/s`; byte units (`b`, `byte`, `bytes`, `byte/s`, `bytes/s`, `b/s`)
    /// are multiplied by eight. A bare integer is bits per second.
    pub fn parse(text: &str) -> Result<Rate, ConfigError> {
        let invalid = || ConfigError::InvalidRateFormat(text.to_string());

        let normalized = text.trim().to_ascii_lowercase();
        let digits_end = normalized
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(normalized.len());
        let (magnitude, suffix) = normalized.split_at(digits_end);
        if magnitude.is_empty() {
            return Err(invalid());
        }
        let magnitude: u64 = magnitude.parse().map_err(|_| invalid())?;

        let suffix = suffix.trim_start();
        if suffix.is_empty() {
            return Ok(Rate(magnitude));
        }

        let (multiplier, unit) = split_prefix(suffix);
        let unit_bits = unit_bits(unit).ok_or_else(invalid)?;

        magnitude
            .checked_mul(multiplier)
            .and_then(|value| value.checked_mul(unit_bits))
            .map(Rate)
            .ok_or_else(invalid)
    }
}

/// Strip a leading SI/IEC prefix, returning its multiplier and the rest
fn split_prefix(suffix: &str) -> (u64, &str) {
    const PREFIXES: [(&str, u64); 8] = [
        ("ki", 1 << 10),
        ("mi", 1 << 20),
        ("gi", 1 << 30),
        ("ti", 1 << 40),
        ("k", 1_000),
        ("m", 1_000_000),
        ("g", 1_000_000_000),
        ("t", 1_000_000_000_000),
    ];

    for (prefix, multiplier) in PREFIXES {
        if let Some(rest) = suffix.strip_prefix(prefix) {
            // Only a prefix when a known unit follows it
            if unit_bits(rest).is_some() {
                return (multiplier, rest);
            }
        }
    }

    (1, suffix)
}

fn unit_bits(unit: &str) -> Option<u64> {
    match unit {
        "bit" | "bits" | "bps" | "bit/s" | "bits/s" => Some(1),
        "b" | "byte" | "bytes" | "b/s" | "byte/s" | "bytes/s" => Some(8),
        _ => None,
    }
}

impl FromStr for Rate {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Rate::parse(s)
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: [(u64, &str); 3] = [
            (1_000_000_000, "gbit"),
            (1_000_000, "mbit"),
            (1_000, "kbit"),
        ];

        for (scale, unit) in UNITS {
            if self.0 >= scale && self.0 % scale == 0 {
                return write!(f, "{}{}", self.0 / scale, unit);
            }
        }
        write!(f, "{}bit", self.0)
    }
}

/// Format an optional ceiling for log output
pub fn describe_ceiling(ceiling: Option<Rate>) -> String {
    match ceiling {
        Some(rate) => rate.to_string(),
        None => "unlimited".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_si_prefixes() {
        assert_eq!(Rate::parse("5mbps").unwrap().bits_per_sec(), 5_000_000);
        assert_eq!(Rate::parse("100kbit").unwrap().bits_per_sec(), 100_000);
        assert_eq!(Rate::parse("2gbit").unwrap().bits_per_sec(), 2_000_000_000);
        assert_eq!(
            Rate::parse("1tbps").unwrap().bits_per_sec(),
            1_000_000_000_000
        );
    }

    #[test]
    fn test_iec_prefixes() {
        assert_eq!(Rate::parse("5mibps").unwrap().bits_per_sec(), 5 * 1024 * 1024);
        assert_eq!(Rate::parse("3kibit").unwrap().bits_per_sec(), 3 * 1024);
        assert_eq!(Rate::parse("1gibps").unwrap().bits_per_sec(), 1 << 30);
    }

    #[test]
    fn test_byte_units() {
        assert_eq!(Rate::parse("1kbyte/s").unwrap().bits_per_sec(), 8_000);
        assert_eq!(Rate::parse("2MB/s").unwrap().bits_per_sec(), 16_000_000);
        assert_eq!(Rate::parse("1KiB").unwrap().bits_per_sec(), 8 * 1024);
    }

    #[test]
    fn test_bare_number_and_whitespace() {
        assert_eq!(Rate::parse("4200").unwrap().bits_per_sec(), 4200);
        assert_eq!(Rate::parse("  10 kbit ").unwrap().bits_per_sec(), 10_000);
        assert_eq!(Rate::parse("7 MBPS").unwrap().bits_per_sec(), 7_000_000);
    }

    #[test]
    fn test_invalid_formats() {
        for text in ["", "mbps", "5furlongs", "5xbps", "1.5mbps", "-3kbit", "5 k"] {
            let err = Rate::parse(text).unwrap_err();
            assert!(
                matches!(err, ConfigError::InvalidRateFormat(_)),
                "{text:?} gave {err:?}"
            );
        }
    }

    #[test]
    fn test_overflow_is_rejected() {
        assert!(Rate::parse("99999999999tibyte").is_err());
    }

    #[test]
    fn test_display_uses_largest_exact_unit() {
        assert_eq!(Rate::from_bits_per_sec(5_000_000).to_string(), "5mbit");
        assert_eq!(Rate::from_bits_per_sec(2_500_000).to_string(), "2500kbit");
        assert_eq!(Rate::from_bits_per_sec(1234).to_string(), "1234bit");
        assert_eq!(Rate::ZERO.to_string(), "0bit");
    }
}
