//! Parsing of human-readable byte sizes and free-space minimums.
//!
//! Sizes accept an optional decimal fraction and a unit suffix. SI units
//! (`KB`, `MB`, `GB`, `TB`) are powers of 1000, IEC units (`KiB`, `MiB`,
//! `GiB`, `TiB`) are powers of 1024. A bare number is a byte count.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const UNITS: &[(&str, u64)] = &[
    ("TIB", 1 << 40),
    ("GIB", 1 << 30),
    ("MIB", 1 << 20),
    ("KIB", 1 << 10),
    ("TB", 1_000_000_000_000),
    ("GB", 1_000_000_000),
    ("MB", 1_000_000),
    ("KB", 1_000),
    ("B", 1),
];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UnitsError {
    #[error("Empty size")]
    Empty,

    #[error("Invalid size '{0}'")]
    InvalidSize(String),

    #[error("Invalid percentage '{0}': must be between 0 and 100")]
    InvalidPercentage(String),

    #[error("Size '{0}' overflows 64 bits")]
    Overflow(String),
}

/// Parse a byte size such as `20MB`, `1.5GiB` or `4096`.
pub fn parse_size(value: &str) -> Result<u64, UnitsError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(UnitsError::Empty);
    }

    let upper = trimmed.to_ascii_uppercase();
    let (number, multiplier) = UNITS
        .iter()
        .find_map(|(suffix, multiplier)| {
            upper
                .strip_suffix(suffix)
                .map(|number| (number.trim(), *multiplier))
        })
        .unwrap_or((upper.as_str(), 1));

    if number.is_empty() {
        return Err(UnitsError::InvalidSize(value.to_string()));
    }

    if let Ok(whole) = number.parse::<u64>() {
        return whole
            .checked_mul(multiplier)
            .ok_or_else(|| UnitsError::Overflow(value.to_string()));
    }

    let value: f64 = number
        .parse()
        .map_err(|_| UnitsError::InvalidSize(value.to_string()))?;
    if !value.is_finite() || value < 0.0 {
        return Err(UnitsError::InvalidSize(value.to_string()));
    }
    let bytes = value * multiplier as f64;
    if bytes > u64::MAX as f64 {
        return Err(UnitsError::Overflow(value.to_string()));
    }
    Ok(bytes.round() as u64)
}

/// Parse a percentage such as `10%`, returning the numeric part.
pub fn parse_percentage(value: &str) -> Result<f64, UnitsError> {
    let number = value
        .trim()
        .strip_suffix('%')
        .ok_or_else(|| UnitsError::InvalidPercentage(value.to_string()))?;
    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| UnitsError::InvalidPercentage(value.to_string()))?;
    if !(0.0..=100.0).contains(&value) {
        return Err(UnitsError::InvalidPercentage(value.to_string()));
    }
    Ok(value)
}

/// Format a byte count with the largest fitting SI unit, for log output.
pub fn format_size(bytes: u64) -> String {
    const STEPS: &[(&str, u64)] = &[
        ("TB", 1_000_000_000_000),
        ("GB", 1_000_000_000),
        ("MB", 1_000_000),
        ("KB", 1_000),
    ];
    for (suffix, unit) in STEPS {
        if bytes >= *unit {
            return format!("{:.1}{suffix}", bytes as f64 / *unit as f64);
        }
    }
    format!("{bytes}B")
}

/// Minimum free space a writable volume must keep.
///
/// `Percent` is relative to the total capacity of the volume and is resolved
/// to an absolute byte count once that capacity is known.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MinFreeSpace {
    #[default]
    None,
    Absolute(u64),
    Percent(f64),
}

impl MinFreeSpace {
    /// Resolve to an absolute byte count for a volume of `total_bytes`.
    pub fn resolve(&self, total_bytes: u64) -> u64 {
        match self {
            MinFreeSpace::None => 0,
            MinFreeSpace::Absolute(bytes) => *bytes,
            MinFreeSpace::Percent(percent) => {
                ((total_bytes as f64) * percent / 100.0).round() as u64
            }
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, MinFreeSpace::None)
    }
}

impl FromStr for MinFreeSpace {
    type Err = UnitsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("NONE") {
            return Ok(MinFreeSpace::None);
        }
        if trimmed.ends_with('%') {
            return parse_percentage(trimmed).map(MinFreeSpace::Percent);
        }
        parse_size(trimmed).map(MinFreeSpace::Absolute)
    }
}

impl TryFrom<String> for MinFreeSpace {
    type Error = UnitsError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MinFreeSpace> for String {
    fn from(value: MinFreeSpace) -> Self {
        value.to_string()
    }
}

impl fmt::Display for MinFreeSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MinFreeSpace::None => write!(f, "NONE"),
            MinFreeSpace::Absolute(bytes) => write!(f, "{bytes}"),
            MinFreeSpace::Percent(percent) => write!(f, "{percent}%"),
        }
    }
}
