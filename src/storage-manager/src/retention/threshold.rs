//! Hour-of-day table of free space targets.
//!
//! Entries are separated by `;` or newlines. Each entry is either
//! `<start>-<end>=<target>`, applying from hour `start` through hour `end`
//! inclusive (wrapping past midnight when `start > end`), or a bare
//! `<target>` that applies at any hour. The first matching entry wins.
//!
//! A target is a byte size (`20MB`, `1.5GiB`), `<n>h` for n hours worth of
//! the expected daily volume, or `<n>%` of the expected daily volume.

use std::fmt;
use std::str::FromStr;

use common::units::{format_size, parse_size};

use super::RetentionConfigError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FreeTarget {
    Absolute(u64),
    Hours(f64),
    Percent(f64),
}

impl FreeTarget {
    /// Bytes to keep free given the expected daily ingest volume.
    pub fn resolve(&self, expected_daily: u64) -> u64 {
        let bytes = match self {
            FreeTarget::Absolute(bytes) => return *bytes,
            FreeTarget::Hours(hours) => expected_daily as f64 * hours / 24.0,
            FreeTarget::Percent(percent) => expected_daily as f64 * percent / 100.0,
        };
        bytes.round() as u64
    }
}

impl fmt::Display for FreeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FreeTarget::Absolute(bytes) => f.write_str(&format_size(*bytes)),
            FreeTarget::Hours(hours) => write!(f, "{hours}h"),
            FreeTarget::Percent(percent) => write!(f, "{percent}%"),
        }
    }
}

impl FromStr for FreeTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let fraction = |number: &str| -> Result<f64, String> {
            let value: f64 = number
                .trim()
                .parse()
                .map_err(|_| format!("'{number}' is not a number"))?;
            if !value.is_finite() || value < 0.0 {
                return Err(format!("'{number}' must be a non-negative number"));
            }
            Ok(value)
        };

        if let Some(hours) = s.strip_suffix(['h', 'H']) {
            return fraction(hours).map(FreeTarget::Hours);
        }
        if let Some(percent) = s.strip_suffix('%') {
            return fraction(percent).map(FreeTarget::Percent);
        }
        parse_size(s)
            .map(FreeTarget::Absolute)
            .map_err(|e| e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HourRange {
    Always,
    /// Inclusive; wraps past midnight when `start > end`
    Hours { start: u32, end: u32 },
}

impl HourRange {
    pub fn contains(&self, hour: u32) -> bool {
        match *self {
            HourRange::Always => true,
            HourRange::Hours { start, end } if start <= end => (start..=end).contains(&hour),
            HourRange::Hours { start, end } => hour >= start || hour <= end,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdEntry {
    pub hours: HourRange,
    pub target: FreeTarget,
}

impl fmt::Display for ThresholdEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.hours {
            HourRange::Always => write!(f, "{}", self.target),
            HourRange::Hours { start, end } => write!(f, "{start}-{end}={}", self.target),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThresholdTable {
    entries: Vec<ThresholdEntry>,
}

impl ThresholdTable {
    pub fn new(entries: Vec<ThresholdEntry>) -> Self {
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[ThresholdEntry] {
        &self.entries
    }

    /// Target of the first entry covering `hour`.
    pub fn target_for_hour(&self, hour: u32) -> Option<FreeTarget> {
        self.entries
            .iter()
            .find(|entry| entry.hours.contains(hour))
            .map(|entry| entry.target)
    }
}

fn parse_hour(value: &str, entry: &str) -> Result<u32, RetentionConfigError> {
    let invalid = |reason: String| RetentionConfigError::InvalidThreshold {
        entry: entry.to_string(),
        reason,
    };
    let hour: u32 = value
        .trim()
        .parse()
        .map_err(|_| invalid(format!("'{value}' is not an hour")))?;
    if hour > 23 {
        return Err(invalid(format!("hour {hour} is out of range 0-23")));
    }
    Ok(hour)
}

fn parse_entry(entry: &str) -> Result<ThresholdEntry, RetentionConfigError> {
    let invalid = |reason: String| RetentionConfigError::InvalidThreshold {
        entry: entry.to_string(),
        reason,
    };

    let (hours, target) = match entry.split_once('=') {
        Some((range, target)) => {
            let (start, end) = range
                .split_once('-')
                .ok_or_else(|| invalid("hour range must be <start>-<end>".to_string()))?;
            let hours = HourRange::Hours {
                start: parse_hour(start, entry)?,
                end: parse_hour(end, entry)?,
            };
            (hours, target)
        }
        None => (HourRange::Always, entry),
    };

    let target = target.parse().map_err(invalid)?;
    Ok(ThresholdEntry { hours, target })
}

impl FromStr for ThresholdTable {
    type Err = RetentionConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("NONE") {
            return Ok(Self::default());
        }
        trimmed
            .split([';', '\n'])
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(parse_entry)
            .collect::<Result<Vec<_>, _>>()
            .map(Self::new)
    }
}

impl fmt::Display for ThresholdTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.entries.is_empty() {
            return f.write_str("NONE");
        }
        let entries: Vec<String> = self.entries.iter().map(ToString::to_string).collect();
        f.write_str(&entries.join(";"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_disables_table() {
        assert!("NONE".parse::<ThresholdTable>().unwrap().is_empty());
        assert!("".parse::<ThresholdTable>().unwrap().is_empty());
        assert!("  none ".parse::<ThresholdTable>().unwrap().is_empty());
    }

    #[test]
    fn test_parse_mixed_table() {
        let table: ThresholdTable = "7-19=24h;19-7=2GB\n50%".parse().unwrap();
        assert_eq!(table.entries().len(), 3);
        assert_eq!(table.target_for_hour(12), Some(FreeTarget::Hours(24.0)));
        assert_eq!(
            table.target_for_hour(22),
            Some(FreeTarget::Absolute(2_000_000_000))
        );
        assert_eq!(
            table.target_for_hour(3),
            Some(FreeTarget::Absolute(2_000_000_000))
        );
        // Both boundaries are inclusive, first match wins
        assert_eq!(table.target_for_hour(7), Some(FreeTarget::Hours(24.0)));
        assert_eq!(table.target_for_hour(19), Some(FreeTarget::Hours(24.0)));
        assert_eq!(table.to_string(), "7-19=24h;19-7=2.0GB;50%");
    }

    #[test]
    fn test_uncovered_hours_have_no_target() {
        let table: ThresholdTable = "8-17=1GB".parse().unwrap();
        assert_eq!(table.target_for_hour(18), None);
        assert_eq!(table.target_for_hour(7), None);
    }

    #[test]
    fn test_target_resolution() {
        let daily = 100_000;
        assert_eq!(FreeTarget::Percent(50.0).resolve(daily), 50_000);
        assert_eq!(FreeTarget::Hours(12.0).resolve(daily), 50_000);
        assert_eq!(FreeTarget::Hours(48.0).resolve(daily), 200_000);
        assert_eq!(FreeTarget::Absolute(7).resolve(daily), 7);
    }

    #[test]
    fn test_invalid_entries() {
        for table in ["24-3=1GB", "7=1GB", "7-8=lots", "a-b=1GB", "7-8=-5h"] {
            assert!(
                table.parse::<ThresholdTable>().is_err(),
                "{table} should be rejected"
            );
        }
    }
}
