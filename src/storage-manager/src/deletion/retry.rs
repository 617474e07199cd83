//! Retry schedule for failed delete orders.
//!
//! A comma or semicolon separated list of delays indexed by failure count:
//! the first entry applies after the first failure. Entries are humantime
//! durations, `0` for an immediate retry or `NEVER` to stop retrying, and
//! may carry a repeat prefix (`5x10m`). Failures past the end of the list
//! are not retried. A schedule holds at most [`MAX_RETRIES`] entries.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RetryIntervalsError {
    #[error("Invalid retry interval '{token}': {reason}")]
    InvalidToken { token: String, reason: String },

    #[error("Invalid repeat count in '{0}'")]
    InvalidRepeat(String),

    #[error("Retry schedule exceeds {} entries", MAX_RETRIES)]
    TooManyRetries,
}

pub const MAX_RETRIES: usize = 1000;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryIntervals {
    delays: Vec<Option<Duration>>,
}

impl RetryIntervals {
    /// Delay before the next attempt after `failure_count` failures, `None`
    /// when the order should be dead-lettered.
    pub fn delay_for(&self, failure_count: u32) -> Option<Duration> {
        let index = (failure_count as usize).checked_sub(1)?;
        self.delays.get(index).copied().flatten()
    }

    pub fn len(&self) -> usize {
        self.delays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.delays.is_empty()
    }
}

fn parse_delay(token: &str) -> Result<Option<Duration>, RetryIntervalsError> {
    if token.eq_ignore_ascii_case("NEVER") {
        return Ok(None);
    }
    if token == "0" {
        return Ok(Some(Duration::ZERO));
    }
    humantime::parse_duration(token)
        .map(Some)
        .map_err(|e| RetryIntervalsError::InvalidToken {
            token: token.to_string(),
            reason: e.to_string(),
        })
}

impl FromStr for RetryIntervals {
    type Err = RetryIntervalsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut delays = Vec::new();
        for token in s.split([',', ';']).map(str::trim).filter(|t| !t.is_empty()) {
            let (count, delay) = match token.split_once(['x', 'X']) {
                Some((count, delay))
                    if !count.is_empty() && count.chars().all(|c| c.is_ascii_digit()) =>
                {
                    let count = match count.parse::<usize>() {
                        Ok(count) if (1..=MAX_RETRIES).contains(&count) => count,
                        _ => return Err(RetryIntervalsError::InvalidRepeat(token.to_string())),
                    };
                    (count, delay.trim())
                }
                _ => (1, token),
            };
            let delay = parse_delay(delay)?;
            if delays.len() + count > MAX_RETRIES {
                return Err(RetryIntervalsError::TooManyRetries);
            }
            delays.extend(std::iter::repeat_n(delay, count));
        }
        Ok(Self { delays })
    }
}

impl fmt::Display for RetryIntervals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tokens: Vec<String> = self
            .delays
            .iter()
            .map(|delay| match delay {
                None => "NEVER".to_string(),
                Some(d) => humantime::format_duration(*d).to_string(),
            })
            .collect();
        f.write_str(&tokens.join(", "))
    }
}
