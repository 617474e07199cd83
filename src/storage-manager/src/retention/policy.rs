use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDate, TimeDelta, Timelike, Utc};
use common::config::RetentionConfig;
use common::units::{format_size, parse_size};

use super::RetentionConfigError;
use super::threshold::ThresholdTable;

#[derive(Debug, Clone)]
struct PolicyState {
    /// Age trigger, `None` when disabled
    max_age: Option<Duration>,
    /// Capacity driven deletion spares studies accessed more recently
    min_age: Duration,
    thresholds: ThresholdTable,
    expected_daily: u64,
    adjust_expected_daily: bool,
    last_adjusted: Option<NaiveDate>,
}

impl PolicyState {
    fn from_config(config: &RetentionConfig) -> Result<Self, RetentionConfigError> {
        let thresholds: ThresholdTable = config.free_space_thresholds.parse()?;
        let expected_daily = parse_size(&config.expected_daily_volume).map_err(|source| {
            RetentionConfigError::InvalidDailyVolume {
                value: config.expected_daily_volume.clone(),
                source,
            }
        })?;

        Ok(Self {
            max_age: Some(config.delete_if_not_accessed_for).filter(|age| !age.is_zero()),
            min_age: config.delete_only_if_not_accessed_for,
            thresholds,
            expected_daily,
            adjust_expected_daily: config.adjust_expected_daily_volume,
            last_adjusted: None,
        })
    }
}

fn cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    let age = TimeDelta::from_std(age).unwrap_or(TimeDelta::MAX);
    now.checked_sub_signed(age)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Age and capacity triggers of a storage group.
///
/// Reconfiguration validates the new settings first and keeps the active
/// ones when they are rejected.
#[derive(Debug)]
pub struct RetentionPolicy {
    state: RwLock<PolicyState>,
}

impl RetentionPolicy {
    pub fn new(config: &RetentionConfig) -> Result<Self, RetentionConfigError> {
        Ok(Self {
            state: RwLock::new(PolicyState::from_config(config)?),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, PolicyState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, PolicyState> {
        self.state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn reconfigure(&self, config: &RetentionConfig) -> Result<(), RetentionConfigError> {
        let next = PolicyState::from_config(config)?;
        *self.write() = next;
        tracing::info!("Retention policy reconfigured");
        Ok(())
    }

    /// Studies last accessed before this instant are always deleted.
    pub fn age_cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.read().max_age.map(|age| cutoff(now, age))
    }

    /// Capacity driven deletion only considers studies accessed before this.
    pub fn capacity_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        cutoff(now, self.read().min_age)
    }

    /// Bytes the capacity trigger must reclaim at `now`. The age trigger has
    /// no byte target and deletes everything behind [`Self::age_cutoff`].
    pub fn capacity_deficit(&self, now: DateTime<Utc>, usable_bytes: u64) -> u64 {
        self.deficit_at_hour(now.with_timezone(&Local).hour(), usable_bytes)
    }

    fn deficit_at_hour(&self, hour: u32, usable_bytes: u64) -> u64 {
        let state = self.read();
        state
            .thresholds
            .target_for_hour(hour)
            .map(|target| {
                target
                    .resolve(state.expected_daily)
                    .saturating_sub(usable_bytes)
            })
            .unwrap_or(0)
    }

    pub fn has_capacity_trigger(&self) -> bool {
        !self.read().thresholds.is_empty()
    }

    pub fn expected_daily_volume(&self) -> u64 {
        self.read().expected_daily
    }

    /// Whether the daily volume estimate may still be adjusted on `today`.
    pub fn needs_ingest_observation(&self, today: NaiveDate) -> bool {
        let state = self.read();
        state.adjust_expected_daily && state.last_adjusted != Some(today)
    }

    /// Feed the bytes ingested over the last 24 hours. Raises the daily
    /// volume estimate at most once per day and never lowers it.
    pub fn observe_ingest(&self, today: NaiveDate, ingested_bytes: u64) -> bool {
        let mut state = self.write();
        if !state.adjust_expected_daily || state.last_adjusted == Some(today) {
            return false;
        }
        state.last_adjusted = Some(today);
        if ingested_bytes <= state.expected_daily {
            return false;
        }

        tracing::info!(
            previous = %format_size(state.expected_daily),
            adjusted = %format_size(ingested_bytes),
            "Raised expected daily volume"
        );
        state.expected_daily = ingested_bytes;
        true
    }

    /// Human readable summary of the active deletion criteria.
    pub fn describe_criteria(&self) -> String {
        let state = self.read();
        let mut lines = Vec::new();

        match state.max_age {
            Some(age) => lines.push(format!(
                "Delete studies not accessed for {}",
                humantime::format_duration(age)
            )),
            None => lines.push("Age based deletion disabled".to_string()),
        }

        if state.thresholds.is_empty() {
            lines.push("Free space thresholds: NONE".to_string());
        } else {
            lines.push(format!(
                "Free space thresholds: {} (expected daily volume {})",
                state.thresholds,
                format_size(state.expected_daily)
            ));
            lines.push(format!(
                "Capacity driven deletion spares studies accessed within {}",
                humantime::format_duration(state.min_age)
            ));
        }

        if state.max_age.is_none() && state.thresholds.is_empty() {
            tracing::warn!("No deletion criteria configured, studies will never be deleted");
            lines.push("WARNING: no deletion criteria configured".to_string());
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(thresholds: &str, daily: &str) -> RetentionConfig {
        RetentionConfig {
            free_space_thresholds: thresholds.to_string(),
            expected_daily_volume: daily.to_string(),
            ..RetentionConfig::default()
        }
    }

    #[test]
    fn test_capacity_deficit_scenario() {
        let policy = RetentionPolicy::new(&config("0-23=50%", "100000")).unwrap();
        assert_eq!(policy.deficit_at_hour(0, 30_000), 20_000);
        assert_eq!(policy.deficit_at_hour(13, 30_000), 20_000);
        assert_eq!(policy.deficit_at_hour(13, 60_000), 0);
        assert_eq!(policy.capacity_deficit(Utc::now(), 30_000), 20_000);
    }

    #[test]
    fn test_age_trigger_has_no_byte_target() {
        let policy = RetentionPolicy::new(&RetentionConfig {
            delete_if_not_accessed_for: Duration::from_secs(86_400),
            ..RetentionConfig::default()
        })
        .unwrap();
        let now = Utc::now();
        assert_eq!(policy.capacity_deficit(now, 0), 0);
        assert_eq!(policy.age_cutoff(now), Some(now - TimeDelta::days(1)));
    }

    #[test]
    fn test_cutoffs() {
        let policy = RetentionPolicy::new(&RetentionConfig::default()).unwrap();
        let now = Utc::now();
        assert_eq!(policy.age_cutoff(now), None);
        assert_eq!(policy.capacity_cutoff(now), now - TimeDelta::hours(1));
        assert_eq!(policy.deficit_at_hour(12, 0), 0);
        assert!(!policy.has_capacity_trigger());
    }

    #[test]
    fn test_invalid_reconfigure_keeps_previous() {
        let policy = RetentionPolicy::new(&config("10GB", "1GB")).unwrap();
        assert!(policy.reconfigure(&config("25-3=1GB", "1GB")).is_err());
        assert!(policy.reconfigure(&config("10GB", "a lot")).is_err());
        assert_eq!(policy.deficit_at_hour(5, 0), 10_000_000_000);

        policy.reconfigure(&config("NONE", "1GB")).unwrap();
        assert_eq!(policy.deficit_at_hour(5, 0), 0);
    }

    #[test]
    fn test_expected_daily_volume_adjusts_once_per_day_upward() {
        let policy = RetentionPolicy::new(&config("24h", "1000")).unwrap();
        let monday = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
        let tuesday = monday.succ_opt().unwrap();

        assert!(policy.needs_ingest_observation(monday));
        assert!(policy.observe_ingest(monday, 5000));
        assert_eq!(policy.expected_daily_volume(), 5000);
        assert!(!policy.needs_ingest_observation(monday));
        assert!(!policy.observe_ingest(monday, 9000));
        assert_eq!(policy.expected_daily_volume(), 5000);

        assert!(!policy.observe_ingest(tuesday, 100));
        assert_eq!(policy.expected_daily_volume(), 5000);
        assert_eq!(policy.deficit_at_hour(0, 0), 5000);
    }

    #[test]
    fn test_adjustment_can_be_disabled() {
        let policy = RetentionPolicy::new(&RetentionConfig {
            adjust_expected_daily_volume: false,
            ..config("24h", "1000")
        })
        .unwrap();
        let today = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
        assert!(!policy.needs_ingest_observation(today));
        assert!(!policy.observe_ingest(today, 5000));
        assert_eq!(policy.expected_daily_volume(), 1000);
    }

    #[test]
    fn test_describe_criteria() {
        let none = RetentionPolicy::new(&RetentionConfig::default()).unwrap();
        assert!(none.describe_criteria().contains("no deletion criteria"));

        let policy = RetentionPolicy::new(&RetentionConfig {
            delete_if_not_accessed_for: Duration::from_secs(30 * 86_400),
            ..config("7-19=24h;19-7=2GB", "100MB")
        })
        .unwrap();
        let text = policy.describe_criteria();
        assert!(text.contains("Delete studies not accessed for 30days"));
        assert!(text.contains("7-19=24h;19-7=2.0GB"));
        assert!(!text.contains("WARNING"));
    }
}
