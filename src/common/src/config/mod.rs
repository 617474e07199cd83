use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

use crate::units::MinFreeSpace;

pub const DEFAULT_CONFIG_FILE: &str = "pacs-archive.toml";
pub const ENV_PREFIX: &str = "PACS__";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub dsn: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            dsn: String::from("sqlite://.data/archive.db"),
        }
    }
}

impl DatabaseConfig {
    /// Create an in-memory database configuration for tests and demos
    pub fn in_memory() -> Self {
        Self {
            dsn: String::from("sqlite::memory:"),
        }
    }
}

/// Backend used for the delete order queue
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    Memory,
    File,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueConfig {
    pub backend: QueueBackend,
    /// Directory holding queued messages when the file backend is used
    pub dir: String,
    /// How often consumers poll for due messages
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackend::File,
            dir: ".data/queue".to_string(),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// A volume registered at startup if its directory is not yet known.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VolumeSeedConfig {
    pub path: String,
    #[serde(default = "default_seed_status")]
    pub status: String,
    #[serde(default = "default_seed_availability")]
    pub availability: String,
    #[serde(default)]
    pub next: Option<String>,
}

fn default_seed_status() -> String {
    "writable".to_string()
}

fn default_seed_availability() -> String {
    "online".to_string()
}

/// Storage group managed by this instance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Logical pool name
    pub id: String,
    /// AE title remote readers use to retrieve files from this group
    pub retrieve_aet: String,
    /// Availability a volume must have to receive writes
    pub availability: String,
    /// `NONE`, an absolute size or a percentage of the volume capacity
    pub min_free_space: MinFreeSpace,
    /// Lower bound of the free space check interval
    #[serde(with = "humantime_serde")]
    pub check_free_space_min_interval: Duration,
    /// Upper bound of the free space check interval
    #[serde(with = "humantime_serde")]
    pub check_free_space_max_interval: Duration,
    /// Directory used to provision a volume when the group has none
    #[serde(default)]
    pub fallback_directory: Option<String>,
    /// Marker file whose presence means the mount is broken
    pub mount_failed_marker: String,
    /// Create missing volume directories instead of failing
    pub auto_create_directories: bool,
    #[serde(default)]
    pub volumes: Vec<VolumeSeedConfig>,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            id: "ONLINE_STORAGE".to_string(),
            retrieve_aet: "ARCHIVE".to_string(),
            availability: "online".to_string(),
            min_free_space: MinFreeSpace::Absolute(50_000_000),
            check_free_space_min_interval: Duration::from_secs(60),
            check_free_space_max_interval: Duration::from_secs(3600),
            fallback_directory: Some(".data/archive".to_string()),
            mount_failed_marker: "NO_MOUNT".to_string(),
            auto_create_directories: true,
            volumes: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Studies not accessed for longer than this are always deleted (0 disables)
    #[serde(with = "humantime_serde")]
    pub delete_if_not_accessed_for: Duration,
    /// Capacity driven deletion never touches studies accessed more recently
    #[serde(with = "humantime_serde")]
    pub delete_only_if_not_accessed_for: Duration,
    /// Hour-of-day table of free space targets, `NONE` disables
    pub free_space_thresholds: String,
    /// Estimated volume of data received per day
    pub expected_daily_volume: String,
    /// Raise the estimate from the volume actually received in the last 24h
    pub adjust_expected_daily_volume: bool,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            delete_if_not_accessed_for: Duration::ZERO,
            delete_only_if_not_accessed_for: Duration::from_secs(3600),
            free_space_thresholds: "NONE".to_string(),
            expected_daily_volume: "100MB".to_string(),
            adjust_expected_daily_volume: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub enabled: bool,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    pub batch_size: usize,
    /// Delete single series instead of whole studies
    pub delete_series_individually: bool,
    /// Only delete studies that can be retrieved from their external AE
    pub delete_only_if_external_retrievable: bool,
    /// Only delete studies that also have a copy on this group
    #[serde(default)]
    pub delete_only_if_copy_on_group: Option<String>,
    /// Log candidates without claiming them
    pub dry_run: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(600),
            batch_size: 100,
            delete_series_individually: false,
            delete_only_if_external_retrievable: false,
            delete_only_if_copy_on_group: None,
            dry_run: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Comma separated retry delays indexed by failure count
    pub retry_intervals: String,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            retry_intervals: "0, 1m, 5x10m, 1h, NEVER".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrphanSweepConfig {
    pub enabled: bool,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    pub batch_size: usize,
}

impl Default for OrphanSweepConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(3600),
            batch_size: 1000,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Configuration {
    pub database: DatabaseConfig,
    pub queue: QueueConfig,
    pub group: GroupConfig,
    pub retention: RetentionConfig,
    pub scheduler: SchedulerConfig,
    pub processor: ProcessorConfig,
    pub orphan: OrphanSweepConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl Configuration {
    /// Load from `pacs-archive.toml` and `PACS__` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path(Path::new(DEFAULT_CONFIG_FILE))
    }

    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let config: Configuration = Figment::from(Serialized::defaults(Configuration::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(Box::new)?;

        config.validate()?;
        Ok(config)
    }

    /// Structural checks. Text settings such as threshold tables are
    /// validated by the components that parse them.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.group.id.trim().is_empty() {
            return Err(ConfigError::Invalid("group.id must not be empty".into()));
        }
        if self.group.check_free_space_min_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "group.check_free_space_min_interval must be positive".into(),
            ));
        }
        if self.group.check_free_space_max_interval < self.group.check_free_space_min_interval {
            return Err(ConfigError::Invalid(format!(
                "group.check_free_space_max_interval ({}) is shorter than the minimum ({})",
                humantime::format_duration(self.group.check_free_space_max_interval),
                humantime::format_duration(self.group.check_free_space_min_interval),
            )));
        }
        if self.scheduler.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.batch_size must be positive".into(),
            ));
        }
        if self.scheduler.interval.is_zero() {
            return Err(ConfigError::Invalid(
                "scheduler.interval must be positive".into(),
            ));
        }
        if self.orphan.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "orphan.batch_size must be positive".into(),
            ));
        }
        if self.orphan.interval.is_zero() {
            return Err(ConfigError::Invalid("orphan.interval must be positive".into()));
        }
        if self.queue.poll_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "queue.poll_interval must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_default_configuration_is_valid() {
        let config = Configuration::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.database.dsn, "sqlite://.data/archive.db");
        assert_eq!(config.group.mount_failed_marker, "NO_MOUNT");
        assert_eq!(config.retention.delete_if_not_accessed_for, Duration::ZERO);
    }

    #[test]
    fn test_configless_operation() {
        let config = Figment::from(Serialized::defaults(Configuration::default()))
            .extract::<Configuration>()
            .unwrap();

        assert_eq!(config.scheduler.batch_size, 100);
        assert_eq!(config.queue.backend, QueueBackend::File);
    }

    #[test]
    fn test_toml_and_env_layering() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "archive.toml",
                r#"
                [group]
                id = "FAST"
                min_free_space = "10%"
                check_free_space_min_interval = "30s"

                [retention]
                delete_if_not_accessed_for = "365days"
                free_space_thresholds = "7-19=24h;19-7=2GB"

                [[group.volumes]]
                path = "/mnt/a"
                next = "/mnt/b"
                "#,
            )?;
            jail.set_env("PACS__SCHEDULER__BATCH_SIZE", "25");
            jail.set_env("PACS__DATABASE__DSN", "sqlite://./test.db");

            let config = Configuration::load_from_path(Path::new("archive.toml"))
                .map_err(|e| e.to_string())?;

            assert_eq!(config.group.id, "FAST");
            assert_eq!(config.group.min_free_space, MinFreeSpace::Percent(10.0));
            assert_eq!(
                config.group.check_free_space_min_interval,
                Duration::from_secs(30)
            );
            assert_eq!(
                config.retention.delete_if_not_accessed_for,
                Duration::from_secs(365 * 86400)
            );
            assert_eq!(config.retention.free_space_thresholds, "7-19=24h;19-7=2GB");
            assert_eq!(config.group.volumes.len(), 1);
            assert_eq!(config.group.volumes[0].status, "writable");
            assert_eq!(config.group.volumes[0].next.as_deref(), Some("/mnt/b"));
            assert_eq!(config.scheduler.batch_size, 25);
            assert_eq!(config.database.dsn, "sqlite://./test.db");
            Ok(())
        });
    }

    #[test]
    fn test_zero_batch_size_is_rejected() {
        Jail::expect_with(|jail| {
            jail.set_env("PACS__SCHEDULER__BATCH_SIZE", "0");
            let result = Configuration::load_from_path(Path::new("missing.toml"));
            assert!(matches!(result, Err(ConfigError::Invalid(_))));
            Ok(())
        });
    }

    #[test]
    fn test_inverted_check_intervals_are_rejected() {
        let mut config = Configuration::default();
        config.group.check_free_space_max_interval = Duration::from_secs(1);
        assert!(config.validate().is_err());
    }
}
