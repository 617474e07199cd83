//! Test configuration builder for creating test setups quickly.

use std::path::Path;
use std::time::Duration;

use crate::config::{Configuration, DatabaseConfig, QueueBackend, VolumeSeedConfig};
use crate::units::MinFreeSpace;

/// Builder for creating test configurations.
///
/// Provides a fluent API for creating configurations suitable for testing,
/// with sensible defaults that can be customized as needed.
#[derive(Debug, Clone)]
pub struct TestConfigBuilder {
    config: Configuration,
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TestConfigBuilder {
    /// Create a new test configuration builder with sensible defaults.
    ///
    /// Free space checks run on every call and no fallback directory is
    /// configured, so tests decide explicitly which volumes exist.
    pub fn new() -> Self {
        let mut config = Configuration::default();
        config.group.fallback_directory = None;
        config.group.min_free_space = MinFreeSpace::None;
        config.group.check_free_space_min_interval = Duration::from_millis(1);
        config.group.check_free_space_max_interval = Duration::from_millis(1);
        config.queue.poll_interval = Duration::from_millis(10);
        Self { config }
    }

    /// Configure for fully in-memory operation (fastest for tests).
    ///
    /// This sets:
    /// - Database DSN to `sqlite::memory:`
    /// - Queue backend to the in-memory queue
    pub fn in_memory(mut self) -> Self {
        self.config.database = DatabaseConfig::in_memory();
        self.config.queue.backend = QueueBackend::Memory;
        self
    }

    /// Register `count` volumes `vol0..volN` under `root`, linked as a ring.
    ///
    /// The first volume is the writable default.
    pub fn with_volumes_under(mut self, root: &str, count: usize) -> Self {
        let root = Path::new(root);
        let paths: Vec<String> = (0..count)
            .map(|i| root.join(format!("vol{i}")).to_string_lossy().into_owned())
            .collect();

        self.config.group.volumes = paths
            .iter()
            .enumerate()
            .map(|(i, path)| VolumeSeedConfig {
                path: path.clone(),
                status: if i == 0 {
                    "writable-default".to_string()
                } else {
                    "writable".to_string()
                },
                availability: "online".to_string(),
                next: if count > 1 {
                    Some(paths[(i + 1) % count].clone())
                } else {
                    None
                },
            })
            .collect();
        self
    }

    /// Set the group identifier.
    pub fn with_group(mut self, group_id: &str) -> Self {
        self.config.group.id = group_id.to_string();
        self
    }

    /// Set the minimum free space per volume.
    pub fn with_min_free_space(mut self, min_free: MinFreeSpace) -> Self {
        self.config.group.min_free_space = min_free;
        self
    }

    /// Set the fallback directory used when the group has no volume.
    pub fn with_fallback_directory(mut self, dir: &str) -> Self {
        self.config.group.fallback_directory = Some(dir.to_string());
        self
    }

    /// Set the database DSN.
    pub fn with_database_dsn(mut self, dsn: &str) -> Self {
        self.config.database.dsn = dsn.to_string();
        self
    }

    /// Use the file queue in `dir`.
    pub fn with_file_queue(mut self, dir: &str) -> Self {
        self.config.queue.backend = QueueBackend::File;
        self.config.queue.dir = dir.to_string();
        self
    }

    /// Delete studies not accessed for `age` regardless of free space.
    pub fn with_max_age(mut self, age: Duration) -> Self {
        self.config.retention.delete_if_not_accessed_for = age;
        self
    }

    /// Set the hour-of-day free space threshold table.
    pub fn with_thresholds(mut self, table: &str, expected_daily_volume: &str) -> Self {
        self.config.retention.free_space_thresholds = table.to_string();
        self.config.retention.expected_daily_volume = expected_daily_volume.to_string();
        self
    }

    /// Set the scheduler batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.config.scheduler.batch_size = batch_size;
        self
    }

    /// Set the delete order retry intervals.
    pub fn with_retry_intervals(mut self, intervals: &str) -> Self {
        self.config.processor.retry_intervals = intervals.to_string();
        self
    }

    /// Build the final configuration.
    pub fn build(self) -> Configuration {
        self.config
    }
}
