//! Shared setup for the storage manager integration tests.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, TimeDelta, Utc};
use common::config::Configuration;
use common::testing::TestConfigBuilder;
use storage_manager::store::StoredObject;
use storage_manager::testing::FixedSpaceGauge;
use storage_manager::{ArchiveEvent, StorageManager, StorageManagerBuilder};
use tempfile::TempDir;
use tokio::sync::broadcast;

pub const GB: u64 = 1_000_000_000;

/// A storage manager over volumes in a temporary directory.
pub struct TestArchive {
    pub dir: TempDir,
    pub gauge: Arc<FixedSpaceGauge>,
    pub manager: StorageManager,
    files: AtomicUsize,
}

impl TestArchive {
    /// `volumes` ring members `vol0..volN`, plenty of free space on each.
    pub async fn new(volumes: usize, configure: impl FnOnce(&mut Configuration)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = TestConfigBuilder::new()
            .in_memory()
            .with_volumes_under(&dir.path().to_string_lossy(), volumes)
            .build();
        configure(&mut config);
        Self::with_config(dir, config).await
    }

    pub async fn with_config(dir: TempDir, config: Configuration) -> Self {
        let gauge = Arc::new(FixedSpaceGauge::with_default(10 * GB, 20 * GB));
        let manager = StorageManagerBuilder::new(config)
            .with_gauge(gauge.clone())
            .build()
            .await
            .unwrap();
        Self {
            dir,
            gauge,
            manager,
            files: AtomicUsize::new(0),
        }
    }

    /// Shut the manager down and build a new one over the same database,
    /// queue and volumes. Only meaningful with a file database.
    pub async fn restart(self) -> Self {
        let Self {
            dir,
            gauge,
            manager,
            files,
        } = self;
        let config = manager.config().clone();
        manager.stop().await;
        manager.database().pool().close().await;
        drop(manager);

        let manager = StorageManagerBuilder::new(config)
            .with_gauge(gauge.clone())
            .build()
            .await
            .unwrap();
        Self {
            dir,
            gauge,
            manager,
            files,
        }
    }

    pub fn volume_path(&self, i: usize) -> PathBuf {
        self.dir.path().join(format!("vol{i}"))
    }

    /// Store a file last accessed `age` ago on the write volume.
    pub async fn store(&self, study: &str, series: &str, size: u64, age: TimeDelta) -> PathBuf {
        self.store_at(study, series, size, Utc::now() - age, None)
            .await
    }

    /// Write a file to the current write volume and index it.
    pub async fn store_at(
        &self,
        study: &str,
        series: &str,
        size: u64,
        accessed: DateTime<Utc>,
        external_aet: Option<&str>,
    ) -> PathBuf {
        let volume = self.manager.write_volume().await.unwrap();
        let n = self.files.fetch_add(1, Ordering::SeqCst);
        let relative = format!("{study}/{series}/{n}.dcm");

        let path = self.manager.registry().resolve_path(&volume, &relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"DICM").unwrap();

        // Stored long ago, so ingest observation does not raise the daily volume
        let mut object = StoredObject::new(study, series, volume.id, relative, size)
            .accessed_at(accessed)
            .stored_at(accessed);
        if let Some(aet) = external_aet {
            object = object.with_external_retrieve_aet(aet);
        }
        self.manager
            .index()
            .record_stored_file(&object)
            .await
            .unwrap();
        path
    }
}

/// Events received so far.
pub fn drain_events(rx: &mut broadcast::Receiver<ArchiveEvent>) -> Vec<ArchiveEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn days(n: i64) -> TimeDelta {
    TimeDelta::days(n)
}
