use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::config::GroupConfig;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool, query};
use tokio::fs;

use super::gauge::SpaceGauge;
use super::{Availability, NewVolume, Volume, VolumeError, VolumeStatus};

const VOLUME_COLUMNS: &str = "pk, group_id, dir_path, status, availability, retrieve_aet, \
                              next_path, free_bytes, free_checked_at";

/// Persistent registry of volumes and gateway to their directories.
#[derive(Debug)]
pub struct VolumeRegistry {
    pool: SqlitePool,
    gauge: Arc<dyn SpaceGauge>,
    mount_failed_marker: String,
    auto_create_directories: bool,
}

fn volume_from_row(row: &SqliteRow) -> Result<Volume, VolumeError> {
    Ok(Volume {
        id: row.get("pk"),
        group_id: row.get("group_id"),
        path: row.get("dir_path"),
        status: VolumeStatus::from_code(row.get("status"))?,
        availability: Availability::from_code(row.get("availability"))?,
        retrieve_aet: row.get("retrieve_aet"),
        next: row.get("next_path"),
        cached_free_bytes: row
            .get::<Option<i64>, _>("free_bytes")
            .map(|bytes| bytes.max(0) as u64),
        free_checked_at: row
            .get::<Option<i64>, _>("free_checked_at")
            .and_then(DateTime::from_timestamp_millis),
    })
}

impl VolumeRegistry {
    pub fn new(pool: SqlitePool, gauge: Arc<dyn SpaceGauge>, group: &GroupConfig) -> Self {
        Self {
            pool,
            gauge,
            mount_failed_marker: group.mount_failed_marker.clone(),
            auto_create_directories: group.auto_create_directories,
        }
    }

    pub async fn volume(&self, id: i64) -> Result<Volume, VolumeError> {
        let sql = format!("SELECT {VOLUME_COLUMNS} FROM volumes WHERE pk = ?");
        match query(&sql).bind(id).fetch_optional(&self.pool).await? {
            Some(row) => volume_from_row(&row),
            None => Err(VolumeError::NotFound(id)),
        }
    }

    pub async fn volume_by_path(&self, path: &str) -> Result<Option<Volume>, VolumeError> {
        let sql = format!("SELECT {VOLUME_COLUMNS} FROM volumes WHERE dir_path = ?");
        query(&sql)
            .bind(path)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(volume_from_row)
            .transpose()
    }

    /// Volumes of a group ordered by id.
    pub async fn volumes_in_group(&self, group_id: &str) -> Result<Vec<Volume>, VolumeError> {
        let sql = format!("SELECT {VOLUME_COLUMNS} FROM volumes WHERE group_id = ? ORDER BY pk");
        query(&sql)
            .bind(group_id)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(volume_from_row)
            .collect()
    }

    pub async fn writable_default(&self, group_id: &str) -> Result<Option<Volume>, VolumeError> {
        let sql = format!(
            "SELECT {VOLUME_COLUMNS} FROM volumes \
             WHERE group_id = ? AND status = ? ORDER BY pk LIMIT 1"
        );
        query(&sql)
            .bind(group_id)
            .bind(VolumeStatus::WritableDefault.code())
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(volume_from_row)
            .transpose()
    }

    async fn validate_next(
        &self,
        group_id: &str,
        path: &str,
        next: Option<&str>,
        sole_member: bool,
    ) -> Result<(), VolumeError> {
        let Some(next) = next else {
            return Ok(());
        };
        if next == path {
            return if sole_member {
                Ok(())
            } else {
                Err(VolumeError::SelfReference(path.to_string()))
            };
        }
        // Ring members may be registered in any order, so unknown paths pass
        match self.volume_by_path(next).await? {
            Some(target) if target.group_id != group_id => Err(VolumeError::ForeignNext {
                path: path.to_string(),
                next: next.to_string(),
                group: target.group_id,
            }),
            _ => Ok(()),
        }
    }

    /// Register a volume. Adding a `WritableDefault` volume demotes the
    /// group's current default in the same transaction.
    pub async fn add_volume(&self, new: NewVolume) -> Result<Volume, VolumeError> {
        if self.volume_by_path(&new.path).await?.is_some() {
            return Err(VolumeError::DuplicatePath(new.path));
        }
        let sole_member = self.volumes_in_group(&new.group_id).await?.is_empty();
        self.validate_next(&new.group_id, &new.path, new.next.as_deref(), sole_member)
            .await?;

        let mut tx = self.pool.begin().await?;
        if new.status == VolumeStatus::WritableDefault {
            query("UPDATE volumes SET status = ? WHERE group_id = ? AND status = ?")
                .bind(VolumeStatus::Writable.code())
                .bind(&new.group_id)
                .bind(VolumeStatus::WritableDefault.code())
                .execute(&mut *tx)
                .await?;
        }
        let id = query(
            r#"
            INSERT INTO volumes (group_id, dir_path, status, availability, retrieve_aet, next_path)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&new.group_id)
        .bind(&new.path)
        .bind(new.status.code())
        .bind(new.availability.code())
        .bind(&new.retrieve_aet)
        .bind(&new.next)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();
        tx.commit().await?;

        tracing::info!(
            volume_id = id,
            group_id = %new.group_id,
            path = %new.path,
            status = %new.status,
            "Registered volume"
        );
        self.volume(id).await
    }

    /// Remove a volume, linking its ring predecessor to its successor.
    pub async fn remove_volume(&self, id: i64) -> Result<Volume, VolumeError> {
        let volume = self.volume(id).await?;
        let successor = volume.next.clone().filter(|next| next != &volume.path);

        let mut tx = self.pool.begin().await?;
        query("UPDATE volumes SET next_path = ? WHERE next_path = ? AND pk != ?")
            .bind(&successor)
            .bind(&volume.path)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        query("DELETE FROM volumes WHERE pk = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::info!(volume_id = id, path = %volume.path, "Removed volume");
        Ok(volume)
    }

    pub async fn update_status(
        &self,
        id: i64,
        status: VolumeStatus,
    ) -> Result<Volume, VolumeError> {
        let volume = self.volume(id).await?;

        let mut tx = self.pool.begin().await?;
        if status == VolumeStatus::WritableDefault {
            query("UPDATE volumes SET status = ? WHERE group_id = ? AND status = ? AND pk != ?")
                .bind(VolumeStatus::Writable.code())
                .bind(&volume.group_id)
                .bind(VolumeStatus::WritableDefault.code())
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        query("UPDATE volumes SET status = ? WHERE pk = ?")
            .bind(status.code())
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::info!(
            volume_id = id,
            from = %volume.status,
            to = %status,
            "Volume status changed"
        );
        self.volume(id).await
    }

    pub async fn update_next(&self, id: i64, next: Option<String>) -> Result<Volume, VolumeError> {
        let volume = self.volume(id).await?;
        let sole_member = self.volumes_in_group(&volume.group_id).await?.len() == 1;
        self.validate_next(&volume.group_id, &volume.path, next.as_deref(), sole_member)
            .await?;

        query("UPDATE volumes SET next_path = ? WHERE pk = ?")
            .bind(&next)
            .bind(id)
            .execute(&self.pool)
            .await?;
        self.volume(id).await
    }

    /// Absolute path of a file stored on `volume`.
    pub fn resolve_path(&self, volume: &Volume, relative: &str) -> PathBuf {
        Path::new(&volume.path).join(relative.trim_start_matches(['/', '\\']))
    }

    fn io_error(volume: &Volume, source: std::io::Error) -> VolumeError {
        VolumeError::Io {
            path: volume.path.clone(),
            source,
        }
    }

    async fn check_mount_marker(&self, volume: &Volume) -> Result<(), VolumeError> {
        let marker = Path::new(&volume.path).join(&self.mount_failed_marker);
        if fs::try_exists(&marker)
            .await
            .map_err(|e| Self::io_error(volume, e))?
        {
            return Err(VolumeError::MountFailed {
                path: volume.path.clone(),
                marker: self.mount_failed_marker.clone(),
            });
        }
        Ok(())
    }

    /// Ensure the volume directory exists and is mounted, creating it when
    /// auto-creation is enabled.
    async fn verify_directory(&self, volume: &Volume) -> Result<(), VolumeError> {
        match fs::metadata(&volume.path).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Err(VolumeError::DirectoryMissing(volume.path.clone())),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if !self.auto_create_directories {
                    return Err(VolumeError::DirectoryMissing(volume.path.clone()));
                }
                fs::create_dir_all(&volume.path)
                    .await
                    .map_err(|e| Self::io_error(volume, e))?;
                tracing::info!(
                    volume_id = volume.id,
                    path = %volume.path,
                    "Created missing volume directory"
                );
            }
            Err(e) => return Err(Self::io_error(volume, e)),
        }
        self.check_mount_marker(volume).await
    }

    /// Bytes available on the volume. Refreshes the cached free space.
    pub async fn free_bytes(&self, volume: &Volume) -> Result<u64, VolumeError> {
        self.verify_directory(volume).await?;

        let gauge = Arc::clone(&self.gauge);
        let path = PathBuf::from(&volume.path);
        let free = tokio::task::spawn_blocking(move || gauge.available_bytes(&path))
            .await?
            .map_err(|e| Self::io_error(volume, e))?;

        query("UPDATE volumes SET free_bytes = ?, free_checked_at = ? WHERE pk = ?")
            .bind(free.min(i64::MAX as u64) as i64)
            .bind(Utc::now().timestamp_millis())
            .bind(volume.id)
            .execute(&self.pool)
            .await?;

        tracing::debug!(volume_id = volume.id, free_bytes = free, "Measured free space");
        Ok(free)
    }

    pub async fn total_bytes(&self, volume: &Volume) -> Result<u64, VolumeError> {
        self.verify_directory(volume).await?;

        let gauge = Arc::clone(&self.gauge);
        let path = PathBuf::from(&volume.path);
        tokio::task::spawn_blocking(move || gauge.total_bytes(&path))
            .await?
            .map_err(|e| Self::io_error(volume, e))
    }

    /// Remove a file from a volume. Returns false if it did not exist.
    ///
    /// Never creates the volume directory: an unmounted volume fails instead
    /// of reporting its files as already gone.
    pub async fn unlink(&self, volume_id: i64, relative: &str) -> Result<bool, VolumeError> {
        let volume = self.volume(volume_id).await?;
        match fs::metadata(&volume.path).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Err(VolumeError::DirectoryMissing(volume.path.clone())),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(VolumeError::DirectoryMissing(volume.path.clone()));
            }
            Err(e) => return Err(Self::io_error(&volume, e)),
        }
        self.check_mount_marker(&volume).await?;

        let path = self.resolve_path(&volume, relative);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Self::io_error(&volume, e)),
        }
    }
}
