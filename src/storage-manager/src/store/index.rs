use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool, query};
use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid timestamp {0} in archive index")]
    InvalidTimestamp(i64),
}

/// Granularity at which retention deletes data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateLevel {
    Study,
    Series,
}

impl fmt::Display for CandidateLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CandidateLevel::Study => write!(f, "study"),
            CandidateLevel::Series => write!(f, "series"),
        }
    }
}

/// Identity of a deletable unit, carried inside delete orders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateRef {
    pub level: CandidateLevel,
    pub pk: i64,
    /// Study or series instance UID, depending on `level`
    pub iuid: String,
    pub study_iuid: String,
}

/// A study or series eligible for deletion from a storage group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionCandidate {
    pub level: CandidateLevel,
    pub pk: i64,
    pub iuid: String,
    pub study_iuid: String,
    pub volume_id: i64,
    /// Bytes the unit occupies on the group
    pub size_bytes: u64,
    pub access_time: DateTime<Utc>,
    pub external_retrieve_aet: Option<String>,
}

impl DeletionCandidate {
    pub fn reference(&self) -> CandidateRef {
        CandidateRef {
            level: self.level,
            pk: self.pk,
            iuid: self.iuid.clone(),
            study_iuid: self.study_iuid.clone(),
        }
    }
}

/// Position of a pass in `(access_time, pk)` order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Watermark {
    pub access_time: DateTime<Utc>,
    pub pk: i64,
}

impl Watermark {
    /// Before every candidate.
    pub const START: Watermark = Watermark {
        access_time: DateTime::<Utc>::MIN_UTC,
        pk: 0,
    };

    pub fn of(candidate: &DeletionCandidate) -> Self {
        Self {
            access_time: candidate.access_time,
            pk: candidate.pk,
        }
    }
}

/// Page of unclaimed candidates past `after` and accessed before `before`.
#[derive(Debug, Clone)]
pub struct CandidateQuery {
    pub group_id: String,
    pub level: CandidateLevel,
    pub after: Watermark,
    pub before: DateTime<Utc>,
    pub limit: usize,
}

/// File row of the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub pk: i64,
    pub volume_id: i64,
    /// Path relative to the volume directory
    pub path: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Index rows removed; the returned files are now orphans awaiting unlink
    Deleted { files: Vec<StoredFile> },
    /// Nothing of the unit is left on the group
    AlreadyGone,
    /// The unit was written to or accessed after it was claimed
    ClaimRevoked,
}

/// Object written to a volume, as reported by the ingest path.
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub study_iuid: String,
    pub series_iuid: String,
    pub volume_id: i64,
    pub path: String,
    pub size: u64,
    pub access_time: DateTime<Utc>,
    pub stored_at: DateTime<Utc>,
    pub external_retrieve_aet: Option<String>,
}

impl StoredObject {
    pub fn new(
        study_iuid: impl Into<String>,
        series_iuid: impl Into<String>,
        volume_id: i64,
        path: impl Into<String>,
        size: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            study_iuid: study_iuid.into(),
            series_iuid: series_iuid.into(),
            volume_id,
            path: path.into(),
            size,
            access_time: now,
            stored_at: now,
            external_retrieve_aet: None,
        }
    }

    pub fn accessed_at(mut self, access_time: DateTime<Utc>) -> Self {
        self.access_time = access_time;
        self
    }

    pub fn stored_at(mut self, stored_at: DateTime<Utc>) -> Self {
        self.stored_at = stored_at;
        self
    }

    pub fn with_external_retrieve_aet(mut self, aet: impl Into<String>) -> Self {
        self.external_retrieve_aet = Some(aet.into());
        self
    }
}

/// Queries and mutations of the study/series/file index used by retention.
#[async_trait]
pub trait ArchiveIndex: fmt::Debug + Send + Sync + 'static {
    /// Register a stored file, creating study and series rows on demand.
    /// A pending claim on the study or series is revoked.
    async fn record_stored_file(&self, object: &StoredObject) -> Result<i64, IndexError>;

    /// Move the access time of a study and its series forward, revoking
    /// pending claims on them.
    async fn record_access(&self, study_iuid: &str, at: DateTime<Utc>) -> Result<(), IndexError>;

    /// Unclaimed candidates ordered by access time, then primary key.
    async fn find_candidates(
        &self,
        query: &CandidateQuery,
    ) -> Result<Vec<DeletionCandidate>, IndexError>;

    /// Claim a unit. Returns false if it was already claimed or is gone.
    async fn mark_for_deletion(&self, level: CandidateLevel, pk: i64) -> Result<bool, IndexError>;

    async fn unmark(&self, level: CandidateLevel, pk: i64) -> Result<(), IndexError>;

    async fn has_copy_on_group(&self, study_iuid: &str, group_id: &str)
    -> Result<bool, IndexError>;

    /// Remove the index rows of a unit on `group_id` in one transaction and
    /// return its files, which stay behind as orphan rows until unlinked.
    /// A unit whose claim was revoked is left untouched.
    async fn delete_unit(
        &self,
        unit: &CandidateRef,
        group_id: &str,
    ) -> Result<DeleteOutcome, IndexError>;

    /// Orphan file rows of the group with `pk > after_pk`, ascending.
    async fn orphaned_files(
        &self,
        group_id: &str,
        after_pk: i64,
        limit: usize,
    ) -> Result<Vec<StoredFile>, IndexError>;

    /// Delete an orphan file row. Returns false if no such orphan exists.
    async fn remove_file_record(&self, pk: i64) -> Result<bool, IndexError>;

    /// Bytes stored on the group since `since`.
    async fn ingested_bytes_since(
        &self,
        group_id: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, IndexError>;
}

#[derive(Debug, Clone)]
pub struct SqliteIndex {
    pool: SqlitePool,
}

impl SqliteIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, IndexError> {
    DateTime::from_timestamp_millis(ms).ok_or(IndexError::InvalidTimestamp(ms))
}

fn stored_file(row: &SqliteRow) -> StoredFile {
    StoredFile {
        pk: row.get("pk"),
        volume_id: row.get("volume_pk"),
        path: row.get("file_path"),
        size: row.get::<i64, _>("file_size").max(0) as u64,
    }
}

const STUDY_CANDIDATES: &str = r#"
    SELECT st.pk AS pk, st.study_iuid AS iuid, st.study_iuid AS study_iuid,
           st.access_time AS access_time, st.external_retrieve_aet AS external_retrieve_aet,
           MIN(f.volume_pk) AS volume_pk, COALESCE(SUM(f.file_size), 0) AS size_bytes
    FROM studies st
    JOIN series se ON se.study_pk = st.pk
    JOIN files f ON f.series_pk = se.pk
    JOIN volumes v ON v.pk = f.volume_pk
    WHERE v.group_id = ? AND st.deletion_marked = 0
      AND (st.access_time > ? OR (st.access_time = ? AND st.pk > ?))
      AND st.access_time < ?
    GROUP BY st.pk
    ORDER BY st.access_time, st.pk
    LIMIT ?
"#;

const SERIES_CANDIDATES: &str = r#"
    SELECT se.pk AS pk, se.series_iuid AS iuid, st.study_iuid AS study_iuid,
           se.access_time AS access_time, st.external_retrieve_aet AS external_retrieve_aet,
           MIN(f.volume_pk) AS volume_pk, COALESCE(SUM(f.file_size), 0) AS size_bytes
    FROM series se
    JOIN studies st ON st.pk = se.study_pk
    JOIN files f ON f.series_pk = se.pk
    JOIN volumes v ON v.pk = f.volume_pk
    WHERE v.group_id = ? AND se.deletion_marked = 0 AND st.deletion_marked = 0
      AND (se.access_time > ? OR (se.access_time = ? AND se.pk > ?))
      AND se.access_time < ?
    GROUP BY se.pk
    ORDER BY se.access_time, se.pk
    LIMIT ?
"#;

#[async_trait]
impl ArchiveIndex for SqliteIndex {
    async fn record_stored_file(&self, object: &StoredObject) -> Result<i64, IndexError> {
        let mut tx = self.pool.begin().await?;
        let access = to_millis(object.access_time);

        query(
            r#"
            INSERT INTO studies (study_iuid, access_time, external_retrieve_aet)
            VALUES (?, ?, ?)
            ON CONFLICT(study_iuid) DO UPDATE SET
                access_time = MAX(access_time, excluded.access_time),
                external_retrieve_aet =
                    COALESCE(excluded.external_retrieve_aet, external_retrieve_aet),
                deletion_marked = 0
            "#,
        )
        .bind(&object.study_iuid)
        .bind(access)
        .bind(&object.external_retrieve_aet)
        .execute(&mut *tx)
        .await?;
        let study_pk: i64 = query("SELECT pk FROM studies WHERE study_iuid = ?")
            .bind(&object.study_iuid)
            .fetch_one(&mut *tx)
            .await?
            .get("pk");

        query(
            r#"
            INSERT INTO series (study_pk, series_iuid, access_time)
            VALUES (?, ?, ?)
            ON CONFLICT(series_iuid) DO UPDATE SET
                access_time = MAX(access_time, excluded.access_time),
                deletion_marked = 0
            "#,
        )
        .bind(study_pk)
        .bind(&object.series_iuid)
        .bind(access)
        .execute(&mut *tx)
        .await?;
        let series_pk: i64 = query("SELECT pk FROM series WHERE series_iuid = ?")
            .bind(&object.series_iuid)
            .fetch_one(&mut *tx)
            .await?
            .get("pk");

        let file_pk = query(
            r#"
            INSERT INTO files (volume_pk, series_pk, file_path, file_size, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(object.volume_id)
        .bind(series_pk)
        .bind(&object.path)
        .bind(object.size as i64)
        .bind(to_millis(object.stored_at))
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        tx.commit().await?;
        Ok(file_pk)
    }

    async fn record_access(&self, study_iuid: &str, at: DateTime<Utc>) -> Result<(), IndexError> {
        let at = to_millis(at);
        let mut tx = self.pool.begin().await?;
        query(
            r#"
            UPDATE studies SET access_time = MAX(access_time, ?), deletion_marked = 0
            WHERE study_iuid = ?
            "#,
        )
            .bind(at)
            .bind(study_iuid)
            .execute(&mut *tx)
            .await?;
        query(
            r#"
            UPDATE series SET access_time = MAX(access_time, ?), deletion_marked = 0
            WHERE study_pk IN (SELECT pk FROM studies WHERE study_iuid = ?)
            "#,
        )
        .bind(at)
        .bind(study_iuid)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn find_candidates(
        &self,
        candidates: &CandidateQuery,
    ) -> Result<Vec<DeletionCandidate>, IndexError> {
        let sql = match candidates.level {
            CandidateLevel::Study => STUDY_CANDIDATES,
            CandidateLevel::Series => SERIES_CANDIDATES,
        };
        let after = to_millis(candidates.after.access_time);
        let rows = query(sql)
            .bind(&candidates.group_id)
            .bind(after)
            .bind(after)
            .bind(candidates.after.pk)
            .bind(to_millis(candidates.before))
            .bind(candidates.limit as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                Ok(DeletionCandidate {
                    level: candidates.level,
                    pk: row.get("pk"),
                    iuid: row.get("iuid"),
                    study_iuid: row.get("study_iuid"),
                    volume_id: row.get("volume_pk"),
                    size_bytes: row.get::<i64, _>("size_bytes").max(0) as u64,
                    access_time: from_millis(row.get("access_time"))?,
                    external_retrieve_aet: row.get("external_retrieve_aet"),
                })
            })
            .collect()
    }

    async fn mark_for_deletion(&self, level: CandidateLevel, pk: i64) -> Result<bool, IndexError> {
        let sql = match level {
            CandidateLevel::Study => {
                "UPDATE studies SET deletion_marked = 1 WHERE pk = ? AND deletion_marked = 0"
            }
            CandidateLevel::Series => {
                "UPDATE series SET deletion_marked = 1 WHERE pk = ? AND deletion_marked = 0"
            }
        };
        let result = query(sql).bind(pk).execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }

    async fn unmark(&self, level: CandidateLevel, pk: i64) -> Result<(), IndexError> {
        let sql = match level {
            CandidateLevel::Study => "UPDATE studies SET deletion_marked = 0 WHERE pk = ?",
            CandidateLevel::Series => "UPDATE series SET deletion_marked = 0 WHERE pk = ?",
        };
        query(sql).bind(pk).execute(&self.pool).await?;
        Ok(())
    }

    async fn has_copy_on_group(
        &self,
        study_iuid: &str,
        group_id: &str,
    ) -> Result<bool, IndexError> {
        let row = query(
            r#"
            SELECT COUNT(*) AS copies
            FROM files f
            JOIN series se ON se.pk = f.series_pk
            JOIN studies st ON st.pk = se.study_pk
            JOIN volumes v ON v.pk = f.volume_pk
            WHERE st.study_iuid = ? AND v.group_id = ?
            "#,
        )
        .bind(study_iuid)
        .bind(group_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("copies") > 0)
    }

    async fn delete_unit(
        &self,
        unit: &CandidateRef,
        group_id: &str,
    ) -> Result<DeleteOutcome, IndexError> {
        let mut tx = self.pool.begin().await?;

        let (study_pk, file_filter) = match unit.level {
            CandidateLevel::Study => {
                let found = query(
                    "SELECT deletion_marked FROM studies WHERE pk = ? AND study_iuid = ?",
                )
                .bind(unit.pk)
                .bind(&unit.iuid)
                .fetch_optional(&mut *tx)
                .await?;
                let Some(row) = found else {
                    return Ok(DeleteOutcome::AlreadyGone);
                };
                if row.get::<i64, _>("deletion_marked") == 0 {
                    return Ok(DeleteOutcome::ClaimRevoked);
                }
                (unit.pk, "se.study_pk = ?")
            }
            CandidateLevel::Series => {
                let found = query(
                    "SELECT study_pk, deletion_marked FROM series WHERE pk = ? AND series_iuid = ?",
                )
                .bind(unit.pk)
                .bind(&unit.iuid)
                .fetch_optional(&mut *tx)
                .await?;
                let Some(row) = found else {
                    return Ok(DeleteOutcome::AlreadyGone);
                };
                if row.get::<i64, _>("deletion_marked") == 0 {
                    return Ok(DeleteOutcome::ClaimRevoked);
                }
                (row.get::<i64, _>("study_pk"), "se.pk = ?")
            }
        };

        let select_files = format!(
            r#"
            SELECT f.pk AS pk, f.volume_pk AS volume_pk, f.file_path AS file_path, f.file_size AS file_size
            FROM files f
            JOIN series se ON se.pk = f.series_pk
            JOIN volumes v ON v.pk = f.volume_pk
            WHERE {file_filter} AND v.group_id = ?
            ORDER BY f.pk
            "#
        );
        let files: Vec<StoredFile> = query(&select_files)
            .bind(unit.pk)
            .bind(group_id)
            .fetch_all(&mut *tx)
            .await?
            .iter()
            .map(stored_file)
            .collect();

        if files.is_empty() {
            // Rows survive because another group still holds copies
            let unmark = match unit.level {
                CandidateLevel::Study => "UPDATE studies SET deletion_marked = 0 WHERE pk = ?",
                CandidateLevel::Series => "UPDATE series SET deletion_marked = 0 WHERE pk = ?",
            };
            query(unmark).bind(unit.pk).execute(&mut *tx).await?;
            tx.commit().await?;
            return Ok(DeleteOutcome::AlreadyGone);
        }

        let orphan_files = format!(
            r#"
            UPDATE files SET series_pk = NULL
            WHERE pk IN (
                SELECT f.pk FROM files f
                JOIN series se ON se.pk = f.series_pk
                JOIN volumes v ON v.pk = f.volume_pk
                WHERE {file_filter} AND v.group_id = ?
            )
            "#
        );
        query(&orphan_files)
            .bind(unit.pk)
            .bind(group_id)
            .execute(&mut *tx)
            .await?;

        query(
            r#"
            DELETE FROM series
            WHERE study_pk = ? AND NOT EXISTS (SELECT 1 FROM files f WHERE f.series_pk = series.pk)
            "#,
        )
        .bind(study_pk)
        .execute(&mut *tx)
        .await?;

        if unit.level == CandidateLevel::Series {
            query("UPDATE series SET deletion_marked = 0 WHERE pk = ?")
                .bind(unit.pk)
                .execute(&mut *tx)
                .await?;
        }

        let study_removed = query(
            r#"
            DELETE FROM studies
            WHERE pk = ? AND NOT EXISTS (SELECT 1 FROM series se WHERE se.study_pk = studies.pk)
            "#,
        )
        .bind(study_pk)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        if !study_removed && unit.level == CandidateLevel::Study {
            query("UPDATE studies SET deletion_marked = 0 WHERE pk = ?")
                .bind(study_pk)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(DeleteOutcome::Deleted { files })
    }

    async fn orphaned_files(
        &self,
        group_id: &str,
        after_pk: i64,
        limit: usize,
    ) -> Result<Vec<StoredFile>, IndexError> {
        let rows = query(
            r#"
            SELECT f.pk AS pk, f.volume_pk AS volume_pk, f.file_path AS file_path, f.file_size AS file_size
            FROM files f
            JOIN volumes v ON v.pk = f.volume_pk
            WHERE f.series_pk IS NULL AND v.group_id = ? AND f.pk > ?
            ORDER BY f.pk
            LIMIT ?
            "#,
        )
        .bind(group_id)
        .bind(after_pk)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(stored_file).collect())
    }

    async fn remove_file_record(&self, pk: i64) -> Result<bool, IndexError> {
        let result = query("DELETE FROM files WHERE pk = ? AND series_pk IS NULL")
            .bind(pk)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn ingested_bytes_since(
        &self,
        group_id: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, IndexError> {
        let row = query(
            r#"
            SELECT COALESCE(SUM(f.file_size), 0) AS bytes
            FROM files f
            JOIN volumes v ON v.pk = f.volume_pk
            WHERE v.group_id = ? AND f.created_at >= ?
            "#,
        )
        .bind(group_id)
        .bind(to_millis(since))
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("bytes").max(0) as u64)
    }
}
