//! SQLite schema and connection handling for the archive index.

pub mod index;

pub use index::{
    ArchiveIndex, CandidateLevel, CandidateQuery, CandidateRef, DeleteOutcome, DeletionCandidate,
    IndexError, SqliteIndex, StoredFile, StoredObject, Watermark,
};

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{SqlitePool, query};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS volumes (
        pk INTEGER PRIMARY KEY AUTOINCREMENT,
        group_id TEXT NOT NULL,
        dir_path TEXT NOT NULL UNIQUE,
        status INTEGER NOT NULL,
        availability INTEGER NOT NULL,
        retrieve_aet TEXT NOT NULL,
        next_path TEXT,
        free_bytes INTEGER,
        free_checked_at INTEGER
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS studies (
        pk INTEGER PRIMARY KEY AUTOINCREMENT,
        study_iuid TEXT NOT NULL UNIQUE,
        access_time INTEGER NOT NULL,
        external_retrieve_aet TEXT,
        deletion_marked INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS series (
        pk INTEGER PRIMARY KEY AUTOINCREMENT,
        study_pk INTEGER NOT NULL REFERENCES studies(pk),
        series_iuid TEXT NOT NULL UNIQUE,
        access_time INTEGER NOT NULL,
        deletion_marked INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS files (
        pk INTEGER PRIMARY KEY AUTOINCREMENT,
        volume_pk INTEGER NOT NULL,
        series_pk INTEGER REFERENCES series(pk),
        file_path TEXT NOT NULL,
        file_size INTEGER NOT NULL,
        created_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_studies_access ON studies(access_time, pk)",
    "CREATE INDEX IF NOT EXISTS idx_series_access ON series(access_time, pk)",
    "CREATE INDEX IF NOT EXISTS idx_files_series ON files(series_pk)",
    "CREATE INDEX IF NOT EXISTS idx_files_volume ON files(volume_pk)",
];

/// Connection pool over the archive database.
#[derive(Debug, Clone)]
pub struct ArchiveDatabase {
    pool: SqlitePool,
}

impl ArchiveDatabase {
    /// Connect to `dsn` and create missing tables.
    pub async fn connect(dsn: &str) -> Result<Self, sqlx::Error> {
        if dsn.contains(":memory:") {
            return Self::new_in_memory().await;
        }

        // Add mode=rwc to create database file if it doesn't exist
        let dsn_with_create = if dsn.contains("mode=") {
            dsn.to_string()
        } else if dsn.contains('?') {
            format!("{dsn}&mode=rwc")
        } else {
            format!("{dsn}?mode=rwc")
        };

        tracing::info!(dsn = %dsn_with_create, "Connecting to archive database");
        let pool = SqlitePool::connect(&dsn_with_create).await.map_err(|e| {
            tracing::error!(
                dsn = %dsn_with_create,
                error = %e,
                "Failed to connect to archive database"
            );
            e
        })?;

        let db = Self { pool };
        db.init().await?;
        Ok(db)
    }

    /// Private in-memory database. A single connection keeps every
    /// statement on the same database.
    pub async fn new_in_memory() -> Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let db = Self { pool };
        db.init().await?;
        Ok(db)
    }

    async fn init(&self) -> Result<(), sqlx::Error> {
        for statement in SCHEMA {
            query(statement).execute(&self.pool).await?;
        }
        tracing::debug!("Archive schema initialized");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
