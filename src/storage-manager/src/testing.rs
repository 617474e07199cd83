//! Test doubles for the storage manager.
//!
//! Only available with the `testing` feature or during tests.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Notify, Semaphore};

use crate::deletion::ExternalRetrieveChecker;
use crate::store::{
    ArchiveIndex, CandidateLevel, CandidateQuery, CandidateRef, DeleteOutcome, DeletionCandidate,
    IndexError, StoredFile, StoredObject,
};
use crate::volume::SpaceGauge;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, Copy)]
struct Space {
    free: u64,
    total: u64,
}

/// Space gauge reporting configured numbers instead of asking the file
/// system. Paths without an entry fall back to the default, or fail with
/// `NotFound` when there is none.
#[derive(Debug, Default)]
pub struct FixedSpaceGauge {
    default: Option<Space>,
    volumes: Mutex<HashMap<PathBuf, Space>>,
    failing: Mutex<Vec<PathBuf>>,
    calls: Mutex<HashMap<PathBuf, usize>>,
}

impl FixedSpaceGauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default(free: u64, total: u64) -> Self {
        Self {
            default: Some(Space { free, total }),
            ..Self::default()
        }
    }

    pub fn set(&self, path: impl AsRef<Path>, free: u64, total: u64) {
        lock(&self.volumes).insert(path.as_ref().to_path_buf(), Space { free, total });
    }

    /// Make every gauge of `path` fail.
    pub fn fail(&self, path: impl AsRef<Path>) {
        lock(&self.failing).push(path.as_ref().to_path_buf());
    }

    /// Number of free space readings of `path`.
    pub fn calls(&self, path: impl AsRef<Path>) -> usize {
        lock(&self.calls)
            .get(path.as_ref())
            .copied()
            .unwrap_or(0)
    }

    fn space(&self, path: &Path) -> io::Result<Space> {
        if lock(&self.failing).iter().any(|failing| failing == path) {
            return Err(io::Error::other(format!("gauge failure for {}", path.display())));
        }
        lock(&self.volumes)
            .get(path)
            .copied()
            .or(self.default)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no space configured for {}", path.display()),
                )
            })
    }
}

impl SpaceGauge for FixedSpaceGauge {
    fn available_bytes(&self, path: &Path) -> io::Result<u64> {
        *lock(&self.calls).entry(path.to_path_buf()).or_insert(0) += 1;
        self.space(path).map(|space| space.free)
    }

    fn total_bytes(&self, path: &Path) -> io::Result<u64> {
        self.space(path).map(|space| space.total)
    }
}

/// External archive answering from a fixed set of retrievable studies.
#[derive(Debug, Default)]
pub struct StaticRetrieveChecker {
    retrievable: Vec<String>,
    unreachable: bool,
}

impl StaticRetrieveChecker {
    pub fn new<I, S>(retrievable: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            retrievable: retrievable.into_iter().map(Into::into).collect(),
            unreachable: false,
        }
    }

    /// A checker whose every query fails.
    pub fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl ExternalRetrieveChecker for StaticRetrieveChecker {
    async fn is_retrievable(&self, aet: &str, study_iuid: &str) -> anyhow::Result<bool> {
        if self.unreachable {
            anyhow::bail!("external archive {aet} unreachable");
        }
        Ok(self.retrievable.iter().any(|iuid| iuid == study_iuid))
    }
}

/// Index wrapper whose `delete_unit` fails a number of times.
#[derive(Debug)]
pub struct FlakyIndex {
    inner: Arc<dyn ArchiveIndex>,
    /// Remaining failures, `usize::MAX` fails forever
    failures: AtomicUsize,
    attempts: AtomicUsize,
}

impl FlakyIndex {
    pub fn failing(inner: Arc<dyn ArchiveIndex>, failures: usize) -> Self {
        Self {
            inner,
            failures: AtomicUsize::new(failures),
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn always_failing(inner: Arc<dyn ArchiveIndex>) -> Self {
        Self::failing(inner, usize::MAX)
    }

    /// Number of `delete_unit` calls so far.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArchiveIndex for FlakyIndex {
    async fn record_stored_file(&self, object: &StoredObject) -> Result<i64, IndexError> {
        self.inner.record_stored_file(object).await
    }

    async fn record_access(&self, study_iuid: &str, at: DateTime<Utc>) -> Result<(), IndexError> {
        self.inner.record_access(study_iuid, at).await
    }

    async fn find_candidates(
        &self,
        query: &CandidateQuery,
    ) -> Result<Vec<DeletionCandidate>, IndexError> {
        self.inner.find_candidates(query).await
    }

    async fn mark_for_deletion(&self, level: CandidateLevel, pk: i64) -> Result<bool, IndexError> {
        self.inner.mark_for_deletion(level, pk).await
    }

    async fn unmark(&self, level: CandidateLevel, pk: i64) -> Result<(), IndexError> {
        self.inner.unmark(level, pk).await
    }

    async fn has_copy_on_group(
        &self,
        study_iuid: &str,
        group_id: &str,
    ) -> Result<bool, IndexError> {
        self.inner.has_copy_on_group(study_iuid, group_id).await
    }

    async fn delete_unit(
        &self,
        unit: &CandidateRef,
        group_id: &str,
    ) -> Result<DeleteOutcome, IndexError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                0 => None,
                usize::MAX => Some(usize::MAX),
                left => Some(left - 1),
            })
            .is_ok();
        if failing {
            return Err(IndexError::Database(sqlx::Error::PoolTimedOut));
        }
        self.inner.delete_unit(unit, group_id).await
    }

    async fn orphaned_files(
        &self,
        group_id: &str,
        after_pk: i64,
        limit: usize,
    ) -> Result<Vec<StoredFile>, IndexError> {
        self.inner.orphaned_files(group_id, after_pk, limit).await
    }

    async fn remove_file_record(&self, pk: i64) -> Result<bool, IndexError> {
        self.inner.remove_file_record(pk).await
    }

    async fn ingested_bytes_since(
        &self,
        group_id: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, IndexError> {
        self.inner.ingested_bytes_since(group_id, since).await
    }
}

/// Index wrapper that holds `find_candidates` until released, so a test
/// can keep a pass in flight.
#[derive(Debug)]
pub struct GatedIndex {
    inner: Arc<dyn ArchiveIndex>,
    entered: Notify,
    /// Never has permits; closing it opens the gate for good
    gate: Semaphore,
    find_calls: AtomicUsize,
}

impl GatedIndex {
    pub fn new(inner: Arc<dyn ArchiveIndex>) -> Self {
        Self {
            inner,
            entered: Notify::new(),
            gate: Semaphore::new(0),
            find_calls: AtomicUsize::new(0),
        }
    }

    /// Candidate batches requested so far.
    pub fn find_calls(&self) -> usize {
        self.find_calls.load(Ordering::SeqCst)
    }

    /// Wait until a caller blocks in `find_candidates`.
    pub async fn wait_entered(&self) {
        self.entered.notified().await;
    }

    /// Let blocked and future callers through.
    pub fn release(&self) {
        self.gate.close();
    }
}

#[async_trait]
impl ArchiveIndex for GatedIndex {
    async fn record_stored_file(&self, object: &StoredObject) -> Result<i64, IndexError> {
        self.inner.record_stored_file(object).await
    }

    async fn record_access(&self, study_iuid: &str, at: DateTime<Utc>) -> Result<(), IndexError> {
        self.inner.record_access(study_iuid, at).await
    }

    async fn find_candidates(
        &self,
        query: &CandidateQuery,
    ) -> Result<Vec<DeletionCandidate>, IndexError> {
        self.find_calls.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        // Fails once the gate is closed
        let _ = self.gate.acquire().await;
        self.inner.find_candidates(query).await
    }

    async fn mark_for_deletion(&self, level: CandidateLevel, pk: i64) -> Result<bool, IndexError> {
        self.inner.mark_for_deletion(level, pk).await
    }

    async fn unmark(&self, level: CandidateLevel, pk: i64) -> Result<(), IndexError> {
        self.inner.unmark(level, pk).await
    }

    async fn has_copy_on_group(
        &self,
        study_iuid: &str,
        group_id: &str,
    ) -> Result<bool, IndexError> {
        self.inner.has_copy_on_group(study_iuid, group_id).await
    }

    async fn delete_unit(
        &self,
        unit: &CandidateRef,
        group_id: &str,
    ) -> Result<DeleteOutcome, IndexError> {
        self.inner.delete_unit(unit, group_id).await
    }

    async fn orphaned_files(
        &self,
        group_id: &str,
        after_pk: i64,
        limit: usize,
    ) -> Result<Vec<StoredFile>, IndexError> {
        self.inner.orphaned_files(group_id, after_pk, limit).await
    }

    async fn remove_file_record(&self, pk: i64) -> Result<bool, IndexError> {
        self.inner.remove_file_record(pk).await
    }

    async fn ingested_bytes_since(
        &self,
        group_id: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, IndexError> {
        self.inner.ingested_bytes_since(group_id, since).await
    }
}
