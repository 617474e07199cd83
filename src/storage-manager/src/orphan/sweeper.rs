use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;

use crate::events::{ArchiveEvent, EventBus};
use crate::metrics::DeletionMetrics;
use crate::store::{ArchiveIndex, IndexError};
use crate::volume::VolumeRegistry;

/// Totals of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub files_deleted: usize,
    pub bytes_freed: u64,
    /// Rows kept because the file could not be unlinked
    pub failed: usize,
    pub batches: usize,
    pub cancelled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepOutcome {
    Completed(SweepReport),
    /// Another sweep was running
    Skipped,
}

/// Unlinks orphan files of a group and drops their rows.
///
/// Pages through orphan rows by ascending primary key, so every sweep ends
/// even when some files keep failing.
#[derive(Debug)]
pub struct OrphanedFileSweeper {
    group_id: String,
    batch_size: usize,
    index: Arc<dyn ArchiveIndex>,
    registry: Arc<VolumeRegistry>,
    events: EventBus,
    metrics: DeletionMetrics,
    sweep_lock: Mutex<()>,
    cancelled: AtomicBool,
}

impl OrphanedFileSweeper {
    pub fn new(
        group_id: impl Into<String>,
        batch_size: usize,
        index: Arc<dyn ArchiveIndex>,
        registry: Arc<VolumeRegistry>,
        events: EventBus,
        metrics: DeletionMetrics,
    ) -> Self {
        Self {
            group_id: group_id.into(),
            batch_size: batch_size.max(1),
            index,
            registry,
            events,
            metrics,
            sweep_lock: Mutex::new(()),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Stop the running sweep after its current batch and turn later
    /// sweeps into no-ops until [`Self::resume`].
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    pub async fn sweep(&self) -> Result<SweepOutcome, IndexError> {
        let Ok(_guard) = self.sweep_lock.try_lock() else {
            tracing::info!(group_id = %self.group_id, "Orphan sweep already running, skipping");
            return Ok(SweepOutcome::Skipped);
        };

        let mut report = SweepReport::default();
        let mut cursor = 0;

        loop {
            if self.cancelled.load(Ordering::SeqCst) {
                report.cancelled = true;
                break;
            }
            let batch = self
                .index
                .orphaned_files(&self.group_id, cursor, self.batch_size)
                .await?;
            if batch.is_empty() {
                break;
            }
            report.batches += 1;

            for file in batch {
                cursor = cursor.max(file.pk);
                match self.registry.unlink(file.volume_id, &file.path).await {
                    Ok(_) => match self.index.remove_file_record(file.pk).await {
                        Ok(_) => {
                            report.files_deleted += 1;
                            report.bytes_freed += file.size;
                        }
                        Err(e) => {
                            tracing::warn!(
                                file_pk = file.pk,
                                error = %e,
                                "Failed to remove orphan row"
                            );
                            report.failed += 1;
                        }
                    },
                    Err(e) => {
                        tracing::warn!(
                            volume_id = file.volume_id,
                            path = %file.path,
                            error = %e,
                            "Failed to unlink orphan file"
                        );
                        report.failed += 1;
                    }
                }
            }
        }

        self.metrics
            .record_orphan_sweep(report.files_deleted, report.bytes_freed, report.failed);
        if report.files_deleted > 0 {
            self.events.emit(ArchiveEvent::OrphanFilesDeleted {
                group_id: self.group_id.clone(),
                files: report.files_deleted,
                bytes: report.bytes_freed,
            });
        }
        tracing::info!(
            group_id = %self.group_id,
            files = report.files_deleted,
            bytes = report.bytes_freed,
            failed = report.failed,
            cancelled = report.cancelled,
            "Orphan sweep finished"
        );
        Ok(SweepOutcome::Completed(report))
    }
}
