//! Consumer of delete orders.
//!
//! Each order removes the index rows of its unit in one transaction, then
//! unlinks the files that became orphans. A unit written to after its claim
//! is left alone. Files that cannot be unlinked
//! keep their orphan row and are retried by the orphan sweeper. A failed
//! order is re-published with the delay of its retry schedule or, when the
//! schedule is exhausted, moved to the dead-letter store.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use common::queue::{
    Envelope, HEADER_DEAD_LETTER_REASON, Message, Queue, QueueError, publish_message,
};
use tokio::sync::Mutex;

use super::order::{DELETE_ORDER_QUEUE, DeleteOrder};
use super::retry::{RetryIntervals, RetryIntervalsError};
use crate::events::{ArchiveEvent, EventBus};
use crate::metrics::DeletionMetrics;
use crate::store::{ArchiveIndex, CandidateLevel, DeleteOutcome, IndexError, StoredFile};
use crate::task::PeriodicTask;
use crate::volume::{VolumeRegistry, VolumeSelector};

#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Failed to encode delete order: {0}")]
    Encode(#[from] serde_json::Error),
}

/// What processing one queued message did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Completed { files: usize, bytes: u64 },
    /// The unit had already been deleted
    AlreadyGone,
    /// The unit changed after it was claimed and is kept
    ClaimRevoked,
    Retried { failure_count: u32, delay: Duration },
    DeadLettered { failure_count: u32 },
    /// The message body was not a delete order
    Malformed,
}

#[derive(Debug, Default, Clone, Copy)]
struct Unlinked {
    files: usize,
    bytes: u64,
}

#[derive(Debug)]
pub struct DeleteOrderProcessor {
    queue: Arc<dyn Queue>,
    index: Arc<dyn ArchiveIndex>,
    registry: Arc<VolumeRegistry>,
    selector: Arc<VolumeSelector>,
    events: EventBus,
    metrics: DeletionMetrics,
    retry_intervals: RwLock<RetryIntervals>,
    poll_interval: Duration,
    consumer: Mutex<Option<PeriodicTask>>,
}

impl DeleteOrderProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<dyn Queue>,
        index: Arc<dyn ArchiveIndex>,
        registry: Arc<VolumeRegistry>,
        selector: Arc<VolumeSelector>,
        events: EventBus,
        metrics: DeletionMetrics,
        retry_intervals: RetryIntervals,
        poll_interval: Duration,
    ) -> Self {
        Self {
            queue,
            index,
            registry,
            selector,
            events,
            metrics,
            retry_intervals: RwLock::new(retry_intervals),
            poll_interval,
            consumer: Mutex::new(None),
        }
    }

    /// Replace the retry schedule. An invalid schedule leaves the current
    /// one active.
    pub fn reconfigure_retry_intervals(&self, value: &str) -> Result<(), RetryIntervalsError> {
        let intervals: RetryIntervals = value.parse()?;
        tracing::info!(retry_intervals = %intervals, "Delete order retry schedule updated");
        *self
            .retry_intervals
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = intervals;
        Ok(())
    }

    fn retry_delay(&self, failure_count: u32) -> Option<Duration> {
        self.retry_intervals
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .delay_for(failure_count)
    }

    /// Start consuming the queue in the background.
    pub async fn start(self: &Arc<Self>) {
        let mut consumer = self.consumer.lock().await;
        if consumer.is_some() {
            return;
        }
        let processor = Arc::clone(self);
        *consumer = Some(PeriodicTask::spawn(
            "delete-order-processor",
            self.poll_interval,
            move || {
                let processor = Arc::clone(&processor);
                async move {
                    if let Err(e) = processor.drain().await {
                        tracing::error!(error = %e, "Delete order processing failed");
                    }
                }
            },
        ));
        tracing::info!(poll_interval = ?self.poll_interval, "Delete order processor started");
    }

    /// Stop the consumer after the order in progress.
    pub async fn stop(&self) {
        let consumer = self.consumer.lock().await.take();
        if let Some(task) = consumer {
            task.stop().await;
            tracing::info!("Delete order processor stopped");
        }
    }

    /// Process due orders until the queue has none left.
    pub async fn drain(&self) -> Result<usize, ProcessorError> {
        let mut processed = 0;
        while self.process_next().await?.is_some() {
            processed += 1;
        }
        Ok(processed)
    }

    /// Lease and process the next due order, if any.
    pub async fn process_next(&self) -> Result<Option<ProcessOutcome>, ProcessorError> {
        let Some(envelope) = self.queue.receive(DELETE_ORDER_QUEUE).await? else {
            return Ok(None);
        };

        let order = match Message::<DeleteOrder>::from_envelope(&envelope) {
            Ok(message) => message.payload,
            Err(e) => {
                tracing::error!(message_id = %envelope.id, error = %e, "Malformed delete order");
                self.dead_letter(envelope, &format!("malformed delete order: {e}"))
                    .await?;
                return Ok(Some(ProcessOutcome::Malformed));
            }
        };

        let outcome = match self.index.delete_unit(&order.candidate, &order.group_id).await {
            Ok(DeleteOutcome::Deleted { files }) => {
                let unlinked = self.unlink_files(files).await;
                self.complete(&envelope, &order, unlinked).await?;
                ProcessOutcome::Completed {
                    files: unlinked.files,
                    bytes: unlinked.bytes,
                }
            }
            Ok(DeleteOutcome::AlreadyGone) => {
                tracing::info!(
                    iuid = %order.candidate.iuid,
                    group_id = %order.group_id,
                    "Unit already deleted"
                );
                self.queue.ack(DELETE_ORDER_QUEUE, envelope.id).await?;
                self.metrics.record_order_completed(0, 0);
                ProcessOutcome::AlreadyGone
            }
            Ok(DeleteOutcome::ClaimRevoked) => {
                tracing::info!(
                    iuid = %order.candidate.iuid,
                    group_id = %order.group_id,
                    "Unit changed after it was claimed, keeping"
                );
                self.queue.ack(DELETE_ORDER_QUEUE, envelope.id).await?;
                self.metrics.record_order_revoked();
                ProcessOutcome::ClaimRevoked
            }
            Err(e) => self.fail(envelope, order, e.to_string()).await?,
        };
        Ok(Some(outcome))
    }

    async fn unlink_files(&self, files: Vec<StoredFile>) -> Unlinked {
        let mut unlinked = Unlinked::default();
        for file in files {
            match self.registry.unlink(file.volume_id, &file.path).await {
                Ok(existed) => {
                    if !existed {
                        tracing::debug!(path = %file.path, "File already missing");
                    }
                    match self.index.remove_file_record(file.pk).await {
                        Ok(_) => {
                            unlinked.files += 1;
                            unlinked.bytes += file.size;
                        }
                        Err(e) => tracing::warn!(
                            file_pk = file.pk,
                            error = %e,
                            "Failed to remove file record, left for orphan sweep"
                        ),
                    }
                }
                Err(e) => {
                    self.metrics.record_unlink_failure();
                    tracing::warn!(
                        volume_id = file.volume_id,
                        path = %file.path,
                        error = %e,
                        "Failed to unlink file, left for orphan sweep"
                    );
                }
            }
        }
        unlinked
    }

    async fn complete(
        &self,
        envelope: &Envelope,
        order: &DeleteOrder,
        unlinked: Unlinked,
    ) -> Result<(), ProcessorError> {
        self.queue.ack(DELETE_ORDER_QUEUE, envelope.id).await?;
        self.metrics
            .record_order_completed(unlinked.files, unlinked.bytes);

        let series_iuid = match order.candidate.level {
            CandidateLevel::Study => None,
            CandidateLevel::Series => Some(order.candidate.iuid.clone()),
        };
        tracing::info!(
            study_iuid = %order.candidate.study_iuid,
            series_iuid = ?series_iuid,
            group_id = %order.group_id,
            files = unlinked.files,
            bytes = unlinked.bytes,
            "Deleted from storage group"
        );
        self.events.emit(ArchiveEvent::StudyDeleted {
            group_id: order.group_id.clone(),
            study_iuid: order.candidate.study_iuid.clone(),
            series_iuid,
            volume_id: order.volume_id,
            files: unlinked.files,
            bytes: unlinked.bytes,
        });

        self.selector.on_space_freed().await;
        Ok(())
    }

    async fn fail(
        &self,
        mut envelope: Envelope,
        mut order: DeleteOrder,
        error: String,
    ) -> Result<ProcessOutcome, ProcessorError> {
        order.failure_count += 1;
        order.last_error = Some(error.clone());
        let failure_count = order.failure_count;

        match self.retry_delay(failure_count) {
            Some(delay) => {
                tracing::warn!(
                    iuid = %order.candidate.iuid,
                    failure_count,
                    retry_in = %humantime::format_duration(delay),
                    error = %error,
                    "Delete order failed, retrying"
                );
                let retry = Message::new(DELETE_ORDER_QUEUE, order).deliver_after(delay);
                publish_message(self.queue.as_ref(), &retry).await?;
                self.queue.ack(DELETE_ORDER_QUEUE, envelope.id).await?;
                self.metrics.record_order_retried();
                Ok(ProcessOutcome::Retried {
                    failure_count,
                    delay,
                })
            }
            None => {
                tracing::error!(
                    iuid = %order.candidate.iuid,
                    failure_count,
                    error = %error,
                    "Delete order failed permanently"
                );
                envelope.body = serde_json::to_value(&order)?;
                let reason = format!("failed {failure_count} times: {error}");
                self.dead_letter(envelope, &reason).await?;
                self.events.emit(ArchiveEvent::DeleteOrderFailed {
                    group_id: order.group_id.clone(),
                    study_iuid: order.candidate.study_iuid.clone(),
                    failure_count,
                    error,
                });
                Ok(ProcessOutcome::DeadLettered { failure_count })
            }
        }
    }

    async fn dead_letter(
        &self,
        mut envelope: Envelope,
        reason: &str,
    ) -> Result<(), ProcessorError> {
        envelope
            .headers
            .insert(HEADER_DEAD_LETTER_REASON.to_string(), reason.to_string());
        self.queue.dead_letter(envelope).await?;
        self.metrics.record_order_dead_lettered();
        Ok(())
    }
}
