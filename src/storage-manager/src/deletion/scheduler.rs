//! Retention passes over the archive index.
//!
//! A pass runs up to two sub-passes: the age sub-pass deletes everything
//! last accessed before the age cutoff, the capacity sub-pass frees the
//! deficit of the current free space target among studies older than the
//! capacity cutoff. Each sub-pass pages through unclaimed candidates in
//! `(access_time, pk)` order behind a watermark, claims them and publishes
//! one delete order per claimed unit. Candidates that are skipped stay
//! behind the watermark, so a pass visits every candidate at most once.
//!
//! Only one pass runs at a time; a pass that finds another one running is
//! skipped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Local, TimeDelta, Utc};
use common::config::{GroupConfig, SchedulerConfig};
use common::queue::{Queue, QueueError, publish_message};
use common::units::format_size;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::external::ExternalRetrieveChecker;
use super::order::DeleteOrder;
use crate::metrics::DeletionMetrics;
use crate::retention::RetentionPolicy;
use crate::store::{
    ArchiveIndex, CandidateLevel, CandidateQuery, DeletionCandidate, IndexError, Watermark,
};
use crate::volume::VolumeSelector;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Failed to publish delete order: {0}")]
    Publish(#[from] QueueError),

    #[error("External retrieve check failed: {0}")]
    ExternalCheck(String),
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub group_id: String,
    pub batch_size: usize,
    pub level: CandidateLevel,
    pub require_external_copy: bool,
    pub require_copy_on_group: Option<String>,
    pub dry_run: bool,
}

impl SchedulerSettings {
    pub fn from_config(group: &GroupConfig, scheduler: &SchedulerConfig) -> Self {
        Self {
            group_id: group.id.clone(),
            batch_size: scheduler.batch_size.max(1),
            level: if scheduler.delete_series_individually {
                CandidateLevel::Series
            } else {
                CandidateLevel::Study
            },
            require_external_copy: scheduler.delete_only_if_external_retrievable,
            require_copy_on_group: scheduler.delete_only_if_copy_on_group.clone(),
            dry_run: scheduler.dry_run,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubPass {
    Age,
    Capacity,
}

impl SubPass {
    fn name(self) -> &'static str {
        match self {
            SubPass::Age => "age",
            SubPass::Capacity => "capacity",
        }
    }
}

/// What happened to a single candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Claimed,
    /// Would have been claimed, dry run only
    DryRun,
    /// A precondition does not hold
    Skipped,
    /// Claimed concurrently by someone else
    AlreadyClaimed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub bytes_claimed: u64,
    pub orders_created: usize,
    pub batches: usize,
    pub skipped_candidates: usize,
    pub failed_candidates: usize,
    pub dry_run_candidates: usize,
    /// False when the capacity sub-pass ran out of candidates or could not
    /// determine the usable space
    pub target_met: bool,
    /// The capacity sub-pass was skipped because usable space was unknown
    pub usable_space_unknown: bool,
    pub cancelled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    Completed(PassReport),
    /// Another pass was running
    Skipped,
}

impl PassOutcome {
    pub fn report(&self) -> Option<&PassReport> {
        match self {
            PassOutcome::Completed(report) => Some(report),
            PassOutcome::Skipped => None,
        }
    }
}

#[derive(Debug)]
pub struct DeletionScheduler {
    settings: SchedulerSettings,
    policy: Arc<RetentionPolicy>,
    index: Arc<dyn ArchiveIndex>,
    selector: Arc<VolumeSelector>,
    queue: Arc<dyn Queue>,
    external: Arc<dyn ExternalRetrieveChecker>,
    metrics: DeletionMetrics,
    pass_lock: Mutex<()>,
    cancelled: AtomicBool,
}

impl DeletionScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: SchedulerSettings,
        policy: Arc<RetentionPolicy>,
        index: Arc<dyn ArchiveIndex>,
        selector: Arc<VolumeSelector>,
        queue: Arc<dyn Queue>,
        external: Arc<dyn ExternalRetrieveChecker>,
        metrics: DeletionMetrics,
    ) -> Self {
        Self {
            settings,
            policy,
            index,
            selector,
            queue,
            external,
            metrics,
            pass_lock: Mutex::new(()),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Stop the running pass at the next batch boundary. Passes started
    /// afterwards end immediately until [`Self::resume`] is called.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    /// Run a pass in the background, e.g. after an ingest completed.
    pub fn trigger(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = scheduler.run_pass().await {
                tracing::error!(
                    group_id = %scheduler.settings.group_id,
                    error = %e,
                    "Triggered deletion pass failed"
                );
            }
        })
    }

    pub async fn run_pass(&self) -> Result<PassOutcome, SchedulerError> {
        let Ok(_guard) = self.pass_lock.try_lock() else {
            tracing::info!(
                group_id = %self.settings.group_id,
                "Deletion pass already running, skipping"
            );
            self.metrics.record_pass_skipped();
            return Ok(PassOutcome::Skipped);
        };

        let now = Utc::now();
        self.observe_ingest(now).await;

        let mut report = PassReport {
            target_met: true,
            ..PassReport::default()
        };

        if let Some(cutoff) = self.policy.age_cutoff(now) {
            self.sub_pass(SubPass::Age, cutoff, u64::MAX, &mut report)
                .await?;
        }

        if !report.cancelled && self.policy.has_capacity_trigger() {
            match self.selector.usable_bytes().await {
                Ok(usable) => self.capacity_pass(now, usable, &mut report).await?,
                Err(e) => {
                    tracing::warn!(
                        group_id = %self.settings.group_id,
                        error = %e,
                        "Failed to determine usable space, skipping capacity deletion"
                    );
                    report.usable_space_unknown = true;
                    report.target_met = false;
                }
            }
        }

        self.metrics.record_pass(
            report.orders_created,
            report.bytes_claimed,
            report.skipped_candidates,
        );
        tracing::info!(
            group_id = %self.settings.group_id,
            orders = report.orders_created,
            claimed = %format_size(report.bytes_claimed),
            batches = report.batches,
            skipped = report.skipped_candidates,
            failed = report.failed_candidates,
            target_met = report.target_met,
            cancelled = report.cancelled,
            dry_run = self.settings.dry_run,
            "Deletion pass finished"
        );
        Ok(PassOutcome::Completed(report))
    }

    async fn observe_ingest(&self, now: DateTime<Utc>) {
        let today = now.with_timezone(&Local).date_naive();
        if !self.policy.needs_ingest_observation(today) {
            return;
        }
        let since = now - TimeDelta::days(1);
        match self
            .index
            .ingested_bytes_since(&self.settings.group_id, since)
            .await
        {
            Ok(bytes) => {
                self.policy.observe_ingest(today, bytes);
            }
            Err(e) => tracing::warn!(
                group_id = %self.settings.group_id,
                error = %e,
                "Failed to measure ingested volume"
            ),
        }
    }

    /// Free the deficit of the current free space target beyond what the
    /// age sub-pass already claimed.
    async fn capacity_pass(
        &self,
        now: DateTime<Utc>,
        usable: u64,
        report: &mut PassReport,
    ) -> Result<(), SchedulerError> {
        let deficit = self.policy.capacity_deficit(now, usable);
        let remaining = deficit.saturating_sub(report.bytes_claimed);
        if remaining == 0 {
            return Ok(());
        }
        tracing::info!(
            group_id = %self.settings.group_id,
            usable = %format_size(usable),
            deficit = %format_size(deficit),
            remaining = %format_size(remaining),
            "Free space below target"
        );
        let cutoff = self.policy.capacity_cutoff(now);
        let claimed = self
            .sub_pass(SubPass::Capacity, cutoff, remaining, report)
            .await?;
        report.target_met = claimed >= remaining;
        Ok(())
    }

    /// Claim candidates accessed before `cutoff` until `target` bytes are
    /// claimed or none are left. Returns the bytes claimed.
    async fn sub_pass(
        &self,
        kind: SubPass,
        cutoff: DateTime<Utc>,
        target: u64,
        report: &mut PassReport,
    ) -> Result<u64, SchedulerError> {
        let mut watermark = Watermark::START;
        let mut claimed: u64 = 0;

        loop {
            if self.cancelled.load(Ordering::SeqCst) {
                tracing::info!(sub_pass = kind.name(), "Deletion pass cancelled");
                report.cancelled = true;
                break;
            }
            if claimed >= target {
                break;
            }

            let batch = self
                .index
                .find_candidates(&CandidateQuery {
                    group_id: self.settings.group_id.clone(),
                    level: self.settings.level,
                    after: watermark,
                    before: cutoff,
                    limit: self.settings.batch_size,
                })
                .await?;
            report.batches += 1;

            if batch.is_empty() {
                if target != u64::MAX {
                    tracing::warn!(
                        group_id = %self.settings.group_id,
                        sub_pass = kind.name(),
                        claimed = %format_size(claimed),
                        target = %format_size(target),
                        "No more candidates, free space target not met"
                    );
                }
                break;
            }

            for candidate in &batch {
                if claimed >= target {
                    break;
                }
                watermark = Watermark::of(candidate);

                match self.schedule(candidate).await {
                    Ok(ScheduleOutcome::Claimed) => {
                        claimed = claimed.saturating_add(candidate.size_bytes);
                        report.bytes_claimed =
                            report.bytes_claimed.saturating_add(candidate.size_bytes);
                        report.orders_created += 1;
                    }
                    Ok(ScheduleOutcome::DryRun) => {
                        claimed = claimed.saturating_add(candidate.size_bytes);
                        report.dry_run_candidates += 1;
                    }
                    Ok(ScheduleOutcome::Skipped) => report.skipped_candidates += 1,
                    Ok(ScheduleOutcome::AlreadyClaimed) => {}
                    Err(e) => {
                        tracing::warn!(
                            study_iuid = %candidate.study_iuid,
                            iuid = %candidate.iuid,
                            error = %e,
                            "Failed to schedule deletion"
                        );
                        report.failed_candidates += 1;
                    }
                }
            }
        }

        Ok(claimed)
    }

    async fn schedule(
        &self,
        candidate: &DeletionCandidate,
    ) -> Result<ScheduleOutcome, SchedulerError> {
        if self.settings.require_external_copy {
            let Some(aet) = candidate.external_retrieve_aet.as_deref() else {
                tracing::debug!(study_iuid = %candidate.study_iuid, "No external archive, keeping");
                return Ok(ScheduleOutcome::Skipped);
            };
            let retrievable = self
                .external
                .is_retrievable(aet, &candidate.study_iuid)
                .await
                .map_err(|e| SchedulerError::ExternalCheck(format!("{e:#}")))?;
            if !retrievable {
                tracing::debug!(
                    study_iuid = %candidate.study_iuid,
                    aet = %aet,
                    "Not retrievable from external archive, keeping"
                );
                return Ok(ScheduleOutcome::Skipped);
            }
        }

        if let Some(group) = &self.settings.require_copy_on_group {
            if !self
                .index
                .has_copy_on_group(&candidate.study_iuid, group)
                .await?
            {
                tracing::debug!(
                    study_iuid = %candidate.study_iuid,
                    copy_group = %group,
                    "No copy on archive group, keeping"
                );
                return Ok(ScheduleOutcome::Skipped);
            }
        }

        if self.settings.dry_run {
            tracing::info!(
                level = %candidate.level,
                iuid = %candidate.iuid,
                size_bytes = candidate.size_bytes,
                access_time = %candidate.access_time,
                "[DRY-RUN] Would delete"
            );
            return Ok(ScheduleOutcome::DryRun);
        }

        if !self
            .index
            .mark_for_deletion(candidate.level, candidate.pk)
            .await?
        {
            tracing::debug!(iuid = %candidate.iuid, "Already claimed by another pass");
            self.metrics.record_claim_conflict();
            return Ok(ScheduleOutcome::AlreadyClaimed);
        }

        let message =
            DeleteOrder::from_candidate(candidate, &self.settings.group_id).into_message();
        if let Err(e) = publish_message(self.queue.as_ref(), &message).await {
            self.metrics.record_publish_failure();
            if let Err(unmark) = self.index.unmark(candidate.level, candidate.pk).await {
                tracing::error!(
                    iuid = %candidate.iuid,
                    error = %unmark,
                    "Failed to release claim after publish failure"
                );
            }
            return Err(e.into());
        }

        tracing::debug!(
            level = %candidate.level,
            iuid = %candidate.iuid,
            size_bytes = candidate.size_bytes,
            "Scheduled deletion"
        );
        Ok(ScheduleOutcome::Claimed)
    }
}
