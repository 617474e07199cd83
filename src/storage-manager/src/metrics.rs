//! Deletion metrics tracking
//!
//! Thread-safe counters for scheduler passes, delete order processing and
//! orphan sweeps.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use common::units::format_size;

/// Counters for deletion scheduling, delete order processing and orphan sweeps
#[derive(Debug, Clone)]
pub struct DeletionMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    passes_completed: AtomicUsize,
    passes_skipped: AtomicUsize,
    orders_created: AtomicUsize,
    bytes_claimed: AtomicU64,
    candidates_skipped: AtomicUsize,
    claim_conflicts: AtomicUsize,
    publish_failures: AtomicUsize,
    orders_completed: AtomicUsize,
    orders_retried: AtomicUsize,
    orders_dead_lettered: AtomicUsize,
    orders_revoked: AtomicUsize,
    files_deleted: AtomicUsize,
    bytes_freed: AtomicU64,
    unlink_failures: AtomicUsize,
    orphans_deleted: AtomicUsize,
    orphan_bytes_freed: AtomicU64,
    orphan_failures: AtomicUsize,
}

impl Default for DeletionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl DeletionMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::default()),
        }
    }

    pub fn record_pass(&self, orders: usize, bytes: u64, skipped: usize) {
        self.inner.passes_completed.fetch_add(1, Ordering::Relaxed);
        self.inner.orders_created.fetch_add(orders, Ordering::Relaxed);
        self.inner.bytes_claimed.fetch_add(bytes, Ordering::Relaxed);
        self.inner
            .candidates_skipped
            .fetch_add(skipped, Ordering::Relaxed);
    }

    pub fn record_pass_skipped(&self) {
        self.inner.passes_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_claim_conflict(&self) {
        self.inner.claim_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish_failure(&self) {
        self.inner.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_order_completed(&self, files: usize, bytes: u64) {
        self.inner.orders_completed.fetch_add(1, Ordering::Relaxed);
        self.inner.files_deleted.fetch_add(files, Ordering::Relaxed);
        self.inner.bytes_freed.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_order_retried(&self) {
        self.inner.orders_retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_order_dead_lettered(&self) {
        self.inner
            .orders_dead_lettered
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_order_revoked(&self) {
        self.inner.orders_revoked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unlink_failure(&self) {
        self.inner.unlink_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_orphan_sweep(&self, files: usize, bytes: u64, failed: usize) {
        self.inner.orphans_deleted.fetch_add(files, Ordering::Relaxed);
        self.inner
            .orphan_bytes_freed
            .fetch_add(bytes, Ordering::Relaxed);
        self.inner.orphan_failures.fetch_add(failed, Ordering::Relaxed);
    }

    pub fn summary(&self) -> MetricsSummary {
        let load = |counter: &AtomicUsize| counter.load(Ordering::Relaxed);
        MetricsSummary {
            passes_completed: load(&self.inner.passes_completed),
            passes_skipped: load(&self.inner.passes_skipped),
            orders_created: load(&self.inner.orders_created),
            bytes_claimed: self.inner.bytes_claimed.load(Ordering::Relaxed),
            candidates_skipped: load(&self.inner.candidates_skipped),
            claim_conflicts: load(&self.inner.claim_conflicts),
            publish_failures: load(&self.inner.publish_failures),
            orders_completed: load(&self.inner.orders_completed),
            orders_retried: load(&self.inner.orders_retried),
            orders_dead_lettered: load(&self.inner.orders_dead_lettered),
            orders_revoked: load(&self.inner.orders_revoked),
            files_deleted: load(&self.inner.files_deleted),
            bytes_freed: self.inner.bytes_freed.load(Ordering::Relaxed),
            unlink_failures: load(&self.inner.unlink_failures),
            orphans_deleted: load(&self.inner.orphans_deleted),
            orphan_bytes_freed: self.inner.orphan_bytes_freed.load(Ordering::Relaxed),
            orphan_failures: load(&self.inner.orphan_failures),
        }
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSummary {
    pub passes_completed: usize,
    pub passes_skipped: usize,
    pub orders_created: usize,
    pub bytes_claimed: u64,
    pub candidates_skipped: usize,
    pub claim_conflicts: usize,
    pub publish_failures: usize,
    pub orders_completed: usize,
    pub orders_retried: usize,
    pub orders_dead_lettered: usize,
    pub orders_revoked: usize,
    pub files_deleted: usize,
    pub bytes_freed: u64,
    pub unlink_failures: usize,
    pub orphans_deleted: usize,
    pub orphan_bytes_freed: u64,
    pub orphan_failures: usize,
}

impl MetricsSummary {
    pub fn log(&self) {
        tracing::info!(
            passes = self.passes_completed,
            skipped_passes = self.passes_skipped,
            orders = self.orders_created,
            claimed = %format_size(self.bytes_claimed),
            skipped_candidates = self.candidates_skipped,
            conflicts = self.claim_conflicts,
            publish_failures = self.publish_failures,
            "Deletion scheduling totals"
        );
        tracing::info!(
            completed = self.orders_completed,
            retried = self.orders_retried,
            dead_lettered = self.orders_dead_lettered,
            revoked = self.orders_revoked,
            files = self.files_deleted,
            freed = %format_size(self.bytes_freed),
            unlink_failures = self.unlink_failures,
            "Delete order totals"
        );
        tracing::info!(
            files = self.orphans_deleted,
            freed = %format_size(self.orphan_bytes_freed),
            failed = self.orphan_failures,
            "Orphan sweep totals"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialization() {
        assert_eq!(DeletionMetrics::new().summary(), MetricsSummary::default());
    }

    #[test]
    fn test_clones_share_counters() {
        let metrics = DeletionMetrics::new();
        let clone = metrics.clone();

        clone.record_pass(3, 300, 1);
        metrics.record_pass_skipped();
        clone.record_order_completed(4, 1024);
        clone.record_order_retried();
        metrics.record_order_dead_lettered();
        clone.record_orphan_sweep(2, 150, 1);

        let summary = metrics.summary();
        assert_eq!(summary.passes_completed, 1);
        assert_eq!(summary.passes_skipped, 1);
        assert_eq!(summary.orders_created, 3);
        assert_eq!(summary.bytes_claimed, 300);
        assert_eq!(summary.candidates_skipped, 1);
        assert_eq!(summary.files_deleted, 4);
        assert_eq!(summary.bytes_freed, 1024);
        assert_eq!(summary.orders_retried, 1);
        assert_eq!(summary.orders_dead_lettered, 1);
        assert_eq!(summary.orphans_deleted, 2);
        assert_eq!(summary.orphan_bytes_freed, 150);
        assert_eq!(summary.orphan_failures, 1);
    }
}
