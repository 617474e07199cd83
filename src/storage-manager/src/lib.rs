//! Storage tiering and retention management for the image archive.
//!
//! Picks the volume new objects are written to, watches free space on the
//! volumes of a storage group and deletes the least recently accessed
//! studies when retention windows expire or free space runs low.
//!
//! - `volume`: volume registry, free space probing and write volume selection
//! - `retention`: age and capacity driven deletion targets
//! - `deletion`: the deletion scheduler and the delete order processor
//! - `orphan`: removal of files whose index records are gone
//! - `store`: the SQLite backed archive index

pub mod deletion;
pub mod events;
pub mod metrics;
pub mod orphan;
pub mod retention;
pub mod service;
pub mod store;
pub mod task;
pub mod volume;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used types
pub use deletion::{
    DeleteOrder, DeleteOrderProcessor, DeletionScheduler, ExternalRetrieveChecker, PassOutcome,
    PassReport, RetryIntervals,
};
pub use events::{ArchiveEvent, EventBus};
pub use metrics::{DeletionMetrics, MetricsSummary};
pub use orphan::{OrphanedFileSweeper, SweepOutcome, SweepReport};
pub use retention::{FreeTarget, RetentionPolicy, ThresholdTable};
pub use service::{CycleReport, StorageManager, StorageManagerBuilder};
pub use store::{ArchiveDatabase, ArchiveIndex, SqliteIndex};
pub use volume::{
    Availability, Volume, VolumeError, VolumeRegistry, VolumeSelector, VolumeStatus,
};
