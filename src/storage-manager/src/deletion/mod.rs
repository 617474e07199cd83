//! Retention driven deletion.
//!
//! The scheduler claims candidates and publishes one [`DeleteOrder`] per
//! claimed unit onto a durable queue; the processor consumes the queue,
//! removes the index rows and unlinks the files, retrying failed orders on
//! the configured schedule.

pub mod external;
pub mod order;
pub mod processor;
pub mod retry;
pub mod scheduler;

pub use external::{ExternalRetrieveChecker, NoExternalArchive};
pub use order::{DELETE_ORDER_QUEUE, DeleteOrder};
pub use processor::{DeleteOrderProcessor, ProcessOutcome, ProcessorError};
pub use retry::{RetryIntervals, RetryIntervalsError};
pub use scheduler::{
    DeletionScheduler, PassOutcome, PassReport, ScheduleOutcome, SchedulerError,
    SchedulerSettings,
};
