//! Removal of files whose index rows were detached by a deletion.

pub mod sweeper;

pub use sweeper::{OrphanedFileSweeper, SweepOutcome, SweepReport};
