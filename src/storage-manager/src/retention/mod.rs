//! How much data retention should free, and which studies are old enough.

pub mod policy;
pub mod threshold;

pub use policy::RetentionPolicy;
pub use threshold::{FreeTarget, HourRange, ThresholdEntry, ThresholdTable};

use common::units::UnitsError;

#[derive(Debug, thiserror::Error)]
pub enum RetentionConfigError {
    #[error("Invalid free space threshold '{entry}': {reason}")]
    InvalidThreshold { entry: String, reason: String },

    #[error("Invalid expected daily volume '{value}': {source}")]
    InvalidDailyVolume {
        value: String,
        #[source]
        source: UnitsError,
    },
}
