pub mod config;
pub mod queue;
pub mod units;

#[cfg(any(test, feature = "testing"))]
pub mod testing;
