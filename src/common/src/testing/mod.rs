//! Test utilities shared by the workspace crates.
//!
//! This module is only available when the `testing` feature is enabled or during tests:
//!
//! ```toml
//! [dev-dependencies]
//! common = { path = "../common", features = ["testing"] }
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use common::testing::TestConfigBuilder;
//!
//! let config = TestConfigBuilder::new()
//!     .in_memory()
//!     .with_volumes_under("/tmp/archive", 3)
//!     .build();
//! ```

mod config_builder;

pub use config_builder::TestConfigBuilder;
