//! # ferrite-rmt-core
//!
//! Pieces of ferrite-rmt that do not depend on the snapshot format: the
//! RESP client codec, configuration, shared errors and the metrics sink.

#![deny(clippy::unwrap_used)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod metrics;
pub mod protocol;

pub use config::Config;
pub use error::ConfigError;
pub use metrics::{FailureReason, MigrationMetrics, MigrationSummary};
