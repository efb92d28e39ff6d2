//! # ferrite-rmt
//!
//! Migrates the keys of an RDB snapshot into a live Redis-compatible server
//! with `RESTORE`, re-encoding values for destinations that predate the
//! snapshot's format version.
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`rdb`] | Snapshot primitives: lengths, strings, LZF, ziplists, streaming reader |
//! | [`dump`] | Format downgrade encoder and `DUMP`-compatible payload framer |
//! | [`migrate`] | Dispatcher, worker pool, connections and retry engine |
//! | [`config`], [`metrics`], [`protocol`] | Re-exported from `ferrite-rmt-core` |
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use ferrite_rmt::config::Config;
//! use ferrite_rmt::migrate::{migrate, DestinationAddr, TcpConnector};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::default();
//! let addr = DestinationAddr::parse("redis://127.0.0.1:6379")?;
//! let connector = TcpConnector::new(addr, config.migrate.batch_size, config.migrate.timeout());
//! let summary = migrate(&config, "dump.rdb", Arc::new(connector)).await?;
//! println!("restored {} keys", summary.restored);
//! # Ok(())
//! # }
//! ```

#![deny(clippy::unwrap_used)]
#![warn(missing_docs)]

pub mod dump;
pub mod migrate;
pub mod rdb;

// ── Re-exports from ferrite-rmt-core ─────────────────────────────────────────

pub use ferrite_rmt_core::config;
pub use ferrite_rmt_core::error;
pub use ferrite_rmt_core::metrics;
pub use ferrite_rmt_core::protocol;

pub use ferrite_rmt_core::{Config, MigrationMetrics, MigrationSummary};
pub use migrate::{MigrateError, Result};
