//! Thermolog Core - sensor time-series storage with a rollup cache
//!
//! Raw readings (temperature, humidity, toggle state) are kept in SQLite
//! next to a cache of per-bucket aggregates, so that charts over months of
//! data only scan the raw table at the edges of the requested window.
//!
//! # Architecture
//!
//! - **Bucketing**: each view range (`hour` .. `all`) maps to a fixed bucket
//!   width; bucket starts are floored from the UTC epoch
//! - **Writer**: the single mutating handle; records samples and keeps the
//!   rollups covering them current
//! - **Reader**: one per request; serves raw ranges and statistics, filling
//!   cache gaps from raw samples on demand
//! - **Ingestion**: a bounded queue between polled or pushed readings and a
//!   consumer thread that owns the writer

pub mod bucket;
pub mod config;
pub mod ingest;
pub mod storage;

mod error;
mod types;

pub use bucket::BucketWidths;
pub use error::{Result, SensorError, ThermoError};
pub use storage::{Reader, ReindexStats, StoreConfig, WriteMode, Writer};
pub use types::*;

/// Thermolog version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
