//! Storage - raw samples and the rollup cache on SQLite
//!
//! Two logical tables live in one database file:
//!
//! - **samples**: raw readings keyed by `(time, sensor, metric)`
//! - **rollups**: min/avg/max per `(bucket, sensor, view range, metric)`
//!
//! A single [`Writer`] owns every mutation and keeps rollups consistent with
//! the samples it records. Any number of [`Reader`]s run concurrently on
//! their own connections; the database runs in WAL mode so readers never
//! block each other or the writer.

mod raw;
mod reader;
mod rollup;
mod schema;
mod writer;

pub use reader::Reader;
pub use writer::{ReindexStats, Writer};

use crate::{BucketWidths, Result, ThermoError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// When the writer recomputes rollups for freshly recorded samples
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    /// Inside `record`, in the same transaction as the raw write
    #[default]
    Synchronous,
    /// On `flush_pending`, once per touched bucket
    Deferred,
}

/// Store configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database file
    pub path: PathBuf,
    /// Bucket width per view range
    pub widths: BucketWidths,
    /// Rollup refresh policy for the writer
    pub write_mode: WriteMode,
    /// Upper bound on bound parameters in one statement
    pub max_query_params: usize,
    /// Upper bound on buckets one `get_stats` call may span
    pub max_query_buckets: usize,
    /// How long a connection waits on a locked database
    pub busy_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("thermolog.db"),
            widths: BucketWidths::default(),
            write_mode: WriteMode::default(),
            max_query_params: crate::config::DEFAULT_MAX_QUERY_PARAMS,
            max_query_buckets: crate::config::DEFAULT_MAX_QUERY_BUCKETS,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

impl StoreConfig {
    /// Default configuration for a database at `path`
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Take the bucket widths an existing store was built with
    ///
    /// Views the store has no width for, and stores that do not exist yet,
    /// keep the configured widths.
    pub fn with_stored_widths(mut self) -> Result<Self> {
        if !self.path.exists() {
            return Ok(self);
        }
        for (view, ms) in schema::peek_widths(&self)? {
            let ms = u64::try_from(ms).map_err(|_| {
                ThermoError::Corruption(format!("negative {view} bucket width {ms}ms"))
            })?;
            self.widths.set_width(view, Duration::from_millis(ms));
        }
        Ok(self)
    }
}
