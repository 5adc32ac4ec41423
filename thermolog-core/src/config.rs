//! Configuration file
//!
//! Loaded once at startup from YAML and passed down explicitly; nothing in
//! the crate reads configuration from global state.

use crate::ingest::PipelineConfig;
use crate::storage::{StoreConfig, WriteMode};
use crate::{BucketWidths, Result, ThermoError};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default cap on bound parameters per statement (SQLite's historical
/// limit is 999)
pub const DEFAULT_MAX_QUERY_PARAMS: usize = 500;

/// Smallest accepted `max_query_params`
pub const MIN_QUERY_PARAMS: usize = 8;

/// Default cap on buckets one statistics query may span
pub const DEFAULT_MAX_QUERY_BUCKETS: usize = 50_000;

/// Top-level configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// SQLite database file
    pub database: PathBuf,

    /// HTTP listen address. Default: 0.0.0.0:8086.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// How often configured sensors are polled. Absent: the monitor idles
    /// and only externally pushed readings are recorded.
    #[serde(default, with = "humantime_serde")]
    pub monitor_interval: Option<Duration>,

    /// How often the ingestion queue is drained. Default: 500ms.
    #[serde(default = "default_queue_interval", with = "humantime_serde")]
    pub queue_interval: Duration,

    /// How often deferred rollup refreshes are flushed. Default: 30s.
    #[serde(default = "default_stats_interval", with = "humantime_serde")]
    pub stats_interval: Duration,

    /// When rollups are refreshed after a write. Default: synchronous.
    #[serde(default)]
    pub write_mode: WriteMode,

    /// Age after which a latest reading is reported as stale. Default: 10m.
    #[serde(default = "default_stale_after", with = "humantime_serde")]
    pub stale_after: Duration,

    /// Maximum bound parameters per SQL statement. Default: 500.
    #[serde(default = "default_max_query_params")]
    pub max_query_params: usize,

    /// Most buckets a single statistics query may span. Default: 50000.
    #[serde(default = "default_max_query_buckets")]
    pub max_query_buckets: usize,

    /// SQLite busy timeout. Default: 5s.
    #[serde(default = "default_busy_timeout", with = "humantime_serde")]
    pub busy_timeout: Duration,

    /// Ingestion queue capacity. Default: 4096.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Bucket width overrides per view range
    #[serde(default)]
    pub buckets: BucketWidths,

    #[serde(default)]
    pub sensors: BTreeMap<String, SensorConfig>,

    #[serde(default)]
    pub toggles: BTreeMap<String, ToggleConfig>,

    #[serde(default)]
    pub groups: BTreeMap<String, GroupConfig>,
}

/// Supported sensor sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    /// Smooth synthetic signal varying over days and years
    Sine,
    /// Uniform random readings
    Random,
}

/// Supported toggle sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToggleKind {
    /// In-memory switch
    Fake,
}

/// A configured sensor
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SensorConfig {
    #[serde(rename = "type")]
    pub kind: SensorKind,
    /// Driver-specific address, e.g. a pin number or a seed
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub group: Option<String>,
    /// Display color, passed through to clients
    #[serde(default)]
    pub color: Option<String>,
}

/// A configured toggle
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToggleConfig {
    #[serde(rename = "type")]
    pub kind: ToggleKind,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub group: Option<String>,
    /// Report and accept the inverse of the device state
    #[serde(default)]
    pub invert: bool,
}

/// A display group of sensors and toggles
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub order: i64,
}

/// A group with its members resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedGroup<'a> {
    pub id: &'a str,
    pub name: &'a str,
    pub sensors: Vec<&'a str>,
    pub toggles: Vec<&'a str>,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8086))
}

fn default_queue_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_stats_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_stale_after() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_max_query_params() -> usize {
    DEFAULT_MAX_QUERY_PARAMS
}

fn default_busy_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_max_query_buckets() -> usize {
    DEFAULT_MAX_QUERY_BUCKETS
}

fn default_queue_capacity() -> usize {
    4096
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            ThermoError::Config(format!("reading config file {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&data)
            .map_err(|e| ThermoError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Parse and validate configuration from YAML text
    pub fn from_yaml(data: &str) -> Result<Self> {
        let cfg: Config =
            serde_yaml::from_str(data).map_err(|e| ThermoError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency
    pub fn validate(&self) -> Result<()> {
        if self.database.as_os_str().is_empty() {
            return Err(ThermoError::Config("database is required".into()));
        }
        if self.queue_interval.is_zero() {
            return Err(ThermoError::Config("queue_interval must be positive".into()));
        }
        if self.stats_interval.is_zero() {
            return Err(ThermoError::Config("stats_interval must be positive".into()));
        }
        if matches!(self.monitor_interval, Some(d) if d.is_zero()) {
            return Err(ThermoError::Config("monitor_interval must be positive".into()));
        }
        if self.max_query_params < MIN_QUERY_PARAMS {
            return Err(ThermoError::Config(format!(
                "max_query_params must be at least {MIN_QUERY_PARAMS}"
            )));
        }
        if self.max_query_buckets == 0 {
            return Err(ThermoError::Config("max_query_buckets must be positive".into()));
        }
        if self.queue_capacity == 0 {
            return Err(ThermoError::Config("queue_capacity must be positive".into()));
        }
        self.buckets.validate()?;

        for id in self.toggles.keys() {
            if self.sensors.contains_key(id) {
                return Err(ThermoError::Config(format!(
                    "{id} is configured both as a sensor and a toggle"
                )));
            }
        }

        let groups = self
            .sensors
            .iter()
            .map(|(id, s)| (id, s.group.as_ref()))
            .chain(self.toggles.iter().map(|(id, t)| (id, t.group.as_ref())));
        for (id, group) in groups {
            if let Some(group) = group {
                if !self.groups.contains_key(group) {
                    return Err(ThermoError::Config(format!(
                        "{id} refers to unknown group {group}"
                    )));
                }
            }
        }

        Ok(())
    }

    /// Store settings derived from this configuration
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            path: self.database.clone(),
            widths: self.buckets,
            write_mode: self.write_mode,
            max_query_params: self.max_query_params,
            max_query_buckets: self.max_query_buckets,
            busy_timeout: self.busy_timeout,
        }
    }

    /// Ingestion pipeline settings derived from this configuration
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            queue_interval: self.queue_interval,
            monitor_interval: self.monitor_interval,
            stats_interval: self.stats_interval,
        }
    }

    /// Ids of every sensor and toggle, sensors first
    pub fn element_ids(&self) -> impl Iterator<Item = &str> {
        self.sensors
            .keys()
            .chain(self.toggles.keys())
            .map(String::as_str)
    }

    /// Groups sorted by display order, then id, with their members
    pub fn resolved_groups(&self) -> Vec<ResolvedGroup<'_>> {
        let mut groups: Vec<_> = self.groups.iter().collect();
        groups.sort_by(|(a_id, a), (b_id, b)| a.order.cmp(&b.order).then_with(|| a_id.cmp(b_id)));

        groups
            .into_iter()
            .map(|(id, group)| ResolvedGroup {
                id,
                name: group.name.as_deref().unwrap_or(id),
                sensors: self
                    .sensors
                    .iter()
                    .filter(|(_, s)| s.group.as_deref() == Some(id.as_str()))
                    .map(|(sid, _)| sid.as_str())
                    .collect(),
                toggles: self
                    .toggles
                    .iter()
                    .filter(|(_, t)| t.group.as_deref() == Some(id.as_str()))
                    .map(|(tid, _)| tid.as_str())
                    .collect(),
            })
            .collect()
    }
}
