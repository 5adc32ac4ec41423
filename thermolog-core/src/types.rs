//! Core types for Thermolog

use crate::{Result, ThermoError};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Instant in UTC. Stored as milliseconds since the Unix epoch.
pub type Timestamp = DateTime<Utc>;

/// Convert a timestamp to its stored representation
pub fn to_millis(ts: Timestamp) -> i64 {
    ts.timestamp_millis()
}

/// Convert a stored millisecond value back into a timestamp
pub fn from_millis(ms: i64) -> Result<Timestamp> {
    DateTime::from_timestamp_millis(ms).ok_or(ThermoError::InvalidTimestamp(ms))
}

/// Kind of value a reading carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Temperature,
    Humidity,
    /// On/off state, stored as 0 or 1
    Toggle,
}

impl MetricKind {
    /// Every metric, in code order
    pub const ALL: [MetricKind; 3] = [
        MetricKind::Temperature,
        MetricKind::Humidity,
        MetricKind::Toggle,
    ];

    /// Stable integer code used in the store
    pub fn code(self) -> i64 {
        match self {
            MetricKind::Temperature => 0,
            MetricKind::Humidity => 1,
            MetricKind::Toggle => 2,
        }
    }

    /// Decode a stored metric code
    pub fn from_code(code: i64) -> Result<Self> {
        match code {
            0 => Ok(MetricKind::Temperature),
            1 => Ok(MetricKind::Humidity),
            2 => Ok(MetricKind::Toggle),
            other => Err(ThermoError::Corruption(format!("unknown metric code {other}"))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MetricKind::Temperature => "temperature",
            MetricKind::Humidity => "humidity",
            MetricKind::Toggle => "toggle",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = ThermoError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "temperature" | "temp" => Ok(MetricKind::Temperature),
            "humidity" | "hum" => Ok(MetricKind::Humidity),
            "toggle" => Ok(MetricKind::Toggle),
            _ => Err(ThermoError::InvalidMetric(s.to_string())),
        }
    }
}

/// Value of a single reading
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SampleValue {
    Float(f64),
    Bool(bool),
}

impl SampleValue {
    /// Numeric form used for storage and aggregation
    pub fn as_f64(self) -> f64 {
        match self {
            SampleValue::Float(v) => v,
            SampleValue::Bool(true) => 1.0,
            SampleValue::Bool(false) => 0.0,
        }
    }
}

impl From<f64> for SampleValue {
    fn from(v: f64) -> Self {
        SampleValue::Float(v)
    }
}

impl From<bool> for SampleValue {
    fn from(v: bool) -> Self {
        SampleValue::Bool(v)
    }
}

/// A raw reading tagged with its sensor and time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub time: Timestamp,
    pub sensor: String,
    pub metric: MetricKind,
    pub value: SampleValue,
}

impl Sample {
    /// Create a new sample
    pub fn new(
        sensor: impl Into<String>,
        time: Timestamp,
        metric: MetricKind,
        value: impl Into<SampleValue>,
    ) -> Self {
        Self {
            time,
            sensor: sensor.into(),
            metric,
            value: value.into(),
        }
    }
}

/// A raw sample as read back from the store
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawPoint {
    pub time: Timestamp,
    pub metric: MetricKind,
    pub value: f64,
}

/// One rollup bucket for one metric. Aggregates are `None` when the bucket
/// holds no raw samples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatRow {
    pub bucket_start: Timestamp,
    pub metric: MetricKind,
    pub avg: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl StatRow {
    /// A negative cache entry for a bucket without samples
    pub fn empty(bucket_start: Timestamp, metric: MetricKind) -> Self {
        Self {
            bucket_start,
            metric,
            avg: None,
            min: None,
            max: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.avg.is_none() && self.min.is_none() && self.max.is_none()
    }
}

/// First and last raw sample times across the whole store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateSpan {
    pub first: Timestamp,
    pub last: Timestamp,
}

impl DateSpan {
    /// Exclusive upper bound of the span. Spans are half-open:
    /// `[first, last + 1ms)`.
    pub fn end(&self) -> Timestamp {
        self.last + Duration::milliseconds(1)
    }
}

/// Named display granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewRange {
    Hour,
    Day,
    Week,
    Month,
    Year,
    All,
}

impl ViewRange {
    pub const ALL: [ViewRange; 6] = [
        ViewRange::Hour,
        ViewRange::Day,
        ViewRange::Week,
        ViewRange::Month,
        ViewRange::Year,
        ViewRange::All,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ViewRange::Hour => "hour",
            ViewRange::Day => "day",
            ViewRange::Week => "week",
            ViewRange::Month => "month",
            ViewRange::Year => "year",
            ViewRange::All => "all",
        }
    }

    /// Default query window ending at `now`. `All` has no fixed window and
    /// is resolved against the store's date span instead.
    pub fn window(self, now: Timestamp) -> Option<(Timestamp, Timestamp)> {
        let span = match self {
            ViewRange::Hour => Duration::hours(1),
            ViewRange::Day => Duration::days(1),
            ViewRange::Week => Duration::days(7),
            ViewRange::Month => Duration::days(30),
            ViewRange::Year => Duration::days(365),
            ViewRange::All => return None,
        };
        Some((now - span, now))
    }
}

impl fmt::Display for ViewRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ViewRange {
    type Err = ThermoError;

    fn from_str(s: &str) -> Result<Self> {
        ViewRange::ALL
            .into_iter()
            .find(|v| v.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ThermoError::InvalidViewRange(s.to_string()))
    }
}
