//! Error types for Thermolog

use crate::MetricKind;
use thiserror::Error;

/// Result type alias for Thermolog operations
pub type Result<T> = std::result::Result<T, ThermoError>;

/// Thermolog error types
#[derive(Error, Debug)]
pub enum ThermoError {
    /// The underlying store rejected or failed an operation
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Sensor acquisition failed
    #[error("Sensor {sensor} failed: {source}")]
    Sensor {
        sensor: String,
        #[source]
        source: SensorError,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unknown view range name
    #[error("Invalid view range: {0}")]
    InvalidViewRange(String),

    /// Unknown metric name or code
    #[error("Invalid metric: {0}")]
    InvalidMetric(String),

    /// A statistics query spanning more buckets than allowed
    #[error("Query spans {requested} buckets, more than the limit of {limit}")]
    TooManyBuckets { requested: usize, limit: usize },

    /// Timestamp outside the representable range
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(i64),

    /// Stored data that cannot be decoded
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// The ingestion queue has no consumer left
    #[error("Sample queue closed")]
    QueueClosed,

    /// The bounded ingestion queue is at capacity
    #[error("Sample queue full ({0} pending)")]
    QueueFull(usize),

    /// A background thread could not be started or died
    #[error("Worker error: {0}")]
    Worker(String),
}

impl ThermoError {
    /// Wrap a sensor failure with the id of the sensor that produced it
    pub fn sensor(sensor: impl Into<String>, source: SensorError) -> Self {
        ThermoError::Sensor {
            sensor: sensor.into(),
            source,
        }
    }

    /// Check if the error came from the store
    pub fn is_storage(&self) -> bool {
        matches!(self, ThermoError::Storage(_) | ThermoError::Io(_))
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            ThermoError::Storage(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            ThermoError::Io(_) => true,
            ThermoError::Sensor { source, .. } => matches!(source, SensorError::Timeout),
            _ => false,
        }
    }
}

/// Acquisition failures reported by sensor and toggle sources
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SensorError {
    /// The device did not answer in time
    #[error("timed out")]
    Timeout,

    /// The device answered with a physically impossible value
    #[error("{metric} reading {value} out of range")]
    OutOfRange { metric: MetricKind, value: f64 },

    /// The device answered with something that could not be parsed
    #[error("malformed response: {0}")]
    Malformed(String),

    /// The device cannot be reached at all
    #[error("unavailable: {0}")]
    Unavailable(String),
}
