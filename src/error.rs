//! Typed error taxonomy. Call sites outside the library use `anyhow`;
//! these enums are what the pipeline actually matches on to decide
//! whether to self-heal, drop a frame, or propagate.

use thiserror::Error;

/// Errors from a `SensorDriver`.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("device busy")]
    DeviceBusy,
    #[error("device not ready")]
    NotReady,
    #[error("unsupported operation for this driver variant")]
    Unsupported,
    #[error("io error: {0}")]
    IOError(String),
    #[error("timed out waiting for frame")]
    Timeout,
    #[error("no data available")]
    NoData,
    #[error("driver closed")]
    Closed,
}

impl DriverError {
    /// Local to the driver; self-heals via a reopen attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, DriverError::IOError(_) | DriverError::Timeout)
    }
}

/// Errors surfaced while running the per-frame acquisition pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("environment model rejected: fewer than 50% of buckets populated")]
    SparseEnvironment,
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),
}

/// Errors from configuration loading/parsing.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required key: {0}")]
    MissingKey(String),
    #[error("could not parse JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown observer type: {0}")]
    UnknownObserverType(String),
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the Recorder/Player binary log.
#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("end of file")]
    Eof,
    #[error("malformed record header, resynced after skipping {skipped} byte(s)")]
    Resynced { skipped: usize },
}

/// Unrecoverable startup-time errors. The process exits nonzero
/// after best-effort observer cleanup.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("could not bind admin server: {0}")]
    BindFailed(String),
    #[error("could not create working directory {path}: {source}")]
    WorkingDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
