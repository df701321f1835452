use thiserror::Error;

/// Rejected detector configuration.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{name} must be a finite positive number, got {value}")]
    NotPositive { name: &'static str, value: f64 },
    #[error("history size must be at least 1")]
    EmptyHistory,
    #[error("settling delay ({settling_ms} ms) must be shorter than timeout ({timeout_ms} ms)")]
    SettlingExceedsTimeout { settling_ms: u64, timeout_ms: u64 },
}

/// Failures surfaced to whoever drives a session.
///
/// A too-short free-fall or a timeout is not an error: both are normal
/// terminal outcomes of a session (see [`crate::detector::Outcome`]).
#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("no accelerometer samples arrived during the session")]
    SensorUnavailable,
    #[error("sample stream closed after {samples} samples without a finished throw")]
    StreamClosed { samples: u64 },
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
