//! Error types for the forecast agent.
//!
//! Backend and cache errors never leave the analyzer; they are absorbed by the
//! fallback chain. Source, sink and configuration errors reach the poll loop
//! or `main`.

use std::time::Duration;

use thiserror::Error;

/// Invalid occupancy sample.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ObservationError {
    #[error("occupied beds {occupied} exceed capacity {total_capacity}")]
    OverCapacity { occupied: u32, total_capacity: u32 },

    #[error("negative bed count: {0}")]
    Negative(i64),
}

/// Any failure of a reasoning backend.
///
/// All variants receive the same fallback treatment; the variant only matters
/// for logging.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("network error: {0}")]
    Network(String),

    #[error("backend timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate limited by backend")]
    RateLimited,

    #[error("backend rejected credentials (status {0})")]
    Unauthorized(u16),

    #[error("backend returned status {0}")]
    Status(u16),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("response violates schema: {0}")]
    Schema(String),
}

impl BackendError {
    /// Short label used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            BackendError::Network(_) => "network",
            BackendError::Timeout(_) => "timeout",
            BackendError::RateLimited => "rate_limited",
            BackendError::Unauthorized(_) => "unauthorized",
            BackendError::Status(_) => "status",
            BackendError::Malformed(_) => "malformed",
            BackendError::Schema(_) => "schema",
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            BackendError::Malformed(e.to_string())
        } else {
            BackendError::Network(e.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("no cached analysis")]
    Empty,

    #[error("cached analysis is corrupt: {0}")]
    Corrupt(String),

    #[error("cache I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// The history source could not provide input for a cycle.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("telemetry source unreachable: {0}")]
    Unreachable(String),

    #[error("telemetry source returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("could not decode telemetry rows: {0}")]
    Decode(String),

    #[error("no department available")]
    NoUnit,
}

impl From<reqwest::Error> for SourceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            SourceError::Decode(e.to_string())
        } else {
            SourceError::Unreachable(e.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink request failed: {0}")]
    Request(String),

    #[error("sink returned status {status}: {body}")]
    Status { status: u16, body: String },
}

impl From<reqwest::Error> for SinkError {
    fn from(e: reqwest::Error) -> Self {
        SinkError::Request(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing setting: {0}")]
    Missing(&'static str),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Top-level error for the agent binary and poll loop.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Sink(#[from] SinkError),
}

pub type Result<T> = std::result::Result<T, AgentError>;
