//! Error types for the relay.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Configuration-related errors. All of these are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Invalid pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Errors reported by the messaging platform on `send`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlatformError {
    #[error("Rate limited, retry after {retry_after:?}")]
    Throttled { retry_after: Duration },

    #[error("Channel not found")]
    NotFound,

    #[error("Permission denied")]
    PermissionDenied,

    /// Any other client-side error (e.g. malformed or oversized message).
    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Transient platform failure: {0}")]
    Transient(String),
}

impl PlatformError {
    /// Whether another attempt may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Throttled { .. } | Self::Transient(_))
    }

    /// Platform-mandated wait before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Throttled { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

/// Dispatch queue errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("Dispatch queue full (capacity {capacity})")]
    Full { capacity: usize },

    #[error("Dispatch queue closed")]
    Closed,
}

/// Errors from the relay pipeline outside of individual deliveries.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Inbound stream failed to start: {0}")]
    StartupFailed(String),
}

/// Result type alias for the relay.
pub type Result<T> = std::result::Result<T, Error>;
