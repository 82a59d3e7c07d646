use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Validation error on '{field}': {message}")]
    Validation { field: &'static str, message: String },

    #[error("Expired window: {timestamp} is older than retained data (retained from {retained_from})")]
    ExpiredWindow {
        timestamp: DateTime<Utc>,
        retained_from: DateTime<Utc>,
    },

    #[error("Stale rollup for {metric_id}/{organization_id} at {bucket_start}: {reason}")]
    StaleRollup {
        metric_id: String,
        organization_id: String,
        bucket_start: DateTime<Utc>,
        reason: String,
    },

    #[error("Batch partially failed: {failed} of {total} records rejected")]
    PartialBatchFailure { failed: usize, total: usize },

    #[error("Partition {0} is sealed")]
    PartitionSealed(String),

    #[error("Partition {0} is no longer readable")]
    PartitionUnavailable(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("Channel send error")]
    ChannelSend,

    #[error("Operation cancelled")]
    Cancelled,
}

/// Result type alias for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    /// Creates a new validation error
    pub fn validation<S: Into<String>>(field: &'static str, msg: S) -> Self {
        Self::Validation {
            field,
            message: msg.into(),
        }
    }

    /// Creates a new storage error
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }

    /// Creates a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Creates a new compression error
    pub fn compression<S: Into<String>>(msg: S) -> Self {
        Self::Compression(msg.into())
    }

    /// Creates a new archive error
    pub fn archive<S: Into<String>>(msg: S) -> Self {
        Self::Archive(msg.into())
    }

    /// Returns true if a background job should try the same work again on its next tick.
    ///
    /// Caller-side errors (validation, expired windows) are never retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Compression(_)
            | Self::Storage(_)
            | Self::Archive(_)
            | Self::Io(_)
            | Self::ChannelSend => true,
            Self::StaleRollup { .. } => true,
            _ => false,
        }
    }

    /// Returns the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::ExpiredWindow { .. } => "expired_window",
            Self::StaleRollup { .. } => "stale_rollup",
            Self::PartialBatchFailure { .. } => "partial_batch",
            Self::PartitionSealed(_) | Self::PartitionUnavailable(_) => "partition",
            Self::Compression(_) => "compression",
            Self::Storage(_) => "storage",
            Self::Config(_) => "config",
            Self::Archive(_) => "archive",
            Self::NotFound(_) => "not_found",
            Self::Io(_) => "io",
            Self::Serialization(_) | Self::Encoding(_) => "serialization",
            Self::ChannelSend => "channel",
            Self::Cancelled => "cancelled",
        }
    }
}
