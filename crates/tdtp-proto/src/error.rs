//! Error taxonomy shared by every TDTP component.
//!
//! One distinct variant per failure kind, so callers can match on
//! `TdtpError` instead of parsing messages.

use thiserror::Error;

/// The single error type returned by `tdtp-proto` operations.
///
/// Downstream crates (`tdtp-db`, `tdtp-etl`) define their own error enums
/// that wrap driver-specific failures and convert into this taxonomy at
/// the boundary; anything that doesn't fit a specific variant falls into
/// `Other(#[from] anyhow::Error)`.
#[derive(Debug, Error)]
pub enum TdtpError {
    #[error("config error: {0}")]
    Config(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("compression error: {0}")]
    Compression(String),

    #[error("checksum mismatch: expected {expected}, computed {computed}")]
    ChecksumMismatch { expected: String, computed: String },

    #[error("multi-part integrity error: {0}")]
    MultiPartIntegrity(String),

    #[error("strategy conflict on key {key}: row already exists")]
    StrategyConflict { key: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("permission error: {0}")]
    Permission(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, TdtpError>;

impl TdtpError {
    pub fn validation(msg: impl Into<String>) -> Self {
        TdtpError::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        TdtpError::Config(msg.into())
    }
}
