// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the mirror sync engine.
//!
//! Errors are categorized by where they happen (origin API, mirror database,
//! subscription management) and carry enough context to find the failing
//! base, table or record in logs.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Origin` | Depends | Origin API failure; transient for network, 429 and 5xx |
//! | `SubscriptionLimit` | No | Account-wide webhook limit reached for a base |
//! | `Mirror` | No | Local database error (needs operator attention) |
//! | `MirrorWrite` | No | Origin write succeeded but the mirror write failed |
//! | `Scan` | No | Table scan failed after all retries |
//! | `Mapping` | No | Unknown table or invalid mapping declaration |
//! | `Config` | No | Configuration invalid |
//! | `Decode` | No | Origin response could not be decoded |
//! | `InvalidState` | No | Engine state machine violation |
//! | `Shutdown` | No | Engine is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Use [`MirrorError::is_retryable()`] to decide whether an operation should
//! be retried with backoff. Only origin failures that look transient qualify.

use thiserror::Error;

/// Result type alias for mirror sync operations.
pub type Result<T> = std::result::Result<T, MirrorError>;

/// Errors that can occur while keeping the mirror in sync.
#[derive(Error, Debug)]
pub enum MirrorError {
    /// Origin API call failed.
    ///
    /// `status` is the HTTP status when the origin answered at all.
    /// `None` means the request never got a response (timeout, reset).
    #[error("Origin error ({operation}): {message}")]
    Origin {
        operation: String,
        status: Option<u16>,
        message: String,
    },

    /// The origin refused to create another subscription for this base.
    #[error("Subscription limit reached for base {base_id}: {message}")]
    SubscriptionLimit { base_id: String, message: String },

    /// SQLite error in the mirror or metadata tables.
    #[error("Mirror store error: {0}")]
    Mirror(#[from] sqlx::Error),

    /// The origin accepted a write but the mirror did not.
    ///
    /// The mirror is now behind the origin for this record until the next
    /// change or full sync touches it. Never swallowed.
    #[error("Mirror write failed for {table}/{record_id} after origin write: {message}")]
    MirrorWrite {
        table: String,
        record_id: String,
        message: String,
    },

    /// Full scan of a table failed after all attempts.
    #[error("Failed to scan records after {attempts} retries: {details}")]
    Scan { attempts: usize, details: String },

    /// Unknown table, or a mapping declaration that breaks an invariant.
    #[error("Mapping error: {0}")]
    Mapping(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Origin response body did not match the expected shape.
    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// Operation attempted in the wrong engine state.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MirrorError {
    /// Create an origin error from a status code and message.
    pub fn origin(operation: impl Into<String>, status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Origin {
            operation: operation.into(),
            status,
            message: message.into(),
        }
    }

    /// HTTP status reported by the origin, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Origin { status, .. } => *status,
            _ => None,
        }
    }

    /// Variant name, for logs, metric labels and error details.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Origin { .. } => "Origin",
            Self::SubscriptionLimit { .. } => "SubscriptionLimit",
            Self::Mirror(_) => "Mirror",
            Self::MirrorWrite { .. } => "MirrorWrite",
            Self::Scan { .. } => "Scan",
            Self::Mapping(_) => "Mapping",
            Self::Config(_) => "Config",
            Self::Decode(_) => "Decode",
            Self::InvalidState { .. } => "InvalidState",
            Self::Shutdown => "Shutdown",
            Self::Internal(_) => "Internal",
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Origin { status, .. } => match status {
                None => true,
                Some(429) => true,
                Some(code) => *code >= 500,
            },
            Self::SubscriptionLimit { .. } => false,
            Self::Mirror(_) => false,
            Self::MirrorWrite { .. } => false,
            Self::Scan { .. } => false,
            Self::Mapping(_) => false,
            Self::Config(_) => false,
            Self::Decode(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }
}

impl From<reqwest::Error> for MirrorError {
    fn from(e: reqwest::Error) -> Self {
        let status = e.status().map(|s| s.as_u16());
        Self::origin("http", status, e.to_string())
    }
}
