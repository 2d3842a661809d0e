//! Error types for refindex.
//!
//! Most failures inside the engine are degradations rather than errors: the
//! index manager logs them and carries on with reduced capability. Only
//! [`RefIndexError::QueryInvalid`] is meant to reach the person typing a query.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the refindex library.
#[derive(Debug, Error)]
pub enum RefIndexError {
    // Engine errors
    #[error("Embedded engine unavailable: {message}")]
    EngineUnavailable { message: String },

    // Query errors
    #[error("Invalid query '{query}': {reason}")]
    QueryInvalid { query: String, reason: String },

    // Indexer errors
    #[error("Indexer degraded: {message}")]
    IndexerDegraded { message: String },

    #[error("Failed to extract text from {path:?}: {message}")]
    ExtractionFailure { path: PathBuf, message: String },

    // Reaper errors
    #[error("Failed to clean up stale instance at {path:?}: {message}")]
    ReaperCleanupFailure { path: PathBuf, message: String },

    // Database errors
    #[error("Database error: {message}")]
    Database {
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Index manager is closed")]
    Closed,

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for refindex operations.
pub type Result<T> = std::result::Result<T, RefIndexError>;

impl From<std::io::Error> for RefIndexError {
    fn from(err: std::io::Error) -> Self {
        RefIndexError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for RefIndexError {
    fn from(err: serde_json::Error) -> Self {
        RefIndexError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<rusqlite::Error> for RefIndexError {
    fn from(err: rusqlite::Error) -> Self {
        RefIndexError::Database {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl RefIndexError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        RefIndexError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    pub fn engine_unavailable(message: impl Into<String>) -> Self {
        RefIndexError::EngineUnavailable {
            message: message.into(),
        }
    }

    pub fn query_invalid(query: impl Into<String>, reason: impl Into<String>) -> Self {
        RefIndexError::QueryInvalid {
            query: query.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error should be shown to the user as-is.
    pub fn is_user_visible(&self) -> bool {
        matches!(self, RefIndexError::QueryInvalid { .. })
    }

    /// Whether this error means a backend is running with reduced capability.
    pub fn is_degradation(&self) -> bool {
        matches!(
            self,
            RefIndexError::EngineUnavailable { .. } | RefIndexError::IndexerDegraded { .. }
        )
    }
}
