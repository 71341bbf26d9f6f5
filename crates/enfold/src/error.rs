//! Error taxonomy for the retrieval core.
//!
//! Inside the request path nothing except [`Error::InvalidArgument`] and
//! [`Error::ExternalPersistence`] escapes to the caller; every other kind is
//! recovered locally and annotated into warnings, skip reasons, or truncated
//! results.

use thiserror::Error;

/// Core error type.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Caller passed an argument the operation cannot work with.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A write path was handed externally-marked content.
    #[error("external content blocked: {count} {item_type} item(s) carry external markers: {urls:?}")]
    ExternalPersistence {
        /// Number of offending items.
        count: usize,
        /// The item type the write path was committing (e.g. "memory").
        item_type: String,
        /// Offending URLs, where a URL was present on the marker.
        urls: Vec<String>,
    },

    /// A circuit breaker rejected the call without invoking the backend.
    #[error("circuit breaker '{0}' is open")]
    BreakerOpen(String),

    /// An operation exceeded its latency budget.
    #[error("{operation} timed out after {budget_ms}ms")]
    Timeout {
        /// The operation that was cancelled.
        operation: String,
        /// The budget that expired.
        budget_ms: u64,
    },

    /// A remote backend failed or is unreachable.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Stored data violated a structural invariant (dangling edge, missing
    /// entity). Recoverable: callers skip the offending row.
    #[error("data integrity: {0}")]
    DataIntegrity(String),

    /// Configuration failed validation at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Anything else.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Invalid-argument error from any displayable message.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Configuration error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Backend-unavailable error from any displayable message.
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::BackendUnavailable(msg.into())
    }

    /// Catch-all error from any displayable message.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Timeout for a named operation.
    pub fn timeout(operation: impl Into<String>, budget_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            budget_ms,
        }
    }

    /// True when this error is a breaker rejection.
    #[must_use]
    pub fn is_breaker_open(&self) -> bool {
        matches!(self, Self::BreakerOpen(_))
    }

    /// Short stable kind tag, used in skip reasons and warnings.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "invalid_argument",
            Self::ExternalPersistence { .. } => "external_persistence",
            Self::BreakerOpen(_) => "breaker_open",
            Self::Timeout { .. } => "timeout",
            Self::BackendUnavailable(_) => "backend_unavailable",
            Self::DataIntegrity(_) => "data_integrity",
            Self::Config(_) => "config",
            Self::Other(_) => "other",
        }
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
