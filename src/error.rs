//! Orchesity error types

use std::time::Duration;

use crate::types::{BackendFailure, BackendId, ErrorKind};

/// Orchesity error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum OrchesityError {
    // Backend-originated errors, folded into partial results by the dispatcher
    #[error("backend {backend} timed out after {after:?}")]
    BackendTimeout { backend: BackendId, after: Duration },

    #[error("backend {backend} failed: {message}")]
    Backend { backend: BackendId, message: String },

    #[error("backend {backend} returned a malformed response: {reason}")]
    MalformedResponse { backend: BackendId, reason: String },

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("HTTP error: {0}")]
    Http(String),

    // Request-level failures surfaced to the caller
    /// Zero backends succeeded before the deadline.
    ///
    /// `timed_out` is set when no backend answered at all, so callers can
    /// tell "backends never answered" apart from "backends said no".
    #[error("all {} dispatched backends failed (timed out: {timed_out})", errors.len())]
    AllBackendsFailed {
        timed_out: bool,
        errors: Vec<BackendFailure>,
    },

    /// Every candidate is circuit-open or at capacity, or the candidate set is empty.
    #[error("no eligible backends among {} candidates", candidates.len())]
    NoEligibleBackends {
        candidates: Vec<BackendId>,
        circuit_open: Vec<BackendId>,
    },

    #[error("unknown backend: {0}")]
    UnknownBackend(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    // Configuration errors
    #[error("configuration error: {0}")]
    Configuration(String),

    // Collaborator errors, never fatal to the request path
    #[error("cache error: {0}")]
    Cache(String),

    #[error("audit sink error: {0}")]
    Audit(String),
}

impl OrchesityError {
    /// Whether a retry of the same call could reasonably succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OrchesityError::RateLimited { .. }
                | OrchesityError::Http(_)
                | OrchesityError::BackendTimeout { .. }
        )
    }

    /// Provider-supplied backoff hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            OrchesityError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Classification used for metrics and per-backend failure detail.
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchesityError::BackendTimeout { .. } => ErrorKind::Timeout,
            OrchesityError::MalformedResponse { .. } => ErrorKind::Malformed,
            _ => ErrorKind::Backend,
        }
    }
}

impl From<serde_json::Error> for OrchesityError {
    fn from(err: serde_json::Error) -> Self {
        OrchesityError::InvalidInput(format!("JSON error: {err}"))
    }
}

/// Result type alias for Orchesity operations
pub type Result<T> = std::result::Result<T, OrchesityError>;
