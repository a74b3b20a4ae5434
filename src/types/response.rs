//! Per-backend results and the assembled orchestration response

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{BackendId, Usage};

/// Why a single backend call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The backend did not answer within its slice of the deadline.
    Timeout,
    /// The backend itself reported failure.
    Backend,
    /// The backend answered, but the answer was unusable.
    Malformed,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Backend => "backend_error",
            ErrorKind::Malformed => "malformed_response",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One successful backend call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendResult {
    pub backend: BackendId,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub usage: Usage,
    /// Cost estimate in USD (reported by the backend, or derived from its profile).
    pub cost: f64,
    pub latency: Duration,
    /// Backend-reported quality score in `[0, 1]`, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<f64>,
}

/// One failed backend call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendFailure {
    pub backend: BackendId,
    pub kind: ErrorKind,
    pub message: String,
    pub latency: Duration,
}

/// Outcome class of a dispatch.
///
/// `TimedOut` with at least one success is reported as `PartialSuccess`;
/// `AllFailed` and `TimedOut` only appear inside
/// [`OrchesityError::AllBackendsFailed`](crate::OrchesityError::AllBackendsFailed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    /// Every dispatched backend succeeded.
    Completed,
    /// At least `min_success` backends succeeded, but not all of them.
    PartialSuccess,
    /// Zero successes, and at least one backend reported an error.
    AllFailed,
    /// Zero successes, and no backend answered before its deadline.
    TimedOut,
}

impl DispatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchStatus::Completed => "completed",
            DispatchStatus::PartialSuccess => "partial_success",
            DispatchStatus::AllFailed => "all_failed",
            DispatchStatus::TimedOut => "timed_out",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self,
            DispatchStatus::Completed | DispatchStatus::PartialSuccess
        )
    }
}

/// Where the returned results came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSource {
    /// This request ran the dispatch.
    Dispatched,
    /// A stored cache entry.
    Cache,
    /// Joined an identical in-flight request and received its result.
    Joined,
}

/// The assembled result handed back to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationResponse {
    pub request_id: String,
    pub status: DispatchStatus,
    pub results: Vec<BackendResult>,
    pub errors: Vec<BackendFailure>,
    /// Backends still running when the caller was unblocked.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending: Vec<BackendId>,
    /// True when this caller did not trigger a dispatch of its own.
    pub cached: bool,
    pub source: ResultSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

impl OrchestrationResponse {
    /// First successful result, in completion order.
    pub fn primary(&self) -> Option<&BackendResult> {
        self.results.first()
    }

    /// Total cost across successful results.
    pub fn total_cost(&self) -> f64 {
        self.results.iter().map(|r| r.cost).sum()
    }
}
