//! Telemetry metric name constants.
//!
//! Centralised metric names for orchestration. Consumers install their own
//! `metrics` recorder (e.g. prometheus, statsd); without a recorder
//! installed, all metric calls are no-ops.
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `orchesity_`. Counters end in `_total`,
//! histograms use meaningful units (e.g. `_seconds`).
//!
//! # Common labels
//!
//! - `backend`: backend id (e.g. "openai/gpt-4")
//! - `policy`: selection policy (e.g. "load_balanced", "round_robin")
//! - `status`: outcome; for requests a dispatch status such as
//!   "completed" or "timed_out", for backend calls "ok", "timeout",
//!   "backend_error" or "malformed_response"

/// Total orchestration requests.
///
/// Labels: `policy`, `status` (dispatch status, "cached", or "rejected").
pub const REQUESTS_TOTAL: &str = "orchesity_requests_total";

/// End-to-end request duration in seconds.
///
/// Labels: `policy`.
pub const REQUEST_DURATION_SECONDS: &str = "orchesity_request_duration_seconds";

/// Total backend calls made by the dispatcher.
///
/// Labels: `backend`, `status`.
pub const BACKEND_CALLS_TOTAL: &str = "orchesity_backend_calls_total";

/// Backend call duration in seconds.
///
/// Labels: `backend`.
pub const BACKEND_CALL_DURATION_SECONDS: &str = "orchesity_backend_call_duration_seconds";

/// Total retry attempts (not counting the initial call).
///
/// Labels: `backend`.
pub const RETRIES_TOTAL: &str = "orchesity_retries_total";

/// Total response cache hits.
pub const CACHE_HITS_TOTAL: &str = "orchesity_cache_hits_total";

/// Total response cache misses, including expired entries.
pub const CACHE_MISSES_TOTAL: &str = "orchesity_cache_misses_total";

/// Requests that waited on an identical in-flight request instead of
/// dispatching.
pub const SINGLE_FLIGHT_JOINS_TOTAL: &str = "orchesity_single_flight_joins_total";

/// Times a backend's circuit opened.
///
/// Labels: `backend`.
pub const CIRCUIT_OPENED_TOTAL: &str = "orchesity_circuit_opened_total";

/// Backend calls that finished after their caller stopped waiting.
///
/// Labels: `backend`.
pub const LATE_COMPLETIONS_TOTAL: &str = "orchesity_late_completions_total";

/// Audit records the sink failed to persist.
pub const AUDIT_FAILURES_TOTAL: &str = "orchesity_audit_failures_total";
