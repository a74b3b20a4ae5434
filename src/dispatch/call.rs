//! One backend call, run as its own task.
//!
//! The task owns the in-flight reservation and is the only place a call's
//! outcome reaches the [`MetricsStore`]. It reports to the collector once
//! the call settles or its slice elapses, whichever comes first; after a
//! timeout it keeps polling the call for the grace period so the real
//! outcome still updates the backend's metrics.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::OrchesityError;
use crate::backend::{BackendSlot, InFlightGuard};
use crate::scoring::{CallOutcome, MetricsStore};
use crate::telemetry;
use crate::types::{
    BackendFailure, BackendId, BackendReply, BackendResult, ErrorKind, GenerationParams, Usage,
};

/// What a call task sends back to the collector.
#[derive(Debug)]
pub(super) struct Report {
    pub backend: BackendId,
    pub outcome: std::result::Result<BackendResult, BackendFailure>,
}

pub(super) struct CallContext {
    pub store: Arc<MetricsStore>,
    pub prompt: Arc<str>,
    pub params: Arc<GenerationParams>,
    pub slice: Duration,
    pub grace: Duration,
    pub reports: mpsc::UnboundedSender<Report>,
}

pub(super) async fn run(guard: InFlightGuard, ctx: CallContext) {
    let slot = Arc::clone(guard.slot());
    let backend = slot.id().clone();
    let started = Instant::now();
    let mut call = std::pin::pin!(slot.backend().invoke(&ctx.prompt, &ctx.params, ctx.slice));

    match tokio::time::timeout(ctx.slice, call.as_mut()).await {
        Ok(reply) => {
            let outcome = settle(&slot, &ctx.prompt, reply, started.elapsed());
            record(&ctx.store, &backend, &outcome, false);
            // the collector may already have returned
            let _ = ctx.reports.send(Report { backend, outcome });
        }
        Err(_) => {
            let timeout = OrchesityError::BackendTimeout {
                backend: backend.clone(),
                after: ctx.slice,
            };
            let outcome = Err(failure(&backend, &timeout, ctx.slice));
            record(&ctx.store, &backend, &outcome, false);
            let _ = ctx.reports.send(Report {
                backend: backend.clone(),
                outcome,
            });

            match tokio::time::timeout(ctx.grace, call).await {
                Ok(reply) => {
                    let outcome = settle(&slot, &ctx.prompt, reply, started.elapsed());
                    metrics::counter!(telemetry::LATE_COMPLETIONS_TOTAL,
                        "backend" => backend.to_string(),
                    )
                    .increment(1);
                    debug!(
                        backend = %backend,
                        ok = outcome.is_ok(),
                        latency_ms = started.elapsed().as_millis() as u64,
                        "late completion recorded"
                    );
                    record(&ctx.store, &backend, &outcome, true);
                }
                Err(_) => {
                    debug!(backend = %backend, "abandoned call after grace period");
                }
            }
        }
    }
    drop(guard);
}

/// Turn a backend reply into a result or a classified failure.
///
/// An empty reply is malformed. Missing usage is estimated from word
/// counts, and missing cost is derived from the backend's token price.
fn settle(
    slot: &BackendSlot,
    prompt: &str,
    reply: crate::Result<BackendReply>,
    latency: Duration,
) -> std::result::Result<BackendResult, BackendFailure> {
    let backend = slot.id();
    let reply = match reply {
        Ok(reply) if reply.text.trim().is_empty() => {
            let err = OrchesityError::MalformedResponse {
                backend: backend.clone(),
                reason: "empty response text".into(),
            };
            return Err(failure(backend, &err, latency));
        }
        Ok(reply) => reply,
        Err(err) => return Err(failure(backend, &err, latency)),
    };
    let usage = reply
        .usage
        .unwrap_or_else(|| Usage::estimate(prompt, &reply.text));
    let cost = reply
        .cost
        .unwrap_or_else(|| slot.profile().estimate_cost(&usage));
    Ok(BackendResult {
        backend: backend.clone(),
        text: reply.text,
        model: reply.model,
        usage,
        cost,
        latency,
        quality: reply.quality,
    })
}

fn failure(backend: &BackendId, err: &OrchesityError, latency: Duration) -> BackendFailure {
    BackendFailure {
        backend: backend.clone(),
        kind: err.kind(),
        message: err.to_string(),
        latency,
    }
}

fn record(
    store: &MetricsStore,
    backend: &BackendId,
    outcome: &std::result::Result<BackendResult, BackendFailure>,
    late: bool,
) {
    let (mut observation, status, latency) = match outcome {
        Ok(result) => {
            let mut observation = CallOutcome::success(result.latency).cost(result.cost);
            if let Some(quality) = result.quality {
                observation = observation.quality(quality);
            }
            (observation, "ok", result.latency)
        }
        Err(failure) => {
            if failure.kind != ErrorKind::Timeout {
                warn!(backend = %backend, kind = %failure.kind, error = %failure.message, "backend call failed");
            } else {
                warn!(backend = %backend, after_ms = failure.latency.as_millis() as u64, "backend call timed out");
            }
            (
                CallOutcome::failure(failure.kind, failure.message.clone(), failure.latency),
                failure.kind.as_str(),
                failure.latency,
            )
        }
    };
    if late {
        observation = observation.late();
    }
    metrics::counter!(telemetry::BACKEND_CALLS_TOTAL,
        "backend" => backend.to_string(),
        "status" => status,
    )
    .increment(1);
    metrics::histogram!(telemetry::BACKEND_CALL_DURATION_SECONDS,
        "backend" => backend.to_string(),
    )
    .record(latency.as_secs_f64());
    store.record_outcome(backend, &observation);
}
