//! Per-request audit records and the sink they are handed to.
//!
//! Records are delivered from a background task. A failing sink is logged
//! and counted; it never affects the request that produced the record.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use crate::Result;
use crate::telemetry;
use crate::types::{BackendFailure, BackendId, BackendResult, OrchestrationResponse};

/// One backend's part in one completed request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditRecord {
    pub request_id: String,
    pub backend: BackendId,
    pub latency: Duration,
    pub cost_estimate: f64,
    pub cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub recorded_at: SystemTime,
}

impl AuditRecord {
    fn success(request_id: &str, result: &BackendResult, cached: bool) -> Self {
        Self {
            request_id: request_id.to_string(),
            backend: result.backend.clone(),
            latency: result.latency,
            cost_estimate: result.cost,
            cached,
            error: None,
            recorded_at: SystemTime::now(),
        }
    }

    fn failure(request_id: &str, failure: &BackendFailure) -> Self {
        Self {
            request_id: request_id.to_string(),
            backend: failure.backend.clone(),
            latency: failure.latency,
            cost_estimate: 0.0,
            cached: false,
            error: Some(format!("{}: {}", failure.kind, failure.message)),
            recorded_at: SystemTime::now(),
        }
    }
}

/// External store for audit records.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: &AuditRecord) -> Result<()>;
}

/// Sink that writes each record as a structured `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, record: &AuditRecord) -> Result<()> {
        info!(
            target: "orchesity::audit",
            request_id = %record.request_id,
            backend = %record.backend,
            latency_ms = record.latency.as_millis() as u64,
            cost_estimate = record.cost_estimate,
            cached = record.cached,
            error = record.error.as_deref(),
            "request audited"
        );
        Ok(())
    }
}

/// Records for every result and failure in `response`.
pub(crate) fn records_for_response(response: &OrchestrationResponse) -> Vec<AuditRecord> {
    response
        .results
        .iter()
        .map(|r| AuditRecord::success(&response.request_id, r, response.cached))
        .chain(
            response
                .errors
                .iter()
                .map(|f| AuditRecord::failure(&response.request_id, f)),
        )
        .collect()
}

pub(crate) fn records_for_failures(request_id: &str, errors: &[BackendFailure]) -> Vec<AuditRecord> {
    errors
        .iter()
        .map(|f| AuditRecord::failure(request_id, f))
        .collect()
}

/// Hand `records` to `sink` without waiting for it.
pub(crate) fn emit(sink: &Arc<dyn AuditSink>, records: Vec<AuditRecord>) {
    if records.is_empty() {
        return;
    }
    let sink = Arc::clone(sink);
    tokio::spawn(async move {
        for record in &records {
            if let Err(e) = sink.record(record).await {
                metrics::counter!(telemetry::AUDIT_FAILURES_TOTAL).increment(1);
                warn!(
                    request_id = %record.request_id,
                    backend = %record.backend,
                    error = %e,
                    "audit sink failed"
                );
            }
        }
    });
}
