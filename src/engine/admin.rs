//! Administrative operations on a running [`Orchestrator`].
//!
//! These read or reset the metrics store and the cache; they are meant to
//! be exposed by an operator-facing API layer, not called on the request
//! path.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use super::Orchestrator;
use crate::cache::CacheStats;
use crate::dispatch::DispatchPlan;
use crate::scoring::BackendMetrics;
use crate::types::{BackendId, GenerationParams};
use crate::{OrchesityError, Result};

/// Prompt sent by [`Orchestrator::probe`].
pub const PROBE_PROMPT: &str = "Hello, this is a test message.";

/// Live view of one backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendStats {
    pub backend: BackendId,
    pub metrics: BackendMetrics,
    pub in_flight: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_in_flight: Option<usize>,
    pub circuit_open: bool,
    /// `load_balanced` composite score among eligible backends; `None`
    /// while the circuit is open.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

/// Result of a direct backend probe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeReport {
    pub backend: BackendId,
    pub success: bool,
    pub latency: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Orchestrator {
    /// Snapshot of every backend's metrics.
    pub fn metrics_snapshot(&self) -> BTreeMap<BackendId, BackendMetrics> {
        self.store.snapshot()
    }

    pub fn backend_metrics(&self, backend: &BackendId) -> Option<BackendMetrics> {
        self.store.get(backend)
    }

    /// Reset one backend's metrics, or all of them with `None`.
    ///
    /// A reset backend's circuit closes immediately.
    pub fn reset_metrics(&self, backend: Option<&BackendId>) -> Result<()> {
        self.store.reset(backend)
    }

    /// The backend the active policy would pick first right now, with its
    /// metrics. Does not advance round-robin or random selection.
    pub fn top_backend(&self) -> Option<(BackendId, BackendMetrics)> {
        let top = self
            .scorer
            .peek(&self.registry.ids(), self.policy(), &self.store)
            .into_iter()
            .next()?;
        let metrics = self.store.get(&top)?;
        Some((top, metrics))
    }

    /// Per-backend metrics, load and health in registration order.
    pub fn backend_stats(&self) -> Vec<BackendStats> {
        let ids = self.registry.ids();
        let scores: BTreeMap<_, _> = self.scorer.scores(&ids, &self.store).into_iter().collect();
        self.registry
            .iter()
            .filter_map(|slot| {
                let id = slot.id();
                Some(BackendStats {
                    backend: id.clone(),
                    metrics: self.store.get(id)?,
                    in_flight: slot.in_flight(),
                    max_in_flight: slot.profile().max_in_flight,
                    circuit_open: self.store.is_circuit_open(id),
                    score: scores.get(id).copied(),
                })
            })
            .collect()
    }

    /// Send [`PROBE_PROMPT`] straight to `backend`, bypassing ranking and
    /// the cache.
    ///
    /// The outcome is recorded like any other call, so a successful probe
    /// closes an open circuit.
    pub async fn probe(&self, backend: &BackendId) -> Result<ProbeReport> {
        let slot = self
            .registry
            .get(backend)
            .ok_or_else(|| OrchesityError::UnknownBackend(backend.to_string()))?;
        let plan = DispatchPlan {
            prompt: Arc::from(PROBE_PROMPT),
            params: Arc::new(GenerationParams::default()),
            fan_out: 1,
            min_success: 1,
            deadline: self.config.dispatch.deadline(),
        };
        let outcome = self
            .dispatcher
            .execute(std::slice::from_ref(slot), &plan)
            .await;

        if let Some(result) = outcome.results.into_iter().next() {
            return Ok(ProbeReport {
                backend: backend.clone(),
                success: true,
                latency: result.latency,
                response: Some(result.text),
                error: None,
            });
        }
        let report = match outcome.errors.into_iter().next() {
            Some(failure) => ProbeReport {
                backend: backend.clone(),
                success: false,
                latency: failure.latency,
                response: None,
                error: Some(failure.message),
            },
            None => ProbeReport {
                backend: backend.clone(),
                success: false,
                latency: Duration::ZERO,
                response: None,
                error: Some("backend at capacity".into()),
            },
        };
        Ok(report)
    }

    /// Delete cached responses whose keys match the glob `pattern`
    /// (e.g. `llm_response:*`). Returns the number removed; `0` when
    /// caching is disabled.
    pub async fn clear_cache(&self, pattern: &str) -> Result<u64> {
        match &self.cache {
            Some(cache) => cache.clear(pattern).await,
            None => Ok(0),
        }
    }

    /// Cache counters, or `None` when caching is disabled.
    pub async fn cache_stats(&self) -> Option<CacheStats> {
        match &self.cache {
            Some(cache) => Some(cache.stats().await),
            None => None,
        }
    }

    /// Reseed the `random` policy.
    pub fn reseed(&self, seed: u64) {
        self.scorer.reseed(seed);
    }
}
