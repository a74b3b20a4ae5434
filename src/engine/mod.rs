//! The orchestration engine.
//!
//! [`Orchestrator::orchestrate`] composes the pieces of the crate:
//! resolve candidates → fingerprint → cache or single-flight join → rank →
//! dispatch → cache write → response. Metrics are updated by the
//! dispatcher as calls settle; a cache hit touches no backend metrics.
//!
//! The orchestrator exclusively owns its [`MetricsStore`] and
//! [`CacheGateway`]. The administrative surface (snapshots, resets,
//! probes, cache maintenance) lives in [`admin`].

pub mod admin;
pub mod audit;
mod builder;

pub use admin::{BackendStats, ProbeReport};
pub use audit::{AuditRecord, AuditSink, TracingAuditSink};
pub use builder::{Orchesity, OrchesityBuilder};

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::Instant;
use tracing::{debug, instrument};

use crate::backend::{BackendRegistry, BackendSlot};
use crate::cache::{CacheGateway, RequestFingerprint, Resolution};
use crate::config::EngineConfig;
use crate::dispatch::{DispatchPlan, Dispatcher};
use crate::scoring::{MetricsStore, WeightScorer};
use crate::telemetry;
use crate::types::{
    BackendId, DispatchStatus, OrchestrationRequest, OrchestrationResponse, ResultSource,
    SelectionPolicy,
};
use crate::{OrchesityError, Result};

/// Routes requests across registered backends.
///
/// Build one with [`Orchesity::builder()`]. All methods take `&self`; share
/// it behind an `Arc` to serve concurrent requests.
pub struct Orchestrator {
    config: EngineConfig,
    registry: BackendRegistry,
    store: Arc<MetricsStore>,
    scorer: WeightScorer,
    dispatcher: Dispatcher,
    cache: Option<CacheGateway>,
    audit: Arc<dyn AuditSink>,
    sequence: AtomicU64,
}

/// Everything `orchestrate` derives from a request before dispatching.
struct Routing {
    candidates: Vec<BackendId>,
    /// `None` when the caller named no backends.
    requested: Option<usize>,
    min_success: usize,
    deadline: Duration,
}

impl Orchestrator {
    /// Orchestrate one request.
    ///
    /// Returns `Err(AllBackendsFailed)` when no backend succeeded and
    /// `Err(NoEligibleBackends)` when nothing could be dispatched to; both
    /// carry the per-backend detail.
    #[instrument(
        skip_all,
        fields(policy = %self.config.routing.policy, backends = request.backends.len(), stream = request.stream)
    )]
    pub async fn orchestrate(&self, request: OrchestrationRequest) -> Result<OrchestrationResponse> {
        let started = Instant::now();
        let policy = self.policy().as_str();
        let request_id = self.next_request_id();
        let result = self.run(&request_id, request).await;

        let status = match &result {
            Ok(response) if response.cached => "cached",
            Ok(response) => response.status.as_str(),
            Err(OrchesityError::AllBackendsFailed { timed_out: true, .. }) => "timed_out",
            Err(OrchesityError::AllBackendsFailed { .. }) => "all_failed",
            Err(_) => "rejected",
        };
        metrics::counter!(telemetry::REQUESTS_TOTAL,
            "policy" => policy,
            "status" => status,
        )
        .increment(1);
        metrics::histogram!(telemetry::REQUEST_DURATION_SECONDS, "policy" => policy)
            .record(started.elapsed().as_secs_f64());

        let records = match &result {
            Ok(response) => audit::records_for_response(response),
            Err(OrchesityError::AllBackendsFailed { errors, .. }) => {
                audit::records_for_failures(&request_id, errors)
            }
            Err(_) => Vec::new(),
        };
        audit::emit(&self.audit, records);
        result
    }

    async fn run(&self, request_id: &str, request: OrchestrationRequest) -> Result<OrchestrationResponse> {
        validate(&request)?;
        let routing = self.route(&request)?;

        let cache = self.cache.as_ref().filter(|_| request.use_cache);
        let Some(cache) = cache else {
            return self.dispatch(request_id, &request, &routing, None).await;
        };

        let fingerprint =
            RequestFingerprint::compute(&request, &routing.candidates, routing.min_success)?;
        let ttl = request
            .cache_ttl_secs
            .map_or_else(|| cache.default_ttl(), Duration::from_secs);
        let resolution = cache
            .resolve(&fingerprint, ttl, || {
                self.dispatch(request_id, &request, &routing, Some(&fingerprint))
            })
            .await;

        match resolution {
            Resolution::Hit(results) => Ok(OrchestrationResponse {
                request_id: request_id.to_string(),
                status: DispatchStatus::Completed,
                results,
                errors: Vec::new(),
                pending: Vec::new(),
                cached: true,
                source: ResultSource::Cache,
                fingerprint: Some(fingerprint.to_string()),
            }),
            Resolution::Joined(result) => result.map(|mut response| {
                response.request_id = request_id.to_string();
                response.cached = true;
                response.source = ResultSource::Joined;
                response
            }),
            Resolution::Dispatched(result) => result,
        }
    }

    /// Work out the candidate set, success threshold and deadline.
    fn route(&self, request: &OrchestrationRequest) -> Result<Routing> {
        let requested = request.distinct_backends();
        if let Some(unknown) = requested.iter().find(|id| !self.registry.contains(id)) {
            return Err(OrchesityError::UnknownBackend(unknown.to_string()));
        }

        let candidates = if requested.is_empty() {
            self.registry.ids()
        } else if self.config.routing.fallback_to_any && !requested.iter().any(|id| self.is_eligible(id)) {
            debug!(requested = ?requested, "no requested backend is eligible, widening to all");
            self.registry.ids()
        } else {
            requested.clone()
        };
        if candidates.is_empty() {
            return Err(OrchesityError::NoEligibleBackends {
                candidates,
                circuit_open: Vec::new(),
            });
        }

        Ok(Routing {
            candidates,
            requested: (!requested.is_empty()).then_some(requested.len()),
            min_success: request
                .min_success
                .unwrap_or(self.config.dispatch.min_success),
            deadline: request
                .deadline_ms
                .map_or_else(|| self.config.dispatch.deadline(), Duration::from_millis),
        })
    }

    async fn dispatch(
        &self,
        request_id: &str,
        request: &OrchestrationRequest,
        routing: &Routing,
        fingerprint: Option<&RequestFingerprint>,
    ) -> Result<OrchestrationResponse> {
        let ranked: Vec<Arc<BackendSlot>> = self
            .scorer
            .rank(&routing.candidates, self.policy(), &self.store)
            .iter()
            .filter_map(|id| self.registry.get(id))
            .filter(|slot| slot.has_capacity())
            .cloned()
            .collect();
        if ranked.is_empty() {
            return Err(self.no_eligible(&routing.candidates));
        }

        // one backend with failover, unless the caller asked for several or for a stream
        let fan_out = match (routing.requested, request.stream) {
            (Some(n), _) => n,
            (None, true) => ranked.len(),
            (None, false) => 1,
        };
        let plan = DispatchPlan {
            prompt: Arc::from(request.prompt.as_str()),
            params: Arc::new(request.params.clone()),
            fan_out,
            min_success: routing.min_success.min(fan_out.min(ranked.len())),
            deadline: routing.deadline,
        };
        let outcome = self.dispatcher.execute(&ranked, &plan).await;
        if outcome.launched == 0 {
            return Err(self.no_eligible(&routing.candidates));
        }
        let outcome = outcome.into_result()?;

        Ok(OrchestrationResponse {
            request_id: request_id.to_string(),
            status: outcome.status,
            results: outcome.results,
            errors: outcome.errors,
            pending: outcome.pending,
            cached: false,
            source: ResultSource::Dispatched,
            fingerprint: fingerprint.map(ToString::to_string),
        })
    }

    fn no_eligible(&self, candidates: &[BackendId]) -> OrchesityError {
        OrchesityError::NoEligibleBackends {
            candidates: candidates.to_vec(),
            circuit_open: candidates
                .iter()
                .filter(|id| self.store.is_circuit_open(id))
                .cloned()
                .collect(),
        }
    }

    fn is_eligible(&self, id: &BackendId) -> bool {
        !self.store.is_circuit_open(id)
            && self.registry.get(id).is_some_and(|slot| slot.has_capacity())
    }

    /// `req_<unix-millis>_<sequence>`.
    fn next_request_id(&self) -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis());
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!("req_{millis}_{seq}")
    }

    /// The active selection policy.
    pub fn policy(&self) -> SelectionPolicy {
        self.config.routing.policy
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Registered backend ids in registration order.
    pub fn backends(&self) -> Vec<BackendId> {
        self.registry.ids()
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("policy", &self.config.routing.policy)
            .field("backends", &self.registry.ids())
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

fn validate(request: &OrchestrationRequest) -> Result<()> {
    if request.prompt.trim().is_empty() {
        return Err(OrchesityError::InvalidInput("prompt must not be empty".into()));
    }
    if request.min_success == Some(0) {
        return Err(OrchesityError::InvalidInput("min_success must be at least 1".into()));
    }
    if request.deadline_ms == Some(0) {
        return Err(OrchesityError::InvalidInput("deadline must be positive".into()));
    }
    Ok(())
}
