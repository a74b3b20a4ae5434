//! Builder for configuring orchestrator instances

use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use tracing::warn;

use super::{AuditSink, Orchestrator, TracingAuditSink};
use crate::backend::{Backend, BackendProfile, BackendRegistry};
use crate::cache::{CacheBackend, CacheGateway, MemoryCache};
use crate::config::EngineConfig;
use crate::dispatch::{DispatchSettings, Dispatcher};
use crate::scoring::{MetricsStore, WeightScorer};
use crate::types::SelectionPolicy;
use crate::{OrchesityError, Result};

/// Main entry point for creating orchestrators.
pub struct Orchesity;

impl Orchesity {
    /// Create a new builder for configuring the orchestrator.
    pub fn builder() -> OrchesityBuilder {
        OrchesityBuilder::new()
    }
}

/// Builder for configuring orchestrator instances.
pub struct OrchesityBuilder {
    config: EngineConfig,
    backends: Vec<(Arc<dyn Backend>, Option<BackendProfile>)>,
    cache_backend: Option<Arc<dyn CacheBackend>>,
    audit_sink: Option<Arc<dyn AuditSink>>,
    seed: Option<u64>,
}

impl OrchesityBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            backends: Vec::new(),
            cache_backend: None,
            audit_sink: None,
            seed: None,
        }
    }

    /// Use `config` for every setting not given explicitly.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the selection policy.
    pub fn policy(mut self, policy: SelectionPolicy) -> Self {
        self.config.routing.policy = policy;
        self
    }

    /// Register a backend. Its profile is taken from the config's
    /// `[[backends]]` entry with the same id, if any.
    pub fn backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backends.push((backend, None));
        self
    }

    /// Register a backend with an explicit profile.
    pub fn backend_with_profile(mut self, backend: Arc<dyn Backend>, profile: BackendProfile) -> Self {
        self.backends.push((backend, Some(profile)));
        self
    }

    /// Store cached responses in `store` instead of the in-memory cache.
    pub fn cache_backend(mut self, store: Arc<dyn CacheBackend>) -> Self {
        self.cache_backend = Some(store);
        self
    }

    /// Disable the response cache.
    pub fn disable_cache(mut self) -> Self {
        self.config.cache.enabled = false;
        self
    }

    /// Deliver an audit record per backend call to `sink` instead of
    /// logging it through [`TracingAuditSink`].
    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit_sink = Some(sink);
        self
    }

    /// Seed the `random` policy for reproducible selection.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Build the orchestrator.
    pub fn build(self) -> Result<Orchestrator> {
        let config = self.config;
        config.validate()?;
        if self.backends.is_empty() {
            return Err(OrchesityError::Configuration(
                "at least one backend must be registered".into(),
            ));
        }

        let mut registry = BackendRegistry::new();
        registry.set_retry_config(config.retry.clone());
        for (backend, profile) in self.backends {
            let profile = profile
                .or_else(|| config.profile(backend.id()).cloned())
                .unwrap_or_else(|| BackendProfile::new(backend.id().clone()));
            registry.add(backend, profile)?;
        }
        for profile in &config.backends {
            if !registry.contains(&profile.id) {
                warn!(backend = %profile.id, "configured profile has no registered backend");
            }
        }

        let store = Arc::new(MetricsStore::new(
            config.metrics.clone(),
            config.health.circuit_ceiling,
        ));
        for id in registry.ids() {
            store.register(&id);
        }

        let mut scorer = WeightScorer::new(config.routing.weights.clone())
            .with_priority(config.routing.priority.clone())
            .with_priority_health_threshold(config.routing.priority_health_threshold);
        if let Some(seed) = self.seed {
            scorer = scorer.with_seed(seed);
        }

        let dispatcher = Dispatcher::new(
            Arc::clone(&store),
            DispatchSettings {
                backend_timeout: config.dispatch.backend_timeout(),
                late_completion_grace: config.dispatch.late_completion_grace(),
            },
        );

        let cache = config.cache.enabled.then(|| {
            let store = self
                .cache_backend
                .unwrap_or_else(|| {
                    Arc::new(MemoryCache::new(config.cache.max_entries)) as Arc<dyn CacheBackend>
                });
            CacheGateway::new(store, config.cache.ttl())
        });

        Ok(Orchestrator {
            config,
            registry,
            store,
            scorer,
            dispatcher,
            cache,
            audit: self
                .audit_sink
                .unwrap_or_else(|| Arc::new(TracingAuditSink) as Arc<dyn AuditSink>),
            sequence: AtomicU64::new(0),
        })
    }
}

impl Default for OrchesityBuilder {
    fn default() -> Self {
        Self::new()
    }
}
