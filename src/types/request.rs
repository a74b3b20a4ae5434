//! Orchestration request types

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::BackendId;

/// Provider-agnostic generation parameters.
///
/// Every field takes part in the request fingerprint, so two requests that
/// differ in any of them never share a cache entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,

    // Escape hatch for backend-specific options
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl GenerationParams {
    pub fn max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }

    pub fn temperature(mut self, temp: f64) -> Self {
        self.temperature = Some(temp);
        self
    }

    pub fn top_p(mut self, p: f64) -> Self {
        self.top_p = Some(p);
        self
    }

    pub fn stop(mut self, stop: Vec<String>) -> Self {
        self.stop = stop;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// One logical request routed across backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationRequest {
    pub prompt: String,
    #[serde(default)]
    pub params: GenerationParams,
    /// Backends the caller asked for. Empty means "any registered backend".
    #[serde(default)]
    pub backends: Vec<BackendId>,
    /// Streaming requests always fan out.
    #[serde(default)]
    pub stream: bool,
    /// Successes required before the caller is unblocked. Engine default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_success: Option<usize>,
    /// Wall-clock budget for the whole request. Engine default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<u64>,
    /// Set to `false` to bypass the cache entirely (no lookup, no store).
    #[serde(default = "default_use_cache")]
    pub use_cache: bool,
    /// Per-request cache TTL override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_ttl_secs: Option<u64>,
}

fn default_use_cache() -> bool {
    true
}

impl OrchestrationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            params: GenerationParams::default(),
            backends: Vec::new(),
            stream: false,
            min_success: None,
            deadline_ms: None,
            use_cache: true,
            cache_ttl_secs: None,
        }
    }

    pub fn params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }

    /// Ask for a specific backend. May be called repeatedly.
    pub fn backend(mut self, id: impl Into<BackendId>) -> Self {
        self.backends.push(id.into());
        self
    }

    pub fn backends<I, B>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<BackendId>,
    {
        self.backends.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn min_success(mut self, n: usize) -> Self {
        self.min_success = Some(n);
        self
    }

    /// Whole milliseconds, saturating at `u64::MAX`.
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline_ms = Some(u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn use_cache(mut self, enabled: bool) -> Self {
        self.use_cache = enabled;
        self
    }

    /// Whole seconds, rounded up so a sub-second TTL still caches.
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        let secs = ttl.as_secs();
        let secs = if ttl.subsec_nanos() > 0 {
            secs.saturating_add(1)
        } else {
            secs
        };
        self.cache_ttl_secs = Some(secs);
        self
    }

    /// Requested backends, sorted and de-duplicated.
    pub fn distinct_backends(&self) -> Vec<BackendId> {
        let mut ids = self.backends.clone();
        ids.sort();
        ids.dedup();
        ids
    }
}
