//! Engine configuration.
//!
//! Configuration is loaded from TOML with the following resolution order:
//! 1. an explicit path (CLI `--config`)
//! 2. `~/.orchesity/config.toml` (user)
//! 3. `/etc/orchesity/config.toml` (system)
//! 4. built-in defaults
//!
//! Every field has a default, so an empty file is a valid configuration.
//! A few settings can be overridden from the environment with
//! [`EngineConfig::apply_env`].
//!
//! ```toml
//! [routing]
//! policy = "priority"
//! priority = ["openai/gpt-4", "anthropic/claude"]
//!
//! [dispatch]
//! deadline_ms = 10000
//! min_success = 1
//!
//! [[backends]]
//! id = "openai/gpt-4"
//! cost_per_1k_tokens = 0.03
//! max_in_flight = 8
//! ```

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::backend::{BackendProfile, RetryConfig};
use crate::scoring::{ScoringWeights, SmoothingConfig};
use crate::scoring::scorer::DEFAULT_PRIORITY_HEALTH_THRESHOLD;
use crate::scoring::store::DEFAULT_CIRCUIT_CEILING;
use crate::types::{BackendId, SelectionPolicy};
use crate::{OrchesityError, Result};

/// Overrides the routing policy.
pub const ENV_SELECTION_POLICY: &str = "ORCHESITY_SELECTION_POLICY";
/// Overrides the request deadline, in whole seconds.
pub const ENV_REQUEST_TIMEOUT_SECS: &str = "ORCHESITY_REQUEST_TIMEOUT_SECS";

/// Full engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub metrics: SmoothingConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Static per-backend profiles, matched to registered backends by id.
    #[serde(default)]
    pub backends: Vec<BackendProfile>,
}

/// Backend selection.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RoutingConfig {
    /// Default: `load_balanced`.
    #[serde(default)]
    pub policy: SelectionPolicy,
    /// Static order for the `priority` policy.
    #[serde(default)]
    pub priority: Vec<BackendId>,
    /// Consecutive failures above which `priority` skips a backend. Default: 2.
    #[serde(default = "default_priority_health_threshold")]
    pub priority_health_threshold: u32,
    #[serde(default)]
    pub weights: ScoringWeights,
    /// Widen the candidate set to every registered backend when none of
    /// the requested ones is eligible. Default: false.
    #[serde(default)]
    pub fallback_to_any: bool,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            policy: SelectionPolicy::default(),
            priority: Vec::new(),
            priority_health_threshold: default_priority_health_threshold(),
            weights: ScoringWeights::default(),
            fallback_to_any: false,
        }
    }
}

fn default_priority_health_threshold() -> u32 {
    DEFAULT_PRIORITY_HEALTH_THRESHOLD
}

/// Circuit breaking.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HealthConfig {
    /// Consecutive failures that open a backend's circuit. Default: 5.
    #[serde(default = "default_circuit_ceiling")]
    pub circuit_ceiling: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            circuit_ceiling: default_circuit_ceiling(),
        }
    }
}

fn default_circuit_ceiling() -> u32 {
    DEFAULT_CIRCUIT_CEILING
}

/// Deadlines and success thresholds.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DispatchConfig {
    /// Request deadline in milliseconds (default: 30000).
    #[serde(default = "default_deadline_ms")]
    pub deadline_ms: u64,
    /// Cap on a single backend call. Default: none (the remaining deadline).
    #[serde(default)]
    pub backend_timeout_ms: Option<u64>,
    /// Successes that satisfy a request (default: 1).
    #[serde(default = "default_min_success")]
    pub min_success: usize,
    /// How long a timed-out call is still awaited for metrics (default: 60000).
    #[serde(default = "default_late_completion_grace_ms")]
    pub late_completion_grace_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            deadline_ms: default_deadline_ms(),
            backend_timeout_ms: None,
            min_success: default_min_success(),
            late_completion_grace_ms: default_late_completion_grace_ms(),
        }
    }
}

impl DispatchConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    pub fn backend_timeout(&self) -> Option<Duration> {
        self.backend_timeout_ms.map(Duration::from_millis)
    }

    pub fn late_completion_grace(&self) -> Duration {
        Duration::from_millis(self.late_completion_grace_ms)
    }
}

fn default_deadline_ms() -> u64 {
    30_000
}

fn default_min_success() -> usize {
    1
}

fn default_late_completion_grace_ms() -> u64 {
    60_000
}

/// Response cache.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CacheConfig {
    /// Default: true.
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,
    /// Entry lifetime in seconds (default: 3600).
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    /// Capacity of the in-memory store (default: 10000).
    #[serde(default = "default_max_entries")]
    pub max_entries: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            ttl_secs: default_ttl_secs(),
            max_entries: default_max_entries(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

fn default_cache_enabled() -> bool {
    true
}

fn default_ttl_secs() -> u64 {
    3600
}

fn default_max_entries() -> u64 {
    10_000
}

impl EngineConfig {
    /// Load configuration from the standard locations, falling back to
    /// defaults when no file exists.
    ///
    /// An explicit path that does not exist is an error.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        match Self::resolve_config_path(explicit_path)? {
            Some(path) => Self::from_file(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            OrchesityError::Configuration(format!("Failed to read config file {path:?}: {e}"))
        })?;
        toml::from_str(&content).map_err(|e| {
            OrchesityError::Configuration(format!("Failed to parse config file {path:?}: {e}"))
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| OrchesityError::Configuration(format!("Failed to parse config: {e}")))
    }

    fn resolve_config_path(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit {
            if path.exists() {
                return Ok(Some(path.to_path_buf()));
            }
            return Err(OrchesityError::Configuration(format!(
                "Config file not found: {path:?}"
            )));
        }

        // User config
        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".orchesity").join("config.toml");
            if user_config.exists() {
                return Ok(Some(user_config));
            }
        }

        // System config
        let system_config = PathBuf::from("/etc/orchesity/config.toml");
        if system_config.exists() {
            return Ok(Some(system_config));
        }

        Ok(None)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Apply overrides using `lookup` in place of the process environment.
    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(policy) = lookup(ENV_SELECTION_POLICY) {
            self.routing.policy = policy.trim().parse()?;
        }
        if let Some(secs) = lookup(ENV_REQUEST_TIMEOUT_SECS) {
            let secs: u64 = secs.trim().parse().map_err(|e| {
                OrchesityError::Configuration(format!(
                    "{ENV_REQUEST_TIMEOUT_SECS} must be whole seconds: {e}"
                ))
            })?;
            self.dispatch.deadline_ms = secs.saturating_mul(1000);
        }
        Ok(())
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(OrchesityError::Configuration(msg));

        let alpha = self.metrics.alpha;
        if !(alpha > 0.0 && alpha <= 1.0) {
            return invalid(format!("metrics.alpha must be in (0, 1], got {alpha}"));
        }
        if !self.metrics.initial_speed_secs.is_finite() || self.metrics.initial_speed_secs < 0.0 {
            return invalid("metrics.initial_speed_secs must be non-negative".into());
        }
        if self.health.circuit_ceiling == 0 {
            return invalid("health.circuit_ceiling must be at least 1".into());
        }
        if self.dispatch.min_success == 0 {
            return invalid("dispatch.min_success must be at least 1".into());
        }
        if self.dispatch.deadline_ms == 0 {
            return invalid("dispatch.deadline_ms must be positive".into());
        }
        if self.dispatch.backend_timeout_ms == Some(0) {
            return invalid("dispatch.backend_timeout_ms must be positive".into());
        }
        let w = &self.routing.weights;
        for (name, value) in [
            ("accuracy", w.accuracy),
            ("speed", w.speed),
            ("cost", w.cost),
            ("availability", w.availability),
        ] {
            if !value.is_finite() || value < 0.0 {
                return invalid(format!("routing.weights.{name} must be non-negative"));
            }
        }
        if self.cache.enabled && self.cache.max_entries == 0 {
            return invalid("cache.max_entries must be positive when the cache is enabled".into());
        }
        let mut seen = HashSet::new();
        for profile in &self.backends {
            if !seen.insert(&profile.id) {
                return invalid(format!("backend profile listed twice: {}", profile.id));
            }
            if profile.max_in_flight == Some(0) {
                return invalid(format!("backends.{}.max_in_flight must be positive", profile.id));
            }
        }
        Ok(())
    }

    /// Profile configured for `id`, if any.
    pub fn profile(&self, id: &BackendId) -> Option<&BackendProfile> {
        self.backends.iter().find(|p| &p.id == id)
    }
}
