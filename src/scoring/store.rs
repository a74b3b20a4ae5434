//! Per-backend performance records.
//!
//! Every record is updated with exponential smoothing:
//!
//! ```text
//! new = alpha * observed + (1 - alpha) * old
//! ```
//!
//! applied to `speed` (latency in seconds), `cost`, `accuracy`, and
//! `availability` (a smoothed 0/1 success indicator). The first observation
//! of speed and cost replaces the configured prior outright.
//!
//! # Concurrency
//!
//! Each record sits behind its own mutex, so one outcome is applied as a
//! single critical section and concurrent updates to the same backend are
//! never lost. Different backends never contend. The outer map is only
//! write-locked when a backend is registered.
//!
//! # Circuit State
//!
//! A backend whose `consecutive_failures` reaches the configured ceiling is
//! "circuit open". The transition is detected inside the record's critical
//! section, so exactly one caller observes each open and each close.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::telemetry;
use crate::types::{BackendId, ErrorKind};
use crate::{OrchesityError, Result};

/// Default circuit ceiling: consecutive failures before a backend is excluded.
pub const DEFAULT_CIRCUIT_CEILING: u32 = 5;

/// Smoothing factor and priors for fresh records.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SmoothingConfig {
    /// Weight of the newest observation, in `(0, 1]`. Default: 0.3.
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    /// Speed assumed before the first observation. Default: 1.0s.
    #[serde(default = "default_initial_speed_secs")]
    pub initial_speed_secs: f64,
    /// Cost assumed before the first observation. Default: 0.0.
    #[serde(default)]
    pub initial_cost: f64,
}

fn default_alpha() -> f64 {
    0.3
}

fn default_initial_speed_secs() -> f64 {
    1.0
}

impl Default for SmoothingConfig {
    fn default() -> Self {
        Self {
            alpha: default_alpha(),
            initial_speed_secs: default_initial_speed_secs(),
            initial_cost: 0.0,
        }
    }
}

/// Observed performance of one backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendMetrics {
    /// Smoothed success quality in `[0, 1]`.
    pub accuracy: f64,
    /// Smoothed latency in seconds. Lower is better.
    pub speed: f64,
    /// Smoothed per-call cost. Lower is better.
    pub cost: f64,
    /// Smoothed success ratio in `[0, 1]`.
    pub availability: f64,
    pub consecutive_failures: u32,
    pub last_success_time: Option<SystemTime>,
    pub last_error: Option<String>,
    pub last_error_kind: Option<ErrorKind>,
    /// Calls observed. A call that timed out and then completed inside the
    /// grace period counts once: the late outcome still moves the smoothed
    /// fields and the failure streak, but not these totals.
    pub total_calls: u64,
    /// Failed calls, counted the same way as `total_calls`.
    pub total_failures: u64,
}

impl BackendMetrics {
    pub fn new(config: &SmoothingConfig) -> Self {
        Self {
            accuracy: 1.0,
            speed: config.initial_speed_secs.max(0.0),
            cost: config.initial_cost.max(0.0),
            availability: 1.0,
            consecutive_failures: 0,
            last_success_time: None,
            last_error: None,
            last_error_kind: None,
            total_calls: 0,
            total_failures: 0,
        }
    }

    /// Apply one outcome with smoothing factor `alpha`.
    ///
    /// - success: accuracy moves toward the reported quality (1.0 if none),
    ///   failures reset to 0, `last_success_time` is stamped.
    /// - malformed response: accuracy moves toward 0.
    /// - timeout or backend error: accuracy is left alone; the backend
    ///   produced nothing to judge.
    ///
    /// Speed tracks the observed latency for every outcome; cost only moves
    /// when the outcome carries one. Bounded fields are clamped afterwards.
    pub fn apply(&mut self, outcome: &CallOutcome, alpha: f64) {
        let alpha = alpha.clamp(f64::EPSILON, 1.0);
        let smooth = |old: f64, observed: f64| alpha * observed + (1.0 - alpha) * old;
        let first = self.total_calls == 0;

        let latency = outcome.latency.as_secs_f64();
        self.speed = if first { latency } else { smooth(self.speed, latency) };

        if let Some(cost) = outcome.cost.filter(|c| c.is_finite()) {
            let cost = cost.max(0.0);
            self.cost = if first { cost } else { smooth(self.cost, cost) };
        }

        match &outcome.error {
            None => {
                let quality = outcome.quality.filter(|q| q.is_finite()).unwrap_or(1.0);
                self.accuracy = smooth(self.accuracy, quality.clamp(0.0, 1.0));
                self.availability = smooth(self.availability, 1.0);
                self.consecutive_failures = 0;
                self.last_success_time = Some(SystemTime::now());
            }
            Some((kind, message)) => {
                if *kind == ErrorKind::Malformed {
                    self.accuracy = smooth(self.accuracy, 0.0);
                }
                self.availability = smooth(self.availability, 0.0);
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.last_error = Some(message.clone());
                self.last_error_kind = Some(*kind);
                if !outcome.late {
                    self.total_failures += 1;
                }
            }
        }
        if !outcome.late {
            self.total_calls += 1;
        }

        self.accuracy = self.accuracy.clamp(0.0, 1.0);
        self.availability = self.availability.clamp(0.0, 1.0);
        self.speed = self.speed.max(0.0);
        self.cost = self.cost.max(0.0);
    }
}

/// What happened on one completed or failed call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallOutcome {
    pub latency: Duration,
    pub cost: Option<f64>,
    pub quality: Option<f64>,
    /// `None` on success.
    pub error: Option<(ErrorKind, String)>,
    /// Real outcome of a call already recorded as timed out.
    pub late: bool,
}

impl CallOutcome {
    pub fn success(latency: Duration) -> Self {
        Self {
            latency,
            cost: None,
            quality: None,
            error: None,
            late: false,
        }
    }

    pub fn failure(kind: ErrorKind, message: impl Into<String>, latency: Duration) -> Self {
        Self {
            latency,
            cost: None,
            quality: None,
            error: Some((kind, message.into())),
            late: false,
        }
    }

    pub fn cost(mut self, cost: f64) -> Self {
        self.cost = Some(cost);
        self
    }

    pub fn quality(mut self, quality: f64) -> Self {
        self.quality = Some(quality);
        self
    }

    pub fn late(mut self) -> Self {
        self.late = true;
        self
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Circuit state change caused by one recorded outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitTransition {
    Unchanged,
    Opened,
    Closed,
}

/// Thread-safe store of per-backend [`BackendMetrics`].
pub struct MetricsStore {
    records: RwLock<HashMap<BackendId, Arc<Mutex<BackendMetrics>>>>,
    config: SmoothingConfig,
    circuit_ceiling: u32,
}

impl MetricsStore {
    pub fn new(config: SmoothingConfig, circuit_ceiling: u32) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            config,
            circuit_ceiling: circuit_ceiling.max(1),
        }
    }

    pub fn config(&self) -> &SmoothingConfig {
        &self.config
    }

    pub fn circuit_ceiling(&self) -> u32 {
        self.circuit_ceiling
    }

    /// Create a default record for `backend` if it has none.
    pub fn register(&self, backend: &BackendId) {
        self.record_for(backend);
    }

    /// Apply one call outcome to `backend`'s record.
    ///
    /// Unknown backends are registered on first use.
    pub fn record_outcome(&self, backend: &BackendId, outcome: &CallOutcome) -> CircuitTransition {
        let record = self.record_for(backend);
        let (before, after) = {
            let mut metrics = lock(&record);
            let before = metrics.consecutive_failures;
            metrics.apply(outcome, self.config.alpha);
            (before, metrics.consecutive_failures)
        };

        let transition = if before < self.circuit_ceiling && after >= self.circuit_ceiling {
            CircuitTransition::Opened
        } else if before >= self.circuit_ceiling && after < self.circuit_ceiling {
            CircuitTransition::Closed
        } else {
            CircuitTransition::Unchanged
        };

        match transition {
            CircuitTransition::Opened => {
                warn!(backend = %backend, failures = after, "circuit opened");
                metrics::counter!(telemetry::CIRCUIT_OPENED_TOTAL,
                    "backend" => backend.to_string(),
                )
                .increment(1);
            }
            CircuitTransition::Closed => info!(backend = %backend, "circuit closed"),
            CircuitTransition::Unchanged => {}
        }
        transition
    }

    /// Snapshot of one backend's record. Never a live reference.
    pub fn get(&self, backend: &BackendId) -> Option<BackendMetrics> {
        let record = read(&self.records).get(backend).cloned()?;
        let snapshot = lock(&record).clone();
        Some(snapshot)
    }

    /// Snapshot of every record, ordered by backend id.
    pub fn snapshot(&self) -> BTreeMap<BackendId, BackendMetrics> {
        let records: Vec<_> = read(&self.records)
            .iter()
            .map(|(id, record)| (id.clone(), Arc::clone(record)))
            .collect();
        records
            .into_iter()
            .map(|(id, record)| {
                let snapshot = lock(&record).clone();
                (id, snapshot)
            })
            .collect()
    }

    /// Whether `backend` is excluded from selection.
    pub fn is_circuit_open(&self, backend: &BackendId) -> bool {
        self.get(backend)
            .is_some_and(|m| m.consecutive_failures >= self.circuit_ceiling)
    }

    /// Clear one record (or all, with `None`) back to defaults.
    ///
    /// Returns `UnknownBackend` if a named backend has no record.
    pub fn reset(&self, backend: Option<&BackendId>) -> Result<()> {
        match backend {
            Some(id) => {
                let record = read(&self.records)
                    .get(id)
                    .cloned()
                    .ok_or_else(|| OrchesityError::UnknownBackend(id.to_string()))?;
                *lock(&record) = BackendMetrics::new(&self.config);
                info!(backend = %id, "metrics reset");
            }
            None => {
                let records: Vec<_> = read(&self.records).values().cloned().collect();
                for record in records {
                    *lock(&record) = BackendMetrics::new(&self.config);
                }
                info!("metrics reset for all backends");
            }
        }
        Ok(())
    }

    fn record_for(&self, backend: &BackendId) -> Arc<Mutex<BackendMetrics>> {
        if let Some(record) = read(&self.records).get(backend) {
            return Arc::clone(record);
        }
        let mut records = self
            .records
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            records
                .entry(backend.clone())
                .or_insert_with(|| Arc::new(Mutex::new(BackendMetrics::new(&self.config)))),
        )
    }
}

impl Default for MetricsStore {
    fn default() -> Self {
        Self::new(SmoothingConfig::default(), DEFAULT_CIRCUIT_CEILING)
    }
}

impl std::fmt::Debug for MetricsStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsStore")
            .field("backends", &read(&self.records).len())
            .field("alpha", &self.config.alpha)
            .field("circuit_ceiling", &self.circuit_ceiling)
            .finish()
    }
}

// Records are replaced or updated field-by-field under the lock and are
// never left half-written, so a poisoned lock still guards valid data.
fn lock(record: &Mutex<BackendMetrics>) -> MutexGuard<'_, BackendMetrics> {
    record.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> BackendId {
        BackendId::from(s)
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    // ========================================================================
    // Update rules
    // ========================================================================

    #[test]
    fn first_observation_replaces_speed_prior() {
        let mut metrics = BackendMetrics::new(&SmoothingConfig::default());
        metrics.apply(&CallOutcome::success(ms(200)), 0.3);
        assert!((metrics.speed - 0.2).abs() < 1e-9);
    }

    #[test]
    fn speed_is_smoothed_after_first_observation() {
        let mut metrics = BackendMetrics::new(&SmoothingConfig::default());
        metrics.apply(&CallOutcome::success(ms(1000)), 0.5);
        metrics.apply(&CallOutcome::success(ms(2000)), 0.5);
        // 0.5 * 2.0 + 0.5 * 1.0
        assert!((metrics.speed - 1.5).abs() < 1e-9);
    }

    #[test]
    fn failure_increments_and_success_resets() {
        let mut metrics = BackendMetrics::new(&SmoothingConfig::default());
        metrics.apply(&CallOutcome::failure(ErrorKind::Backend, "boom", ms(10)), 0.3);
        metrics.apply(&CallOutcome::failure(ErrorKind::Timeout, "late", ms(10)), 0.3);
        assert_eq!(metrics.consecutive_failures, 2);
        assert_eq!(metrics.last_error.as_deref(), Some("late"));
        assert_eq!(metrics.last_error_kind, Some(ErrorKind::Timeout));
        assert!(metrics.last_success_time.is_none());

        metrics.apply(&CallOutcome::success(ms(10)), 0.3);
        assert_eq!(metrics.consecutive_failures, 0);
        assert!(metrics.last_success_time.is_some());
        assert_eq!(metrics.total_calls, 3);
        assert_eq!(metrics.total_failures, 2);
    }

    #[test]
    fn late_outcome_moves_metrics_but_not_totals() {
        let mut metrics = BackendMetrics::new(&SmoothingConfig::default());
        metrics.apply(&CallOutcome::failure(ErrorKind::Timeout, "slice elapsed", ms(100)), 0.3);
        metrics.apply(&CallOutcome::success(ms(300)).late(), 0.3);
        assert_eq!(metrics.total_calls, 1);
        assert_eq!(metrics.total_failures, 1);
        assert_eq!(metrics.consecutive_failures, 0);
        assert!(metrics.last_success_time.is_some());
        // 0.3 * 1.0 + 0.7 * 0.7
        assert!((metrics.availability - 0.79).abs() < 1e-9);
    }

    #[test]
    fn availability_follows_success_indicator() {
        let mut metrics = BackendMetrics::new(&SmoothingConfig::default());
        metrics.apply(&CallOutcome::failure(ErrorKind::Backend, "x", ms(1)), 0.3);
        assert!((metrics.availability - 0.7).abs() < 1e-9);
        metrics.apply(&CallOutcome::success(ms(1)), 0.3);
        assert!((metrics.availability - 0.79).abs() < 1e-9);
    }

    #[test]
    fn malformed_response_lowers_accuracy_but_timeout_does_not() {
        let mut metrics = BackendMetrics::new(&SmoothingConfig::default());
        metrics.apply(&CallOutcome::failure(ErrorKind::Timeout, "t", ms(1)), 0.5);
        assert_eq!(metrics.accuracy, 1.0);
        metrics.apply(&CallOutcome::failure(ErrorKind::Malformed, "m", ms(1)), 0.5);
        assert!((metrics.accuracy - 0.5).abs() < 1e-9);
    }

    #[test]
    fn out_of_range_quality_is_clamped() {
        let mut metrics = BackendMetrics::new(&SmoothingConfig::default());
        metrics.apply(&CallOutcome::success(ms(1)).quality(7.0), 1.0);
        assert_eq!(metrics.accuracy, 1.0);
        metrics.apply(&CallOutcome::success(ms(1)).quality(-3.0), 1.0);
        assert_eq!(metrics.accuracy, 0.0);
    }

    #[test]
    fn cost_only_moves_when_reported() {
        let mut metrics = BackendMetrics::new(&SmoothingConfig::default());
        metrics.apply(&CallOutcome::success(ms(1)).cost(0.04), 0.5);
        assert!((metrics.cost - 0.04).abs() < 1e-12);
        metrics.apply(&CallOutcome::failure(ErrorKind::Backend, "x", ms(1)), 0.5);
        assert!((metrics.cost - 0.04).abs() < 1e-12);
    }

    // ========================================================================
    // Store
    // ========================================================================

    #[test]
    fn get_returns_detached_snapshot() {
        let store = MetricsStore::default();
        store.register(&id("a"));
        let before = store.get(&id("a")).unwrap();
        store.record_outcome(&id("a"), &CallOutcome::failure(ErrorKind::Backend, "x", ms(5)));
        assert_eq!(before.consecutive_failures, 0);
        assert_eq!(store.get(&id("a")).unwrap().consecutive_failures, 1);
    }

    #[test]
    fn circuit_opens_exactly_at_ceiling() {
        let store = MetricsStore::new(SmoothingConfig::default(), 3);
        let fail = CallOutcome::failure(ErrorKind::Backend, "x", ms(1));
        assert_eq!(store.record_outcome(&id("a"), &fail), CircuitTransition::Unchanged);
        assert_eq!(store.record_outcome(&id("a"), &fail), CircuitTransition::Unchanged);
        assert_eq!(store.record_outcome(&id("a"), &fail), CircuitTransition::Opened);
        assert!(store.is_circuit_open(&id("a")));
        assert_eq!(store.record_outcome(&id("a"), &fail), CircuitTransition::Unchanged);

        let ok = CallOutcome::success(ms(1));
        assert_eq!(store.record_outcome(&id("a"), &ok), CircuitTransition::Closed);
        assert!(!store.is_circuit_open(&id("a")));
    }

    #[test]
    fn reset_one_leaves_others() {
        let store = MetricsStore::default();
        let fail = CallOutcome::failure(ErrorKind::Backend, "x", ms(1));
        store.record_outcome(&id("a"), &fail);
        store.record_outcome(&id("b"), &fail);

        store.reset(Some(&id("a"))).unwrap();
        assert_eq!(store.get(&id("a")).unwrap().consecutive_failures, 0);
        assert_eq!(store.get(&id("b")).unwrap().consecutive_failures, 1);

        store.reset(None).unwrap();
        assert_eq!(store.get(&id("b")).unwrap().consecutive_failures, 0);
    }

    #[test]
    fn reset_unknown_backend_errors() {
        let store = MetricsStore::default();
        assert!(matches!(
            store.reset(Some(&id("ghost"))),
            Err(OrchesityError::UnknownBackend(_))
        ));
    }

    #[test]
    fn snapshot_is_ordered_by_id() {
        let store = MetricsStore::default();
        for name in ["c", "a", "b"] {
            store.register(&id(name));
        }
        let ids: Vec<_> = store.snapshot().into_keys().map(|k| k.to_string()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
    }
}
