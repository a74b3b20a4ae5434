//! Backend registry with per-backend in-flight capacity.
//!
//! The registry keeps backends in registration order and owns one
//! [`BackendSlot`] per backend. A slot carries the backend's static
//! [`BackendProfile`] and an atomic in-flight counter; the dispatcher
//! reserves capacity with [`BackendSlot::try_acquire`] before calling the
//! backend and releases it when the call finishes, even if the caller has
//! already stopped waiting.
//!
//! # Retry Wrapping
//!
//! When a [`RetryConfig`] is set, backends are wrapped in
//! [`RetryingBackend`] at registration time.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Deserialize;

use super::retry::{RetryConfig, RetryingBackend};
use super::traits::Backend;
use crate::types::{BackendId, Usage};
use crate::{OrchesityError, Result};

/// Static, configured facts about one backend.
///
/// ```toml
/// [[backends]]
/// id = "openai/gpt-4"
/// cost_per_1k_tokens = 0.03
/// max_in_flight = 4
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BackendProfile {
    pub id: BackendId,
    /// Used to estimate cost when the backend reports none.
    #[serde(default)]
    pub cost_per_1k_tokens: Option<f64>,
    /// Concurrent calls allowed. `None` means unbounded.
    #[serde(default)]
    pub max_in_flight: Option<usize>,
}

impl BackendProfile {
    pub fn new(id: impl Into<BackendId>) -> Self {
        Self {
            id: id.into(),
            cost_per_1k_tokens: None,
            max_in_flight: None,
        }
    }

    pub fn cost_per_1k_tokens(mut self, cost: f64) -> Self {
        self.cost_per_1k_tokens = Some(cost);
        self
    }

    pub fn max_in_flight(mut self, n: usize) -> Self {
        self.max_in_flight = Some(n);
        self
    }

    /// Cost estimate for `usage` under this profile's token price.
    pub fn estimate_cost(&self, usage: &Usage) -> f64 {
        self.cost_per_1k_tokens
            .map(|rate| f64::from(usage.total_tokens) / 1000.0 * rate)
            .unwrap_or(0.0)
    }
}

/// A registered backend plus its live load counter.
pub struct BackendSlot {
    backend: Arc<dyn Backend>,
    profile: BackendProfile,
    in_flight: AtomicUsize,
}

impl BackendSlot {
    fn new(backend: Arc<dyn Backend>, profile: BackendProfile) -> Self {
        Self {
            backend,
            profile,
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> &BackendId {
        &self.profile.id
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn profile(&self) -> &BackendProfile {
        &self.profile
    }

    /// Calls currently running against this backend.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn has_capacity(&self) -> bool {
        self.profile
            .max_in_flight
            .is_none_or(|max| self.in_flight() < max)
    }

    /// Reserve one call's worth of capacity.
    ///
    /// Returns `None` when the backend is at `max_in_flight`. The
    /// compare-and-swap loop guarantees concurrent callers never push the
    /// counter past the limit.
    pub fn try_acquire(self: &Arc<Self>) -> Option<InFlightGuard> {
        let max = self.profile.max_in_flight.unwrap_or(usize::MAX);
        let mut current = self.in_flight.load(Ordering::Acquire);
        loop {
            if current >= max {
                return None;
            }
            match self.in_flight.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(InFlightGuard {
                        slot: Arc::clone(self),
                    });
                }
                Err(actual) => current = actual,
            }
        }
    }
}

impl std::fmt::Debug for BackendSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendSlot")
            .field("id", &self.profile.id)
            .field("in_flight", &self.in_flight())
            .field("max_in_flight", &self.profile.max_in_flight)
            .finish()
    }
}

/// RAII reservation of one in-flight call. Dropping it releases the slot.
pub struct InFlightGuard {
    slot: Arc<BackendSlot>,
}

impl InFlightGuard {
    pub fn slot(&self) -> &Arc<BackendSlot> {
        &self.slot
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.slot.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Registry of backends in registration order.
#[derive(Default)]
pub struct BackendRegistry {
    slots: Vec<Arc<BackendSlot>>,
    index: HashMap<BackendId, usize>,
    retry_config: Option<RetryConfig>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the retry configuration.
    ///
    /// Backends registered after this call are wrapped in [`RetryingBackend`].
    pub fn set_retry_config(&mut self, config: RetryConfig) {
        self.retry_config = Some(config);
    }

    /// Register a backend with its profile.
    ///
    /// The profile id must match `backend.id()`, and ids must be unique.
    pub fn add(&mut self, backend: Arc<dyn Backend>, profile: BackendProfile) -> Result<()> {
        if backend.id() != &profile.id {
            return Err(OrchesityError::Configuration(format!(
                "profile id {} does not match backend id {}",
                profile.id,
                backend.id()
            )));
        }
        if self.index.contains_key(&profile.id) {
            return Err(OrchesityError::Configuration(format!(
                "backend registered twice: {}",
                profile.id
            )));
        }
        let backend = match &self.retry_config {
            Some(config) if config.is_enabled() => {
                Arc::new(RetryingBackend::new(backend, config.clone())) as Arc<dyn Backend>
            }
            _ => backend,
        };
        self.index.insert(profile.id.clone(), self.slots.len());
        self.slots.push(Arc::new(BackendSlot::new(backend, profile)));
        Ok(())
    }

    pub fn get(&self, id: &BackendId) -> Option<&Arc<BackendSlot>> {
        self.index.get(id).map(|&i| &self.slots[i])
    }

    pub fn contains(&self, id: &BackendId) -> bool {
        self.index.contains_key(id)
    }

    /// Registered ids in registration order.
    pub fn ids(&self) -> Vec<BackendId> {
        self.slots.iter().map(|s| s.id().clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<BackendSlot>> {
        self.slots.iter()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
