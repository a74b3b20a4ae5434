//! Cache-gated dispatch with single-flight joins.
//!
//! [`CacheGateway::resolve`] is the only path from a cache miss to a
//! dispatch. For any fingerprint at most one dispatch runs at a time in
//! this process: the first request to miss becomes the leader and
//! registers a `watch` channel; identical requests arriving while it runs
//! subscribe to that channel and receive the leader's outcome instead of
//! dispatching.
//!
//! The leader stores a successful result before it unregisters the
//! flight, so a request arriving after the flight ends finds the entry in
//! the cache. If the leader is dropped before publishing, its guard
//! unregisters the flight and closes the channel; waiting followers then
//! retry and one of them takes over.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::fingerprint::RequestFingerprint;
use super::store::{CacheBackend, CacheEntry};
use crate::Result;
use crate::telemetry;
use crate::types::{BackendResult, OrchestrationResponse};

type FlightResult = Result<OrchestrationResponse>;
type FlightReceiver = watch::Receiver<Option<FlightResult>>;

/// How a request was satisfied by [`CacheGateway::resolve`].
#[derive(Debug)]
pub enum Resolution {
    /// Served from a live cache entry.
    Hit(Vec<BackendResult>),
    /// Waited on an identical in-flight request.
    Joined(FlightResult),
    /// This request ran the dispatch.
    Dispatched(FlightResult),
}

/// Counters reported by [`CacheGateway::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub joins: u64,
    pub stores: u64,
    pub store_failures: u64,
    /// Entries held by the store, when it can report them.
    pub entries: Option<u64>,
    /// Dispatches currently registered as flights.
    pub in_flight: usize,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    joins: AtomicU64,
    stores: AtomicU64,
    store_failures: AtomicU64,
}

pub struct CacheGateway {
    store: Arc<dyn CacheBackend>,
    default_ttl: Duration,
    flights: Mutex<HashMap<RequestFingerprint, FlightReceiver>>,
    counters: Counters,
}

enum Flight<'a> {
    Leader(FlightGuard<'a>),
    Follower(FlightReceiver),
}

/// Leader's registration. Unregisters the flight on drop.
struct FlightGuard<'a> {
    flights: &'a Mutex<HashMap<RequestFingerprint, FlightReceiver>>,
    key: RequestFingerprint,
    tx: Option<watch::Sender<Option<FlightResult>>>,
}

impl FlightGuard<'_> {
    fn publish(mut self, outcome: FlightResult) {
        lock(self.flights).remove(&self.key);
        if let Some(tx) = self.tx.take() {
            tx.send_replace(Some(outcome));
        }
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if self.tx.is_some() {
            lock(self.flights).remove(&self.key);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl CacheGateway {
    pub fn new(store: Arc<dyn CacheBackend>, default_ttl: Duration) -> Self {
        Self {
            store,
            default_ttl,
            flights: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Live results for `fingerprint`, or `None` on a miss.
    ///
    /// Expired entries count as misses and are deleted. Store errors are
    /// logged and treated as misses.
    pub async fn lookup(&self, fingerprint: &RequestFingerprint) -> Option<Vec<BackendResult>> {
        let found = self.read(fingerprint).await;
        if found.is_some() {
            self.count_hit(fingerprint);
        } else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(telemetry::CACHE_MISSES_TOTAL).increment(1);
        }
        found
    }

    /// Store `results` under `fingerprint`. Failures are logged, never
    /// returned.
    pub async fn store(
        &self,
        fingerprint: &RequestFingerprint,
        results: Vec<BackendResult>,
        ttl: Duration,
    ) {
        let entry = CacheEntry::new(results, ttl);
        match self.store.set(fingerprint.as_str(), entry, ttl).await {
            Ok(()) => {
                self.counters.stores.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.store_failures.fetch_add(1, Ordering::Relaxed);
                warn!(fingerprint = %fingerprint, error = %e, "cache store failed");
            }
        }
    }

    /// Serve `fingerprint` from cache, from an identical in-flight
    /// request, or by running `produce`.
    ///
    /// `produce` runs at most once. Its outcome is cached with `ttl` only
    /// when it succeeded with at least one result.
    pub async fn resolve<F, Fut>(
        &self,
        fingerprint: &RequestFingerprint,
        ttl: Duration,
        produce: F,
    ) -> Resolution
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FlightResult>,
    {
        let guard = loop {
            if let Some(results) = self.lookup(fingerprint).await {
                return Resolution::Hit(results);
            }
            match self.begin(fingerprint) {
                Flight::Leader(guard) => break guard,
                Flight::Follower(mut rx) => {
                    self.counters.joins.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!(telemetry::SINGLE_FLIGHT_JOINS_TOTAL).increment(1);
                    debug!(fingerprint = %fingerprint, "joining in-flight request");
                    let outcome = match rx.wait_for(Option::is_some).await {
                        Ok(value) => Option::clone(&value),
                        Err(_) => None,
                    };
                    if let Some(result) = outcome {
                        return Resolution::Joined(result);
                    }
                    debug!(fingerprint = %fingerprint, "in-flight leader went away, retrying");
                }
            }
        };

        // a previous leader may have stored between our lookup and begin
        if let Some(results) = self.read(fingerprint).await {
            self.count_hit(fingerprint);
            return Resolution::Hit(results);
        }

        let outcome = produce().await;
        if let Ok(response) = &outcome
            && response.status.is_success()
            && !response.results.is_empty()
        {
            self.store(fingerprint, response.results.clone(), ttl).await;
        }
        guard.publish(outcome.clone());
        Resolution::Dispatched(outcome)
    }

    /// Delete cached entries whose keys match the glob `pattern`.
    pub async fn clear(&self, pattern: &str) -> Result<u64> {
        let removed = self.store.delete_pattern(pattern).await?;
        debug!(pattern, removed, "cleared cache entries");
        Ok(removed)
    }

    pub async fn stats(&self) -> CacheStats {
        let entries = match self.store.len().await {
            Ok(n) => Some(n),
            Err(e) => {
                warn!(error = %e, "cache store could not report its size");
                None
            }
        };
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            joins: self.counters.joins.load(Ordering::Relaxed),
            stores: self.counters.stores.load(Ordering::Relaxed),
            store_failures: self.counters.store_failures.load(Ordering::Relaxed),
            entries,
            in_flight: lock(&self.flights).len(),
        }
    }

    fn begin(&self, fingerprint: &RequestFingerprint) -> Flight<'_> {
        let mut flights = lock(&self.flights);
        if let Some(rx) = flights.get(fingerprint) {
            return Flight::Follower(rx.clone());
        }
        let (tx, rx) = watch::channel(None);
        flights.insert(fingerprint.clone(), rx);
        Flight::Leader(FlightGuard {
            flights: &self.flights,
            key: fingerprint.clone(),
            tx: Some(tx),
        })
    }

    /// Uncounted read with expiry handling.
    async fn read(&self, fingerprint: &RequestFingerprint) -> Option<Vec<BackendResult>> {
        let key = fingerprint.as_str();
        let entry = match self.store.get(key).await {
            Ok(entry) => entry?,
            Err(e) => {
                warn!(fingerprint = %fingerprint, error = %e, "cache lookup failed");
                return None;
            }
        };
        if entry.is_expired() {
            if let Err(e) = self.store.delete(key).await {
                warn!(fingerprint = %fingerprint, error = %e, "failed to drop expired cache entry");
            }
            return None;
        }
        Some(entry.results)
    }

    fn count_hit(&self, fingerprint: &RequestFingerprint) {
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(telemetry::CACHE_HITS_TOTAL).increment(1);
        debug!(fingerprint = %fingerprint, "cache hit");
    }
}

impl std::fmt::Debug for CacheGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheGateway")
            .field("default_ttl", &self.default_ttl)
            .field("in_flight", &lock(&self.flights).len())
            .finish_non_exhaustive()
    }
}
