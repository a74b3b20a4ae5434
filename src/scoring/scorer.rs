//! Backend ranking under a selection policy.
//!
//! [`WeightScorer::rank`] filters out circuit-open backends, snapshots the
//! metrics of the rest, and hands them to the ranking function for the
//! active [`SelectionPolicy`]. Ranking functions are plain `fn`s over a
//! [`RankInput`]; the only state they see is what the scorer passes in (the
//! round-robin ticket and the seeded RNG), so each one is testable alone.
//!
//! # Policies
//!
//! | policy | ordering |
//! |---|---|
//! | `load_balanced` | weighted sum of per-factor min-max normalized accuracy, 1/speed, 1/cost, availability |
//! | `round_robin` | identity order rotated by a shared atomic cursor |
//! | `random` | uniform shuffle |
//! | `priority` | configured order; backends over the health threshold fall to the back |

use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::Deserialize;
use tracing::debug;

use super::store::{BackendMetrics, MetricsStore};
use crate::types::{BackendId, SelectionPolicy};

/// Floor applied to speed and cost before taking the reciprocal.
const MIN_DENOMINATOR: f64 = 1e-6;

/// Default consecutive failures tolerated by the `priority` policy.
pub const DEFAULT_PRIORITY_HEALTH_THRESHOLD: u32 = 2;

/// Factor weights for the `load_balanced` policy.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ScoringWeights {
    /// Default: 0.4
    #[serde(default = "default_accuracy_weight")]
    pub accuracy: f64,
    /// Default: 0.3
    #[serde(default = "default_speed_weight")]
    pub speed: f64,
    /// Default: 0.1
    #[serde(default = "default_cost_weight")]
    pub cost: f64,
    /// Default: 0.2
    #[serde(default = "default_availability_weight")]
    pub availability: f64,
}

fn default_accuracy_weight() -> f64 {
    0.4
}
fn default_speed_weight() -> f64 {
    0.3
}
fn default_cost_weight() -> f64 {
    0.1
}
fn default_availability_weight() -> f64 {
    0.2
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            accuracy: default_accuracy_weight(),
            speed: default_speed_weight(),
            cost: default_cost_weight(),
            availability: default_availability_weight(),
        }
    }
}

/// A candidate with the metrics snapshot it is ranked on.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub id: BackendId,
    pub metrics: BackendMetrics,
}

/// Everything a ranking function may look at.
pub struct RankInput<'a> {
    /// Eligible candidates, sorted by id.
    pub candidates: Vec<Candidate>,
    pub weights: &'a ScoringWeights,
    pub priority: &'a [BackendId],
    pub priority_health_threshold: u32,
    /// Round-robin ticket for this call.
    pub rotation: usize,
    pub rng: &'a mut StdRng,
}

/// A ranking function: best backend first.
pub type RankFn = fn(RankInput<'_>) -> Vec<BackendId>;

/// The policy → ranking function table.
pub fn ranker(policy: SelectionPolicy) -> RankFn {
    match policy {
        SelectionPolicy::LoadBalanced => rank_load_balanced,
        SelectionPolicy::RoundRobin => rank_round_robin,
        SelectionPolicy::Random => rank_random,
        SelectionPolicy::Priority => rank_priority,
    }
}

/// Composite `load_balanced` score per candidate, in input order.
pub fn composite_scores(candidates: &[Candidate], weights: &ScoringWeights) -> Vec<f64> {
    let accuracy = normalize(candidates.iter().map(|c| c.metrics.accuracy));
    let speed = normalize(
        candidates
            .iter()
            .map(|c| 1.0 / c.metrics.speed.max(MIN_DENOMINATOR)),
    );
    let cost = normalize(
        candidates
            .iter()
            .map(|c| 1.0 / c.metrics.cost.max(MIN_DENOMINATOR)),
    );
    let availability = normalize(candidates.iter().map(|c| c.metrics.availability));

    (0..candidates.len())
        .map(|i| {
            weights.accuracy * accuracy[i]
                + weights.speed * speed[i]
                + weights.cost * cost[i]
                + weights.availability * availability[i]
        })
        .collect()
}

/// Min-max normalize into `[0, 1]`. A factor with no spread contributes 1.0
/// to everyone, so it cannot separate candidates.
fn normalize(values: impl Iterator<Item = f64>) -> Vec<f64> {
    let values: Vec<f64> = values
        .map(|v| if v.is_finite() { v } else { 0.0 })
        .collect();
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let range = max - min;
    if !range.is_finite() || range <= f64::EPSILON {
        return vec![1.0; values.len()];
    }
    values.iter().map(|v| (v - min) / range).collect()
}

fn rank_load_balanced(input: RankInput<'_>) -> Vec<BackendId> {
    let scores = composite_scores(&input.candidates, input.weights);
    let mut scored: Vec<_> = input.candidates.into_iter().zip(scores).collect();
    scored.sort_by(|(a, sa), (b, sb)| {
        sb.total_cmp(sa)
            .then(a.metrics.consecutive_failures.cmp(&b.metrics.consecutive_failures))
            .then_with(|| a.id.cmp(&b.id))
    });
    scored.into_iter().map(|(c, _)| c.id).collect()
}

fn rank_round_robin(input: RankInput<'_>) -> Vec<BackendId> {
    let mut ids: Vec<_> = input.candidates.into_iter().map(|c| c.id).collect();
    if !ids.is_empty() {
        let shift = input.rotation % ids.len();
        ids.rotate_left(shift);
    }
    ids
}

fn rank_random(input: RankInput<'_>) -> Vec<BackendId> {
    let mut ids: Vec<_> = input.candidates.into_iter().map(|c| c.id).collect();
    ids.shuffle(input.rng);
    ids
}

fn rank_priority(input: RankInput<'_>) -> Vec<BackendId> {
    let position = |id: &BackendId| {
        input
            .priority
            .iter()
            .position(|p| p == id)
            .unwrap_or(usize::MAX)
    };
    let mut candidates = input.candidates;
    // Listed backends in configured order, then the rest by failures and id.
    candidates.sort_by(|a, b| {
        position(&a.id)
            .cmp(&position(&b.id))
            .then(a.metrics.consecutive_failures.cmp(&b.metrics.consecutive_failures))
            .then_with(|| a.id.cmp(&b.id))
    });
    let (healthy, unhealthy): (Vec<_>, Vec<_>) = candidates
        .into_iter()
        .partition(|c| c.metrics.consecutive_failures <= input.priority_health_threshold);
    healthy
        .into_iter()
        .chain(unhealthy)
        .map(|c| c.id)
        .collect()
}

/// Ranks candidate backends under a [`SelectionPolicy`].
///
/// Holds the only long-lived selection state: the round-robin cursor and
/// the RNG used by `random`.
pub struct WeightScorer {
    weights: ScoringWeights,
    priority: Vec<BackendId>,
    priority_health_threshold: u32,
    cursor: AtomicUsize,
    rng: Mutex<StdRng>,
}

impl WeightScorer {
    pub fn new(weights: ScoringWeights) -> Self {
        Self {
            weights,
            priority: Vec::new(),
            priority_health_threshold: DEFAULT_PRIORITY_HEALTH_THRESHOLD,
            cursor: AtomicUsize::new(0),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Static order used by the `priority` policy (first = preferred).
    pub fn with_priority(mut self, order: Vec<BackendId>) -> Self {
        self.priority = order;
        self
    }

    /// Consecutive failures above which `priority` falls through a backend.
    pub fn with_priority_health_threshold(mut self, threshold: u32) -> Self {
        self.priority_health_threshold = threshold;
        self
    }

    pub fn with_seed(self, seed: u64) -> Self {
        self.reseed(seed);
        self
    }

    /// Reseed the `random` policy's RNG.
    pub fn reseed(&self, seed: u64) {
        *self.rng.lock().unwrap_or_else(PoisonError::into_inner) = StdRng::seed_from_u64(seed);
    }

    pub fn weights(&self) -> &ScoringWeights {
        &self.weights
    }

    /// Order `candidates` best-first under `policy`.
    ///
    /// Circuit-open backends are dropped regardless of policy. Duplicates
    /// are collapsed. An empty result means nothing is eligible.
    pub fn rank(
        &self,
        candidates: &[BackendId],
        policy: SelectionPolicy,
        store: &MetricsStore,
    ) -> Vec<BackendId> {
        let ranked = self.rank_inner(candidates, policy, store, true);
        debug!(policy = %policy, ranked = ?ranked, "ranked backends");
        ranked
    }

    /// The ranking the next [`rank`](Self::rank) call would produce,
    /// without advancing the round-robin cursor or the RNG.
    pub fn peek(
        &self,
        candidates: &[BackendId],
        policy: SelectionPolicy,
        store: &MetricsStore,
    ) -> Vec<BackendId> {
        self.rank_inner(candidates, policy, store, false)
    }

    fn rank_inner(
        &self,
        candidates: &[BackendId],
        policy: SelectionPolicy,
        store: &MetricsStore,
        advance: bool,
    ) -> Vec<BackendId> {
        let eligible = self.eligible(candidates, store);
        if eligible.is_empty() {
            return Vec::new();
        }

        let rotation = match (policy, advance) {
            (SelectionPolicy::RoundRobin, true) => self.cursor.fetch_add(1, Ordering::Relaxed),
            (SelectionPolicy::RoundRobin, false) => self.cursor.load(Ordering::Relaxed),
            _ => 0,
        };
        let mut shared = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        let mut scratch;
        let rng: &mut StdRng = if advance {
            &mut shared
        } else {
            scratch = shared.clone();
            &mut scratch
        };
        ranker(policy)(RankInput {
            candidates: eligible,
            weights: &self.weights,
            priority: &self.priority,
            priority_health_threshold: self.priority_health_threshold,
            rotation,
            rng,
        })
    }

    /// `load_balanced` composite score for each eligible candidate, best first.
    pub fn scores(&self, candidates: &[BackendId], store: &MetricsStore) -> Vec<(BackendId, f64)> {
        let eligible = self.eligible(candidates, store);
        let scores = composite_scores(&eligible, &self.weights);
        let mut scored: Vec<_> = eligible.into_iter().map(|c| c.id).zip(scores).collect();
        scored.sort_by(|(a, sa), (b, sb)| sb.total_cmp(sa).then_with(|| a.cmp(b)));
        scored
    }

    fn eligible(&self, candidates: &[BackendId], store: &MetricsStore) -> Vec<Candidate> {
        let mut ids = candidates.to_vec();
        ids.sort();
        ids.dedup();
        ids.into_iter()
            .filter_map(|id| {
                let metrics = store
                    .get(&id)
                    .unwrap_or_else(|| BackendMetrics::new(store.config()));
                (metrics.consecutive_failures < store.circuit_ceiling())
                    .then_some(Candidate { id, metrics })
            })
            .collect()
    }
}

impl Default for WeightScorer {
    fn default() -> Self {
        Self::new(ScoringWeights::default())
    }
}

impl std::fmt::Debug for WeightScorer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeightScorer")
            .field("weights", &self.weights)
            .field("priority", &self.priority)
            .field("priority_health_threshold", &self.priority_health_threshold)
            .field("cursor", &self.cursor.load(Ordering::Relaxed))
            .finish()
    }
}
