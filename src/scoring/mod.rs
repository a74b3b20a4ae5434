//! Performance tracking and backend ranking.
//!
//! - [`store::MetricsStore`]: per-backend smoothed performance records and
//!   the circuit-open health state derived from them.
//! - [`scorer::WeightScorer`]: turns those records into an ordering under
//!   a [`SelectionPolicy`](crate::SelectionPolicy).

pub mod scorer;
pub mod store;

pub use scorer::{ScoringWeights, WeightScorer};
pub use store::{BackendMetrics, CallOutcome, CircuitTransition, MetricsStore, SmoothingConfig};
