//! Metrics store and scorer behaviour through the public scoring API.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use orchesity::scoring::{CallOutcome, CircuitTransition, MetricsStore, SmoothingConfig, WeightScorer};
use orchesity::{BackendId, ErrorKind, SelectionPolicy};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn id(s: &str) -> BackendId {
    BackendId::from(s)
}

fn ids(names: &[&str]) -> Vec<BackendId> {
    names.iter().map(|n| id(n)).collect()
}

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

fn fail(store: &MetricsStore, backend: &str, times: u32) {
    for _ in 0..times {
        store.record_outcome(&id(backend), &CallOutcome::failure(ErrorKind::Backend, "down", ms(10)));
    }
}

// ============================================================================
// Metrics store
// ============================================================================

#[test]
fn bounded_fields_stay_in_range_under_random_outcomes() {
    let store = MetricsStore::new(SmoothingConfig::default(), 3);
    let backends = ids(&["a", "b", "c"]);
    let mut streak: HashMap<BackendId, u32> = HashMap::new();
    let mut rng = StdRng::seed_from_u64(7);

    for _ in 0..2_000 {
        let backend = &backends[rng.gen_range(0..backends.len())];
        let latency = ms(rng.gen_range(0..5_000));
        let outcome = match rng.gen_range(0..4) {
            0 => CallOutcome::failure(ErrorKind::Timeout, "late", latency),
            1 => CallOutcome::failure(ErrorKind::Malformed, "garbled", latency),
            _ => CallOutcome::success(latency)
                .cost(rng.gen_range(-1.0..1.0))
                .quality(rng.gen_range(-0.5..1.5)),
        };
        let expected = if outcome.is_success() {
            0
        } else {
            streak.get(backend).copied().unwrap_or(0) + 1
        };
        streak.insert(backend.clone(), expected);

        store.record_outcome(backend, &outcome);
        let metrics = store.get(backend).unwrap();
        assert!((0.0..=1.0).contains(&metrics.accuracy));
        assert!((0.0..=1.0).contains(&metrics.availability));
        assert!(metrics.speed >= 0.0);
        assert!(metrics.cost >= 0.0);
        assert_eq!(metrics.consecutive_failures, expected);
        assert_eq!(store.is_circuit_open(backend), expected >= 3);
    }
}

#[test]
fn concurrent_updates_are_never_lost() {
    let store = MetricsStore::default();
    let backend = id("shared");

    std::thread::scope(|s| {
        for t in 0..8 {
            let store = &store;
            let backend = &backend;
            s.spawn(move || {
                for i in 0..500 {
                    let outcome = if (t + i) % 5 == 0 {
                        CallOutcome::failure(ErrorKind::Backend, "x", ms(1))
                    } else {
                        CallOutcome::success(ms(1))
                    };
                    store.record_outcome(backend, &outcome);
                }
            });
        }
    });

    let metrics = store.get(&backend).unwrap();
    assert_eq!(metrics.total_calls, 4_000);
    assert_eq!(metrics.total_failures, 800);
}

#[test]
fn each_circuit_transition_is_reported_once() {
    let store = MetricsStore::new(SmoothingConfig::default(), 2);
    let backend = id("a");
    let failure = CallOutcome::failure(ErrorKind::Timeout, "late", ms(1));

    let transitions: Vec<_> = (0..4)
        .map(|_| store.record_outcome(&backend, &failure))
        .collect();
    assert_eq!(
        transitions,
        [
            CircuitTransition::Unchanged,
            CircuitTransition::Opened,
            CircuitTransition::Unchanged,
            CircuitTransition::Unchanged,
        ]
    );
    assert_eq!(
        store.record_outcome(&backend, &CallOutcome::success(ms(1))),
        CircuitTransition::Closed
    );
}

#[test]
fn unknown_backend_is_registered_on_first_outcome() {
    let store = MetricsStore::default();
    assert!(store.get(&id("late-joiner")).is_none());
    store.record_outcome(&id("late-joiner"), &CallOutcome::success(ms(5)));
    assert_eq!(store.get(&id("late-joiner")).unwrap().total_calls, 1);
}

// ============================================================================
// Scorer
// ============================================================================

#[test]
fn dominant_backend_ranks_first_under_load_balanced() {
    let store = MetricsStore::default();
    for _ in 0..3 {
        store.record_outcome(&id("good"), &CallOutcome::success(ms(100)).cost(0.001));
        store.record_outcome(&id("poor"), &CallOutcome::success(ms(2_000)).cost(0.05));
    }
    store.record_outcome(&id("poor"), &CallOutcome::failure(ErrorKind::Malformed, "junk", ms(2_000)));
    store.record_outcome(&id("poor"), &CallOutcome::success(ms(2_000)).cost(0.05));

    let scorer = WeightScorer::default();
    let ranked = scorer.rank(&ids(&["poor", "good"]), SelectionPolicy::LoadBalanced, &store);
    assert_eq!(ranked, ids(&["good", "poor"]));

    let scores = scorer.scores(&ids(&["poor", "good"]), &store);
    assert_eq!(scores[0].0, id("good"));
    assert!(scores[0].1 > scores[1].1);
}

#[test]
fn round_robin_is_fair_under_concurrent_callers() {
    let store = MetricsStore::default();
    let scorer = WeightScorer::default();
    let candidates = ids(&["a", "b", "c"]);
    let firsts = Mutex::new(HashMap::<BackendId, usize>::new());

    std::thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| {
                for _ in 0..300 {
                    let ranked = scorer.rank(&candidates, SelectionPolicy::RoundRobin, &store);
                    assert_eq!(ranked.len(), 3);
                    *firsts.lock().unwrap().entry(ranked[0].clone()).or_default() += 1;
                }
            });
        }
    });

    let firsts = firsts.into_inner().unwrap();
    for backend in &candidates {
        assert_eq!(firsts[backend], 800, "{backend} led {} rankings", firsts[backend]);
    }
}

#[test]
fn round_robin_visits_every_backend_once_per_cycle() {
    let store = MetricsStore::default();
    let scorer = WeightScorer::default();
    let candidates = ids(&["c", "a", "b", "d"]);

    let cycle: Vec<_> = (0..4)
        .map(|_| scorer.rank(&candidates, SelectionPolicy::RoundRobin, &store)[0].clone())
        .collect();
    assert_eq!(cycle, ids(&["a", "b", "c", "d"]));
}

#[test]
fn random_policy_is_reproducible_after_reseed() {
    let store = MetricsStore::default();
    let candidates = ids(&["a", "b", "c", "d", "e"]);
    let draw = |scorer: &WeightScorer| -> Vec<Vec<BackendId>> {
        (0..10)
            .map(|_| scorer.rank(&candidates, SelectionPolicy::Random, &store))
            .collect()
    };

    let scorer = WeightScorer::default();
    scorer.reseed(42);
    let first = draw(&scorer);
    scorer.reseed(42);
    assert_eq!(draw(&scorer), first);
    assert_eq!(draw(&WeightScorer::default().with_seed(42)), first);

    // every draw is a permutation of the candidates
    for ranking in &first {
        let mut sorted = ranking.clone();
        sorted.sort();
        assert_eq!(sorted, candidates);
    }
}

#[test]
fn priority_falls_through_unhealthy_backend() {
    let store = MetricsStore::default();
    let scorer = WeightScorer::default()
        .with_priority(ids(&["primary", "secondary", "tertiary"]))
        .with_priority_health_threshold(2);
    let candidates = ids(&["tertiary", "secondary", "primary"]);

    assert_eq!(
        scorer.rank(&candidates, SelectionPolicy::Priority, &store),
        ids(&["primary", "secondary", "tertiary"])
    );

    fail(&store, "primary", 3);
    assert_eq!(
        scorer.rank(&candidates, SelectionPolicy::Priority, &store),
        ids(&["secondary", "tertiary", "primary"])
    );

    store.record_outcome(&id("primary"), &CallOutcome::success(ms(10)));
    assert_eq!(
        scorer.rank(&candidates, SelectionPolicy::Priority, &store)[0],
        id("primary")
    );
}

#[test]
fn open_circuit_is_excluded_under_every_policy() {
    let store = MetricsStore::new(SmoothingConfig::default(), 2);
    let scorer = WeightScorer::default().with_priority(ids(&["broken", "ok"]));
    let candidates = ids(&["broken", "ok"]);
    fail(&store, "broken", 2);

    for policy in SelectionPolicy::ALL {
        assert_eq!(scorer.rank(&candidates, policy, &store), ids(&["ok"]), "{policy}");
    }

    store.reset(Some(&id("broken"))).unwrap();
    for policy in SelectionPolicy::ALL {
        let ranked = scorer.rank(&candidates, policy, &store);
        assert!(ranked.contains(&id("broken")), "{policy}");
    }
}

#[test]
fn nothing_eligible_yields_empty_ranking() {
    let store = MetricsStore::new(SmoothingConfig::default(), 1);
    fail(&store, "a", 1);
    fail(&store, "b", 1);

    let scorer = WeightScorer::default();
    assert!(scorer.rank(&ids(&["a", "b"]), SelectionPolicy::LoadBalanced, &store).is_empty());
    assert!(scorer.rank(&[], SelectionPolicy::RoundRobin, &store).is_empty());
    assert!(scorer.scores(&ids(&["a", "b"]), &store).is_empty());
}
