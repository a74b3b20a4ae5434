//! Cache gateway: expiry, pattern deletes and single-flight resolution.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use orchesity::cache::{CacheGateway, MemoryCache, RequestFingerprint, Resolution};
use orchesity::{
    BackendId, BackendResult, DispatchStatus, OrchesityError, OrchestrationRequest,
    OrchestrationResponse, Result, ResultSource, Usage,
};

// ============================================================================
// Helpers
// ============================================================================

fn gateway() -> CacheGateway {
    CacheGateway::new(Arc::new(MemoryCache::new(100)), Duration::from_secs(60))
}

fn fingerprint(prompt: &str) -> RequestFingerprint {
    RequestFingerprint::compute(
        &OrchestrationRequest::new(prompt),
        &[BackendId::from("a")],
        1,
    )
    .unwrap()
}

fn response(text: &str) -> OrchestrationResponse {
    OrchestrationResponse {
        request_id: "req_test".into(),
        status: DispatchStatus::Completed,
        results: vec![BackendResult {
            backend: BackendId::from("a"),
            text: text.into(),
            model: None,
            usage: Usage::new(1, 1),
            cost: 0.0,
            latency: Duration::from_millis(5),
            quality: None,
        }],
        errors: Vec::new(),
        pending: Vec::new(),
        cached: false,
        source: ResultSource::Dispatched,
        fingerprint: None,
    }
}

fn failed() -> OrchesityError {
    OrchesityError::AllBackendsFailed {
        timed_out: false,
        errors: Vec::new(),
    }
}

/// Produce `text` after `delay`, counting invocations.
async fn produce(counter: &AtomicU32, delay: Duration, text: &str) -> Result<OrchestrationResponse> {
    counter.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(delay).await;
    Ok(response(text))
}

fn text(resolution: &Resolution) -> String {
    match resolution {
        Resolution::Hit(results) => results[0].text.clone(),
        Resolution::Joined(Ok(r)) | Resolution::Dispatched(Ok(r)) => r.results[0].text.clone(),
        other => panic!("unexpected resolution: {other:?}"),
    }
}

// ============================================================================
// Lookup and expiry
// ============================================================================

#[tokio::test(start_paused = true)]
async fn stored_results_are_served_until_ttl_elapses() {
    let gateway = gateway();
    let fp = fingerprint("q");

    gateway
        .store(&fp, response("cached").results, Duration::from_secs(30))
        .await;

    tokio::time::advance(Duration::from_secs(29)).await;
    assert_eq!(gateway.lookup(&fp).await.unwrap()[0].text, "cached");

    tokio::time::advance(Duration::from_secs(1)).await;
    assert!(gateway.lookup(&fp).await.is_none());

    let stats = gateway.stats().await;
    assert_eq!((stats.hits, stats.misses), (1, 1));
    assert_eq!(stats.entries, Some(0), "expired entry is deleted on read");
}

#[tokio::test(start_paused = true)]
async fn expired_entry_is_refreshed_by_resolve() {
    let gateway = gateway();
    let fp = fingerprint("q");
    let calls = AtomicU32::new(0);
    let ttl = Duration::from_secs(10);

    let first = gateway
        .resolve(&fp, ttl, || produce(&calls, Duration::ZERO, "v1"))
        .await;
    assert!(matches!(first, Resolution::Dispatched(Ok(_))));

    let second = gateway
        .resolve(&fp, ttl, || produce(&calls, Duration::ZERO, "v2"))
        .await;
    assert!(matches!(second, Resolution::Hit(_)));
    assert_eq!(text(&second), "v1");

    tokio::time::advance(ttl).await;
    let third = gateway
        .resolve(&fp, ttl, || produce(&calls, Duration::ZERO, "v3"))
        .await;
    assert!(matches!(third, Resolution::Dispatched(Ok(_))));
    assert_eq!(text(&third), "v3");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn clear_removes_only_matching_keys() {
    let gateway = gateway();
    for prompt in ["one", "two", "three"] {
        gateway
            .store(&fingerprint(prompt), response(prompt).results, Duration::from_secs(60))
            .await;
    }

    assert_eq!(gateway.clear("unrelated:*").await.unwrap(), 0);
    let one = fingerprint("one").to_string();
    assert_eq!(gateway.clear(&one).await.unwrap(), 1);
    assert_eq!(gateway.clear("llm_response:*").await.unwrap(), 2);
    assert_eq!(gateway.stats().await.entries, Some(0));
}

// ============================================================================
// Single flight
// ============================================================================

#[tokio::test(start_paused = true)]
async fn identical_concurrent_resolves_run_produce_once() {
    let gateway = gateway();
    let fp = fingerprint("popular");
    let calls = AtomicU32::new(0);
    let ttl = Duration::from_secs(60);

    let (a, b, c) = tokio::join!(
        gateway.resolve(&fp, ttl, || produce(&calls, Duration::from_millis(50), "shared")),
        gateway.resolve(&fp, ttl, || produce(&calls, Duration::from_millis(50), "b")),
        gateway.resolve(&fp, ttl, || produce(&calls, Duration::from_millis(50), "c")),
    );

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(matches!(a, Resolution::Dispatched(Ok(_))));
    assert!(matches!(b, Resolution::Joined(Ok(_))));
    assert!(matches!(c, Resolution::Joined(Ok(_))));
    for resolution in [&a, &b, &c] {
        assert_eq!(text(resolution), "shared");
    }

    let stats = gateway.stats().await;
    assert_eq!(stats.joins, 2);
    assert_eq!(stats.stores, 1);
    assert_eq!(stats.in_flight, 0);
}

#[tokio::test(start_paused = true)]
async fn different_fingerprints_do_not_join() {
    let gateway = gateway();
    let calls = AtomicU32::new(0);
    let ttl = Duration::from_secs(60);
    let (x, y) = (fingerprint("x"), fingerprint("y"));

    tokio::join!(
        gateway.resolve(&x, ttl, || produce(&calls, Duration::from_millis(50), "x")),
        gateway.resolve(&y, ttl, || produce(&calls, Duration::from_millis(50), "y")),
    );
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(gateway.stats().await.joins, 0);
}

#[tokio::test(start_paused = true)]
async fn leader_failure_reaches_joiners_and_is_not_cached() {
    let gateway = gateway();
    let fp = fingerprint("doomed");
    let calls = AtomicU32::new(0);
    let ttl = Duration::from_secs(60);
    let counter = &calls;
    let fail = move || async move {
        counter.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        Err::<OrchestrationResponse, _>(failed())
    };

    let (leader, joiner) = tokio::join!(
        gateway.resolve(&fp, ttl, fail),
        gateway.resolve(&fp, ttl, fail),
    );
    assert!(matches!(leader, Resolution::Dispatched(Err(_))));
    assert!(matches!(
        joiner,
        Resolution::Joined(Err(OrchesityError::AllBackendsFailed { .. }))
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(gateway.stats().await.stores, 0);

    let retry = gateway
        .resolve(&fp, ttl, || produce(&calls, Duration::ZERO, "recovered"))
        .await;
    assert!(matches!(retry, Resolution::Dispatched(Ok(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn unsuccessful_status_is_not_cached() {
    let gateway = gateway();
    let fp = fingerprint("empty");
    let ttl = Duration::from_secs(60);

    let resolution = gateway
        .resolve(&fp, ttl, || async {
            let mut r = response("ignored");
            r.results.clear();
            Ok(r)
        })
        .await;
    assert!(matches!(resolution, Resolution::Dispatched(Ok(_))));
    assert_eq!(gateway.stats().await.stores, 0);
    assert!(gateway.lookup(&fp).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn follower_takes_over_when_leader_is_dropped() {
    let gateway = gateway();
    let fp = fingerprint("abandoned");
    let calls = AtomicU32::new(0);
    let ttl = Duration::from_secs(60);

    let (abandoned, follower) = tokio::join!(
        tokio::time::timeout(
            Duration::from_millis(100),
            gateway.resolve(&fp, ttl, || produce(&calls, Duration::from_secs(3600), "never")),
        ),
        gateway.resolve(&fp, ttl, || produce(&calls, Duration::from_millis(10), "takeover")),
    );

    assert!(abandoned.is_err());
    assert!(matches!(follower, Resolution::Dispatched(Ok(_))));
    assert_eq!(text(&follower), "takeover");
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let stats = gateway.stats().await;
    assert_eq!(stats.joins, 1);
    assert_eq!(stats.in_flight, 0);
}
