//! Unit tests for the coalescing cache.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use super::*;

fn counting_loader(
    calls: Arc<AtomicUsize>,
    delay: Duration,
    value: &'static str,
) -> Loader<String> {
    Arc::new(move |_key| {
        let calls = Arc::clone(&calls);
        Box::pin(async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            Ok(String::from(value))
        })
    })
}

fn failing_then_ok_loader(calls: Arc<AtomicUsize>, failures: usize) -> Loader<String> {
    Arc::new(move |key| {
        let calls = Arc::clone(&calls);
        Box::pin(async move {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            if attempt < failures {
                Err(CacheError::Transient {
                    message: format!("attempt {attempt} failed for {key}"),
                })
            } else {
                Ok(String::from("V"))
            }
        })
    })
}

#[tokio::test]
async fn concurrent_gets_share_one_load() {
    let calls = Arc::new(AtomicUsize::new(0));
    let cache = Cache::new(
        counting_loader(Arc::clone(&calls), Duration::from_millis(100), "V"),
        0,
        false,
        4,
    );

    let started = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..50 {
        let cache = cache.clone();
        handles.push(tokio::spawn(async move { cache.get("k").await }));
    }
    for handle in handles {
        let outcome = handle.await.unwrap_or_else(|err| panic!("join: {err}"));
        assert_eq!(outcome, Ok(String::from("V")));
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1, "loader must run once");
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "waiters should share one load rather than serialise fifty"
    );
}

#[tokio::test]
async fn retries_until_the_budget_is_spent() {
    let calls = Arc::new(AtomicUsize::new(0));
    let cache = Cache::new(failing_then_ok_loader(Arc::clone(&calls), 2), 2, false, 1);
    assert_eq!(cache.get("k").await, Ok(String::from("V")));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn gives_up_when_failures_exceed_retries() {
    let calls = Arc::new(AtomicUsize::new(0));
    let cache = Cache::new(failing_then_ok_loader(Arc::clone(&calls), 3), 2, false, 1);
    let outcome = cache.get("k").await;
    assert!(matches!(outcome, Err(CacheError::Transient { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 3, "initial attempt plus two retries");
}

#[tokio::test]
async fn cached_errors_are_replayed_without_reloading() {
    let calls = Arc::new(AtomicUsize::new(0));
    let cache = Cache::new(failing_then_ok_loader(Arc::clone(&calls), 10), 0, true, 1);

    let first = cache.get("k").await;
    assert!(first.is_err());
    let second = cache.get("k").await;
    assert_eq!(first, second);
    assert_eq!(calls.load(Ordering::SeqCst), 1, "negative entry must be served from the store");
}

#[tokio::test]
async fn uncached_errors_trigger_a_fresh_load() {
    let calls = Arc::new(AtomicUsize::new(0));
    let cache = Cache::new(failing_then_ok_loader(Arc::clone(&calls), 1), 0, false, 1);

    assert!(cache.get("k").await.is_err());
    assert_eq!(cache.get("k").await, Ok(String::from("V")));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn prepare_warms_the_store_for_later_gets() {
    let calls = Arc::new(AtomicUsize::new(0));
    let cache = Cache::new(
        counting_loader(Arc::clone(&calls), Duration::from_millis(10), "V"),
        0,
        false,
        2,
    );

    cache.prepare("k").await;
    let deadline = Instant::now() + Duration::from_secs(2);
    while !cache.peek("k").await {
        assert!(Instant::now() < deadline, "prepare should eventually store the value");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(cache.get("k").await, Ok(String::from("V")));
    assert_eq!(calls.load(Ordering::SeqCst), 1, "get after prepare must not reload");
}

#[tokio::test]
async fn peek_never_triggers_a_load() {
    let calls = Arc::new(AtomicUsize::new(0));
    let cache = Cache::new(
        counting_loader(Arc::clone(&calls), Duration::ZERO, "V"),
        0,
        false,
        1,
    );

    assert!(!cache.peek("k").await);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn close_rejects_later_requests() {
    let calls = Arc::new(AtomicUsize::new(0));
    let cache = Cache::new(
        counting_loader(Arc::clone(&calls), Duration::ZERO, "V"),
        0,
        false,
        1,
    );

    assert_eq!(cache.get("k").await, Ok(String::from("V")));
    cache.close().await;

    assert_eq!(cache.get("other").await, Err(CacheError::Closed));
    assert!(!cache.peek("k").await);
}

#[tokio::test]
async fn close_drains_in_flight_loads() {
    let calls = Arc::new(AtomicUsize::new(0));
    let cache = Cache::new(
        counting_loader(Arc::clone(&calls), Duration::from_millis(50), "V"),
        0,
        false,
        1,
    );

    let waiter = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.get("k").await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    cache.close().await;

    let outcome = waiter.await.unwrap_or_else(|err| panic!("join: {err}"));
    assert_eq!(outcome, Ok(String::from("V")), "in-flight load must still deliver");
}

#[tokio::test]
async fn every_waiter_observes_the_same_failure() {
    let calls = Arc::new(AtomicUsize::new(0));
    let slow_failure: Loader<String> = {
        let calls = Arc::clone(&calls);
        Arc::new(move |key| {
            let calls = Arc::clone(&calls);
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Err(CacheError::NotFound {
                    message: format!("no such resource {key}"),
                })
            })
        })
    };
    let cache = Cache::new(slow_failure, 0, true, 2);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let cache = cache.clone();
        handles.push(tokio::spawn(async move { cache.get("missing").await }));
    }

    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.unwrap_or_else(|err| panic!("join: {err}")));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    for outcome in &outcomes {
        assert_eq!(outcome, &outcomes[0]);
    }
}
