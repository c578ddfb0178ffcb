//! Integration tests for the Redis store.
//!
//! These tests require a Redis instance running at `redis://127.0.0.1/`.
//! Tests are ignored by default - run with `cargo test --test redis_store -- --ignored`

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use storegate::ratelimit::{AdmissionRule, AdmissionRules, IdentifierSource, QuotaKey};
use storegate::store::{CommitOutcome, OptimisticTransaction, RedisStore, SharedStore, Ttl};
use storegate::{AdmissionGate, CounterKey, OptimisticCounter, RateLimiter, RetryPolicy, UnitOfWork};

const REDIS_URL: &str = "redis://127.0.0.1/";

/// Connect, or `None` if Redis is not reachable.
async fn connect() -> Option<RedisStore> {
    match RedisStore::connect(REDIS_URL).await {
        Ok(store) => Some(store),
        Err(_) => {
            eprintln!("Skipping test: Redis not available at {}", REDIS_URL);
            None
        }
    }
}

/// A key unique to this test run, cleared before use.
async fn fresh_key(store: &RedisStore, name: &str) -> String {
    let key = format!("storegate-test:{}:{}", std::process::id(), name);
    store.set_expiry(&key, 0).await.unwrap();
    key
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_redis_increment_and_expiry() {
    let Some(store) = connect().await else { return };
    let key = fresh_key(&store, "incr").await;

    assert_eq!(store.get(&key).await.unwrap(), None);
    assert_eq!(store.ttl(&key).await.unwrap(), Ttl::Missing);

    assert_eq!(store.increment(&key).await.unwrap(), 1);
    assert_eq!(store.ttl(&key).await.unwrap(), Ttl::Persistent);

    store.set_expiry(&key, 30).await.unwrap();
    match store.ttl(&key).await.unwrap() {
        Ttl::Expires(secs) => assert!(secs > 0 && secs <= 30),
        other => panic!("expected an expiry, got {:?}", other),
    }

    store.set_expiry(&key, 0).await.unwrap();
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_redis_increment_with_expiry_sets_window_once() {
    let Some(store) = connect().await else { return };
    let key = fresh_key(&store, "window").await;

    assert_eq!(store.increment_with_expiry(&key, 60).await.unwrap(), 1);
    assert_eq!(store.increment_with_expiry(&key, 5).await.unwrap(), 2);

    // The second call must not have shortened the window.
    match store.ttl(&key).await.unwrap() {
        Ttl::Expires(secs) => assert!(secs > 5),
        other => panic!("expected an expiry, got {:?}", other),
    }

    store.set_expiry(&key, 0).await.unwrap();
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_redis_transaction_aborts_on_interleaved_write() {
    let Some(store) = connect().await else { return };
    let key = fresh_key(&store, "watch").await;
    store.set(&key, 10).await.unwrap();

    let mut tx = store.begin_optimistic_transaction(&key).await.unwrap();
    assert_eq!(tx.get().await.unwrap(), Some(10));

    store.set(&key, 50).await.unwrap();

    assert_eq!(tx.commit(11).await.unwrap(), CommitOutcome::Aborted);
    assert_eq!(store.get(&key).await.unwrap(), Some(50));

    let mut tx = store.begin_optimistic_transaction(&key).await.unwrap();
    let current = tx.get().await.unwrap().unwrap_or(0);
    assert_eq!(tx.commit(current + 1).await.unwrap(), CommitOutcome::Committed);
    assert_eq!(store.get(&key).await.unwrap(), Some(51));

    store.set_expiry(&key, 0).await.unwrap();
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_redis_concurrent_counter() {
    let Some(store) = connect().await else { return };
    let key = fresh_key(&store, "counter").await;
    let store = Arc::new(store);

    let policy = RetryPolicy::unbounded()
        .with_backoff(storegate::counter::Backoff::Fixed(Duration::from_millis(5)));
    let counter = OptimisticCounter::new(store.clone()).with_policy(policy);
    let counter_key = CounterKey::raw(key.clone());

    let results = join_all((0..20).map(|_| counter.increment(&counter_key))).await;
    let values: HashSet<i64> = results.into_iter().map(|r| r.unwrap()).collect();

    assert_eq!(values, (1..=20).collect::<HashSet<_>>());
    assert_eq!(store.get(&key).await.unwrap(), Some(20));

    store.set_expiry(&key, 0).await.unwrap();
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_redis_admission_gate() {
    let Some(store) = connect().await else { return };
    let prefix = format!("storegate-test:{}:quota:", std::process::id());
    let caller = "198.51.100.9";
    store
        .set_expiry(&format!("{}ip:{}", prefix, caller), 0)
        .await
        .unwrap();

    let gate = AdmissionGate::new(
        RateLimiter::with_prefix(Arc::new(store), prefix),
        AdmissionRules::new(vec![
            AdmissionRule::new("ip", IdentifierSource::Caller, 3, 60).unwrap(),
        ])
        .unwrap(),
    );
    let unit = UnitOfWork::new(caller);

    for _ in 0..3 {
        assert!(gate.admit(&unit).await.unwrap().is_allowed());
    }
    let denied = gate.admit(&unit).await.unwrap();
    let retry_after = denied.retry_after_secs().expect("fourth request is denied");
    assert!(retry_after > 0 && retry_after <= 60);

    let key = QuotaKey::new("ip", caller);
    assert_eq!(gate.limiter().counter_value(&key).await.unwrap(), Some(4));
    gate.limiter()
        .store()
        .set_expiry(&key.storage_key(gate.limiter().key_prefix()), 0)
        .await
        .unwrap();
}
