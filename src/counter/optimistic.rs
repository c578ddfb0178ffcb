//! Read-modify-write counters under optimistic concurrency control.
//!
//! No lock is held between the read and the write. Each attempt watches the
//! key, reads it, and commits conditionally; a concurrent writer makes the
//! commit abort and the attempt is retried after a backoff. Uncontended
//! updates cost one transaction. Under heavy contention every participant may
//! retry until the policy's attempt budget runs out.

use std::sync::Arc;
use tracing::{debug, instrument, trace, warn};

use super::backoff::RetryPolicy;
use super::sleeper::{Sleeper, TokioSleeper};
use crate::error::{Result, StoregateError};
use crate::store::{CommitOutcome, OptimisticTransaction, SharedStore};

/// Default namespace for resource counters.
pub const DEFAULT_NAMESPACE: &str = "product";
/// Default counter name within a resource.
pub const DEFAULT_COUNTER_NAME: &str = "views";

/// Store key of a resource-scoped counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey(String);

impl CounterKey {
    /// `namespace:resource_id:name`
    pub fn new(namespace: &str, resource_id: &str, name: &str) -> Self {
        Self(format!("{}:{}:{}", namespace, resource_id, name))
    }

    /// View counter of a product.
    pub fn views(resource_id: &str) -> Self {
        Self::new(DEFAULT_NAMESPACE, resource_id, DEFAULT_COUNTER_NAME)
    }

    /// Use `key` verbatim.
    pub fn raw(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CounterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Counter updates with bounded optimistic retries.
#[derive(Debug)]
pub struct OptimisticCounter<S> {
    store: Arc<S>,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    namespace: String,
    name: String,
}

impl<S: SharedStore> OptimisticCounter<S> {
    /// Create a counter with the default retry policy.
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            policy: RetryPolicy::default(),
            sleeper: Arc::new(TokioSleeper),
            namespace: DEFAULT_NAMESPACE.to_string(),
            name: DEFAULT_COUNTER_NAME.to_string(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Change how [`resource_key`](Self::resource_key) builds keys.
    pub fn with_naming(mut self, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self.name = name.into();
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Counter key for `resource_id` under this counter's naming.
    pub fn resource_key(&self, resource_id: &str) -> CounterKey {
        CounterKey::new(&self.namespace, resource_id, &self.name)
    }

    /// Current value; an absent counter reads as zero.
    pub async fn current(&self, key: &CounterKey) -> Result<i64> {
        Ok(self.store.get(key.as_str()).await?.unwrap_or(0))
    }

    /// Add one and return the committed value.
    pub async fn increment(&self, key: &CounterKey) -> Result<i64> {
        self.add(key, 1).await
    }

    /// Add one to `resource_id`'s counter.
    pub async fn increment_resource(&self, resource_id: &str) -> Result<i64> {
        self.increment(&self.resource_key(resource_id)).await
    }

    /// Add `delta` and return the committed value.
    pub async fn add(&self, key: &CounterKey, delta: i64) -> Result<i64> {
        self.update(key, |current| {
            current.checked_add(delta).ok_or_else(|| {
                StoregateError::Store(format!("adding {} to {} would overflow", delta, key))
            })
        })
        .await
    }

    /// Replace the value with `transform(current)` and return what was committed.
    ///
    /// `transform` may run once per attempt. Dropping the returned future stops
    /// further attempts; a commit that already went through stays.
    #[instrument(skip(self, key, transform), fields(key = %key))]
    pub async fn update<F>(&self, key: &CounterKey, transform: F) -> Result<i64>
    where
        F: Fn(i64) -> Result<i64> + Send + Sync,
    {
        let max_attempts = self.policy.max_attempts;

        for attempt in 1..=max_attempts {
            let mut tx = self.store.begin_optimistic_transaction(key.as_str()).await?;
            let current = tx.get().await?.unwrap_or(0);
            let next = transform(current)?;

            match tx.commit(next).await? {
                CommitOutcome::Committed => {
                    trace!(attempt = attempt, value = next, "Counter committed");
                    return Ok(next);
                }
                CommitOutcome::Aborted => {
                    debug!(attempt = attempt, "Counter commit aborted, concurrent writer");
                    if attempt < max_attempts {
                        self.sleeper.sleep(self.policy.delay(attempt)).await;
                    }
                }
            }
        }

        warn!(attempts = max_attempts, "Counter update gave up under contention");
        Err(StoregateError::ContentionExhausted {
            key: key.to_string(),
            attempts: max_attempts,
        })
    }
}
