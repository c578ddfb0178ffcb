//! Fixed-window rate limiter over the shared store.
//!
//! Each evaluation counts one occurrence. The first occurrence in a window
//! creates the key and gives it an expiry of `window_secs`; the window ends
//! when the key expires, not on a clock boundary. Across a boundary up to
//! `2 * limit` occurrences can be admitted, which is accepted in exchange for
//! a single round trip per check.

use std::sync::Arc;
use tracing::{debug, trace, warn};

use super::quota::{QuotaDecision, QuotaKey, QuotaRule};
use crate::error::Result;
use crate::store::{SharedStore, Ttl};

/// Default prefix for quota keys in the store.
pub const DEFAULT_KEY_PREFIX: &str = "rate_limit:";

/// Evaluates quota rules against the shared store.
#[derive(Debug)]
pub struct RateLimiter<S> {
    store: Arc<S>,
    key_prefix: String,
}

impl<S> Clone for RateLimiter<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            key_prefix: self.key_prefix.clone(),
        }
    }
}

impl<S: SharedStore> RateLimiter<S> {
    /// Create a rate limiter using the default key prefix.
    pub fn new(store: Arc<S>) -> Self {
        Self::with_prefix(store, DEFAULT_KEY_PREFIX)
    }

    /// Create a rate limiter that namespaces its keys under `key_prefix`.
    pub fn with_prefix(store: Arc<S>, key_prefix: impl Into<String>) -> Self {
        Self {
            store,
            key_prefix: key_prefix.into(),
        }
    }

    /// The key prefix in use.
    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Record one occurrence on `key` and decide whether it fits `rule`.
    pub async fn evaluate(&self, key: &QuotaKey, rule: &QuotaRule) -> Result<QuotaDecision> {
        let storage_key = key.storage_key(&self.key_prefix);

        let count = self
            .store
            .increment_with_expiry(&storage_key, rule.window_secs)
            .await?;

        trace!(
            key = %key,
            count = count,
            limit = rule.limit,
            "Evaluated quota"
        );

        if u64::try_from(count).is_ok_and(|count| count <= rule.limit) {
            return Ok(QuotaDecision::Allowed);
        }

        let retry_after_secs = match self.store.ttl(&storage_key).await? {
            Ttl::Expires(secs) => secs,
            Ttl::Persistent => {
                // The expiry was lost between increment and expire. Without
                // this the key would deny forever.
                warn!(
                    key = %key,
                    count = count,
                    window_secs = rule.window_secs,
                    "Quota key has no expiry, restoring window"
                );
                self.store
                    .set_expiry(&storage_key, rule.window_secs)
                    .await?;
                rule.window_secs
            }
            Ttl::Missing => 0,
        };

        debug!(
            key = %key,
            count = count,
            limit = rule.limit,
            retry_after_secs = retry_after_secs,
            "Quota exceeded"
        );

        Ok(QuotaDecision::Denied {
            key: key.clone(),
            retry_after_secs,
        })
    }

    /// Current occurrence count for `key`, if it has a live window.
    pub async fn counter_value(&self, key: &QuotaKey) -> Result<Option<i64>> {
        self.store.get(&key.storage_key(&self.key_prefix)).await
    }
}
