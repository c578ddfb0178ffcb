//! Shared atomic store abstraction.
//!
//! Both the admission gate and the optimistic counter talk to the backend
//! exclusively through [`SharedStore`]. The store is the single source of
//! truth; nothing here caches counter values in-process.

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::{RedisStore, RedisStoreConfig};

use async_trait::async_trait;

use crate::error::Result;

/// Remaining lifetime of a key, as reported by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    /// The key expires in this many seconds.
    Expires(u64),
    /// The key exists but has no expiry set.
    Persistent,
    /// The key does not exist.
    Missing,
}

impl Ttl {
    /// Convert from the Redis `TTL` reply convention (-2 missing, -1 no expiry).
    pub fn from_redis(value: i64) -> Self {
        match value {
            -2 => Ttl::Missing,
            v if v < 0 => Ttl::Persistent,
            v => Ttl::Expires(v as u64),
        }
    }
}

/// Outcome of committing an optimistic transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The write was applied.
    Committed,
    /// A concurrent writer touched the watched key; nothing was written.
    Aborted,
}

/// A watch-then-commit transaction on a single key.
#[async_trait]
pub trait OptimisticTransaction: Send {
    /// Read the watched key's current value.
    async fn get(&mut self) -> Result<Option<i64>>;

    /// Write `value` only if the key was not modified since the watch began.
    async fn commit(self, value: i64) -> Result<CommitOutcome>;
}

/// Narrow interface over the shared key-value backend.
#[async_trait]
pub trait SharedStore: Send + Sync + std::fmt::Debug {
    /// Transaction handle produced by [`SharedStore::begin_optimistic_transaction`].
    type Transaction: OptimisticTransaction;

    /// Atomically add one to `key`, returning the post-increment value.
    async fn increment(&self, key: &str) -> Result<i64>;

    /// Set `key` to expire `seconds` from now.
    async fn set_expiry(&self, key: &str, seconds: u64) -> Result<()>;

    /// Remaining time-to-live of `key`.
    async fn ttl(&self, key: &str) -> Result<Ttl>;

    /// Read an integer value.
    async fn get(&self, key: &str) -> Result<Option<i64>>;

    /// Unconditionally write an integer value, clearing any expiry.
    async fn set(&self, key: &str, value: i64) -> Result<()>;

    /// Increment `key` and give it an expiry if this call created it.
    ///
    /// The default runs two separate commands, so a crash between them leaves
    /// a key with no expiry. Backends that can do both atomically override it.
    async fn increment_with_expiry(&self, key: &str, seconds: u64) -> Result<i64> {
        let count = self.increment(key).await?;
        if count == 1 {
            self.set_expiry(key, seconds).await?;
        }
        Ok(count)
    }

    /// Start watching `key` for concurrent modification.
    async fn begin_optimistic_transaction(&self, key: &str) -> Result<Self::Transaction>;
}
