//! In-memory shared store.
//!
//! Stands in for the real backend in tests and local runs. Atomicity comes
//! from dashmap's per-shard locking; every write stamps the key with a fresh
//! version so optimistic transactions can detect interleaved writers the same
//! way `WATCH` does. Expiry uses the tokio clock, so paused-time tests can
//! step through windows.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::trace;

use super::{CommitOutcome, OptimisticTransaction, SharedStore, Ttl};
use crate::error::{Result, StoregateError};

#[derive(Debug, Clone)]
struct Slot {
    value: i64,
    version: u64,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

#[derive(Debug, Default)]
struct Inner {
    slots: DashMap<String, Slot>,
    next_version: AtomicU64,
    transactions: AtomicU64,
    aborts: AtomicU64,
}

impl Inner {
    fn bump_version(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Drop `key` if its expiry has passed. Must not be called while holding a
    /// guard on the same shard.
    fn purge_expired(&self, key: &str, now: Instant) {
        self.slots.remove_if(key, |_, slot| slot.is_expired(now));
    }

    /// Entry for `key`, replaced by `fresh` if absent or expired. The expiry
    /// check happens under the entry guard.
    fn live_slot(&self, key: &str, now: Instant, fresh: Slot) -> RefMut<'_, String, Slot> {
        match self.slots.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(fresh);
                }
                occupied.into_ref()
            }
            Entry::Vacant(vacant) => vacant.insert(fresh),
        }
    }

    fn watched_version(&self, key: &str) -> Option<u64> {
        self.purge_expired(key, Instant::now());
        self.slots.get(key).map(|slot| slot.version)
    }

    fn value(&self, key: &str) -> Option<i64> {
        self.purge_expired(key, Instant::now());
        self.slots.get(key).map(|slot| slot.value)
    }
}

/// A process-local [`SharedStore`].
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
    read_delay: Option<Duration>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pause for `delay` after every transactional read.
    ///
    /// Widens the gap between watch and commit so concurrent transactions
    /// reliably collide.
    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = Some(delay);
        self
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.inner
            .slots
            .iter()
            .filter(|slot| !slot.is_expired(now))
            .count()
    }

    /// Whether the store holds no live keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `key` currently exists.
    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.value(key).is_some()
    }

    /// Remove every key.
    pub fn clear(&self) {
        self.inner.slots.clear();
    }

    /// Number of optimistic transactions started so far.
    pub fn transactions_started(&self) -> u64 {
        self.inner.transactions.load(Ordering::SeqCst)
    }

    /// Number of commits rejected because of a concurrent writer.
    pub fn aborted_commits(&self) -> u64 {
        self.inner.aborts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    type Transaction = MemoryTransaction;

    async fn increment(&self, key: &str) -> Result<i64> {
        let version = self.inner.bump_version();

        let mut slot = self.inner.live_slot(
            key,
            Instant::now(),
            Slot {
                value: 0,
                version,
                expires_at: None,
            },
        );
        slot.value = slot
            .value
            .checked_add(1)
            .ok_or_else(|| StoregateError::Store(format!("increment would overflow {}", key)))?;
        slot.version = version;
        Ok(slot.value)
    }

    async fn set_expiry(&self, key: &str, seconds: u64) -> Result<()> {
        let now = Instant::now();
        self.inner.purge_expired(key, now);

        if seconds == 0 {
            self.inner.slots.remove(key);
            return Ok(());
        }

        let version = self.inner.bump_version();
        if let Some(mut slot) = self.inner.slots.get_mut(key) {
            slot.expires_at = Some(now + Duration::from_secs(seconds));
            slot.version = version;
        }
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<Ttl> {
        let now = Instant::now();
        self.inner.purge_expired(key, now);

        let ttl = match self.inner.slots.get(key) {
            None => Ttl::Missing,
            Some(slot) => match slot.expires_at {
                None => Ttl::Persistent,
                Some(at) => {
                    let remaining = at.saturating_duration_since(now);
                    let mut secs = remaining.as_secs();
                    if remaining.subsec_nanos() > 0 {
                        secs += 1;
                    }
                    Ttl::Expires(secs)
                }
            },
        };
        Ok(ttl)
    }

    async fn get(&self, key: &str) -> Result<Option<i64>> {
        Ok(self.inner.value(key))
    }

    async fn set(&self, key: &str, value: i64) -> Result<()> {
        let version = self.inner.bump_version();
        self.inner.slots.insert(
            key.to_string(),
            Slot {
                value,
                version,
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn increment_with_expiry(&self, key: &str, seconds: u64) -> Result<i64> {
        let now = Instant::now();
        let version = self.inner.bump_version();

        let mut slot = self.inner.live_slot(
            key,
            now,
            Slot {
                value: 0,
                version,
                expires_at: Some(now + Duration::from_secs(seconds)),
            },
        );
        slot.value = slot
            .value
            .checked_add(1)
            .ok_or_else(|| StoregateError::Store(format!("increment would overflow {}", key)))?;
        slot.version = version;
        Ok(slot.value)
    }

    async fn begin_optimistic_transaction(&self, key: &str) -> Result<MemoryTransaction> {
        self.inner.transactions.fetch_add(1, Ordering::SeqCst);
        let watched = self.inner.watched_version(key);
        trace!(key = %key, watched = ?watched, "Watching key");

        Ok(MemoryTransaction {
            inner: Arc::clone(&self.inner),
            key: key.to_string(),
            watched,
            read_delay: self.read_delay,
        })
    }
}

/// Optimistic transaction against a [`MemoryStore`].
#[derive(Debug)]
pub struct MemoryTransaction {
    inner: Arc<Inner>,
    key: String,
    watched: Option<u64>,
    read_delay: Option<Duration>,
}

#[async_trait]
impl OptimisticTransaction for MemoryTransaction {
    async fn get(&mut self) -> Result<Option<i64>> {
        let value = self.inner.value(&self.key);
        if let Some(delay) = self.read_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(value)
    }

    async fn commit(self, value: i64) -> Result<CommitOutcome> {
        let now = Instant::now();
        let version = self.inner.bump_version();
        let fresh = Slot {
            value,
            version,
            expires_at: None,
        };

        let outcome = match self.inner.slots.entry(self.key.clone()) {
            Entry::Occupied(mut occupied) => {
                let current = Some(occupied.get())
                    .filter(|slot| !slot.is_expired(now))
                    .map(|slot| slot.version);
                if current == self.watched {
                    occupied.insert(fresh);
                    CommitOutcome::Committed
                } else {
                    CommitOutcome::Aborted
                }
            }
            Entry::Vacant(vacant) => {
                if self.watched.is_none() {
                    vacant.insert(fresh);
                    CommitOutcome::Committed
                } else {
                    CommitOutcome::Aborted
                }
            }
        };

        if outcome == CommitOutcome::Aborted {
            self.inner.aborts.fetch_add(1, Ordering::SeqCst);
        }
        Ok(outcome)
    }
}
