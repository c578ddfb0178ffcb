//! Redis-backed shared store.
//!
//! ## Connections
//!
//! Plain commands go through a shared `ConnectionManager`, which multiplexes
//! and reconnects on its own. Optimistic transactions cannot share it:
//! `WATCH` state belongs to a connection, so every transaction opens its own
//! connection and drops it after `EXEC`.
//!
//! ## Expiry
//!
//! `increment_with_expiry` runs `INCR` and the first `EXPIRE` inside one Lua
//! script, so a key can never be created without its window.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{AsyncCommands, Client, Script};
use tracing::{debug, info};

use super::{CommitOutcome, OptimisticTransaction, SharedStore, Ttl};
use crate::error::{Result, StoregateError};

const INCREMENT_WITH_EXPIRY: &str = r"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return count
";

/// Configuration for the Redis store.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Redis connection URL (default: "redis://127.0.0.1:6379/")
    pub url: String,
    /// Upper bound on opening a transaction connection (default: 2 seconds)
    pub connect_timeout: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/".to_string(),
            connect_timeout: Duration::from_secs(2),
        }
    }
}

/// [`SharedStore`] backed by a Redis server.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    connection: ConnectionManager,
    increment_script: Script,
    config: RedisStoreConfig,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to Redis with default settings.
    ///
    /// # Errors
    /// Returns `StoreUnavailable` if the server cannot be reached.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_config(RedisStoreConfig {
            url: url.to_string(),
            ..RedisStoreConfig::default()
        })
        .await
    }

    /// Connect to Redis with custom configuration.
    pub async fn connect_with_config(config: RedisStoreConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())?;
        let connection = ConnectionManager::new(client.clone()).await?;
        info!(url = %config.url, "Connected to Redis");

        Ok(Self {
            client,
            connection,
            increment_script: Script::new(INCREMENT_WITH_EXPIRY),
            config,
        })
    }

    async fn dedicated_connection(&self) -> Result<MultiplexedConnection> {
        tokio::time::timeout(
            self.config.connect_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| {
            StoregateError::StoreUnavailable(format!(
                "timed out connecting to {} after {:?}",
                self.config.url, self.config.connect_timeout
            ))
        })?
        .map_err(StoregateError::from)
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    type Transaction = RedisTransaction;

    async fn increment(&self, key: &str) -> Result<i64> {
        let mut conn = self.connection.clone();
        let count: i64 = conn.incr(key, 1).await?;
        Ok(count)
    }

    async fn set_expiry(&self, key: &str, seconds: u64) -> Result<()> {
        let mut conn = self.connection.clone();
        let _: () = conn.expire(key, seconds as i64).await?;
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<Ttl> {
        let mut conn = self.connection.clone();
        let ttl: i64 = conn.ttl(key).await?;
        Ok(Ttl::from_redis(ttl))
    }

    async fn get(&self, key: &str) -> Result<Option<i64>> {
        let mut conn = self.connection.clone();
        let value: Option<i64> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: i64) -> Result<()> {
        let mut conn = self.connection.clone();
        let _: () = conn.set(key, value).await?;
        Ok(())
    }

    async fn increment_with_expiry(&self, key: &str, seconds: u64) -> Result<i64> {
        let mut conn = self.connection.clone();
        let count: i64 = self
            .increment_script
            .key(key)
            .arg(seconds)
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn begin_optimistic_transaction(&self, key: &str) -> Result<RedisTransaction> {
        let mut conn = self.dedicated_connection().await?;
        redis::cmd("WATCH")
            .arg(key)
            .query_async::<()>(&mut conn)
            .await?;

        Ok(RedisTransaction {
            conn,
            key: key.to_string(),
        })
    }
}

/// `WATCH` / `MULTI` / `EXEC` transaction on a dedicated connection.
pub struct RedisTransaction {
    conn: MultiplexedConnection,
    key: String,
}

impl fmt::Debug for RedisTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisTransaction")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl OptimisticTransaction for RedisTransaction {
    async fn get(&mut self) -> Result<Option<i64>> {
        let value: Option<i64> = self.conn.get(&self.key).await?;
        Ok(value)
    }

    async fn commit(mut self, value: i64) -> Result<CommitOutcome> {
        // EXEC answers nil when a watched key changed underneath us.
        let reply: Option<()> = redis::pipe()
            .atomic()
            .set(&self.key, value)
            .ignore()
            .query_async(&mut self.conn)
            .await?;

        match reply {
            Some(()) => Ok(CommitOutcome::Committed),
            None => {
                debug!(key = %self.key, "EXEC aborted by concurrent writer");
                Ok(CommitOutcome::Aborted)
            }
        }
    }
}
