//! Redis-backed fast tier.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use deadpool_redis::redis::{self, AsyncCommands};
use deadpool_redis::{Config, Connection, Pool, Runtime};
use encore_core::{Error, Result};

use crate::tier::FastCache;

const TIER: &str = "fast";

/// [`FastCache`] on a pooled Redis connection.
///
/// Values are stored with `SET EX`; batched reads use `MGET` and batched
/// writes a single pipeline.
#[derive(Clone)]
pub struct RedisFastCache {
    pool: Pool,
}

impl RedisFastCache {
    /// Create the connection pool. No connection is opened until first use.
    pub fn new(redis_url: &str) -> Result<Self> {
        let cfg = Config::from_url(redis_url);
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| Error::Config(format!("invalid redis url {redis_url}: {e}")))?;
        Ok(Self { pool })
    }

    async fn conn(&self) -> Result<Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| Error::tier_unavailable(TIER, e))
    }
}

impl std::fmt::Debug for RedisFastCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = self.pool.status();
        f.debug_struct("RedisFastCache")
            .field("size", &status.size)
            .field("available", &status.available)
            .finish()
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl FastCache for RedisFastCache {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let mut conn = self.conn().await?;
        let value = conn
            .get::<_, Option<Vec<u8>>>(key)
            .await
            .map_err(|e| Error::tier_unavailable(TIER, e))?;
        Ok(value.map(Bytes::from))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        let mut conn = self.conn().await?;
        conn.set_ex::<_, _, ()>(key, value.as_ref(), ttl_secs(ttl))
            .await
            .map_err(|e| Error::tier_unavailable(TIER, e))
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        let values: Vec<Option<Vec<u8>>> = redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::tier_unavailable(TIER, e))?;
        Ok(values.into_iter().map(|v| v.map(Bytes::from)).collect())
    }

    async fn set_many(&self, entries: Vec<(String, Bytes)>, ttl: Duration) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let secs = ttl_secs(ttl);
        let mut pipe = redis::pipe();
        for (key, value) in &entries {
            pipe.set_ex(key, value.as_ref(), secs).ignore();
        }
        let mut conn = self.conn().await?;
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::tier_unavailable(TIER, e))?;
        Ok(())
    }
}
