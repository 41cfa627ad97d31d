//! Tier interfaces.
//!
//! A miss is `Ok(None)`, never an error. Implementations return
//! [`Error::CacheTierUnavailable`](encore_core::Error::CacheTierUnavailable)
//! or [`Error::DurableStore`](encore_core::Error::DurableStore) only when the
//! backend itself failed.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use encore_core::Result;

/// Which tier served a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Scratch,
    Fast,
    Durable,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Scratch => "scratch",
            Tier::Fast => "fast",
            Tier::Durable => "durable",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared key/blob cache with per-key expiry.
#[async_trait]
pub trait FastCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()>;

    /// Batched lookup. The result has one slot per key, in order.
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.get(key).await?);
        }
        Ok(out)
    }

    /// Batched write with a shared TTL.
    async fn set_many(&self, entries: Vec<(String, Bytes)>, ttl: Duration) -> Result<()> {
        for (key, value) in entries {
            self.set(&key, value, ttl).await?;
        }
        Ok(())
    }
}

/// Metadata returned by [`DurableStore::stat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectMeta {
    pub size: u64,
}

/// Long-term object store keyed by path-like strings.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn put(&self, key: &str, value: Bytes) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    async fn stat(&self, key: &str) -> Result<Option<ObjectMeta>>;
}
