//! The tiered segment cache.
//!
//! Read path: scratch, then fast (bounded retries on transient errors; a
//! miss is final), then durable under a timeout. A durable hit backfills the
//! fast tier in a detached task. Only a durable-tier failure is surfaced as
//! an error; a clean miss on every tier is [`CacheLookup::Miss`].
//!
//! Write path: fast (best-effort) and durable (retried) concurrently. Neither
//! failure fails the caller; the outcome says which tiers took the write.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use encore_core::config::CacheConfig;
use encore_core::{Error, Result, StreamId};
use encore_hls::content_type_for;
use futures::future::join_all;

use crate::retry::with_backoff;
use crate::scratch::ScratchTier;
use crate::tier::{DurableStore, FastCache, ObjectMeta, Tier};

/// A successful read.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedObject {
    pub bytes: Bytes,
    pub content_type: &'static str,
    /// Tier that served the read.
    pub tier: Tier,
}

/// Result of a cache read. A miss is not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    Hit(CachedObject),
    Miss,
}

impl CacheLookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, CacheLookup::Hit(_))
    }

    pub fn into_hit(self) -> Option<CachedObject> {
        match self {
            CacheLookup::Hit(obj) => Some(obj),
            CacheLookup::Miss => None,
        }
    }
}

/// Which tiers accepted a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PutOutcome {
    pub fast: bool,
    pub durable: bool,
}

/// Retry and timeout settings, taken from [`CacheConfig`].
#[derive(Debug, Clone)]
struct Settings {
    key_prefix: String,
    fast_ttl: Duration,
    fast_retries: u32,
    fast_backoff: Duration,
    durable_retries: u32,
    durable_backoff: Duration,
    durable_timeout: Duration,
}

impl Settings {
    fn from_config(config: &CacheConfig) -> Self {
        Self {
            key_prefix: config.key_prefix.clone(),
            fast_ttl: config.fast_ttl(),
            fast_retries: config.fast_retries,
            fast_backoff: config.fast_backoff(),
            durable_retries: config.durable_retries,
            durable_backoff: config.durable_backoff(),
            durable_timeout: config.durable_timeout(),
        }
    }
}

/// Scratch, fast and durable tiers behind one read/write interface.
#[derive(Clone)]
pub struct TieredCache {
    scratch: ScratchTier,
    fast: Arc<dyn FastCache>,
    durable: Arc<dyn DurableStore>,
    settings: Arc<Settings>,
}

impl std::fmt::Debug for TieredCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredCache")
            .field("scratch", &self.scratch)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl TieredCache {
    pub fn new(
        config: &CacheConfig,
        scratch: ScratchTier,
        fast: Arc<dyn FastCache>,
        durable: Arc<dyn DurableStore>,
    ) -> Self {
        Self {
            scratch,
            fast,
            durable,
            settings: Arc::new(Settings::from_config(config)),
        }
    }

    pub fn scratch(&self) -> &ScratchTier {
        &self.scratch
    }

    /// Fast-tier key: `{prefix}:{stream}:{filename}`.
    pub fn fast_key(&self, stream: &StreamId, filename: &str) -> String {
        format!("{}:{}:{}", self.settings.key_prefix, stream, filename)
    }

    /// Durable-tier key: `streams/{stream}/{filename}`.
    pub fn durable_key(stream: &StreamId, filename: &str) -> String {
        format!("streams/{stream}/{filename}")
    }

    fn hit(bytes: Bytes, filename: &str, tier: Tier) -> CacheLookup {
        CacheLookup::Hit(CachedObject {
            bytes,
            content_type: content_type_for(filename),
            tier,
        })
    }

    // -----------------------------------------------------------------------
    // Read path
    // -----------------------------------------------------------------------

    /// Look up one stream file across all tiers.
    pub async fn get(&self, stream: &StreamId, filename: &str) -> Result<CacheLookup> {
        let started = Instant::now();

        match self.scratch.read(stream, filename).await {
            Ok(Some(bytes)) => return Ok(Self::hit(bytes, filename, Tier::Scratch)),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(stream_id = %stream, filename, tier = "scratch", error = %e, "Tier read failed, falling through");
            }
        }

        if let Some(bytes) = self.fast_get(stream, filename).await {
            return Ok(Self::hit(bytes, filename, Tier::Fast));
        }

        let key = Self::durable_key(stream, filename);
        match self.durable_get(&key).await {
            Ok(Some(bytes)) => {
                self.spawn_backfill(vec![(self.fast_key(stream, filename), bytes.clone())]);
                tracing::debug!(
                    stream_id = %stream,
                    filename,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Served from durable tier"
                );
                Ok(Self::hit(bytes, filename, Tier::Durable))
            }
            Ok(None) => Ok(CacheLookup::Miss),
            Err(e) => {
                tracing::error!(
                    stream_id = %stream,
                    filename,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    error = %e,
                    "All cache tiers failed"
                );
                Err(e)
            }
        }
    }

    /// Batched lookup; one result per filename, in order.
    ///
    /// Fails only if a durable lookup fails for a file no other tier had.
    pub async fn get_many(
        &self,
        stream: &StreamId,
        filenames: &[String],
    ) -> Result<Vec<CacheLookup>> {
        let mut results: Vec<CacheLookup> = vec![CacheLookup::Miss; filenames.len()];
        let mut pending: Vec<usize> = Vec::new();

        for (i, name) in filenames.iter().enumerate() {
            match self.scratch.read(stream, name).await {
                Ok(Some(bytes)) => results[i] = Self::hit(bytes, name, Tier::Scratch),
                Ok(None) => pending.push(i),
                Err(e) => {
                    tracing::warn!(stream_id = %stream, filename = %name, tier = "scratch", error = %e, "Tier read failed, falling through");
                    pending.push(i);
                }
            }
        }
        if pending.is_empty() {
            return Ok(results);
        }

        let keys: Vec<String> = pending
            .iter()
            .map(|&i| self.fast_key(stream, &filenames[i]))
            .collect();
        let fast = with_backoff(
            "fast get_many",
            self.settings.fast_retries,
            self.settings.fast_backoff,
            || self.fast.get_many(&keys),
        )
        .await;
        let mut still_pending = Vec::new();
        match fast {
            Ok(values) if values.len() == pending.len() => {
                for (&i, value) in pending.iter().zip(values) {
                    match value {
                        Some(bytes) => results[i] = Self::hit(bytes, &filenames[i], Tier::Fast),
                        None => still_pending.push(i),
                    }
                }
            }
            Ok(values) => {
                tracing::warn!(stream_id = %stream, expected = pending.len(), got = values.len(), "Fast tier returned a short batch");
                still_pending = pending;
            }
            Err(e) => {
                tracing::warn!(stream_id = %stream, tier = "fast", error = %e, "Batched tier read failed, falling through");
                still_pending = pending;
            }
        }
        if still_pending.is_empty() {
            return Ok(results);
        }

        let lookups = still_pending.iter().map(|&i| {
            let key = Self::durable_key(stream, &filenames[i]);
            async move { (i, self.durable_get(&key).await) }
        });
        let mut backfill = Vec::new();
        let mut first_error = None;
        for (i, outcome) in join_all(lookups).await {
            match outcome {
                Ok(Some(bytes)) => {
                    backfill.push((self.fast_key(stream, &filenames[i]), bytes.clone()));
                    results[i] = Self::hit(bytes, &filenames[i], Tier::Durable);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(stream_id = %stream, filename = %filenames[i], error = %e, "All cache tiers failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        if !backfill.is_empty() {
            self.spawn_backfill(backfill);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(results),
        }
    }

    /// Whether the durable tier holds `filename`. Used to decide whether a
    /// finished stream needs transcoding at all.
    pub async fn durable_stat(&self, stream: &StreamId, filename: &str) -> Result<Option<ObjectMeta>> {
        let key = Self::durable_key(stream, filename);
        let timeout = self.settings.durable_timeout;
        tokio::time::timeout(timeout, self.durable.stat(&key))
            .await
            .map_err(|_| Error::timeout(format!("durable stat {key}"), timeout))?
    }

    async fn fast_get(&self, stream: &StreamId, filename: &str) -> Option<Bytes> {
        let key = self.fast_key(stream, filename);
        let result = with_backoff(
            "fast get",
            self.settings.fast_retries,
            self.settings.fast_backoff,
            || self.fast.get(&key),
        )
        .await;
        match result {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(stream_id = %stream, filename, tier = "fast", error = %e, "Tier read failed, falling through");
                None
            }
        }
    }

    async fn durable_get(&self, key: &str) -> Result<Option<Bytes>> {
        let timeout = self.settings.durable_timeout;
        with_backoff(
            "durable get",
            self.settings.durable_retries,
            self.settings.durable_backoff,
            || async move {
                tokio::time::timeout(timeout, self.durable.get(key))
                    .await
                    .map_err(|_| Error::timeout(format!("durable get {key}"), timeout))?
            },
        )
        .await
    }

    /// Copy durable hits into the fast tier without holding up the reader.
    fn spawn_backfill(&self, entries: Vec<(String, Bytes)>) {
        let fast = Arc::clone(&self.fast);
        let ttl = self.settings.fast_ttl;
        tokio::spawn(async move {
            let count = entries.len();
            match fast.set_many(entries, ttl).await {
                Ok(()) => tracing::trace!(count, "Backfilled fast tier"),
                Err(e) => tracing::warn!(count, error = %e, "Fast tier backfill failed"),
            }
        });
    }

    // -----------------------------------------------------------------------
    // Write path
    // -----------------------------------------------------------------------

    /// Write one stream file to the fast and durable tiers.
    ///
    /// `ttl` overrides the configured fast-tier TTL.
    pub async fn put(
        &self,
        stream: &StreamId,
        filename: &str,
        bytes: Bytes,
        ttl: Option<Duration>,
    ) -> PutOutcome {
        let ttl = ttl.unwrap_or(self.settings.fast_ttl);
        let fast_key = self.fast_key(stream, filename);
        let durable_key = Self::durable_key(stream, filename);

        let fast_write = async {
            match self.fast.set(&fast_key, bytes.clone(), ttl).await {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(stream_id = %stream, filename, tier = "fast", error = %e, "Fast tier write failed");
                    false
                }
            }
        };
        let durable_write = async {
            match self.durable_put(&durable_key, bytes.clone()).await {
                Ok(()) => true,
                Err(e) => {
                    tracing::error!(stream_id = %stream, filename, tier = "durable", error = %e, "Durable write failed after retries");
                    false
                }
            }
        };

        let (fast, durable) = tokio::join!(fast_write, durable_write);
        PutOutcome { fast, durable }
    }

    /// Batched write. The outcome is per tier: `true` only if every entry
    /// reached that tier.
    pub async fn put_many(
        &self,
        stream: &StreamId,
        entries: Vec<(String, Bytes)>,
        ttl: Option<Duration>,
    ) -> PutOutcome {
        if entries.is_empty() {
            return PutOutcome {
                fast: true,
                durable: true,
            };
        }
        let ttl = ttl.unwrap_or(self.settings.fast_ttl);
        let fast_entries: Vec<(String, Bytes)> = entries
            .iter()
            .map(|(name, bytes)| (self.fast_key(stream, name), bytes.clone()))
            .collect();

        let fast_write = async {
            match self.fast.set_many(fast_entries, ttl).await {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(stream_id = %stream, count = entries.len(), tier = "fast", error = %e, "Batched fast tier write failed");
                    false
                }
            }
        };
        let durable_write = async {
            let writes = entries.iter().map(|(name, bytes)| {
                let key = Self::durable_key(stream, name);
                async move {
                    let result = self.durable_put(&key, bytes.clone()).await;
                    if let Err(e) = &result {
                        tracing::error!(stream_id = %stream, filename = %name, tier = "durable", error = %e, "Durable write failed after retries");
                    }
                    result.is_ok()
                }
            });
            join_all(writes).await.into_iter().all(|ok| ok)
        };

        let (fast, durable) = tokio::join!(fast_write, durable_write);
        PutOutcome { fast, durable }
    }

    async fn durable_put(&self, key: &str, bytes: Bytes) -> Result<()> {
        let timeout = self.settings.durable_timeout;
        with_backoff(
            "durable put",
            self.settings.durable_retries,
            self.settings.durable_backoff,
            || {
                let bytes = bytes.clone();
                async move {
                    tokio::time::timeout(timeout, self.durable.put(key, bytes))
                        .await
                        .map_err(|_| Error::timeout(format!("durable put {key}"), timeout))?
                }
            },
        )
        .await
    }
}
