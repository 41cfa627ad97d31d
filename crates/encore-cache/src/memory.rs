//! In-process tier implementations.
//!
//! Used when no Redis URL or durable root is configured, and as the backing
//! store for tests.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use encore_core::Result;

use crate::tier::{DurableStore, FastCache, ObjectMeta};

struct Entry {
    value: Bytes,
    expires_at: Instant,
}

/// [`FastCache`] backed by a `DashMap` with lazy expiry.
#[derive(Default)]
pub struct MemoryFastCache {
    entries: DashMap<String, Entry>,
}

impl MemoryFastCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, expired ones included until they are
    /// touched or purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop all expired entries.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, e| e.expires_at > now);
    }
}

impl std::fmt::Debug for MemoryFastCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryFastCache")
            .field("entries", &self.entries.len())
            .finish()
    }
}

#[async_trait]
impl FastCache for MemoryFastCache {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let now = Instant::now();
        match self.entries.get(key) {
            Some(entry) if entry.expires_at > now => return Ok(Some(entry.value.clone())),
            Some(_) => {}
            None => return Ok(None),
        }
        self.entries.remove_if(key, |_, e| e.expires_at <= now);
        Ok(None)
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }
}

/// [`DurableStore`] held in memory. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: DashMap<String, Bytes>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl DurableStore for MemoryObjectStore {
    async fn put(&self, key: &str, value: Bytes) -> Result<()> {
        self.objects.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.objects.get(key).map(|v| v.clone()))
    }

    async fn stat(&self, key: &str) -> Result<Option<ObjectMeta>> {
        Ok(self.objects.get(key).map(|v| ObjectMeta {
            size: v.len() as u64,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fast_get_set() {
        let cache = MemoryFastCache::new();
        assert!(cache.get("k").await.unwrap().is_none());
        cache
            .set("k", Bytes::from_static(b"v"), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(cache.get("k").await.unwrap().unwrap(), Bytes::from_static(b"v"));
    }

    #[tokio::test]
    async fn fast_entries_expire() {
        let cache = MemoryFastCache::new();
        cache
            .set("k", Bytes::from_static(b"v"), Duration::from_millis(20))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.get("k").await.unwrap().is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn fast_batch_defaults() {
        let cache = MemoryFastCache::new();
        cache
            .set_many(
                vec![
                    ("a".into(), Bytes::from_static(b"1")),
                    ("c".into(), Bytes::from_static(b"3")),
                ],
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        let got = cache
            .get_many(&["a".into(), "b".into(), "c".into()])
            .await
            .unwrap();
        assert_eq!(
            got,
            vec![
                Some(Bytes::from_static(b"1")),
                None,
                Some(Bytes::from_static(b"3"))
            ]
        );
    }

    #[tokio::test]
    async fn purge_expired_drops_stale() {
        let cache = MemoryFastCache::new();
        cache
            .set("old", Bytes::from_static(b"x"), Duration::from_millis(1))
            .await
            .unwrap();
        cache
            .set("new", Bytes::from_static(b"y"), Duration::from_secs(60))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        cache.purge_expired();
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn object_store_stat() {
        let store = MemoryObjectStore::new();
        assert!(store.stat("streams/a/x.ts").await.unwrap().is_none());
        store
            .put("streams/a/x.ts", Bytes::from_static(b"12345"))
            .await
            .unwrap();
        assert_eq!(
            store.stat("streams/a/x.ts").await.unwrap(),
            Some(ObjectMeta { size: 5 })
        );
        assert_eq!(store.len(), 1);
    }
}
