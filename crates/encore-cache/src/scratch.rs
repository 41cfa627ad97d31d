//! Tier 1: the transcoder's scratch output directories.
//!
//! A directory is registered when a job starts writing into it. Only files
//! the publisher has marked as published are served, so a segment the
//! transcoder is still writing is never returned. Each directory is deleted
//! a fixed delay after registration, whether or not it is still being read.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use encore_core::{Error, Result, StreamId};

#[derive(Debug)]
struct ScratchDir {
    path: PathBuf,
    created_at: Instant,
    generation: u64,
    published: HashSet<String>,
}

#[derive(Debug)]
struct Inner {
    dirs: DashMap<StreamId, ScratchDir>,
    ttl: Duration,
    next_generation: AtomicU64,
}

/// Registry of per-stream scratch directories.
#[derive(Debug, Clone)]
pub struct ScratchTier {
    inner: Arc<Inner>,
}

impl ScratchTier {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                dirs: DashMap::new(),
                ttl,
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    /// Register `dir` as the scratch directory of `stream` and schedule its
    /// deletion after the configured delay.
    ///
    /// Re-registering a stream (a retry) restarts the delay; the earlier
    /// timer becomes a no-op.
    pub fn register(&self, stream: &StreamId, dir: impl Into<PathBuf>) {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let path = dir.into();
        self.inner.dirs.insert(
            stream.clone(),
            ScratchDir {
                path,
                created_at: Instant::now(),
                generation,
                published: HashSet::new(),
            },
        );

        // Outside a runtime the periodic sweep still removes the directory.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let tier = self.clone();
            let stream = stream.clone();
            handle.spawn(async move {
                tokio::time::sleep(tier.inner.ttl).await;
                tier.expire(&stream, Some(generation)).await;
            });
        }
    }

    /// Allow `filename` to be served from the scratch directory.
    pub fn mark_published(&self, stream: &StreamId, filename: &str) {
        if let Some(mut dir) = self.inner.dirs.get_mut(stream) {
            dir.published.insert(filename.to_string());
        }
    }

    pub fn path_of(&self, stream: &StreamId) -> Option<PathBuf> {
        self.inner.dirs.get(stream).map(|d| d.path.clone())
    }

    /// Read a published file. `Ok(None)` when the stream has no scratch
    /// directory, the file is not published, or it is already gone.
    pub async fn read(&self, stream: &StreamId, filename: &str) -> Result<Option<Bytes>> {
        let path = match self.inner.dirs.get(stream) {
            Some(dir) if dir.published.contains(filename) => dir.path.join(filename),
            _ => return Ok(None),
        };
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::tier_unavailable("scratch", e)),
        }
    }

    /// Delete every directory whose delay has elapsed. Returns how many were
    /// removed.
    pub async fn sweep_expired(&self) -> usize {
        let expired: Vec<StreamId> = self
            .inner
            .dirs
            .iter()
            .filter(|d| d.created_at.elapsed() >= self.inner.ttl)
            .map(|d| d.key().clone())
            .collect();
        let mut removed = 0;
        for stream in expired {
            if self.expire(&stream, None).await {
                removed += 1;
            }
        }
        removed
    }

    /// Unregister and delete a stream's directory. With `generation`, only
    /// the matching registration is removed.
    async fn expire(&self, stream: &StreamId, generation: Option<u64>) -> bool {
        let removed = self.inner.dirs.remove_if(stream, |_, d| {
            generation.map_or(d.created_at.elapsed() >= self.inner.ttl, |g| d.generation == g)
        });
        let Some((_, dir)) = removed else {
            return false;
        };
        remove_dir(stream, &dir.path).await;
        true
    }

    pub fn len(&self) -> usize {
        self.inner.dirs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.dirs.is_empty()
    }
}

async fn remove_dir(stream: &StreamId, path: &Path) {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {
            tracing::debug!(stream_id = %stream, path = %path.display(), "Removed scratch directory");
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(
                stream_id = %stream,
                path = %path.display(),
                error = %e,
                "Failed to remove scratch directory"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn only_published_files_are_served() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("trk-1");
        std::fs::create_dir_all(&out).unwrap();
        std::fs::write(out.join("segment_000.ts"), b"seg0").unwrap();
        std::fs::write(out.join("segment_001.ts"), b"partial").unwrap();

        let tier = ScratchTier::new(Duration::from_secs(900));
        let s = StreamId::new("trk-1");
        tier.register(&s, &out);
        tier.mark_published(&s, "segment_000.ts");

        assert_eq!(
            tier.read(&s, "segment_000.ts").await.unwrap(),
            Some(Bytes::from_static(b"seg0"))
        );
        assert_eq!(tier.read(&s, "segment_001.ts").await.unwrap(), None);
        assert_eq!(
            tier.read(&StreamId::new("other"), "segment_000.ts")
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn directory_is_deleted_after_delay() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("trk-2");
        std::fs::create_dir_all(&out).unwrap();
        std::fs::write(out.join("segment_000.ts"), b"x").unwrap();

        let tier = ScratchTier::new(Duration::from_millis(50));
        let s = StreamId::new("trk-2");
        tier.register(&s, &out);
        assert_eq!(tier.path_of(&s), Some(out.clone()));

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!out.exists());
        assert!(tier.is_empty());
    }

    #[tokio::test]
    async fn reregistration_restarts_delay() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("trk-3");
        std::fs::create_dir_all(&out).unwrap();

        let tier = ScratchTier::new(Duration::from_millis(200));
        let s = StreamId::new("trk-3");
        tier.register(&s, &out);
        tokio::time::sleep(Duration::from_millis(120)).await;
        tier.register(&s, &out);
        tokio::time::sleep(Duration::from_millis(120)).await;

        // The first timer fired but belonged to the replaced registration.
        assert!(out.exists());
        assert_eq!(tier.len(), 1);
    }

    #[tokio::test]
    async fn sweep_removes_only_expired() {
        let dir = tempfile::tempdir().unwrap();
        let tier = ScratchTier::new(Duration::from_secs(900));
        let s = StreamId::new("fresh");
        let out = dir.path().join("fresh");
        std::fs::create_dir_all(&out).unwrap();
        tier.register(&s, &out);

        assert_eq!(tier.sweep_expired().await, 0);
        assert!(out.exists());
    }
}
