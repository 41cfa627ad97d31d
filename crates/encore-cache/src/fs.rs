//! Filesystem-backed durable store.
//!
//! Keys map to paths under a root directory. Writes go to a sibling temp file
//! that is renamed into place, so a reader never sees a half-written object.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use encore_core::{Error, Result};

use crate::tier::{DurableStore, ObjectMeta};

/// Distinguishes temp files of concurrent writes to the same key.
static WRITE_SEQ: AtomicU64 = AtomicU64::new(0);

/// [`DurableStore`] rooted at a local (or network-mounted) directory.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `key` to a path under the root, rejecting keys that would
    /// escape it.
    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let rel = Path::new(key);
        let safe = !key.is_empty()
            && rel
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(Error::Internal(format!("invalid object key: {key:?}")));
        }
        Ok(self.root.join(rel))
    }
}

fn store_err(op: &str, key: &str, e: std::io::Error) -> Error {
    Error::DurableStore(format!("{op} {key}: {e}"))
}

#[async_trait]
impl DurableStore for FsObjectStore {
    async fn put(&self, key: &str, value: Bytes) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| store_err("put", key, e))?;
        }

        let mut tmp = path.clone().into_os_string();
        tmp.push(format!(
            ".{}.{}.part",
            std::process::id(),
            WRITE_SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, &value)
            .await
            .map_err(|e| store_err("put", key, e))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(store_err("put", key, e));
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(store_err("get", key, e)),
        }
    }

    async fn stat(&self, key: &str) -> Result<Option<ObjectMeta>> {
        let path = self.path_for(key)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Some(ObjectMeta { size: meta.len() })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(store_err("stat", key, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_stat() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());

        store
            .put("streams/trk-1/segment_000.ts", Bytes::from_static(b"abc"))
            .await
            .unwrap();

        let got = store.get("streams/trk-1/segment_000.ts").await.unwrap();
        assert_eq!(got.unwrap(), Bytes::from_static(b"abc"));
        assert_eq!(
            store.stat("streams/trk-1/segment_000.ts").await.unwrap(),
            Some(ObjectMeta { size: 3 })
        );
        assert!(dir.path().join("streams/trk-1/segment_000.ts").is_file());
    }

    #[tokio::test]
    async fn missing_key_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        assert!(store.get("streams/x/y.ts").await.unwrap().is_none());
        assert!(store.stat("streams/x/y.ts").await.unwrap().is_none());
        // A directory is not an object.
        store.put("streams/x/z.ts", Bytes::new()).await.unwrap();
        assert!(store.stat("streams/x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn overwrite_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        store.put("a/b", Bytes::from_static(b"one")).await.unwrap();
        store.put("a/b", Bytes::from_static(b"two")).await.unwrap();
        assert_eq!(
            store.get("a/b").await.unwrap().unwrap(),
            Bytes::from_static(b"two")
        );
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("a"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".part"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn escaping_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        for key in ["../evil", "/etc/passwd", "", "a/../../b"] {
            assert!(
                matches!(store.get(key).await, Err(Error::Internal(_))),
                "key {key:?} should be rejected"
            );
        }
    }
}
