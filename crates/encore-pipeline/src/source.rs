//! Resolving a task's source locator to a local file.
//!
//! The catalog client is outside this crate; by the time a task reaches a
//! worker its `source` is either a fetchable URL or a local path.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use encore_core::config::SourceConfig;
use encore_core::{Error, Result};
use tokio::io::AsyncWriteExt;

use crate::task::TranscodeTask;

/// Turns a task's source locator into a readable local file.
#[async_trait]
pub trait SourceResolver: Send + Sync {
    /// Resolve `task.source`. Downloads go into `work_dir`, which the worker
    /// deletes when the job ends.
    async fn resolve(&self, task: &TranscodeTask, work_dir: &Path) -> Result<PathBuf>;
}

/// Downloads `http(s)` sources with `reqwest`; anything else is a local path.
#[derive(Debug, Clone)]
pub struct DefaultSourceResolver {
    client: reqwest::Client,
    timeout: Duration,
}

impl DefaultSourceResolver {
    pub fn new(config: &SourceConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.download_timeout())
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            timeout: config.download_timeout(),
        })
    }

    async fn download(&self, task: &TranscodeTask, url: &str, work_dir: &Path) -> Result<PathBuf> {
        let dest = work_dir.join(format!("source{}", url_extension(url)));
        let track = &task.track_id;

        let fetch = async {
            let mut resp = self
                .client
                .get(url)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| Error::source_unavailable(track, e.to_string()))?;

            let mut file = tokio::fs::File::create(&dest).await?;
            let mut written: u64 = 0;
            while let Some(chunk) = resp
                .chunk()
                .await
                .map_err(|e| Error::source_unavailable(track, format!("read failed: {e}")))?
            {
                file.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
            file.flush().await?;
            Ok::<u64, Error>(written)
        };

        let written = tokio::time::timeout(self.timeout, fetch)
            .await
            .map_err(|_| Error::timeout(format!("download of {track}"), self.timeout))??;

        if written == 0 {
            return Err(Error::source_unavailable(track, "empty response body"));
        }
        tracing::debug!(track_id = %track, bytes = written, dest = %dest.display(), "Downloaded source");
        Ok(dest)
    }
}

#[async_trait]
impl SourceResolver for DefaultSourceResolver {
    async fn resolve(&self, task: &TranscodeTask, work_dir: &Path) -> Result<PathBuf> {
        let source = task.source.trim();
        if is_remote(source) {
            return self.download(task, source, work_dir).await;
        }
        if task.is_external {
            return Err(Error::source_missing(
                &task.track_id,
                format!("external source is not a URL: {source}"),
            ));
        }

        let path = PathBuf::from(source.strip_prefix("file://").unwrap_or(source));
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(path),
            Ok(_) => Err(Error::source_missing(
                &task.track_id,
                format!("not a file: {}", path.display()),
            )),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::source_missing(
                &task.track_id,
                format!("{}: {e}", path.display()),
            )),
            Err(e) => Err(Error::source_unavailable(
                &task.track_id,
                format!("{}: {e}", path.display()),
            )),
        }
    }
}

fn is_remote(source: &str) -> bool {
    let lower = source.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// `.ext` of the URL path (query and fragment ignored), or empty.
fn url_extension(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let last = path.rsplit('/').next().unwrap_or(path);
    match last.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty()
                && !ext.is_empty()
                && ext.len() <= 5
                && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            format!(".{}", ext.to_ascii_lowercase())
        }
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use encore_core::TrackId;

    fn resolver() -> DefaultSourceResolver {
        DefaultSourceResolver::new(&SourceConfig::default()).unwrap()
    }

    #[test]
    fn remote_detection() {
        assert!(is_remote("https://cdn.example.com/a.mp3"));
        assert!(is_remote("HTTP://x/y"));
        assert!(!is_remote("/music/a.flac"));
        assert!(!is_remote("file:///music/a.flac"));
    }

    #[test]
    fn extension_from_url() {
        assert_eq!(url_extension("https://x/y/track.MP3?sig=abc"), ".mp3");
        assert_eq!(url_extension("https://x/y/stream"), "");
        assert_eq!(url_extension("https://x/y/.hidden"), "");
        assert_eq!(url_extension("https://x/y/a.verylongext"), "");
    }

    #[tokio::test]
    async fn local_file_resolves_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("song.flac");
        std::fs::write(&file, b"fLaC").unwrap();

        let task = TranscodeTask::new(TrackId::new("t"), file.to_string_lossy(), dir.path(), false);
        let resolved = resolver().resolve(&task, dir.path()).await.unwrap();
        assert_eq!(resolved, file);

        let task = TranscodeTask::new(
            TrackId::new("t"),
            format!("file://{}", file.display()),
            dir.path(),
            false,
        );
        assert_eq!(resolver().resolve(&task, dir.path()).await.unwrap(), file);
    }

    #[tokio::test]
    async fn missing_local_file_is_source_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let task = TranscodeTask::new(TrackId::new("t"), "/no/such/file.flac", dir.path(), false);
        let err = resolver().resolve(&task, dir.path()).await.unwrap_err();
        assert!(matches!(err, Error::SourceUnavailable { .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn external_flag_requires_url() {
        let dir = tempfile::tempdir().unwrap();
        let task = TranscodeTask::new(TrackId::new("t"), "catalog-id-123", dir.path(), true);
        let err = resolver().resolve(&task, dir.path()).await.unwrap_err();
        assert!(matches!(err, Error::SourceUnavailable { .. }));
    }

    #[tokio::test]
    async fn unreachable_url_is_source_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let task = TranscodeTask::new(TrackId::new("t"), "http://127.0.0.1:1/a.mp3", dir.path(), true);
        let err = resolver().resolve(&task, dir.path()).await.unwrap_err();
        assert!(
            matches!(err, Error::SourceUnavailable { .. } | Error::Timeout { .. }),
            "got {err}"
        );
        assert!(err.is_transient());
    }
}
