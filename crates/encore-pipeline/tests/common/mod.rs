//! Shared test harness for pipeline integration tests.
//!
//! Provides [`ScriptedTranscoder`], which writes segment files and a growing
//! playlist on a timer the way a real transcoder does, a durable store that
//! counts reads, and [`TestHarness`] wiring them into a [`StreamingService`].

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use encore_av::{TranscodeRequest, Transcoder};
use encore_cache::{DurableStore, MemoryFastCache, MemoryObjectStore, ObjectMeta};
use encore_core::config::Config;
use encore_core::{Error, Result};
use encore_hls::SegmentNaming;
use encore_pipeline::{Collaborators, DefaultSourceResolver, StreamingService};
use tokio::sync::Notify;

/// Fake transcoder producing `ceil(total / segment)` segments.
pub struct ScriptedTranscoder {
    pub total_secs: f64,
    pub segment_secs: f64,
    pub interval: Duration,
    pub fail: bool,
    /// Block after this many segments until the gate is notified.
    pub pause_after: Option<(u32, Arc<Notify>)>,
    runs: AtomicU32,
}

impl ScriptedTranscoder {
    pub fn new(total_secs: f64, segment_secs: f64) -> Self {
        Self {
            total_secs,
            segment_secs,
            interval: Duration::from_millis(20),
            fail: false,
            pause_after: None,
            runs: AtomicU32::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(8.0, 4.0)
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn pause_after(mut self, segments: u32, gate: Arc<Notify>) -> Self {
        self.pause_after = Some((segments, gate));
        self
    }

    pub fn runs(&self) -> u32 {
        self.runs.load(Ordering::SeqCst)
    }

    fn durations(&self) -> Vec<f64> {
        let count = (self.total_secs / self.segment_secs).ceil() as u32;
        (0..count)
            .map(|i| {
                let start = f64::from(i) * self.segment_secs;
                (self.total_secs - start).min(self.segment_secs)
            })
            .collect()
    }
}

#[async_trait]
impl Transcoder for ScriptedTranscoder {
    async fn run(&self, request: &TranscodeRequest) -> Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            tokio::time::sleep(self.interval).await;
            return Err(Error::transcode_failed(&request.track_id, "exit status 1"));
        }

        let naming = SegmentNaming::default();
        let mut playlist = format!(
            "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:{}\n#EXT-X-MEDIA-SEQUENCE:0\n#EXT-X-PLAYLIST-TYPE:EVENT\n",
            self.segment_secs.ceil() as u64
        );
        for (i, duration) in self.durations().into_iter().enumerate() {
            let index = i as u32;
            if let Some((after, gate)) = &self.pause_after {
                if index == *after {
                    gate.notified().await;
                }
            }
            let name = naming.filename(index);
            std::fs::write(request.output_dir.join(&name), vec![0x47; 188 * 8])?;
            playlist.push_str(&format!("#EXTINF:{duration:.6},\n{name}\n"));
            std::fs::write(request.manifest_path(), &playlist)?;
            tokio::time::sleep(self.interval).await;
        }
        playlist.push_str("#EXT-X-ENDLIST\n");
        std::fs::write(request.manifest_path(), &playlist)?;
        Ok(())
    }

    async fn probe_duration(&self, _input: &Path) -> Result<f64> {
        Ok(self.total_secs)
    }
}

/// In-memory durable store that counts reads.
#[derive(Default)]
pub struct CountingStore {
    inner: MemoryObjectStore,
    gets: AtomicU32,
}

impl CountingStore {
    pub fn gets(&self) -> u32 {
        self.gets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DurableStore for CountingStore {
    async fn put(&self, key: &str, value: Bytes) -> Result<()> {
        self.inner.put(key, value).await
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get(key).await
    }

    async fn stat(&self, key: &str) -> Result<Option<ObjectMeta>> {
        self.inner.stat(key).await
    }
}

/// Fast timings so tests finish quickly.
pub fn test_config(root: &Path) -> Config {
    let mut config = Config::default();
    config.pool.workers = 2;
    config.pool.retry_backoff_ms = 1;
    config.pool.wait_timeout_secs = 30;
    config.pool.work_dir = root.join("work");
    config.publisher.poll_interval_ms = 10;
    config.publisher.stability_window_ms = 30;
    config.preheat.enabled = false;
    config
}

pub struct TestHarness {
    pub service: StreamingService,
    pub transcoder: Arc<ScriptedTranscoder>,
    pub durable: Arc<CountingStore>,
    pub root: tempfile::TempDir,
    /// A local source file for submissions.
    pub source: PathBuf,
}

impl TestHarness {
    pub fn new(transcoder: ScriptedTranscoder) -> Self {
        let root = tempfile::tempdir().expect("tempdir");
        Self::with_config(transcoder, test_config(root.path()), root)
    }

    pub fn with_config(transcoder: ScriptedTranscoder, config: Config, root: tempfile::TempDir) -> Self {
        let source = root.path().join("source.flac");
        std::fs::write(&source, b"fLaC fake source").expect("write source");

        let transcoder = Arc::new(transcoder);
        let durable = Arc::new(CountingStore::default());
        let collaborators = Collaborators {
            transcoder: transcoder.clone(),
            resolver: Arc::new(DefaultSourceResolver::new(&config.source).expect("resolver")),
            fast: Arc::new(MemoryFastCache::new()),
            durable: durable.clone(),
            playback: None,
        };
        let service = StreamingService::start(config, collaborators);
        Self {
            service,
            transcoder,
            durable,
            root,
            source,
        }
    }

    pub fn source(&self) -> String {
        self.source.to_string_lossy().into_owned()
    }
}

/// Sum of `#EXTINF` durations in a manifest.
pub fn summed_durations(manifest: &str) -> f64 {
    manifest
        .lines()
        .filter_map(|l| l.strip_prefix("#EXTINF:"))
        .filter_map(|l| l.trim_end_matches(',').split(',').next()?.parse::<f64>().ok())
        .sum()
}
