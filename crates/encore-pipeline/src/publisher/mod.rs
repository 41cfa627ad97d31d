//! Incremental segment publisher.
//!
//! Runs the transcoder and, while it is still writing, hands every finished
//! segment to the tiered cache and the manifest registry. A segment counts
//! as finished once its size and mtime have been stable for the stability
//! window. When the transcoder exits, a reconciliation scan dispatches
//! anything the watch loop had not reached yet.
//!
//! Dispatch runs on a small fan-out pool fed by a bounded channel; each
//! worker finishes both cache writes for a segment before taking the next,
//! so in-flight persistence is bounded by the worker count.

mod settle;
mod watch;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use bytes::Bytes;
use encore_av::{TranscodeRequest, Transcoder};
use encore_cache::TieredCache;
use encore_core::config::{PublisherConfig, TranscodeConfig};
use encore_core::events::{EventBus, EventPayload};
use encore_core::{Error, StreamId, TrackId};
use encore_hls::{parse_playlist, ManifestRegistry, SegmentNaming, TranscoderPlaylist};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use self::settle::SettleTracker;
use self::watch::{scan_segments, start_watcher};

/// In notification mode, also scan the directory every this many ticks in
/// case an event was dropped.
const SAFETY_SCAN_TICKS: u64 = 20;

/// What a publish run produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PublishReport {
    /// Sum of known segment durations, in seconds.
    pub total_duration: f64,
    pub segment_count: usize,
    /// Milliseconds from the start of the run until the first segment was
    /// published.
    pub first_segment_after_ms: Option<u64>,
}

/// A failed publish run. Segments in `report` were published before the
/// failure and remain valid.
#[derive(Debug, thiserror::Error)]
#[error("{source}")]
pub struct PublishFailure {
    pub report: PublishReport,
    pub source: Error,
}

impl PublishFailure {
    pub(crate) fn before_start(source: Error) -> Self {
        Self {
            report: PublishReport::default(),
            source,
        }
    }
}

/// Drives one transcoder run per call and publishes its output.
pub struct SegmentPublisher {
    transcode: TranscodeConfig,
    settings: PublisherConfig,
    transcoder: Arc<dyn Transcoder>,
    cache: TieredCache,
    registry: Arc<ManifestRegistry>,
    events: Arc<EventBus>,
    naming: SegmentNaming,
}

impl std::fmt::Debug for SegmentPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentPublisher")
            .field("settings", &self.settings)
            .field("naming", &self.naming)
            .finish_non_exhaustive()
    }
}

/// State shared by the tasks of a single publish run.
struct Run<'a> {
    stream: StreamId,
    dir: &'a Path,
    playlist_path: PathBuf,
    tracker: Arc<Mutex<SettleTracker>>,
    /// Segments whose duration was not in the transcoder playlist yet.
    estimated: Mutex<HashMap<u32, String>>,
    /// Segments whose dispatch failed and that have not been published since.
    unpublished: Mutex<HashSet<String>>,
    started: Instant,
    first_segment_ms: OnceLock<u64>,
}

impl SegmentPublisher {
    pub fn new(
        transcode: TranscodeConfig,
        settings: PublisherConfig,
        transcoder: Arc<dyn Transcoder>,
        cache: TieredCache,
        registry: Arc<ManifestRegistry>,
        events: Arc<EventBus>,
    ) -> Self {
        let naming = SegmentNaming::from_config(&transcode);
        Self {
            transcode,
            settings,
            transcoder,
            cache,
            registry,
            events,
            naming,
        }
    }

    pub fn naming(&self) -> &SegmentNaming {
        &self.naming
    }

    /// Transcode `input` into `scratch_dir`, publishing segments as they are
    /// finished.
    ///
    /// On success the stream is marked complete and its final manifest is
    /// persisted. On failure the stream is left open; the caller decides
    /// whether to keep the partial stream via [`finalize_stream`].
    ///
    /// [`finalize_stream`]: Self::finalize_stream
    pub async fn publish(
        &self,
        track: &TrackId,
        input: &Path,
        scratch_dir: &Path,
    ) -> Result<PublishReport, PublishFailure> {
        let stream = StreamId::from(track);
        tokio::fs::create_dir_all(scratch_dir)
            .await
            .map_err(|e| PublishFailure::before_start(e.into()))?;

        self.registry.open(&stream);
        self.cache.scratch().register(&stream, scratch_dir);

        let request = TranscodeRequest::new(
            track.clone(),
            input,
            scratch_dir,
            &self.transcode,
            self.settings.transcode_timeout(),
        );
        let run = Run {
            stream: stream.clone(),
            dir: scratch_dir,
            playlist_path: request.manifest_path(),
            tracker: Arc::new(Mutex::new(SettleTracker::new(
                self.settings.stability_window(),
            ))),
            estimated: Mutex::new(HashMap::new()),
            unpublished: Mutex::new(HashSet::new()),
            started: Instant::now(),
            first_segment_ms: OnceLock::new(),
        };

        let watcher = if self.settings.force_polling {
            None
        } else {
            start_watcher(scratch_dir, run.tracker.clone(), self.naming.clone())
        };
        let polling = watcher.is_none();
        tracing::info!(
            track_id = %track,
            stream_id = %stream,
            input = %input.display(),
            dir = %scratch_dir.display(),
            polling,
            "Publishing stream"
        );

        let done = CancellationToken::new();
        let workers = self.settings.dispatch_workers.max(1);
        let (tx, rx) = flume::bounded::<String>(workers);

        let transcode = async {
            let result = self.transcoder.run(&request).await;
            done.cancel();
            result
        };
        let (result, (), ()) = tokio::join!(
            transcode,
            self.produce(&run, tx, &done, polling),
            self.consume(&run, rx, workers),
        );
        drop(watcher);

        let unpublished = self.retry_unpublished(&run).await;
        self.correct_durations(&run).await;
        let report = self.report(&run);

        match result {
            Ok(()) if !unpublished.is_empty() => {
                let source = Error::transcode_failed(
                    track,
                    format!("segments could not be read: {}", unpublished.join(", ")),
                );
                tracing::error!(track_id = %track, error = %source, "Publish failed");
                Err(PublishFailure { report, source })
            }
            Ok(()) if report.segment_count == 0 => {
                let source = Error::transcode_failed(track, "transcoder produced no segments");
                tracing::error!(track_id = %track, error = %source, "Publish failed");
                Err(PublishFailure { report, source })
            }
            Ok(()) => {
                let report = self.finalize_stream(&stream).await;
                tracing::info!(
                    track_id = %track,
                    segments = report.segment_count,
                    total_duration = report.total_duration,
                    elapsed_ms = run.started.elapsed().as_millis() as u64,
                    "Stream published"
                );
                Ok(PublishReport {
                    first_segment_after_ms: run.first_segment_ms.get().copied(),
                    ..report
                })
            }
            Err(source) => {
                tracing::warn!(
                    track_id = %track,
                    segments = report.segment_count,
                    elapsed_ms = run.started.elapsed().as_millis() as u64,
                    error = %source,
                    "Transcoder failed"
                );
                Err(PublishFailure { report, source })
            }
        }
    }

    /// Close a stream with the segments it has, then persist the final
    /// manifest. Used after a successful run and to keep a partial stream.
    pub async fn finalize_stream(&self, stream: &StreamId) -> PublishReport {
        let segment_count = self.registry.segment_count(stream);
        let total_duration = self.registry.total_duration(stream).unwrap_or(0.0);
        let was_playable = self.registry.is_playable(stream);
        self.registry.mark_complete(stream, total_duration);
        if !was_playable {
            // Short streams open the gate on completion.
            self.events.publish(EventPayload::StreamPlayable {
                stream_id: stream.clone(),
            });
        }

        if let Some(text) = self.registry.render(stream) {
            let outcome = self
                .cache
                .put(stream, self.naming.manifest_name(), Bytes::from(text), None)
                .await;
            if !outcome.durable {
                tracing::warn!(stream_id = %stream, "Final manifest was not persisted to the durable tier");
            }
        }

        PublishReport {
            total_duration,
            segment_count,
            first_segment_after_ms: None,
        }
    }

    /// Watch loop: detect settled segments and queue them for dispatch.
    /// Ends with a reconciliation scan once the transcoder has exited.
    async fn produce(
        &self,
        run: &Run<'_>,
        tx: flume::Sender<String>,
        done: &CancellationToken,
        polling: bool,
    ) {
        let mut ticker = tokio::time::interval(self.settings.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ticks: u64 = 0;

        loop {
            tokio::select! {
                _ = done.cancelled() => break,
                _ = ticker.tick() => {}
            }
            ticks += 1;
            if polling || ticks % SAFETY_SCAN_TICKS == 0 {
                self.scan(run);
            }
            for name in self.sample(run) {
                if tx.send_async(name).await.is_err() {
                    return;
                }
            }
        }

        let remaining = self.reconcile(run);
        if !remaining.is_empty() {
            tracing::debug!(
                stream_id = %run.stream,
                count = remaining.len(),
                "Reconciliation found undispatched segments"
            );
        }
        for name in remaining {
            if tx.send_async(name).await.is_err() {
                return;
            }
        }
    }

    async fn consume(&self, run: &Run<'_>, rx: flume::Receiver<String>, workers: usize) {
        let pool = (0..workers).map(|_| {
            let rx = rx.clone();
            async move {
                while let Ok(name) = rx.recv_async().await {
                    self.dispatch(run, &name).await;
                }
            }
        });
        join_all(pool).await;
    }

    /// Add segment files found on disk to the pending set.
    fn scan(&self, run: &Run<'_>) {
        let files = scan_segments(run.dir, &self.naming);
        let now = Instant::now();
        let mut tracker = run.tracker.lock();
        for file in files {
            if tracker.is_dispatched(&file.name) {
                continue;
            }
            if !tracker.is_pending(&file.name) {
                tracker.touch(&file.name, now);
            }
            tracker.observe(&file.name, file.size, file.modified, now);
        }
    }

    /// Stat every pending file and return the ones that settled, in index
    /// order.
    fn sample(&self, run: &Run<'_>) -> Vec<String> {
        let names = run.tracker.lock().pending_names();
        let stats: Vec<_> = names
            .into_iter()
            .map(|name| {
                let meta = std::fs::metadata(run.dir.join(&name));
                (name, meta)
            })
            .collect();

        let now = Instant::now();
        let mut tracker = run.tracker.lock();
        for (name, meta) in stats {
            match meta {
                Ok(meta) => tracker.observe(&name, meta.len(), meta.modified().ok(), now),
                Err(_) => tracker.forget(&name),
            }
        }
        let mut settled = tracker.take_settled(now);
        drop(tracker);
        settled.sort_by_key(|name| self.naming.parse_index(name));
        settled
    }

    /// Claim every non-empty segment file not dispatched yet.
    fn reconcile(&self, run: &Run<'_>) -> Vec<String> {
        let mut files = scan_segments(run.dir, &self.naming);
        files.sort_by_key(|f| self.naming.parse_index(&f.name));
        let mut tracker = run.tracker.lock();
        files
            .into_iter()
            .filter(|f| f.size > 0)
            .filter(|f| tracker.claim(&f.name))
            .map(|f| f.name)
            .collect()
    }

    /// One more pass over segments that were never published, after the
    /// transcoder has exited. Returns the names that still failed.
    async fn retry_unpublished(&self, run: &Run<'_>) -> Vec<String> {
        if run.unpublished.lock().is_empty() {
            return Vec::new();
        }
        for name in self.reconcile(run) {
            self.dispatch(run, &name).await;
        }
        let mut left: Vec<String> = run.unpublished.lock().iter().cloned().collect();
        left.sort();
        left
    }

    /// Persist one finished segment and record it in the manifest. A segment
    /// that cannot be read is released for a later pass. Returns whether
    /// the segment was published.
    async fn dispatch(&self, run: &Run<'_>, name: &str) -> bool {
        let Some(index) = self.naming.parse_index(name) else {
            return false;
        };
        let stream = &run.stream;
        let bytes = match tokio::fs::read(run.dir.join(name)).await {
            Ok(data) => Bytes::from(data),
            Err(e) => {
                tracing::warn!(stream_id = %stream, filename = name, error = %e, "Failed to read finished segment");
                run.tracker.lock().release(name);
                run.unpublished.lock().insert(name.to_string());
                return false;
            }
        };
        let size = bytes.len();
        run.unpublished.lock().remove(name);

        self.cache.scratch().mark_published(stream, name);
        let outcome = self.cache.put(stream, name, bytes, None).await;

        let duration = match self.read_playlist(run).await.duration_of(name) {
            Some(d) => d,
            None => {
                run.estimated.lock().insert(index, name.to_string());
                f64::from(self.transcode.segment_duration_secs)
            }
        };

        let became_playable = self.registry.record_segment(stream, index, duration);
        let _ = run
            .first_segment_ms
            .set(run.started.elapsed().as_millis() as u64);

        tracing::debug!(
            stream_id = %stream,
            filename = name,
            index,
            bytes = size,
            duration,
            fast = outcome.fast,
            durable = outcome.durable,
            "Segment published"
        );
        self.events.publish(EventPayload::SegmentPublished {
            stream_id: stream.clone(),
            index,
            duration_secs: duration,
        });
        if became_playable {
            tracing::info!(stream_id = %stream, "Stream is playable");
            self.events.publish(EventPayload::StreamPlayable {
                stream_id: stream.clone(),
            });
        }
        true
    }

    /// Replace estimated durations with the transcoder's own figures.
    async fn correct_durations(&self, run: &Run<'_>) {
        let estimated = std::mem::take(&mut *run.estimated.lock());
        if estimated.is_empty() {
            return;
        }
        let playlist = self.read_playlist(run).await;
        for (index, name) in estimated {
            if let Some(duration) = playlist.duration_of(&name) {
                self.registry.record_segment(&run.stream, index, duration);
            }
        }
    }

    async fn read_playlist(&self, run: &Run<'_>) -> TranscoderPlaylist {
        match tokio::fs::read_to_string(&run.playlist_path).await {
            Ok(text) => parse_playlist(&text),
            Err(_) => TranscoderPlaylist::default(),
        }
    }

    fn report(&self, run: &Run<'_>) -> PublishReport {
        PublishReport {
            total_duration: self.registry.total_duration(&run.stream).unwrap_or(0.0),
            segment_count: self.registry.segment_count(&run.stream),
            first_segment_after_ms: run.first_segment_ms.get().copied(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use encore_cache::{MemoryFastCache, MemoryObjectStore, ScratchTier};
    use encore_core::config::CacheConfig;
    use encore_hls::ManifestFormat;

    /// Writes `segments` files of `duration` seconds each, appending to the
    /// playlist after every file, then optionally fails.
    struct ScriptedTranscoder {
        segments: u32,
        duration: f64,
        interval: Duration,
        fail: bool,
    }

    #[async_trait]
    impl Transcoder for ScriptedTranscoder {
        async fn run(&self, request: &TranscodeRequest) -> encore_core::Result<()> {
            let naming = SegmentNaming::default();
            let mut playlist = String::from("#EXTM3U\n#EXT-X-TARGETDURATION:4\n");
            for i in 0..self.segments {
                let name = naming.filename(i);
                std::fs::write(request.output_dir.join(&name), vec![i as u8; 188])?;
                playlist.push_str(&format!("#EXTINF:{:.6},\n{name}\n", self.duration));
                std::fs::write(request.manifest_path(), &playlist)?;
                tokio::time::sleep(self.interval).await;
            }
            if self.fail {
                return Err(Error::transcode_failed(&request.track_id, "exit status 1"));
            }
            playlist.push_str("#EXT-X-ENDLIST\n");
            std::fs::write(request.manifest_path(), &playlist)?;
            Ok(())
        }

        async fn probe_duration(&self, _input: &Path) -> encore_core::Result<f64> {
            Ok(f64::from(self.segments) * self.duration)
        }
    }

    struct Fixture {
        publisher: SegmentPublisher,
        registry: Arc<ManifestRegistry>,
        cache: TieredCache,
        events: Arc<EventBus>,
    }

    fn fixture(transcoder: ScriptedTranscoder) -> Fixture {
        let settings = PublisherConfig {
            poll_interval_ms: 10,
            stability_window_ms: 30,
            force_polling: true,
            ..PublisherConfig::default()
        };
        let cache = TieredCache::new(
            &CacheConfig::default(),
            ScratchTier::new(Duration::from_secs(900)),
            Arc::new(MemoryFastCache::new()),
            Arc::new(MemoryObjectStore::new()),
        );
        let registry = Arc::new(ManifestRegistry::new(ManifestFormat::default(), 3));
        let events = Arc::new(EventBus::default());
        let publisher = SegmentPublisher::new(
            TranscodeConfig::default(),
            settings,
            Arc::new(transcoder),
            cache.clone(),
            registry.clone(),
            events.clone(),
        );
        Fixture {
            publisher,
            registry,
            cache,
            events,
        }
    }

    #[tokio::test]
    async fn publishes_every_segment_and_completes() {
        let f = fixture(ScriptedTranscoder {
            segments: 5,
            duration: 2.5,
            interval: Duration::from_millis(20),
            fail: false,
        });
        let dir = tempfile::tempdir().unwrap();
        let track = TrackId::new("trk");
        let report = f
            .publisher
            .publish(&track, Path::new("/in.flac"), dir.path())
            .await
            .unwrap();

        assert_eq!(report.segment_count, 5);
        assert!((report.total_duration - 12.5).abs() < 1e-9);
        assert!(report.first_segment_after_ms.is_some());

        let stream = StreamId::from(&track);
        assert!(f.registry.is_complete(&stream));
        let text = f.registry.render(&stream).unwrap();
        assert!(text.contains("#EXT-X-ENDLIST"));
        assert_eq!(text.matches("#EXTINF:2.500000,").count(), 5);

        let manifest = f.cache.get(&stream, "index.m3u8").await.unwrap();
        assert!(manifest.is_hit());
        let seg = f.cache.get(&stream, "segment_004.ts").await.unwrap();
        assert!(seg.is_hit());

        let published = f
            .events
            .recent_events(100)
            .into_iter()
            .filter(|e| matches!(e.payload, EventPayload::SegmentPublished { .. }))
            .count();
        assert_eq!(published, 5);
        let playable = f
            .events
            .recent_events(100)
            .into_iter()
            .filter(|e| matches!(e.payload, EventPayload::StreamPlayable { .. }))
            .count();
        assert_eq!(playable, 1);
    }

    #[tokio::test]
    async fn failure_keeps_published_segments() {
        let f = fixture(ScriptedTranscoder {
            segments: 2,
            duration: 4.0,
            interval: Duration::from_millis(10),
            fail: true,
        });
        let dir = tempfile::tempdir().unwrap();
        let track = TrackId::new("broken");
        let failure = f
            .publisher
            .publish(&track, Path::new("/in.flac"), dir.path())
            .await
            .unwrap_err();

        assert!(matches!(failure.source, Error::TranscodeFailed { .. }));
        assert_eq!(failure.report.segment_count, 2);
        let stream = StreamId::from(&track);
        assert!(!f.registry.is_complete(&stream));

        let report = f.publisher.finalize_stream(&stream).await;
        assert_eq!(report.segment_count, 2);
        assert!(f.registry.is_complete(&stream));
        assert!(f.registry.is_playable(&stream));
    }

    fn run_in(dir: &Path) -> Run<'_> {
        Run {
            stream: StreamId::new("flaky"),
            dir,
            playlist_path: dir.join("index.m3u8"),
            tracker: Arc::new(Mutex::new(SettleTracker::new(Duration::from_millis(30)))),
            estimated: Mutex::new(HashMap::new()),
            unpublished: Mutex::new(HashSet::new()),
            started: Instant::now(),
            first_segment_ms: OnceLock::new(),
        }
    }

    #[tokio::test]
    async fn unreadable_segment_is_retried_not_dropped() {
        let f = fixture(ScriptedTranscoder {
            segments: 0,
            duration: 4.0,
            interval: Duration::ZERO,
            fail: false,
        });
        let dir = tempfile::tempdir().unwrap();
        let run = run_in(dir.path());
        let name = "segment_001.ts";

        // Settled, then gone before it could be read.
        assert!(run.tracker.lock().claim(name));
        assert!(!f.publisher.dispatch(&run, name).await);
        assert!(!run.tracker.lock().is_dispatched(name));
        assert_eq!(f.publisher.retry_unpublished(&run).await, vec![name.to_string()]);
        assert_eq!(f.registry.segment_count(&run.stream), 0);

        std::fs::write(dir.path().join(name), vec![0u8; 188]).unwrap();
        assert!(f.publisher.retry_unpublished(&run).await.is_empty());
        assert_eq!(f.registry.segment_count(&run.stream), 1);
        assert!(f.cache.get(&run.stream, name).await.unwrap().is_hit());
    }

    #[tokio::test]
    async fn no_output_is_a_transcode_failure() {
        let f = fixture(ScriptedTranscoder {
            segments: 0,
            duration: 4.0,
            interval: Duration::from_millis(10),
            fail: false,
        });
        let dir = tempfile::tempdir().unwrap();
        let failure = f
            .publisher
            .publish(&TrackId::new("empty"), Path::new("/in.flac"), dir.path())
            .await
            .unwrap_err();
        assert!(matches!(failure.source, Error::TranscodeFailed { .. }));
        assert_eq!(failure.report.segment_count, 0);
    }
}
