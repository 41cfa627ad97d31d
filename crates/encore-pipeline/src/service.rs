//! The streaming service: one object owning the pool, caches, manifest
//! registry, event bus, and background tasks of a process.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use encore_av::{FfmpegTranscoder, ToolRegistry, Transcoder};
use encore_cache::{
    CacheLookup, CachedObject, DurableStore, FastCache, FsObjectStore, MemoryFastCache,
    MemoryObjectStore, RedisFastCache, ScratchTier, TieredCache,
};
use encore_core::config::Config;
use encore_core::events::EventBus;
use encore_core::{ContextId, Error, Result, StreamId, TrackId};
use encore_hls::{ManifestFormat, ManifestRegistry, SegmentNaming};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::pool::{Admission, JobOutcome, ProcessingStatus, WorkerPool};
use crate::preheat::{NextTrack, PlaybackSource, PreheatScheduler, PreheatTarget};
use crate::publisher::{PublishReport, SegmentPublisher};
use crate::source::{DefaultSourceResolver, SourceResolver};
use crate::task::{stream_dir_name, TranscodeTask};

/// External pieces the service is built from.
pub struct Collaborators {
    pub transcoder: Arc<dyn Transcoder>,
    pub resolver: Arc<dyn SourceResolver>,
    pub fast: Arc<dyn FastCache>,
    pub durable: Arc<dyn DurableStore>,
    /// Enables the preheat scheduler.
    pub playback: Option<Arc<dyn PlaybackSource>>,
}

impl Collaborators {
    /// Production adapters: ffmpeg from the tool registry, Redis when
    /// `cache.redis_url` is set, a filesystem object store when
    /// `cache.durable_root` is set. In-memory tiers otherwise.
    pub fn from_config(config: &Config) -> Result<Self> {
        let tools = ToolRegistry::discover(&config.tools);
        let transcoder = Arc::new(FfmpegTranscoder::from_registry(&tools)?);
        let resolver = Arc::new(DefaultSourceResolver::new(&config.source)?);

        let fast: Arc<dyn FastCache> = match &config.cache.redis_url {
            Some(url) => Arc::new(RedisFastCache::new(url)?),
            None => {
                tracing::info!("No redis_url configured; using in-process fast cache");
                Arc::new(MemoryFastCache::new())
            }
        };
        let durable: Arc<dyn DurableStore> = match &config.cache.durable_root {
            Some(root) => Arc::new(FsObjectStore::new(root.clone())),
            None => {
                tracing::warn!("No durable_root configured; streams are kept in memory only");
                Arc::new(MemoryObjectStore::new())
            }
        };

        Ok(Self {
            transcoder,
            resolver,
            fast,
            durable,
            playback: None,
        })
    }

    pub fn with_playback(mut self, playback: Arc<dyn PlaybackSource>) -> Self {
        self.playback = Some(playback);
        self
    }
}

/// Answer to a manifest request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ManifestLookup {
    Ready { text: String },
    /// Known stream still below the playability gate.
    NotReady { segments: usize, required: usize },
    NotFound,
}

impl ManifestLookup {
    pub fn into_text(self) -> Option<String> {
        match self {
            ManifestLookup::Ready { text } => Some(text),
            _ => None,
        }
    }
}

/// State shared with the preheat scheduler.
struct Core {
    config: Config,
    pool: WorkerPool,
    registry: Arc<ManifestRegistry>,
    cache: TieredCache,
    naming: SegmentNaming,
}

impl Core {
    fn default_output_dir(&self, track: &TrackId) -> PathBuf {
        self.config
            .pool
            .work_dir
            .join("streams")
            .join(stream_dir_name(track))
    }

    async fn stream_available(&self, track: &TrackId) -> bool {
        let stream = StreamId::from(track);
        if self.registry.is_complete(&stream) {
            return true;
        }
        if self.registry.contains(&stream) {
            return false;
        }
        match self
            .cache
            .durable_stat(&stream, self.naming.manifest_name())
            .await
        {
            Ok(meta) => meta.is_some(),
            Err(e) => {
                tracing::debug!(stream_id = %stream, error = %e, "Durable manifest check failed");
                false
            }
        }
    }

    /// Returns (scratch directories removed, manifests evicted).
    async fn sweep(&self) -> (usize, usize) {
        let scratch = self.cache.scratch().sweep_expired().await;
        let manifests = self
            .registry
            .evict_completed(self.config.manifest.retain_completed());
        (scratch, manifests)
    }

    async fn submit(
        &self,
        track: TrackId,
        source: String,
        output_dir: Option<PathBuf>,
        is_external: bool,
    ) -> Result<Admission> {
        if self.stream_available(&track).await {
            tracing::debug!(track_id = %track, "Stream already available");
            return Ok(Admission::AlreadyAvailable);
        }
        let output_dir = output_dir.unwrap_or_else(|| self.default_output_dir(&track));
        self.pool
            .submit(TranscodeTask::new(track, source, output_dir, is_external))
            .await
    }
}

#[async_trait]
impl PreheatTarget for Core {
    async fn is_available(&self, track: &TrackId) -> bool {
        self.stream_available(track).await
    }

    async fn preheat(&self, next: &NextTrack) -> Result<Admission> {
        self.submit(
            next.track_id.clone(),
            next.source.clone(),
            None,
            next.is_external,
        )
        .await
    }
}

/// Handle to a running pipeline.
pub struct StreamingService {
    core: Arc<Core>,
    events: Arc<EventBus>,
    preheat: Option<PreheatScheduler>,
    cancel: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for StreamingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingService")
            .field("pool", &self.core.pool)
            .field("streams", &self.core.registry.len())
            .field("preheat", &self.preheat)
            .finish_non_exhaustive()
    }
}

impl StreamingService {
    /// Build every component and start the background tasks. Must be called
    /// inside a Tokio runtime.
    pub fn start(config: Config, collaborators: Collaborators) -> Self {
        for warning in config.validate() {
            tracing::warn!("Config: {warning}");
        }

        let events = Arc::new(EventBus::default());
        let registry = Arc::new(ManifestRegistry::new(
            ManifestFormat::from_config(&config.transcode),
            config.manifest.min_playable_segments,
        ));
        let cache = TieredCache::new(
            &config.cache,
            ScratchTier::new(config.cache.scratch_ttl()),
            collaborators.fast,
            collaborators.durable,
        );
        let publisher = Arc::new(SegmentPublisher::new(
            config.transcode.clone(),
            config.publisher.clone(),
            collaborators.transcoder,
            cache.clone(),
            registry.clone(),
            events.clone(),
        ));
        let pool = WorkerPool::start(
            config.pool.clone(),
            publisher,
            collaborators.resolver,
            registry.clone(),
            events.clone(),
        );

        let core = Arc::new(Core {
            naming: SegmentNaming::from_config(&config.transcode),
            config,
            pool,
            registry,
            cache,
        });

        let preheat = collaborators.playback.map(|playback| {
            let scheduler = PreheatScheduler::new(
                core.config.preheat.clone(),
                playback,
                core.clone(),
                events.clone(),
            );
            if core.config.preheat.enabled {
                scheduler.start();
            }
            scheduler
        });

        let cancel = CancellationToken::new();
        let background = vec![tokio::spawn(run_sweeper(
            core.clone(),
            cancel.clone(),
        ))];

        tracing::info!(
            preheat = preheat.as_ref().is_some_and(|p| p.is_running()),
            "Streaming service started"
        );
        Self {
            core,
            events,
            preheat,
            cancel,
            background: Mutex::new(background),
        }
    }

    /// Queue a track unless it is already complete or being processed.
    /// `output_dir` defaults to a per-track directory under the work dir.
    pub async fn submit_async(
        &self,
        track: TrackId,
        source: impl Into<String>,
        output_dir: Option<PathBuf>,
        is_external: bool,
    ) -> Result<Admission> {
        self.core
            .submit(track, source.into(), output_dir, is_external)
            .await
    }

    /// Submit and block until the job finishes or the configured wait
    /// timeout elapses. `Ok(None)` means the stream was already available.
    pub async fn submit_and_wait(
        &self,
        track: TrackId,
        source: impl Into<String>,
        output_dir: Option<PathBuf>,
        is_external: bool,
    ) -> Result<Option<PublishReport>> {
        let admission = self
            .submit_async(track.clone(), source, output_dir, is_external)
            .await?;
        if admission == Admission::AlreadyAvailable {
            return Ok(None);
        }

        let outcome = self
            .core
            .pool
            .wait(&track, self.core.config.pool.wait_timeout())
            .await?;
        match (outcome.report, outcome.error) {
            (Some(report), _) => Ok(Some(report)),
            (None, Some(error)) => Err(error),
            (None, None) => Err(Error::transcode_failed(&track, "no stream was published")),
        }
    }

    /// Wait for the active (or last) job of `track`.
    pub async fn wait(&self, track: &TrackId) -> Result<JobOutcome> {
        self.core
            .pool
            .wait(track, self.core.config.pool.wait_timeout())
            .await
    }

    /// A segment or the persisted manifest file of a stream.
    pub async fn get_segment(&self, stream: &StreamId, filename: &str) -> Result<CachedObject> {
        let naming = &self.core.naming;
        if !naming.is_segment(filename) && !naming.is_manifest(filename) {
            return Err(Error::not_found("segment", format!("{stream}/{filename}")));
        }
        match self.core.cache.get(stream, filename).await? {
            CacheLookup::Hit(object) => Ok(object),
            CacheLookup::Miss => Err(Error::not_found("segment", format!("{stream}/{filename}"))),
        }
    }

    /// The manifest of a stream: rendered from memory while the stream is
    /// known here, otherwise the persisted final manifest.
    pub async fn get_manifest(&self, stream: &StreamId) -> Result<ManifestLookup> {
        let registry = &self.core.registry;
        if registry.contains(stream) {
            if registry.is_playable(stream) {
                if let Some(text) = registry.render(stream) {
                    return Ok(ManifestLookup::Ready { text });
                }
            }
            return Ok(ManifestLookup::NotReady {
                segments: registry.segment_count(stream),
                required: registry.min_playable(),
            });
        }

        match self
            .core
            .cache
            .get(stream, self.core.naming.manifest_name())
            .await?
        {
            CacheLookup::Hit(object) => Ok(ManifestLookup::Ready {
                text: String::from_utf8_lossy(&object.bytes).into_owned(),
            }),
            CacheLookup::Miss => Ok(ManifestLookup::NotFound),
        }
    }

    pub fn get_status(&self, track: &TrackId) -> Option<ProcessingStatus> {
        self.core.pool.status(track)
    }

    pub fn outcome(&self, track: &TrackId) -> Option<JobOutcome> {
        self.core.pool.outcome(track)
    }

    pub fn is_playable(&self, stream: &StreamId) -> bool {
        self.core.registry.is_playable(stream)
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.core.pool
    }

    pub fn preheat(&self) -> Option<&PreheatScheduler> {
        self.preheat.as_ref()
    }

    /// Check one playback context now. `Ok(None)` without a playback source.
    pub async fn preheat_next(&self, context: &ContextId) -> Result<Option<TrackId>> {
        match &self.preheat {
            Some(scheduler) => scheduler.preheat_next(context).await,
            None => Ok(None),
        }
    }

    /// One pass of the background sweep: expired scratch directories, and
    /// completed manifests past `manifest.retain_completed_secs`. Readers of
    /// an evicted stream get the persisted manifest.
    pub async fn sweep(&self) -> (usize, usize) {
        self.core.sweep().await
    }

    /// Stop background loops, let running jobs finish, and join everything.
    pub async fn shutdown(&self) {
        if let Some(preheat) = &self.preheat {
            preheat.stop().await;
        }
        self.cancel.cancel();
        let handles = std::mem::take(&mut *self.background.lock());
        for handle in handles {
            let _ = handle.await;
        }
        self.core.pool.shutdown().await;
        tracing::info!("Streaming service stopped");
    }
}

async fn run_sweeper(core: Arc<Core>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(core.config.pool.sweep_interval());
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let (scratch, manifests) = core.sweep().await;
                if scratch > 0 || manifests > 0 {
                    tracing::debug!(scratch, manifests, "Swept streams");
                }
            }
        }
    }
}
