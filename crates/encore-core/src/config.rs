//! Pipeline configuration types.
//!
//! The top-level [`Config`] struct is deserialized from TOML and carries all
//! sub-configs for the worker pool, publisher, transcoder, cache tiers,
//! manifest synthesizer and preheat scheduler. Every section defaults to the
//! values the pipeline was tuned with, so a completely empty file is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;
use crate::Error;

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root pipeline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pool: PoolConfig,
    pub publisher: PublisherConfig,
    pub transcode: TranscodeConfig,
    pub cache: CacheConfig,
    pub manifest: ManifestConfig,
    pub preheat: PreheatConfig,
    pub source: SourceConfig,
    pub tools: ToolsConfig,
}

impl Config {
    /// Deserialize a `Config` from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).map_err(|e| Error::Config(format!("config parse error: {e}")))
    }

    /// Load configuration from a file path, falling back to defaults if the
    /// path is `None` or the file does not exist.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_toml(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config file at {}; using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(Error::Config(format!(
                "failed to read config file {}: {e}",
                path.display()
            ))),
        }
    }

    /// Return a list of validation warnings (non-fatal issues).
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.pool.workers > 8 {
            warnings.push(format!(
                "pool.workers = {} exceeds the cap of 8; it will be clamped",
                self.pool.workers
            ));
        }
        if self.pool.queue_capacity == 0 {
            warnings.push("pool.queue_capacity is 0; a capacity of 1 will be used".into());
        }
        if self.pool.max_retries == 0 {
            warnings.push("pool.max_retries is 0; every track gets a single attempt".into());
        }
        if self.publisher.stability_window_ms < self.publisher.poll_interval_ms {
            warnings.push(
                "publisher.stability_window_ms is shorter than poll_interval_ms; \
                 partially written segments may be published"
                    .into(),
            );
        }
        if self.publisher.dispatch_workers == 0 {
            warnings.push("publisher.dispatch_workers is 0; 1 worker will be used".into());
        }
        if self.transcode.segment_duration_secs == 0 {
            warnings.push("transcode.segment_duration_secs must be at least 1".into());
        }
        if self.manifest.min_playable_segments == 0 {
            warnings.push(
                "manifest.min_playable_segments is 0; streams are exposed before any segment exists"
                    .into(),
            );
        }
        if !(0.0..=1.0).contains(&self.preheat.played_fraction_threshold) {
            warnings.push(format!(
                "preheat.played_fraction_threshold {} is outside 0.0..=1.0",
                self.preheat.played_fraction_threshold
            ));
        }
        let worst_job = u64::from(self.pool.max_retries.max(1)).saturating_mul(
            self.publisher
                .transcode_timeout_secs
                .saturating_add(self.source.download_timeout_secs),
        );
        if self.pool.max_processing_age_secs <= worst_job {
            warnings.push(format!(
                "pool.max_processing_age_secs ({}) is not above max_retries x \
                 (transcode_timeout_secs + download_timeout_secs) = {worst_job}s; \
                 queued tracks may expire before a worker picks them up",
                self.pool.max_processing_age_secs
            ));
        }
        if self.cache.scratch_ttl_secs <= self.publisher.transcode_timeout_secs {
            warnings.push(format!(
                "cache.scratch_ttl_secs ({}) is not above publisher.transcode_timeout_secs ({}); \
                 a long transcode can lose its scratch directory",
                self.cache.scratch_ttl_secs, self.publisher.transcode_timeout_secs
            ));
        }
        if let Some(ref url) = self.cache.redis_url {
            if !url.starts_with("redis://") && !url.starts_with("rediss://") {
                warnings.push(format!("cache.redis_url '{url}' is not a redis:// URL"));
            }
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// Transcode worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of workers; 0 sizes the pool from the CPU count.
    pub workers: usize,
    pub queue_capacity: usize,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub max_processing_age_secs: u64,
    pub sweep_interval_secs: u64,
    pub wait_timeout_secs: u64,
    pub outcome_ttl_secs: u64,
    /// Finalize a partially transcoded stream instead of retrying.
    pub accept_partial_streams: bool,
    /// Root for per-job private work directories (downloaded sources).
    pub work_dir: PathBuf,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            queue_capacity: 64,
            max_retries: 3,
            retry_backoff_ms: 500,
            max_processing_age_secs: 3600,
            sweep_interval_secs: 60,
            wait_timeout_secs: 300,
            outcome_ttl_secs: 1800,
            accept_partial_streams: false,
            work_dir: std::env::temp_dir().join("encore"),
        }
    }
}

impl PoolConfig {
    /// Effective worker count: explicit value or CPU count, clamped to 2..=8.
    pub fn effective_workers(&self, cpus: usize) -> usize {
        let wanted = if self.workers == 0 { cpus } else { self.workers };
        wanted.clamp(2, 8)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn max_processing_age(&self) -> Duration {
        Duration::from_secs(self.max_processing_age_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    pub fn outcome_ttl(&self) -> Duration {
        Duration::from_secs(self.outcome_ttl_secs)
    }
}

/// Incremental segment publisher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    pub poll_interval_ms: u64,
    /// How long a file must be unchanged before it counts as fully written.
    pub stability_window_ms: u64,
    pub dispatch_workers: usize,
    /// Skip filesystem notifications and rely on directory scans only.
    pub force_polling: bool,
    pub transcode_timeout_secs: u64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 50,
            stability_window_ms: 100,
            dispatch_workers: 4,
            force_polling: false,
            transcode_timeout_secs: 600,
        }
    }
}

impl PublisherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn stability_window(&self) -> Duration {
        Duration::from_millis(self.stability_window_ms)
    }

    pub fn transcode_timeout(&self) -> Duration {
        Duration::from_secs(self.transcode_timeout_secs)
    }
}

/// Transcoder output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodeConfig {
    pub bitrate: String,
    pub segment_duration_secs: u32,
    pub codec: String,
    pub sample_rate: u32,
    pub channels: u32,
    /// Apply EBU R128 loudness normalization while transcoding.
    pub normalize_loudness: bool,
    /// Prefix for segment URIs in rendered manifests (empty = relative).
    pub base_url: String,
    pub segment_prefix: String,
    pub segment_extension: String,
    pub manifest_name: String,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            bitrate: "192k".into(),
            segment_duration_secs: 4,
            codec: "aac".into(),
            sample_rate: 44_100,
            channels: 2,
            normalize_loudness: true,
            base_url: String::new(),
            segment_prefix: "segment_".into(),
            segment_extension: "ts".into(),
            manifest_name: "index.m3u8".into(),
        }
    }
}

/// Tiered cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub fast_ttl_secs: u64,
    pub scratch_ttl_secs: u64,
    pub fast_retries: u32,
    pub fast_backoff_ms: u64,
    pub durable_retries: u32,
    pub durable_backoff_ms: u64,
    pub durable_timeout_secs: u64,
    /// Redis URL for the fast tier; `None` uses an in-process cache.
    pub redis_url: Option<String>,
    pub key_prefix: String,
    /// Directory backing the durable tier; `None` uses an in-memory store.
    pub durable_root: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            fast_ttl_secs: 1800,
            scratch_ttl_secs: 900,
            fast_retries: 3,
            fast_backoff_ms: 20,
            durable_retries: 3,
            durable_backoff_ms: 200,
            durable_timeout_secs: 15,
            redis_url: None,
            key_prefix: "encore".into(),
            durable_root: None,
        }
    }
}

impl CacheConfig {
    pub fn fast_ttl(&self) -> Duration {
        Duration::from_secs(self.fast_ttl_secs)
    }

    pub fn scratch_ttl(&self) -> Duration {
        Duration::from_secs(self.scratch_ttl_secs)
    }

    pub fn fast_backoff(&self) -> Duration {
        Duration::from_millis(self.fast_backoff_ms)
    }

    pub fn durable_backoff(&self) -> Duration {
        Duration::from_millis(self.durable_backoff_ms)
    }

    pub fn durable_timeout(&self) -> Duration {
        Duration::from_secs(self.durable_timeout_secs.max(1))
    }
}

/// Progressive manifest settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManifestConfig {
    /// Segments required before a stream is exposed for playback.
    pub min_playable_segments: usize,
    /// How long a completed stream stays in memory before readers are
    /// served the persisted manifest instead.
    pub retain_completed_secs: u64,
}

impl Default for ManifestConfig {
    fn default() -> Self {
        Self {
            min_playable_segments: 3,
            retain_completed_secs: 1800,
        }
    }
}

impl ManifestConfig {
    pub fn retain_completed(&self) -> Duration {
        Duration::from_secs(self.retain_completed_secs)
    }
}

/// Preheat scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreheatConfig {
    pub enabled: bool,
    pub tick_interval_secs: u64,
    pub remaining_threshold_secs: f64,
    pub played_fraction_threshold: f64,
    pub flag_reset_interval_secs: u64,
}

impl Default for PreheatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval_secs: 5,
            remaining_threshold_secs: 30.0,
            played_fraction_threshold: 0.5,
            flag_reset_interval_secs: 600,
        }
    }
}

impl PreheatConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }

    pub fn flag_reset_interval(&self) -> Duration {
        Duration::from_secs(self.flag_reset_interval_secs.max(1))
    }
}

/// Source fetching settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub download_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            download_timeout_secs: 30,
            user_agent: concat!("encore/", env!("CARGO_PKG_VERSION")).into(),
        }
    }
}

impl SourceConfig {
    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs.max(1))
    }
}

/// Paths to external CLI tools.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub ffmpeg_path: Option<PathBuf>,
    pub ffprobe_path: Option<PathBuf>,
}
