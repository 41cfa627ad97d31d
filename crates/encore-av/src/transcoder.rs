//! The external transcoder: ffmpeg writing HLS audio segments.
//!
//! A [`Transcoder`] runs one long-lived process per job. It writes a playlist
//! plus sequentially numbered segment files into the job's output directory
//! while the publisher watches that directory; nothing here waits for the
//! output to be complete before the caller can observe it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use encore_core::config::TranscodeConfig;
use encore_core::{Error, Result, TrackId};

use crate::command::ToolCommand;
use crate::tools::ToolRegistry;

/// Timeout for `ffprobe` duration probes.
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything the transcoder needs to produce one HLS stream.
#[derive(Debug, Clone)]
pub struct TranscodeRequest {
    pub track_id: TrackId,
    pub input: PathBuf,
    pub output_dir: PathBuf,
    /// Playlist file name written inside `output_dir`.
    pub manifest_name: String,
    /// printf-style segment file name, e.g. `segment_%03d.ts`.
    pub segment_pattern: String,
    /// Prefix for segment URIs in the transcoder's playlist (empty = relative).
    pub base_url: String,
    pub bitrate: String,
    pub codec: String,
    pub sample_rate: u32,
    pub channels: u32,
    pub segment_duration_secs: u32,
    pub normalize_loudness: bool,
    /// Deadline for the whole run. The process is killed when it elapses.
    pub timeout: Duration,
}

impl TranscodeRequest {
    /// Build a request from the transcode settings.
    pub fn new(
        track_id: TrackId,
        input: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        config: &TranscodeConfig,
        timeout: Duration,
    ) -> Self {
        Self {
            track_id,
            input: input.into(),
            output_dir: output_dir.into(),
            manifest_name: config.manifest_name.clone(),
            segment_pattern: format!(
                "{}%03d.{}",
                config.segment_prefix, config.segment_extension
            ),
            base_url: config.base_url.clone(),
            bitrate: config.bitrate.clone(),
            codec: config.codec.clone(),
            sample_rate: config.sample_rate,
            channels: config.channels,
            segment_duration_secs: config.segment_duration_secs,
            normalize_loudness: config.normalize_loudness,
            timeout,
        }
    }

    /// Full path of the playlist the transcoder writes.
    pub fn manifest_path(&self) -> PathBuf {
        self.output_dir.join(&self.manifest_name)
    }
}

/// An external process that turns an input file into HLS segments.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Run the transcode to completion (or until `request.timeout`).
    ///
    /// Segment files appear in `request.output_dir` while this is running.
    async fn run(&self, request: &TranscodeRequest) -> Result<()>;

    /// Probe mode: return the media duration of `input` in seconds.
    async fn probe_duration(&self, input: &Path) -> Result<f64>;
}

/// [`Transcoder`] backed by the `ffmpeg` and `ffprobe` executables.
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    ffmpeg: PathBuf,
    ffprobe: Option<PathBuf>,
}

impl FfmpegTranscoder {
    /// Create a transcoder from discovered tools. `ffmpeg` is required;
    /// `ffprobe` is only needed for probe mode.
    pub fn from_registry(tools: &ToolRegistry) -> Result<Self> {
        Ok(Self {
            ffmpeg: tools.require("ffmpeg")?.to_path_buf(),
            ffprobe: tools.require("ffprobe").ok().map(Path::to_path_buf),
        })
    }

    /// Create a transcoder from explicit executable paths.
    pub fn new(ffmpeg: PathBuf, ffprobe: Option<PathBuf>) -> Self {
        Self { ffmpeg, ffprobe }
    }

    /// Build the ffmpeg argument list for `request`.
    pub fn build_args(request: &TranscodeRequest) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-nostdin".into(),
            "-y".into(),
            "-i".into(),
            request.input.to_string_lossy().into_owned(),
            "-vn".into(),
            "-c:a".into(),
            request.codec.clone(),
            "-b:a".into(),
            request.bitrate.clone(),
            "-ar".into(),
            request.sample_rate.to_string(),
            "-ac".into(),
            request.channels.to_string(),
        ];

        if request.normalize_loudness {
            args.push("-af".into());
            args.push("loudnorm=I=-16:TP=-1.5:LRA=11".into());
        }

        args.extend([
            "-f".into(),
            "hls".into(),
            "-hls_time".into(),
            request.segment_duration_secs.to_string(),
            "-hls_list_size".into(),
            "0".into(),
            "-hls_playlist_type".into(),
            "event".into(),
            // Segments are written to `<name>.tmp` and renamed when finished.
            "-hls_flags".into(),
            "temp_file+independent_segments".into(),
            "-hls_segment_filename".into(),
            request
                .output_dir
                .join(&request.segment_pattern)
                .to_string_lossy()
                .into_owned(),
        ]);

        if !request.base_url.is_empty() {
            args.push("-hls_base_url".into());
            args.push(request.base_url.clone());
        }

        args.push(request.manifest_path().to_string_lossy().into_owned());
        args
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn run(&self, request: &TranscodeRequest) -> Result<()> {
        tokio::fs::create_dir_all(&request.output_dir).await?;

        tracing::info!(
            track_id = %request.track_id,
            input = %request.input.display(),
            output_dir = %request.output_dir.display(),
            segment_secs = request.segment_duration_secs,
            "Starting transcode"
        );

        let mut cmd = ToolCommand::new(self.ffmpeg.clone());
        cmd.timeout(request.timeout)
            .current_dir(&request.output_dir)
            .args(Self::build_args(request));

        match cmd.execute().await {
            Ok(_) => Ok(()),
            Err(e @ Error::Timeout { .. }) => Err(e),
            Err(e) => Err(Error::transcode_failed(&request.track_id, e.to_string())),
        }
    }

    async fn probe_duration(&self, input: &Path) -> Result<f64> {
        let ffprobe = self
            .ffprobe
            .as_ref()
            .ok_or_else(|| Error::tool("ffprobe", "ffprobe not found; is it installed and in PATH?"))?;

        let output = ToolCommand::new(ffprobe.clone())
            .timeout(PROBE_TIMEOUT)
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(input.to_string_lossy())
            .execute()
            .await?;

        parse_probe_duration(&output.stdout)
            .ok_or_else(|| Error::tool("ffprobe", format!("unparseable duration: {:?}", output.stdout.trim())))
    }
}

fn parse_probe_duration(stdout: &str) -> Option<f64> {
    stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .and_then(|l| l.parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d >= 0.0)
}
