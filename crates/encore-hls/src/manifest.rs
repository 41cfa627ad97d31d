//! Per-stream manifest state and rendering.
//!
//! A [`StreamManifest`] is an index -> duration map plus a completion flag.
//! Segments can be recorded in any order; rendering always walks the map in
//! ascending index order, so detection order never shows up in the output.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::time::{Duration, Instant};

use encore_core::config::TranscodeConfig;

use crate::naming::SegmentNaming;

/// HLS protocol version. Version 3 allows fractional `#EXTINF` durations.
const HLS_VERSION: u32 = 3;

/// How segment entries are written into a rendered manifest.
#[derive(Debug, Clone)]
pub struct ManifestFormat {
    pub naming: SegmentNaming,
    /// Prepended to each segment file name (empty = relative URIs).
    pub base_url: String,
    /// Configured segment length, used for the target duration before any
    /// segment has been observed.
    pub segment_duration_secs: u32,
}

impl ManifestFormat {
    pub fn from_config(config: &TranscodeConfig) -> Self {
        Self {
            naming: SegmentNaming::from_config(config),
            base_url: config.base_url.clone(),
            segment_duration_secs: config.segment_duration_secs,
        }
    }

    fn segment_uri(&self, index: u32) -> String {
        format!("{}{}", self.base_url, self.naming.filename(index))
    }
}

impl Default for ManifestFormat {
    fn default() -> Self {
        Self::from_config(&TranscodeConfig::default())
    }
}

/// Known segments of one stream.
#[derive(Debug, Clone, Default)]
pub struct StreamManifest {
    segments: BTreeMap<u32, f64>,
    complete: bool,
    total_duration: Option<f64>,
    completed_at: Option<Instant>,
}

impl StreamManifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record (or correct) the duration of segment `index`.
    ///
    /// Returns `true` if the index was not known before. Recording into a
    /// completed manifest is ignored.
    pub fn record_segment(&mut self, index: u32, duration: f64) -> bool {
        if self.complete {
            return false;
        }
        self.segments.insert(index, duration.max(0.0)).is_none()
    }

    /// Close the stream. Calling this again only updates the total.
    pub fn mark_complete(&mut self, total_duration: f64) {
        self.complete = true;
        self.total_duration = Some(total_duration);
        self.completed_at.get_or_insert_with(Instant::now);
    }

    /// Time since the first [`mark_complete`](Self::mark_complete).
    pub fn completed_for(&self) -> Option<Duration> {
        self.completed_at.map(|at| at.elapsed())
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn has_minimum_segments(&self, n: usize) -> bool {
        self.segments.len() >= n
    }

    /// Total duration passed to [`mark_complete`](Self::mark_complete), or the
    /// sum of known segment durations while the stream is still open.
    pub fn total_duration(&self) -> f64 {
        self.total_duration
            .unwrap_or_else(|| self.segments.values().sum())
    }

    /// Segment entries in index order.
    pub fn entries(&self) -> Vec<(u32, f64)> {
        self.segments.iter().map(|(&i, &d)| (i, d)).collect()
    }

    /// `#EXT-X-TARGETDURATION`: the longest observed segment rounded up, plus
    /// one second of headroom.
    pub fn target_duration(&self, format: &ManifestFormat) -> u64 {
        let longest = self
            .segments
            .values()
            .copied()
            .reduce(f64::max)
            .unwrap_or(f64::from(format.segment_duration_secs));
        longest.ceil() as u64 + 1
    }

    pub fn render(&self, format: &ManifestFormat) -> String {
        render_entries(
            &self.entries(),
            self.target_duration(format),
            self.complete,
            format,
        )
    }
}

/// Render a manifest from an already sorted entry list.
pub(crate) fn render_entries(
    entries: &[(u32, f64)],
    target_duration: u64,
    complete: bool,
    format: &ManifestFormat,
) -> String {
    let mut out = String::with_capacity(128 + entries.len() * 48);

    let _ = writeln!(out, "#EXTM3U");
    let _ = writeln!(out, "#EXT-X-VERSION:{HLS_VERSION}");
    let _ = writeln!(out, "#EXT-X-TARGETDURATION:{target_duration}");
    let _ = writeln!(out, "#EXT-X-MEDIA-SEQUENCE:0");
    if complete {
        let _ = writeln!(out, "#EXT-X-PLAYLIST-TYPE:VOD");
    } else {
        let _ = writeln!(out, "#EXT-X-PLAYLIST-TYPE:EVENT");
    }

    for &(index, duration) in entries {
        let _ = writeln!(out, "#EXTINF:{duration:.6},");
        let _ = writeln!(out, "{}", format.segment_uri(index));
    }

    if complete {
        let _ = writeln!(out, "#EXT-X-ENDLIST");
    }

    out
}
