//! Concurrent registry of stream manifests.
//!
//! Each stream gets its own `RwLock`, so recording into one stream never
//! contends with rendering another. The `DashMap` shard lock is only held
//! long enough to clone the stream's `Arc`.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use encore_core::StreamId;
use parking_lot::RwLock;

use crate::manifest::{render_entries, ManifestFormat, StreamManifest};

/// Default number of segments required before a stream may be played.
pub const DEFAULT_MIN_PLAYABLE_SEGMENTS: usize = 3;

/// All in-memory stream manifests of this process.
#[derive(Debug)]
pub struct ManifestRegistry {
    streams: DashMap<StreamId, Arc<RwLock<StreamManifest>>>,
    format: ManifestFormat,
    min_playable: usize,
}

impl ManifestRegistry {
    pub fn new(format: ManifestFormat, min_playable: usize) -> Self {
        Self {
            streams: DashMap::new(),
            format,
            min_playable: min_playable.max(1),
        }
    }

    pub fn format(&self) -> &ManifestFormat {
        &self.format
    }

    pub fn min_playable(&self) -> usize {
        self.min_playable
    }

    fn get(&self, stream: &StreamId) -> Option<Arc<RwLock<StreamManifest>>> {
        self.streams.get(stream).map(|e| Arc::clone(e.value()))
    }

    fn get_or_create(&self, stream: &StreamId) -> Arc<RwLock<StreamManifest>> {
        Arc::clone(
            self.streams
                .entry(stream.clone())
                .or_insert_with(|| Arc::new(RwLock::new(StreamManifest::new())))
                .value(),
        )
    }

    /// Register an empty stream so readers see it as "not ready yet" rather
    /// than unknown.
    pub fn open(&self, stream: &StreamId) {
        self.get_or_create(stream);
    }

    /// Record a segment. Idempotent: re-recording an index only updates its
    /// duration.
    ///
    /// Returns `true` when this call made the stream cross the playability
    /// gate.
    pub fn record_segment(&self, stream: &StreamId, index: u32, duration: f64) -> bool {
        let manifest = self.get_or_create(stream);
        let mut m = manifest.write();
        let before = m.segment_count();
        let inserted = m.record_segment(index, duration);
        if !inserted && m.is_complete() {
            tracing::debug!(stream_id = %stream, index, "Ignoring segment for completed stream");
        }
        inserted && before < self.min_playable && m.segment_count() >= self.min_playable
    }

    /// Mark the stream finished. Safe to call more than once.
    pub fn mark_complete(&self, stream: &StreamId, total_duration: f64) {
        let manifest = self.get_or_create(stream);
        manifest.write().mark_complete(total_duration);
        tracing::debug!(stream_id = %stream, total_duration, "Manifest marked complete");
    }

    /// Render the manifest, or `None` for an unknown stream.
    ///
    /// The entries are copied under the read lock and formatted after it is
    /// released.
    pub fn render(&self, stream: &StreamId) -> Option<String> {
        let manifest = self.get(stream)?;
        let (entries, target, complete) = {
            let m = manifest.read();
            (m.entries(), m.target_duration(&self.format), m.is_complete())
        };
        Some(render_entries(&entries, target, complete, &self.format))
    }

    pub fn has_minimum_segments(&self, stream: &StreamId, n: usize) -> bool {
        self.get(stream)
            .is_some_and(|m| m.read().has_minimum_segments(n))
    }

    /// The playability gate: enough segments for the configured minimum, or
    /// a completed stream (which may legitimately be shorter).
    pub fn is_playable(&self, stream: &StreamId) -> bool {
        self.get(stream).is_some_and(|m| {
            let m = m.read();
            m.is_complete() || m.has_minimum_segments(self.min_playable)
        })
    }

    pub fn is_complete(&self, stream: &StreamId) -> bool {
        self.get(stream).is_some_and(|m| m.read().is_complete())
    }

    pub fn contains(&self, stream: &StreamId) -> bool {
        self.streams.contains_key(stream)
    }

    pub fn segment_count(&self, stream: &StreamId) -> usize {
        self.get(stream).map_or(0, |m| m.read().segment_count())
    }

    pub fn total_duration(&self, stream: &StreamId) -> Option<f64> {
        self.get(stream).map(|m| m.read().total_duration())
    }

    /// Drop a stream's in-memory state.
    pub fn remove(&self, stream: &StreamId) -> bool {
        self.streams.remove(stream).is_some()
    }

    /// Drop completed streams that finished more than `retain` ago. Open
    /// streams are never evicted. Returns how many were dropped.
    pub fn evict_completed(&self, retain: Duration) -> usize {
        let before = self.streams.len();
        self.streams.retain(|_, m| {
            m.read()
                .completed_for()
                .map_or(true, |elapsed| elapsed < retain)
        });
        let evicted = before.saturating_sub(self.streams.len());
        if evicted > 0 {
            tracing::debug!(evicted, "Evicted completed manifests");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

impl Default for ManifestRegistry {
    fn default() -> Self {
        Self::new(ManifestFormat::default(), DEFAULT_MIN_PLAYABLE_SEGMENTS)
    }
}
