//! The unit of work handed to the worker pool.

use std::path::PathBuf;

use encore_core::{StreamId, TrackId};
use serde::{Deserialize, Serialize};

/// One track to fetch and transcode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscodeTask {
    pub track_id: TrackId,
    /// URL or local path of the source audio.
    pub source: String,
    /// Directory the transcoder writes the stream into.
    pub output_dir: PathBuf,
    /// The source comes from an external catalog and must be downloaded.
    pub is_external: bool,
}

impl TranscodeTask {
    pub fn new(
        track_id: TrackId,
        source: impl Into<String>,
        output_dir: impl Into<PathBuf>,
        is_external: bool,
    ) -> Self {
        Self {
            track_id,
            source: source.into(),
            output_dir: output_dir.into(),
            is_external,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        StreamId::from(&self.track_id)
    }
}

/// Directory name for a track's stream output. Characters outside
/// `[A-Za-z0-9._-]` are replaced so catalog IDs like `spotify:track:42`
/// stay single path components.
pub fn stream_dir_name(track: &TrackId) -> String {
    let name: String = track
        .as_str()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match name.as_str() {
        "" | "." | ".." => format!("track_{}", name.len()),
        _ => name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dir_name_is_one_component() {
        assert_eq!(stream_dir_name(&TrackId::new("spotify:track:42")), "spotify_track_42");
        assert_eq!(stream_dir_name(&TrackId::new("a/../b")), "a_.._b");
        assert_eq!(stream_dir_name(&TrackId::new("plain-id_1.0")), "plain-id_1.0");
        assert_eq!(stream_dir_name(&TrackId::new("..")), "track_2");
    }

    #[test]
    fn stream_id_follows_track() {
        let task = TranscodeTask::new(TrackId::new("t1"), "/music/t1.flac", "/tmp/out", false);
        assert_eq!(task.stream_id().as_str(), "t1");
    }
}
