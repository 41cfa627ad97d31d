//! Segment file naming.
//!
//! The transcoder writes `segment_000.ts`, `segment_001.ts`, ... next to its
//! playlist. Everything that needs to go from a filename to an index (the
//! publisher's watcher) or back (manifest rendering) goes through
//! [`SegmentNaming`] so the two directions cannot drift apart.

use encore_core::config::TranscodeConfig;

/// Number of zero-padded digits in a segment index.
const INDEX_WIDTH: usize = 3;

/// Naming scheme for the segment files of one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentNaming {
    prefix: String,
    extension: String,
    manifest_name: String,
}

impl SegmentNaming {
    pub fn new(
        prefix: impl Into<String>,
        extension: impl Into<String>,
        manifest_name: impl Into<String>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            extension: extension.into().trim_start_matches('.').to_string(),
            manifest_name: manifest_name.into(),
        }
    }

    pub fn from_config(config: &TranscodeConfig) -> Self {
        Self::new(
            config.segment_prefix.clone(),
            config.segment_extension.clone(),
            config.manifest_name.clone(),
        )
    }

    /// File name for segment `index`, e.g. `segment_007.ts`.
    pub fn filename(&self, index: u32) -> String {
        format!(
            "{}{:0width$}.{}",
            self.prefix,
            index,
            self.extension,
            width = INDEX_WIDTH
        )
    }

    /// Parse the segment index out of a file name.
    ///
    /// Returns `None` for anything that is not a finished segment: the
    /// playlist, `.tmp` files the transcoder is still writing, and
    /// unrelated files.
    pub fn parse_index(&self, filename: &str) -> Option<u32> {
        let stem = filename
            .strip_prefix(self.prefix.as_str())?
            .strip_suffix(self.extension.as_str())?
            .strip_suffix('.')?;
        if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        stem.parse().ok()
    }

    pub fn is_segment(&self, filename: &str) -> bool {
        self.parse_index(filename).is_some()
    }

    pub fn manifest_name(&self) -> &str {
        &self.manifest_name
    }

    pub fn is_manifest(&self, filename: &str) -> bool {
        filename == self.manifest_name
    }
}

impl Default for SegmentNaming {
    fn default() -> Self {
        Self::from_config(&TranscodeConfig::default())
    }
}

/// MIME type served for a stream file, by extension.
pub fn content_type_for(filename: &str) -> &'static str {
    let ext = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "m3u8" => "application/vnd.apple.mpegurl",
        "ts" => "video/mp2t",
        "aac" => "audio/aac",
        "m4s" | "mp4" => "audio/mp4",
        "mp3" => "audio/mpeg",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_is_zero_padded() {
        let naming = SegmentNaming::default();
        assert_eq!(naming.filename(0), "segment_000.ts");
        assert_eq!(naming.filename(42), "segment_042.ts");
        assert_eq!(naming.filename(1234), "segment_1234.ts");
    }

    #[test]
    fn parse_index_round_trips_filename() {
        let naming = SegmentNaming::default();
        for i in [0, 7, 99, 1000] {
            assert_eq!(naming.parse_index(&naming.filename(i)), Some(i));
        }
    }

    #[test]
    fn non_segments_are_rejected() {
        let naming = SegmentNaming::default();
        assert_eq!(naming.parse_index("index.m3u8"), None);
        assert_eq!(naming.parse_index("segment_003.ts.tmp"), None);
        assert_eq!(naming.parse_index("segment_.ts"), None);
        assert_eq!(naming.parse_index("segment_0a1.ts"), None);
        assert_eq!(naming.parse_index("other_001.ts"), None);
        assert!(naming.is_manifest("index.m3u8"));
        assert!(!naming.is_segment("index.m3u8"));
    }

    #[test]
    fn custom_extension_with_leading_dot() {
        let naming = SegmentNaming::new("chunk-", ".aac", "live.m3u8");
        assert_eq!(naming.filename(5), "chunk-005.aac");
        assert_eq!(naming.parse_index("chunk-005.aac"), Some(5));
        assert_eq!(naming.manifest_name(), "live.m3u8");
    }

    #[test]
    fn content_types() {
        assert_eq!(content_type_for("index.m3u8"), "application/vnd.apple.mpegurl");
        assert_eq!(content_type_for("segment_001.ts"), "video/mp2t");
        assert_eq!(content_type_for("segment_001.TS"), "video/mp2t");
        assert_eq!(content_type_for("a.aac"), "audio/aac");
        assert_eq!(content_type_for("noext"), "application/octet-stream");
    }
}
