//! Parsing the playlist the transcoder writes while it runs.
//!
//! Only the parts the publisher needs are read: each `#EXTINF` duration paired
//! with the URI on the following line, and whether `#EXT-X-ENDLIST` has been
//! written. Unknown tags are skipped.

/// One segment listed by the transcoder.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaylistEntry {
    /// File name of the segment (any base URL or directory is stripped).
    pub filename: String,
    pub duration: f64,
}

/// The transcoder's view of the stream so far.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TranscoderPlaylist {
    pub entries: Vec<PlaylistEntry>,
    pub ended: bool,
}

impl TranscoderPlaylist {
    /// Duration reported for `filename`, if it is listed yet.
    pub fn duration_of(&self, filename: &str) -> Option<f64> {
        self.entries
            .iter()
            .find(|e| e.filename == filename)
            .map(|e| e.duration)
    }

    pub fn total_duration(&self) -> f64 {
        self.entries.iter().map(|e| e.duration).sum()
    }
}

/// Parse M3U8 text into a [`TranscoderPlaylist`].
///
/// Tolerates a playlist that is being rewritten: a trailing `#EXTINF` with no
/// URI yet is dropped.
pub fn parse_playlist(text: &str) -> TranscoderPlaylist {
    let mut playlist = TranscoderPlaylist::default();
    let mut pending: Option<f64> = None;

    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(rest) = line.strip_prefix("#EXTINF:") {
            let value = rest.split(',').next().unwrap_or_default().trim();
            pending = value.parse::<f64>().ok().filter(|d| d.is_finite() && *d >= 0.0);
        } else if line == "#EXT-X-ENDLIST" {
            playlist.ended = true;
        } else if line.starts_with('#') {
            continue;
        } else if let Some(duration) = pending.take() {
            playlist.entries.push(PlaylistEntry {
                filename: uri_filename(line).to_string(),
                duration,
            });
        }
    }

    playlist
}

fn uri_filename(uri: &str) -> &str {
    let path = uri.split(['?', '#']).next().unwrap_or(uri);
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GROWING: &str = "\
#EXTM3U
#EXT-X-VERSION:3
#EXT-X-TARGETDURATION:4
#EXT-X-MEDIA-SEQUENCE:0
#EXT-X-PLAYLIST-TYPE:EVENT
#EXTINF:4.010667,
segment_000.ts
#EXTINF:3.989333,
segment_001.ts
";

    #[test]
    fn parses_entries_in_order() {
        let pl = parse_playlist(GROWING);
        assert_eq!(pl.entries.len(), 2);
        assert_eq!(pl.entries[0].filename, "segment_000.ts");
        assert!((pl.entries[0].duration - 4.010667).abs() < 1e-9);
        assert!(!pl.ended);
        assert!((pl.total_duration() - 8.0).abs() < 1e-6);
    }

    #[test]
    fn ended_playlist() {
        let text = format!("{GROWING}#EXTINF:2.5,\nsegment_002.ts\n#EXT-X-ENDLIST\n");
        let pl = parse_playlist(&text);
        assert!(pl.ended);
        assert_eq!(pl.duration_of("segment_002.ts"), Some(2.5));
    }

    #[test]
    fn base_url_is_stripped() {
        let text = "#EXTM3U\n#EXTINF:4.0,title\nhttps://cdn.example.com/s/trk/segment_000.ts?sig=1\n";
        let pl = parse_playlist(text);
        assert_eq!(pl.entries[0].filename, "segment_000.ts");
    }

    #[test]
    fn dangling_extinf_is_ignored() {
        let text = "#EXTM3U\n#EXTINF:4.0,\nsegment_000.ts\n#EXTINF:4.0,";
        let pl = parse_playlist(text);
        assert_eq!(pl.entries.len(), 1);
        assert_eq!(pl.duration_of("segment_001.ts"), None);
    }

    #[test]
    fn empty_input() {
        assert_eq!(parse_playlist(""), TranscoderPlaylist::default());
    }
}
