//! encore-hls: segment naming, transcoder playlist parsing, and the
//! progressive manifest synthesizer.
//!
//! # Modules
//!
//! - [`naming`] - Segment file naming and content types
//! - [`playlist`] - Parsing the playlist the transcoder writes as it runs
//! - [`manifest`] - Per-stream segment index and manifest rendering
//! - [`registry`] - Concurrent map of stream manifests with the playability gate

pub mod manifest;
pub mod naming;
pub mod playlist;
pub mod registry;

pub use manifest::{ManifestFormat, StreamManifest};
pub use naming::{content_type_for, SegmentNaming};
pub use playlist::{parse_playlist, PlaylistEntry, TranscoderPlaylist};
pub use registry::ManifestRegistry;
