//! # encore-av
//!
//! External tool management and transcoding for the encore pipeline.
//!
//! This crate provides:
//!
//! - **Tool discovery** ([`ToolRegistry`]) -- find and cache paths to ffmpeg
//!   and ffprobe.
//! - **Command execution** ([`ToolCommand`]) -- async builder with timeout
//!   support for one-shot tool invocations.
//! - **Transcoding** ([`Transcoder`], [`FfmpegTranscoder`]) -- run the
//!   external transcoder that writes HLS segments into a scratch directory,
//!   and probe media durations.

pub mod command;
pub mod tools;
pub mod transcoder;

// ---- Re-exports for convenience ----

pub use command::{ToolCommand, ToolOutput};
pub use tools::{ToolInfo, ToolRegistry};
pub use transcoder::{FfmpegTranscoder, TranscodeRequest, Transcoder};
