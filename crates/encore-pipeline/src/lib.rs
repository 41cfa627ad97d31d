//! # encore-pipeline
//!
//! The transcode-and-delivery pipeline built on the encore crates.
//!
//! - [`source`] - resolve a task's source locator to a local file
//! - [`publisher`] - run the transcoder and publish segments while it writes
//! - [`pool`] - bounded worker pool with one active job per track
//! - [`preheat`] - transcode upcoming tracks ahead of playback
//! - [`service`] - [`StreamingService`], the entry point owning all of the above

pub mod pool;
pub mod preheat;
pub mod publisher;
pub mod service;
pub mod source;
pub mod task;

pub use pool::{Admission, JobOutcome, ProcessingStatus, WorkerPool};
pub use preheat::{
    should_preheat, NextTrack, PlaybackSnapshot, PlaybackSource, PreheatScheduler, PreheatTarget,
};
pub use publisher::{PublishFailure, PublishReport, SegmentPublisher};
pub use service::{Collaborators, ManifestLookup, StreamingService};
pub use source::{DefaultSourceResolver, SourceResolver};
pub use task::{stream_dir_name, TranscodeTask};
