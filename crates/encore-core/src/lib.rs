//! encore-core: shared identifiers, errors, configuration, and event bus.
//!
//! This crate is the foundational dependency for all other encore crates,
//! providing typed identifiers for tracks, streams and playback contexts, a
//! unified error type, injectable configuration, and a broadcast event bus.

pub mod config;
pub mod error;
pub mod events;
pub mod ids;

// Re-export the most commonly used items at the crate root.
pub use error::{Error, Result};
pub use ids::*;
