//! Unified error type for the encore pipeline.
//!
//! All crates funnel their failures into [`Error`]. Cache misses are not
//! errors: tier lookups report absence through `Option` or lookup enums, and
//! only genuine failures end up here.

use std::fmt;
use std::time::Duration;

/// Unified error type covering all failure modes in encore.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The track source could not be resolved or fetched.
    #[error("Source unavailable for {track}: {message}")]
    SourceUnavailable {
        /// Track whose source failed.
        track: String,
        /// Human-readable error description.
        message: String,
        /// False when retrying cannot help, e.g. a local file that does not
        /// exist.
        retryable: bool,
    },

    /// The transcoder exited non-zero or produced no usable output.
    #[error("Transcode failed for {track}: {message}")]
    TranscodeFailed {
        /// Track being transcoded.
        track: String,
        /// Human-readable error description.
        message: String,
    },

    /// A single cache tier could not be reached. Callers fall through to the
    /// next tier; this only surfaces when logged.
    #[error("Cache tier {tier} unavailable: {message}")]
    CacheTierUnavailable {
        /// Tier name (e.g. "fast", "scratch").
        tier: &'static str,
        /// Human-readable error description.
        message: String,
    },

    /// The durable object store failed after exhausting its retries.
    #[error("Durable store error: {0}")]
    DurableStore(String),

    /// Another worker already holds the processing lock for this track.
    #[error("Track {track} is already being processed")]
    ConcurrentConflict {
        /// Track that is already in flight.
        track: String,
    },

    /// A bounded wait or external call exceeded its deadline.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// What was being waited on.
        operation: String,
        /// The deadline that elapsed.
        after: Duration,
    },

    /// The requested entity could not be found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// The kind of entity (e.g. "segment", "manifest").
        entity: String,
        /// The identifier that was looked up.
        id: String,
    },

    /// An external tool (ffmpeg, ffprobe) returned an error.
    #[error("Tool error [{tool}]: {message}")]
    Tool {
        /// Name of the tool that failed.
        tool: String,
        /// Human-readable error description.
        message: String,
    },

    /// Configuration could not be parsed or is invalid.
    #[error("Config error: {0}")]
    Config(String),

    /// An I/O operation failed.
    #[error("IO error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Catch-all for unexpected internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether retrying the failed operation may succeed.
    pub fn is_transient(&self) -> bool {
        if let Error::SourceUnavailable { retryable, .. } = self {
            return *retryable;
        }
        matches!(
            self,
            Error::TranscodeFailed { .. }
                | Error::CacheTierUnavailable { .. }
                | Error::DurableStore(_)
                | Error::Timeout { .. }
                | Error::Io { .. }
                | Error::Tool { .. }
        )
    }

    /// Convenience constructor for [`Error::NotFound`].
    pub fn not_found(entity: impl Into<String>, id: impl fmt::Display) -> Self {
        Error::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// Convenience constructor for a retryable [`Error::SourceUnavailable`].
    pub fn source_unavailable(track: impl fmt::Display, message: impl Into<String>) -> Self {
        Error::SourceUnavailable {
            track: track.to_string(),
            message: message.into(),
            retryable: true,
        }
    }

    /// [`Error::SourceUnavailable`] that no retry can fix.
    pub fn source_missing(track: impl fmt::Display, message: impl Into<String>) -> Self {
        Error::SourceUnavailable {
            track: track.to_string(),
            message: message.into(),
            retryable: false,
        }
    }

    /// Convenience constructor for [`Error::TranscodeFailed`].
    pub fn transcode_failed(track: impl fmt::Display, message: impl Into<String>) -> Self {
        Error::TranscodeFailed {
            track: track.to_string(),
            message: message.into(),
        }
    }

    /// Convenience constructor for [`Error::CacheTierUnavailable`].
    pub fn tier_unavailable(tier: &'static str, message: impl fmt::Display) -> Self {
        Error::CacheTierUnavailable {
            tier,
            message: message.to_string(),
        }
    }

    /// Convenience constructor for [`Error::Timeout`].
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Error::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// Convenience constructor for [`Error::Tool`].
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }
}

// Finished job outcomes are shared with every waiter, so errors are cloned.
// `std::io::Error` is not `Clone`; its kind and message are kept.
impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Error::SourceUnavailable {
                track,
                message,
                retryable,
            } => Error::SourceUnavailable {
                track: track.clone(),
                message: message.clone(),
                retryable: *retryable,
            },
            Error::TranscodeFailed { track, message } => Error::TranscodeFailed {
                track: track.clone(),
                message: message.clone(),
            },
            Error::CacheTierUnavailable { tier, message } => Error::CacheTierUnavailable {
                tier,
                message: message.clone(),
            },
            Error::DurableStore(message) => Error::DurableStore(message.clone()),
            Error::ConcurrentConflict { track } => Error::ConcurrentConflict {
                track: track.clone(),
            },
            Error::Timeout { operation, after } => Error::Timeout {
                operation: operation.clone(),
                after: *after,
            },
            Error::NotFound { entity, id } => Error::NotFound {
                entity: entity.clone(),
                id: id.clone(),
            },
            Error::Tool { tool, message } => Error::Tool {
                tool: tool.clone(),
                message: message.clone(),
            },
            Error::Config(message) => Error::Config(message.clone()),
            Error::Io { source } => Error::Io {
                source: std::io::Error::new(source.kind(), source.to_string()),
            },
            Error::Internal(message) => Error::Internal(message.clone()),
        }
    }
}

/// Result alias using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
