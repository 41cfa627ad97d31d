//! Typed identifier wrappers.
//!
//! Track and context identifiers come from outside (the catalog, the room
//! service), so each ID is a newtype over `String` rather than a generated
//! UUID. The newtypes keep a track ID from being passed where a playback
//! context is expected.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Generate a newtype ID wrapper over `String`.
///
/// The macro produces a struct with:
/// - `new()` taking anything convertible into a `String`
/// - `as_str()` borrowing the inner value
/// - `Debug`, `Clone`, `PartialEq`, `Eq`, `Hash`, `Ord`, `Serialize`, `Deserialize`
/// - `Display` and `From<&str>` / `From<String>` conversions
macro_rules! string_id {
    ($($(#[doc = $doc:expr])* $name:ident),+ $(,)?) => {
        $(
            $(#[doc = $doc])*
            #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
            #[serde(transparent)]
            pub struct $name(String);

            impl $name {
                /// Wrap an identifier.
                #[must_use]
                pub fn new(id: impl Into<String>) -> Self {
                    Self(id.into())
                }

                /// Borrow the inner identifier.
                #[must_use]
                pub fn as_str(&self) -> &str {
                    &self.0
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(&self.0)
                }
            }

            impl From<&str> for $name {
                fn from(s: &str) -> Self {
                    Self(s.to_string())
                }
            }

            impl From<String> for $name {
                fn from(s: String) -> Self {
                    Self(s)
                }
            }

            impl AsRef<str> for $name {
                fn as_ref(&self) -> &str {
                    &self.0
                }
            }
        )+
    };
}

string_id! {
    /// Catalog identifier for a track.
    TrackId,
    /// Identifier for a segmented output stream.
    StreamId,
    /// Identifier for a playback context (a room or an individual listener).
    ContextId,
}

impl From<&TrackId> for StreamId {
    /// Each track publishes exactly one stream, keyed by the track ID.
    fn from(track: &TrackId) -> Self {
        StreamId(track.0.clone())
    }
}
