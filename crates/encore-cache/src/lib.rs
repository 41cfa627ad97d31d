//! # encore-cache
//!
//! Three-tier segment storage for the encore pipeline.
//!
//! - **Scratch** ([`ScratchTier`]) -- the transcoder's own output directory,
//!   served directly while the job is active or just finished, deleted on a
//!   fixed delay after creation.
//! - **Fast** ([`FastCache`]) -- shared key/blob cache with per-key TTL.
//!   [`RedisFastCache`] in deployments, [`MemoryFastCache`] otherwise.
//! - **Durable** ([`DurableStore`]) -- object store without expiry.
//!   [`FsObjectStore`] or [`MemoryObjectStore`].
//!
//! [`TieredCache`] stitches them together: reads fall through the tiers and
//! backfill the fast tier from durable hits; writes go to fast (best-effort)
//! and durable (retried).

pub mod fs;
pub mod memory;
pub mod redis;
pub mod retry;
pub mod scratch;
pub mod tier;
pub mod tiered;

pub use fs::FsObjectStore;
pub use memory::{MemoryFastCache, MemoryObjectStore};
pub use redis::RedisFastCache;
pub use scratch::ScratchTier;
pub use tier::{DurableStore, FastCache, ObjectMeta, Tier};
pub use tiered::{CacheLookup, CachedObject, PutOutcome, TieredCache};
