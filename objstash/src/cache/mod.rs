//! Disk-backed object cache engine.
//!
//! Provides typed caches with watermark-bounded admission, a
//! cost-weighted LRU eviction discipline and a crash-recoverable
//! on-disk representation built from per-object extended attributes.

pub mod codec;
pub mod object;
pub mod seqnum;
pub mod set;
pub mod store;
pub mod type_cache;
pub mod types;
pub mod walker;

pub use object::{CacheObject, Unsubscribed};
pub use set::CacheSet;
pub use type_cache::TypeCache;
pub use types::{CacheError, CacheParams, CacheStatus, ObjectId, TypeConfig};
