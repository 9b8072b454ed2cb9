//! objstash - persistent, disk-backed object cache service.
//!
//! Clients define named cache types with admission and eviction
//! bounds, insert objects (files or whole directories) and receive a
//! filesystem path to write into.  Objects are pinned while
//! subscriptions are active and evicted under a cost-weighted LRU
//! discipline when a type or the whole cache runs past its
//! watermarks.  The cache survives restarts by rebuilding its state
//! from the directory tree and per-object extended attributes.
//!
//! # High-Level API
//!
//! ```ignore
//! use objstash::cache::{CacheParams, CacheSet};
//! use objstash::cache::walker;
//!
//! let mut set = CacheSet::new(&config.base_dir, config.total_cache_space)?;
//! walker::walk_tree(&mut set);
//! set.cleanup_at_startup();
//!
//! set.define_type("thumbs", Some(&CacheParams::new(100_000, 500_000, 0, 50, 60)), false)?;
//! let id = set.insert_cache_object("thumbs", "photo.jpg", 20_000, 0, 0)?;
//! let path = set.subscribe_cache_object(id)?;
//! ```
//!
//! The [`service`] module wraps the engine with the named-operation
//! router, subscription handles and the maintenance ticker that the
//! daemon binary serves over its socket.

pub mod cache;
pub mod config;
pub mod logging;
pub mod service;

/// Version of the objstash library and CLI.
///
/// This is synchronized across all components in the workspace.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version of the service interface reported by GetVersion.
pub const INTERFACE_VERSION: &str = "1.0";
