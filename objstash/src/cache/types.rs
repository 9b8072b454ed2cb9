//! Core types and constants for the cache engine.

use std::io;
use thiserror::Error;

/// Identifier of one cached object, encoded into its on-disk pathname.
///
/// Valid ids lie in `[1, 2^63)`; zero means "no object" and is what the
/// path decoder returns for anything that does not parse.
pub type ObjectId = u64;

/// Largest id the generator will hand out.
pub const MAX_OBJECT_ID: ObjectId = (1 << 63) - 1;

/// Filesystem block size used for on-disk accounting.
pub const BLOCK_SIZE: u64 = 4096;

/// Upper bound for object cost values.
pub const MAX_COST: u32 = 100;

/// Number of low bits of an object id taken from the sequence counter.
pub const SEQ_BITS: u32 = 22;

/// Highest sequence number before the counter wraps back to 1.
pub const MAX_SEQ_NUM: u64 = (1 << SEQ_BITS) - 1;

/// How many allocations may pass between sequence-file rewrites.  The
/// file is bumped by this amount on open so ids from before a crash can
/// never be reissued.
pub const SEQ_BUMP: u64 = 1000;

/// Longest filename accepted in the `user.f` attribute.
pub const MAX_FILENAME_LEN: usize = 256;

/// Attempts made to find an unused destination name for a copy.
pub const MAX_UNIQUE_FILE_INDEX: u32 = 1000;

/// Mode for type directories, container directories and dirType objects.
pub const DIR_MODE: u32 = 0o770;

/// Mode for an object file during its write window.
pub const FILE_RW_MODE: u32 = 0o660;

/// Mode for a finalised, read-only object file.
pub const FILE_RO_MODE: u32 = 0o440;

/// Name of the per-type configuration file inside each type directory.
pub const TYPE_CONFIG_FILENAME: &str = "Type.defaults";

/// Name of the sequence-number file at the cache root.
pub const SEQ_NUM_FILENAME: &str = ".sequenceNumber";

/// Cache engine errors.
#[derive(Debug, Error)]
pub enum CacheError {
    /// I/O failure from the backing filesystem
    #[error("cache I/O error: {0}")]
    Io(#[from] io::Error),

    /// The requested type is not defined
    #[error("type '{0}' does not exist")]
    UnknownType(String),

    /// The requested object is not in the cache
    #[error("object '{0}' does not exist")]
    UnknownObject(ObjectId),

    /// A type with this name is already defined
    #[error("type '{0}' already exists")]
    TypeExists(String),

    /// The type could not be configured (bad watermark budget or an
    /// unreadable defaults file)
    #[error("failed to configure type '{0}'")]
    Configure(String),

    /// A second subscriber arrived during the write window
    #[error("only one writer allowed")]
    OnlyOneWriter,

    /// The object has been expired and can no longer be subscribed
    #[error("object '{0}' is already expired")]
    Expired(ObjectId),

    /// Admission or cleanup could not find room for the request
    #[error("could not find {needed} bytes of cache space")]
    NoSpace { needed: u64 },

    /// The type still has subscribed objects and cannot be deleted
    #[error("type '{0}' has subscribed objects")]
    TypeInUse(String),

    /// The object id cannot be encoded into a pathname
    #[error("invalid object id")]
    InvalidId,
}

/// Configuration parameters as supplied by a caller.
///
/// Fields are signed so that "explicitly negative" can be told apart
/// from "zero, leave unchanged" when a type is reconfigured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheParams {
    pub lo_watermark: i64,
    pub hi_watermark: i64,
    pub default_size: i64,
    pub default_cost: i64,
    pub default_lifetime: i64,
}

impl CacheParams {
    pub fn new(
        lo_watermark: i64,
        hi_watermark: i64,
        default_size: i64,
        default_cost: i64,
        default_lifetime: i64,
    ) -> Self {
        Self {
            lo_watermark,
            hi_watermark,
            default_size,
            default_cost,
            default_lifetime,
        }
    }
}

/// Effective configuration of one cache type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeConfig {
    /// Space this type may claim even under global contention, rounded
    /// to filesystem blocks.
    pub lo_watermark: u64,
    /// Per-type size bound that triggers local eviction.
    pub hi_watermark: u64,
    /// Size substituted when an insert passes zero.
    pub default_size: u64,
    /// Cost substituted when an insert passes zero.
    pub default_cost: u32,
    /// Lifetime substituted when an insert passes zero, in seconds.
    pub default_lifetime: u64,
    /// Objects of this type are directories rather than files.
    pub dir_type: bool,
}

impl Default for TypeConfig {
    fn default() -> Self {
        Self {
            lo_watermark: 0,
            hi_watermark: 1,
            default_size: 0,
            default_cost: 0,
            default_lifetime: 1,
            dir_type: false,
        }
    }
}

/// Aggregate state returned by [`crate::cache::CacheSet::cache_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStatus {
    pub num_types: u64,
    pub size: u64,
    pub num_objects: u64,
    /// Guaranteed headroom: the sum of low watermarks minus the space
    /// in use, clamped at zero.
    pub avail_space: u64,
}
