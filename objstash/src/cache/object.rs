//! One cached object: a regular file or a directory tree, addressed by
//! its encoded object id.
//!
//! The object owns its persisted metadata (six `user.` extended
//! attributes) and the write-window state machine: a newly inserted
//! object is writable for exactly one subscriber until the first
//! unsubscribe finalises it read-only.

use crate::cache::codec;
use crate::cache::store::{self, XattrMode};
use crate::cache::types::{
    CacheError, ObjectId, BLOCK_SIZE, DIR_MODE, FILE_RO_MODE, FILE_RW_MODE, MAX_COST,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, warn};

/// Extended-attribute keys, one byte each in the `user.` namespace.
pub const ATTR_FILENAME: &str = "user.f";
pub const ATTR_SIZE: &str = "user.s";
pub const ATTR_COST: &str = "user.c";
pub const ATTR_LIFETIME: &str = "user.l";
pub const ATTR_WRITTEN: &str = "user.w";
pub const ATTR_DIR_TYPE: &str = "user.d";

/// Outcome of releasing a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unsubscribed {
    /// The object remains valid in the cache.
    Released,
    /// Finalisation failed (or the object is a single-shot directory):
    /// the object is now expired and its id must leave the global map.
    Orphaned,
}

/// A single cached object.
#[derive(Debug)]
pub struct CacheObject {
    id: ObjectId,
    type_name: String,
    base_dir: PathBuf,
    filename: String,
    size: u64,
    cost: u32,
    lifetime: u64,
    subscription_count: u32,
    written: bool,
    expired: bool,
    dir_type: bool,
    creation_time: SystemTime,
    last_access_time: SystemTime,
}

impl CacheObject {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        base_dir: &Path,
        type_name: &str,
        id: ObjectId,
        filename: &str,
        size: u64,
        cost: u32,
        lifetime: u64,
        written: bool,
        dir_type: bool,
    ) -> Self {
        let now = SystemTime::now();
        Self {
            id,
            type_name: type_name.to_string(),
            base_dir: base_dir.to_path_buf(),
            filename: filename.to_string(),
            size,
            cost: cost.min(MAX_COST),
            lifetime: lifetime.max(1),
            subscription_count: 0,
            written,
            expired: false,
            dir_type,
            creation_time: now,
            last_access_time: now,
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn cost(&self) -> u32 {
        self.cost
    }

    pub fn lifetime(&self) -> u64 {
        self.lifetime
    }

    pub fn subscription_count(&self) -> u32 {
        self.subscription_count
    }

    pub fn is_written(&self) -> bool {
        self.written
    }

    pub fn is_expired(&self) -> bool {
        self.expired
    }

    pub fn is_dir_type(&self) -> bool {
        self.dir_type
    }

    pub fn creation_time(&self) -> SystemTime {
        self.creation_time
    }

    pub fn last_access_time(&self) -> SystemTime {
        self.last_access_time
    }

    /// The full on-disk pathname for this object.
    pub fn pathname(&self, create_dir: bool) -> Result<PathBuf, CacheError> {
        codec::build_pathname(
            &self.base_dir,
            &self.type_name,
            self.id,
            &self.filename,
            create_dir,
        )
    }

    /// Create the backing file or directory and persist the metadata
    /// attributes, or (for recovery) verify the backing still exists.
    ///
    /// The attribute order is fixed: backing exists, perms rw, then
    /// f, s, c, l, d and finally w, whose write flips the file back to
    /// read-only.  A failure at any step leaves the object unusable and
    /// the caller discards it.
    pub fn initialize(&self, is_new: bool) -> Result<(), CacheError> {
        let path = self.pathname(is_new)?;

        if !is_new {
            fs::symlink_metadata(&path)?;
            return Ok(());
        }

        if self.dir_type {
            store::create_dir(&path, DIR_MODE)?;
        } else {
            store::create_file(&path)?;
            store::chmod(&path, FILE_RW_MODE)?;
        }

        store::set_xattr(
            &path,
            ATTR_FILENAME,
            self.filename.as_bytes(),
            XattrMode::Create,
        )?;
        store::set_xattr_u64(&path, ATTR_SIZE, self.size, XattrMode::Create)?;
        store::set_xattr_u32(&path, ATTR_COST, self.cost, XattrMode::Create)?;
        store::set_xattr_u64(&path, ATTR_LIFETIME, self.lifetime, XattrMode::Create)?;
        store::set_xattr_u32(
            &path,
            ATTR_DIR_TYPE,
            u32::from(self.dir_type),
            XattrMode::Create,
        )?;
        store::set_xattr_u32(
            &path,
            ATTR_WRITTEN,
            u32::from(self.written),
            XattrMode::Create,
        )?;
        store::chmod(&path, FILE_RO_MODE)?;

        debug!(id = self.id, path = %path.display(), "initialized cache object");
        Ok(())
    }

    /// Take a subscription, pinning the object and returning its path.
    ///
    /// The first subscription on an unwritten object opens the write
    /// window (perms flip to read-write); while that window is open any
    /// further subscribe is refused.  Written objects allow concurrent
    /// readers.
    pub fn subscribe(&mut self) -> Result<PathBuf, CacheError> {
        if self.expired {
            warn!(id = self.id, "subscribe refused, object already expired");
            return Err(CacheError::Expired(self.id));
        }

        if self.written || self.subscription_count == 0 {
            let path = self.pathname(false)?;
            if !self.written {
                let mode = if self.dir_type { DIR_MODE } else { FILE_RW_MODE };
                store::chmod(&path, mode)?;
            }
            self.subscription_count += 1;
            self.update_access_time();
            info!(id = self.id, count = self.subscription_count, "subscription taken");
            Ok(path)
        } else {
            self.update_access_time();
            error!(id = self.id, "subscribe refused, only one writer allowed");
            Err(CacheError::OnlyOneWriter)
        }
    }

    /// Release one subscription.
    ///
    /// Leaving the write window finalises the object: the declared size
    /// is clamped down to the real size (growing past it expires the
    /// object instead), the contents are fsynced, `w=1` is persisted and
    /// the file goes read-only.  Directory objects are single-shot and
    /// always expire here.  Any failure orphans the object.
    pub fn unsubscribe(&mut self) -> Unsubscribed {
        self.subscription_count = self.subscription_count.saturating_sub(1);

        let mut ok = true;
        if self.dir_type {
            debug!(id = self.id, "directory object marked expired on unsubscribe");
            ok = false;
        } else if !self.written {
            ok = self.finalize();
        }

        if !ok {
            debug!(id = self.id, "object marked expired on unsubscribe");
            self.expired = true;
            Unsubscribed::Orphaned
        } else {
            self.update_access_time();
            Unsubscribed::Released
        }
    }

    fn finalize(&mut self) -> bool {
        let path = match self.pathname(false) {
            Ok(path) => path,
            Err(e) => {
                error!(id = self.id, error = %e, "finalize: no pathname");
                return false;
            }
        };

        let real_size = match fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(e) => {
                error!(id = self.id, path = %path.display(), error = %e, "finalize: stat failed");
                return false;
            }
        };

        if real_size > self.size {
            error!(
                id = self.id,
                declared = self.size,
                real = real_size,
                "file larger than space allocated, expiring"
            );
            return false;
        }
        if real_size < self.size {
            debug!(
                id = self.id,
                declared = self.size,
                real = real_size,
                "clamping declared size to real size"
            );
            self.size = real_size;
            if let Err(e) = store::set_xattr_u64(&path, ATTR_SIZE, self.size, XattrMode::Replace) {
                error!(id = self.id, error = %e, "finalize: size attribute update failed");
                return false;
            }
        }

        if let Err(e) = store::sync_file(&path) {
            error!(id = self.id, error = %e, "finalize: fsync failed, expiring");
            return false;
        }

        self.written = true;
        if let Err(e) = store::set_xattr_u32(&path, ATTR_WRITTEN, 1, XattrMode::Replace) {
            error!(id = self.id, error = %e, "finalize: written attribute update failed");
            self.written = false;
            return false;
        }
        if let Err(e) = store::chmod(&path, FILE_RO_MODE) {
            error!(id = self.id, error = %e, "finalize: permission reset failed");
            self.written = false;
            return false;
        }

        debug!(id = self.id, size = self.size, "object finalized");
        true
    }

    /// Update the access time without subscribing.
    pub fn touch(&mut self) -> SystemTime {
        self.update_access_time()
    }

    /// Change the declared size.  Only legal while the single writable
    /// subscription is open; any violation returns the current size
    /// unchanged.  The caller has already checked cache space.
    pub fn resize(&mut self, new_size: u64) -> u64 {
        if !self.written && self.subscription_count == 1 {
            match self.pathname(false) {
                Ok(path) => {
                    let saved = self.size;
                    self.size = new_size;
                    if let Err(e) =
                        store::set_xattr_u64(&path, ATTR_SIZE, self.size, XattrMode::Replace)
                    {
                        error!(id = self.id, error = %e, "resize: size attribute update failed");
                        self.size = saved;
                    }
                }
                Err(e) => {
                    error!(id = self.id, error = %e, "resize: no pathname");
                }
            }
        } else if self.written {
            warn!(id = self.id, "resize not allowed on written object");
        } else {
            warn!(id = self.id, "resize not allowed on unsubscribed object");
        }

        self.size
    }

    /// Mark the object expired and, unless a subscription pins it,
    /// remove the backing storage now.  Returns whether the backing was
    /// removed; a pinned object is removed by the orphan sweep after
    /// its last unsubscribe.
    pub fn expire(&mut self) -> bool {
        self.expired = true;

        if self.subscription_count > 0 {
            info!(id = self.id, "expire deferred, object subscribed");
            return false;
        }
        if self.filename.is_empty() {
            warn!(id = self.id, "expire: no filename to remove");
            return false;
        }
        self.remove_backing()
    }

    /// Best-effort removal of the backing file or directory tree plus
    /// the containing one-character directory.
    pub(crate) fn remove_backing(&self) -> bool {
        let path = match self.pathname(false) {
            Ok(path) => path,
            Err(e) => {
                error!(id = self.id, error = %e, "remove: no pathname");
                return false;
            }
        };

        let removed = if self.dir_type {
            match store::remove_tree(&path) {
                Ok(()) => true,
                Err(e) => {
                    error!(id = self.id, path = %path.display(), error = %e, "remove tree failed");
                    false
                }
            }
        } else {
            match store::unlink(&path) {
                Ok(()) => true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
                Err(e) => {
                    error!(id = self.id, path = %path.display(), error = %e, "unlink failed");
                    false
                }
            }
        };

        if removed {
            if let Some(parent) = path.parent() {
                if let Err(e) = store::remove_dir_if_empty(parent) {
                    error!(dir = %parent.display(), error = %e, "container rmdir failed");
                }
            }
            debug!(id = self.id, path = %path.display(), "removed backing storage");
        }
        removed
    }

    /// Compare the on-disk size against the declared size and log any
    /// discrepancy.  Never mutates state.
    pub fn validate(&self) {
        let path = match self.pathname(false) {
            Ok(path) => path,
            Err(e) => {
                error!(id = self.id, error = %e, "validate: no pathname");
                return;
            }
        };

        let real_size = if self.dir_type {
            store::sum_tree(&path)
        } else {
            fs::metadata(&path).map(|m| m.len())
        };

        match real_size {
            Ok(real) if real <= self.size => {
                debug!(id = self.id, path = %path.display(), "object is valid");
            }
            Ok(real) => {
                error!(
                    id = self.id,
                    path = %path.display(),
                    real,
                    declared = self.size,
                    "object size exceeds declaration"
                );
            }
            Err(e) => {
                error!(id = self.id, path = %path.display(), error = %e, "validate: size check failed");
            }
        }
    }

    /// Eviction priority.  Objects younger than their lifetime report
    /// the maximum cost; after that the cost decays with age, scaled by
    /// the object's page count.  Lower is a better eviction candidate.
    pub fn cache_cost(&self) -> u64 {
        let age = SystemTime::now()
            .duration_since(self.last_access_time)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        if age < self.lifetime {
            u64::from(MAX_COST)
        } else {
            let pages = self.size / BLOCK_SIZE + u64::from(self.size % BLOCK_SIZE != 0);
            u64::from(self.cost) * pages / age
        }
    }

    fn update_access_time(&mut self) -> SystemTime {
        self.last_access_time = SystemTime::now();
        self.last_access_time
    }

    #[cfg(test)]
    pub(crate) fn backdate_last_access(&mut self, secs: u64) {
        self.last_access_time = SystemTime::now() - Duration::from_secs(secs);
    }
}
