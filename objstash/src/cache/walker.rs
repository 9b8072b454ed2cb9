//! Startup recovery: rebuild the in-memory cache state from the
//! directory tree and per-object extended attributes.
//!
//! The walk is depth-first pre-order, so a type's `Type.defaults` is
//! seen before the objects beneath it.  Every entry resolves to
//! `Continue`/`Complete`/`Error`; an error abandons that entry only and
//! the walk moves on to the next sibling.  Files that fail any check
//! (undecodable path, missing or zero `w`, size mismatch) are deleted
//! on the spot.

use crate::cache::codec;
use crate::cache::object::{ATTR_COST, ATTR_FILENAME, ATTR_LIFETIME, ATTR_SIZE, ATTR_WRITTEN};
use crate::cache::set::CacheSet;
use crate::cache::store;
use crate::cache::types::{FILE_RO_MODE, MAX_FILENAME_LEN, SEQ_NUM_FILENAME, TYPE_CONFIG_FILENAME};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Continue,
    Complete,
    Error,
}

#[derive(Default)]
struct WalkState {
    /// Directories accepted as dirType objects; their contents belong
    /// to the object and are not descended into.
    dir_type_roots: HashSet<PathBuf>,
}

/// Walk the cache tree and rebuild `set`.  Returns false when a
/// directory listing could not be read; individual bad files never
/// fail the walk.
pub fn walk_tree(set: &mut CacheSet) -> bool {
    let base = set.base_dir().to_path_buf();
    let mut state = WalkState::default();
    let ok = walk_dir(set, &base, &mut state);
    info!(base = %base.display(), ok, "recovery walk finished");
    ok
}

fn walk_dir(set: &mut CacheSet, dir: &Path, state: &mut WalkState) -> bool {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            error!(dir = %dir.display(), error = %e, "recovery: cannot list directory");
            return false;
        }
    };
    let mut paths: Vec<PathBuf> = entries.filter_map(|e| e.ok().map(|e| e.path())).collect();
    paths.sort();

    for path in &paths {
        if process_entry(set, path, state) == Status::Error {
            warn!(path = %path.display(), "recovery: skipping entry after error");
        }
    }

    let mut ok = true;
    for path in &paths {
        if path.is_dir() && !state.dir_type_roots.contains(path) {
            ok &= walk_dir(set, path, state);
        }
    }
    ok
}

fn is_top_level(base: &Path, path: &Path) -> bool {
    path == base || path.parent() == Some(base)
}

fn process_entry(set: &mut CacheSet, path: &Path, state: &mut WalkState) -> Status {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) => {
            error!(path = %path.display(), error = %e, "recovery: stat failed");
            return Status::Error;
        }
    };

    let base = set.base_dir().to_path_buf();
    if meta.is_dir() && is_top_level(&base, path) {
        return Status::Complete;
    }

    let type_name = codec::type_name_from_path(&base, path).unwrap_or_default();
    let object_id = codec::object_id_from_path(path);
    let mut dir_type = false;

    if meta.is_file() {
        match check_special_file(set, path, &type_name) {
            Status::Continue => {}
            status => return status,
        }
        match ensure_type(set, path, &type_name) {
            Status::Continue => {}
            status => return status,
        }
    } else if meta.is_dir() {
        if set.type_exists(&type_name) && set.is_dir_type(&type_name) && object_id != 0 {
            dir_type = true;
            state.dir_type_roots.insert(path.to_path_buf());
        } else {
            if let Err(e) = store::remove_dir_if_empty(path) {
                error!(path = %path.display(), error = %e, "recovery: rmdir failed");
            } else if !path.exists() {
                info!(path = %path.display(), "recovery: removed empty directory");
            }
            return Status::Complete;
        }
    }

    if object_id == 0 {
        info!(path = %path.display(), "recovery: unlinking non-cache file");
        return remove_entry(path);
    }

    // user.w decides whether the object ever finished its write
    // window.  Directory objects never finish one, so only a missing
    // attribute condemns them.
    let written = match store::get_xattr_u32(path, ATTR_WRITTEN) {
        Ok(w) => w != 0,
        Err(e) => {
            error!(path = %path.display(), error = %e, "recovery: cannot read written attribute");
            if dir_type {
                if let Err(e) = store::remove_tree(path) {
                    error!(path = %path.display(), error = %e, "recovery: cleanup of directory failed");
                }
                return Status::Complete;
            }
            return remove_entry(path);
        }
    };
    if !dir_type && !written {
        error!(path = %path.display(), "recovery: cleaning up un-written cache object");
        return remove_entry(path);
    }
    if written {
        // A crash can land between the attribute write and the
        // permission reset.
        if let Err(e) = store::chmod(path, FILE_RO_MODE) {
            error!(path = %path.display(), error = %e, "recovery: cannot reset permissions");
            return Status::Error;
        }
    }

    let size = match store::get_xattr_u64(path, ATTR_SIZE) {
        Ok(size) => size,
        Err(e) => {
            error!(path = %path.display(), error = %e, "recovery: cannot read size attribute");
            return Status::Error;
        }
    };
    if !dir_type && meta.len() != size {
        error!(
            path = %path.display(),
            declared = size,
            real = meta.len(),
            "recovery: size mismatch, removing object"
        );
        return remove_entry(path);
    }

    let filename = match store::get_xattr(path, ATTR_FILENAME, MAX_FILENAME_LEN)
        .map_err(|e| e.to_string())
        .and_then(|raw| String::from_utf8(raw).map_err(|e| e.to_string()))
    {
        Ok(filename) => filename,
        Err(e) => {
            error!(path = %path.display(), error = %e, "recovery: cannot read filename attribute");
            return Status::Error;
        }
    };

    let cost = match store::get_xattr_u32(path, ATTR_COST) {
        Ok(cost) => cost,
        Err(e) => {
            error!(path = %path.display(), error = %e, "recovery: cannot read cost attribute");
            return Status::Error;
        }
    };

    let lifetime = match store::get_xattr_u64(path, ATTR_LIFETIME) {
        Ok(lifetime) => lifetime,
        Err(e) => {
            error!(path = %path.display(), error = %e, "recovery: cannot read lifetime attribute");
            return Status::Error;
        }
    };

    debug!(
        path = %path.display(),
        id = object_id,
        filename,
        "recovery: rebuilding cache object"
    );
    match set.recovery_insert(&type_name, &filename, object_id, size, cost, lifetime, written) {
        Ok(_) => Status::Complete,
        Err(e) => {
            error!(path = %path.display(), error = %e, "recovery: insert failed");
            Status::Error
        }
    }
}

/// `Type.defaults` instantiates its type (covering types with no cached
/// objects); the sequence-number file is left alone.
fn check_special_file(set: &mut CacheSet, path: &Path, type_name: &str) -> Status {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return Status::Continue;
    };

    if name == TYPE_CONFIG_FILENAME {
        if set.type_exists(type_name) {
            return Status::Complete;
        }
        return match set.define_type(type_name, None, false) {
            Ok(()) => Status::Complete,
            Err(e) => {
                error!(cache_type = type_name, error = %e, "recovery: define from defaults failed");
                let _ = store::unlink(path);
                Status::Error
            }
        };
    }

    if name == SEQ_NUM_FILENAME {
        return Status::Complete;
    }

    Status::Continue
}

/// Define the file's type on demand from its `Type.defaults`.  A file
/// whose type cannot be configured is unrecoverable and is deleted.
fn ensure_type(set: &mut CacheSet, path: &Path, type_name: &str) -> Status {
    if set.type_exists(type_name) {
        return Status::Continue;
    }
    match set.define_type(type_name, None, false) {
        Ok(()) => Status::Continue,
        Err(e) => {
            error!(cache_type = type_name, error = %e, "recovery: cannot define type for file");
            if let Err(e) = store::unlink(path) {
                error!(path = %path.display(), error = %e, "recovery: unlink failed");
            }
            Status::Error
        }
    }
}

fn remove_entry(path: &Path) -> Status {
    let mut status = Status::Complete;
    if let Err(e) = store::unlink(path) {
        error!(path = %path.display(), error = %e, "recovery: unlink failed");
        status = Status::Error;
    }
    if let Some(parent) = path.parent() {
        if let Err(e) = store::remove_dir_if_empty(parent) {
            error!(dir = %parent.display(), error = %e, "recovery: rmdir failed");
        }
    }
    status
}
