//! Subscription handles: the pins callers hold on cache objects.
//!
//! A handle is a separate value owned by the request layer, never by
//! the object it pins.  Dropping it (the caller went away, or released
//! explicitly) performs the unsubscribe on the engine and removes the
//! entry from the shared registry the maintenance worker scans.

use crate::cache::set::CacheSet;
use crate::cache::types::ObjectId;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

pub type SharedCacheSet = Arc<Mutex<CacheSet>>;

#[derive(Debug, Clone)]
pub struct SubscriptionEntry {
    pub type_name: String,
    pub id: ObjectId,
    pub path: PathBuf,
}

/// Registry of live subscriptions, shared between the router (which
/// adds and removes entries) and the maintenance worker (which
/// validates every subscribed object).
#[derive(Debug, Clone, Default)]
pub struct SubscriptionRegistry {
    inner: Arc<Mutex<Vec<SubscriptionEntry>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, entry: SubscriptionEntry) {
        if let Ok(mut entries) = self.inner.lock() {
            entries.push(entry);
        }
    }

    fn deregister(&self, id: ObjectId, path: &Path) {
        if let Ok(mut entries) = self.inner.lock() {
            if let Some(pos) = entries.iter().position(|e| e.id == id && e.path == path) {
                entries.remove(pos);
                info!(id, path = %path.display(), "removed subscription");
            }
        }
    }

    /// Snapshot of the live subscriptions.
    pub fn entries(&self) -> Vec<SubscriptionEntry> {
        self.inner.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A live pin on one cache object.  Dropping the handle releases the
/// pin: the engine unsubscribe runs and the registry entry goes away.
#[derive(Debug)]
pub struct SubscriptionHandle {
    set: SharedCacheSet,
    registry: SubscriptionRegistry,
    type_name: String,
    id: ObjectId,
    path: PathBuf,
}

impl SubscriptionHandle {
    pub fn new(
        set: SharedCacheSet,
        registry: SubscriptionRegistry,
        type_name: String,
        id: ObjectId,
        path: PathBuf,
    ) -> Self {
        registry.register(SubscriptionEntry {
            type_name: type_name.clone(),
            id,
            path: path.clone(),
        });
        Self {
            set,
            registry,
            type_name,
            id,
            path,
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.registry.deregister(self.id, &self.path);
        match self.set.lock() {
            Ok(mut set) => {
                if let Err(e) = set.unsubscribe_cache_object(&self.type_name, self.id) {
                    warn!(id = self.id, error = %e, "unsubscribe on drop failed");
                }
            }
            Err(_) => warn!(id = self.id, "cache set lock poisoned, pin leaked"),
        }
    }
}
