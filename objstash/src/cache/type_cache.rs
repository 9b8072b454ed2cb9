//! All cached objects of one type: LRU ordering, watermark accounting
//! and the persisted `Type.defaults` configuration.
//!
//! Cross-type concerns (the global id map, eviction that spans types)
//! live on [`crate::cache::CacheSet`]; this layer owns only the
//! per-type state and exposes the primitives the set drives.

use crate::cache::codec::filesystem_file_size;
use crate::cache::object::{CacheObject, Unsubscribed};
use crate::cache::store;
use crate::cache::types::{
    CacheError, CacheParams, ObjectId, TypeConfig, DIR_MODE, MAX_COST, TYPE_CONFIG_FILENAME,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

const LABEL_LO_WATERMARK: &str = "loWatermark";
const LABEL_HI_WATERMARK: &str = "hiWatermark";
const LABEL_DEFAULT_SIZE: &str = "defaultSize";
const LABEL_DEFAULT_COST: &str = "defaultCost";
const LABEL_DEFAULT_LIFETIME: &str = "defaultLifetime";
const LABEL_DIR_TYPE: &str = "dirType";
const NUM_LABELS: usize = 6;

/// The objects of a single cache type.
#[derive(Debug)]
pub struct TypeCache {
    type_name: String,
    base_dir: PathBuf,
    config: TypeConfig,
    objects: HashMap<ObjectId, CacheObject>,
    /// Recency order, front = most recently used.
    lru: VecDeque<ObjectId>,
    cache_size: u64,
    num_objects: u64,
}

impl TypeCache {
    pub fn new(base_dir: &Path, type_name: &str) -> Self {
        Self {
            type_name: type_name.to_string(),
            base_dir: base_dir.to_path_buf(),
            config: TypeConfig::default(),
            objects: HashMap::new(),
            lru: VecDeque::new(),
            cache_size: 0,
            num_objects: 0,
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn config(&self) -> &TypeConfig {
        &self.config
    }

    pub fn is_dir_type(&self) -> bool {
        self.config.dir_type
    }

    pub fn cache_size(&self) -> u64 {
        self.cache_size
    }

    pub fn num_objects(&self) -> u64 {
        self.num_objects
    }

    pub fn dir_path(&self) -> PathBuf {
        self.base_dir.join(&self.type_name)
    }

    pub fn config_file_path(&self) -> PathBuf {
        self.dir_path().join(TYPE_CONFIG_FILENAME)
    }

    /// Apply a configuration.  With `params` absent the persisted
    /// `Type.defaults` file is loaded instead.  `avail_space` is the
    /// total cache space minus the other types' low watermarks; a low
    /// watermark that does not fit is rejected with no state change.
    ///
    /// Fields apply individually: positive values take effect
    /// (watermarks rounded to filesystem blocks), zero leaves the
    /// current value, negative is logged and ignored.
    pub fn configure(
        &mut self,
        params: Option<&CacheParams>,
        dir_type: bool,
        avail_space: u64,
    ) -> bool {
        let Some(params) = params else {
            debug!(cache_type = %self.type_name, "configuring from Type.defaults");
            return self.read_config();
        };

        let requested_lo = filesystem_file_size(params.lo_watermark.max(0) as u64);
        if requested_lo > avail_space {
            warn!(
                cache_type = %self.type_name,
                requested = requested_lo,
                avail = avail_space,
                "not enough cache space to configure type"
            );
            return false;
        }

        if params.lo_watermark > 0 {
            self.config.lo_watermark = filesystem_file_size(params.lo_watermark as u64);
            debug!(cache_type = %self.type_name, lo = self.config.lo_watermark, "low watermark set");
        } else if params.lo_watermark < 0 {
            error!(
                cache_type = %self.type_name,
                value = params.lo_watermark,
                "ignoring invalid low watermark"
            );
        }
        if params.hi_watermark > 0 {
            self.config.hi_watermark = filesystem_file_size(params.hi_watermark as u64);
            debug!(cache_type = %self.type_name, hi = self.config.hi_watermark, "high watermark set");
        } else if params.hi_watermark < 0 {
            error!(
                cache_type = %self.type_name,
                value = params.hi_watermark,
                "ignoring invalid high watermark"
            );
        }
        if params.default_size > 0 {
            self.config.default_size = params.default_size as u64;
        } else if params.default_size < 0 {
            error!(
                cache_type = %self.type_name,
                value = params.default_size,
                "ignoring invalid default size"
            );
        }
        if params.default_lifetime > 1 {
            self.config.default_lifetime = params.default_lifetime as u64;
        }
        if params.default_cost > 0 {
            self.config.default_cost = (params.default_cost as u64).min(u64::from(MAX_COST)) as u32;
        }
        self.config.dir_type = dir_type;

        self.write_config()
    }

    /// Persist the configuration to `Type.defaults` via a temp file,
    /// fsync and rename.
    fn write_config(&self) -> bool {
        let dir = self.dir_path();
        if let Err(e) = store::create_dir(&dir, DIR_MODE) {
            error!(dir = %dir.display(), error = %e, "failed to create type directory");
            return false;
        }

        let mut contents = String::new();
        let _ = writeln!(contents, "{} {}", LABEL_LO_WATERMARK, self.config.lo_watermark);
        let _ = writeln!(contents, "{} {}", LABEL_HI_WATERMARK, self.config.hi_watermark);
        let _ = writeln!(contents, "{} {}", LABEL_DEFAULT_SIZE, self.config.default_size);
        let _ = writeln!(contents, "{} {}", LABEL_DEFAULT_COST, self.config.default_cost);
        let _ = writeln!(
            contents,
            "{} {}",
            LABEL_DEFAULT_LIFETIME, self.config.default_lifetime
        );
        let _ = writeln!(
            contents,
            "{} {}",
            LABEL_DIR_TYPE,
            u8::from(self.config.dir_type)
        );

        let path = self.config_file_path();
        match store::write_atomic(&path, &contents) {
            Ok(()) => {
                info!(path = %path.display(), "wrote type configuration");
                true
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "failed to write type configuration");
                false
            }
        }
    }

    /// Load the configuration from `Type.defaults`.  A missing or
    /// partial file fails the load.
    fn read_config(&mut self) -> bool {
        let path = self.config_file_path();
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) => {
                error!(path = %path.display(), error = %e, "failed to open type configuration");
                return false;
            }
        };

        let mut seen = HashSet::new();
        let mut tokens = contents.split_whitespace();
        while let Some(label) = tokens.next() {
            let Some(value) = tokens.next().and_then(|v| v.parse::<u64>().ok()) else {
                break;
            };
            match label {
                LABEL_LO_WATERMARK => self.config.lo_watermark = value,
                LABEL_HI_WATERMARK => self.config.hi_watermark = value,
                LABEL_DEFAULT_SIZE => self.config.default_size = value,
                LABEL_DEFAULT_COST => self.config.default_cost = value.min(u64::from(MAX_COST)) as u32,
                LABEL_DEFAULT_LIFETIME => self.config.default_lifetime = value,
                LABEL_DIR_TYPE => self.config.dir_type = value != 0,
                _ => continue,
            }
            seen.insert(label);
        }

        if seen.len() != NUM_LABELS {
            error!(path = %path.display(), "incomplete type configuration");
            return false;
        }
        info!(path = %path.display(), "read type configuration");
        true
    }

    /// Enter a new object: front of the LRU, counted into the cache
    /// size.  Returns the object count.
    pub fn insert(&mut self, obj: CacheObject) -> u64 {
        let id = obj.id();
        self.cache_size += filesystem_file_size(obj.size());
        self.lru.push_front(id);
        self.objects.insert(id, obj);
        self.num_objects += 1;
        info!(
            cache_type = %self.type_name,
            id,
            cache_size = self.cache_size,
            count = self.num_objects,
            "object inserted"
        );
        self.objects.len() as u64
    }

    pub fn object(&self, id: ObjectId) -> Option<&CacheObject> {
        self.objects.get(&id)
    }

    pub fn object_mut(&mut self, id: ObjectId) -> Option<&mut CacheObject> {
        self.objects.get_mut(&id)
    }

    pub fn object_ids(&self) -> Vec<ObjectId> {
        self.objects.keys().copied().collect()
    }

    /// Ids of objects already marked expired (deferred deletions).
    pub fn expired_object_ids(&self) -> Vec<ObjectId> {
        self.objects
            .iter()
            .filter(|(_, o)| o.is_expired())
            .map(|(&id, _)| id)
            .collect()
    }

    /// Ids of objects with no active subscription.
    pub fn unsubscribed_object_ids(&self) -> Vec<ObjectId> {
        self.objects
            .iter()
            .filter(|(_, o)| o.subscription_count() == 0)
            .map(|(&id, _)| id)
            .collect()
    }

    /// Subscribe to an object; success promotes it to the LRU front.
    pub fn subscribe(&mut self, id: ObjectId) -> Result<PathBuf, CacheError> {
        let obj = self
            .objects
            .get_mut(&id)
            .ok_or(CacheError::UnknownObject(id))?;
        let path = obj.subscribe()?;
        self.promote(id);
        Ok(path)
    }

    /// Release a subscription, folding any declared-size change into
    /// the accounting.
    pub fn unsubscribe(&mut self, id: ObjectId) -> Result<Unsubscribed, CacheError> {
        let obj = self
            .objects
            .get_mut(&id)
            .ok_or(CacheError::UnknownObject(id))?;
        let size_before = filesystem_file_size(obj.size());
        let outcome = obj.unsubscribe();
        let size_after = filesystem_file_size(obj.size());
        if size_after != size_before {
            self.cache_size = self.cache_size - size_before + size_after;
            info!(
                cache_type = %self.type_name,
                id,
                cache_size = self.cache_size,
                "adjusted cache size for finalized object"
            );
        }
        match outcome {
            Unsubscribed::Released => self.promote(id),
            Unsubscribed::Orphaned => self.remove_from_lru(id),
        }
        Ok(outcome)
    }

    /// Update an object's access time and promote it.
    pub fn touch(&mut self, id: ObjectId) -> Result<(), CacheError> {
        let obj = self
            .objects
            .get_mut(&id)
            .ok_or(CacheError::UnknownObject(id))?;
        obj.touch();
        self.promote(id);
        Ok(())
    }

    /// Apply a resize whose space the caller has already admitted.
    /// Returns the resulting size; an unchanged size means the object
    /// refused.
    pub fn apply_resize(&mut self, id: ObjectId, new_size: u64) -> Result<u64, CacheError> {
        let obj = self
            .objects
            .get_mut(&id)
            .ok_or(CacheError::UnknownObject(id))?;
        let size_before = filesystem_file_size(obj.size());
        let final_size = obj.resize(new_size);
        let size_after = filesystem_file_size(obj.size());
        if size_after != size_before {
            self.cache_size = self.cache_size - size_before + size_after;
            self.promote(id);
            info!(cache_type = %self.type_name, id, size = final_size, "object resized");
        }
        Ok(final_size)
    }

    /// Expire an object.  Returns true when the object is gone from the
    /// type (also for ids the type no longer knows, since the cache
    /// state already satisfies the request); false when deletion is
    /// deferred behind active subscriptions.
    pub fn expire(&mut self, id: ObjectId) -> bool {
        let Some(obj) = self.objects.get(&id) else {
            warn!(cache_type = %self.type_name, id, "expire: object does not exist");
            return true;
        };

        if !obj.is_expired() {
            self.remove_from_lru(id);
        }

        let Some(obj) = self.objects.get_mut(&id) else {
            return true;
        };
        let size = filesystem_file_size(obj.size());
        if obj.expire() {
            self.objects.remove(&id);
            self.num_objects = self.num_objects.saturating_sub(1);
            self.cache_size = self.cache_size.saturating_sub(size);
            info!(cache_type = %self.type_name, id, "object removed from cache");
            true
        } else {
            info!(cache_type = %self.type_name, id, "object expired but still in use");
            false
        }
    }

    /// Admission check for `delta` additional bytes.  Strictly below
    /// the high watermark, and within the global space the set reports
    /// as available.
    pub fn check_for_size(&self, delta: i64, avail_space: u64) -> bool {
        (self.cache_size as i64 + delta) < self.config.hi_watermark as i64
            && delta <= avail_space as i64
    }

    /// The least recently used object id, offered for cross-type
    /// eviction only while this type sits above its low watermark.
    pub fn cleanup_candidate(&self) -> ObjectId {
        if self.cache_size > self.config.lo_watermark {
            self.lru.back().copied().unwrap_or(0)
        } else {
            0
        }
    }

    /// Pop the LRU tail for the set's per-type cleanup loop.
    pub fn pop_lru_tail(&mut self) -> Option<ObjectId> {
        self.lru.pop_back()
    }

    pub fn lru_front(&self) -> Option<ObjectId> {
        self.lru.front().copied()
    }

    pub fn lru_contains(&self, id: ObjectId) -> bool {
        self.lru.contains(&id)
    }

    pub fn cache_cost(&self, id: ObjectId) -> Option<u64> {
        self.objects.get(&id).map(CacheObject::cache_cost)
    }

    /// A type is cleanable when none of its objects are pinned.
    pub fn is_cleanable(&self) -> bool {
        self.objects.values().all(|o| o.subscription_count() == 0)
    }

    fn promote(&mut self, id: ObjectId) {
        if let Some(pos) = self.lru.iter().position(|&x| x == id) {
            self.lru.remove(pos);
            self.lru.push_front(id);
        }
    }

    fn remove_from_lru(&mut self, id: ObjectId) {
        if let Some(pos) = self.lru.iter().position(|&x| x == id) {
            self.lru.remove(pos);
        }
    }
}
