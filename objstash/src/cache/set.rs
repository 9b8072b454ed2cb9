//! The root of the cache engine: the set of all cache types.
//!
//! Owns the type map, the global id→type index, the object-id
//! generator and the eviction machinery that crosses type boundaries.
//! Ownership runs strictly downward (set → type → object); operations
//! that touch both a type and the global index are driven from here so
//! the two always stay in step.

use crate::cache::codec::filesystem_file_size;
use crate::cache::object::{CacheObject, Unsubscribed};
use crate::cache::seqnum::SequenceNumber;
use crate::cache::store;
use crate::cache::type_cache::TypeCache;
use crate::cache::types::{
    CacheError, CacheParams, CacheStatus, ObjectId, TypeConfig, DIR_MODE, MAX_OBJECT_ID, SEQ_BITS,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

#[derive(Debug)]
pub struct CacheSet {
    base_dir: PathBuf,
    total_cache_space: u64,
    types: HashMap<String, TypeCache>,
    id_map: HashMap<ObjectId, String>,
    seq: SequenceNumber,
    rng: StdRng,
}

impl CacheSet {
    /// Open a cache set rooted at `base_dir`, creating the directory
    /// mode 0770 when missing.  Failure to create the base directory is
    /// the one fatal startup error.
    pub fn new(base_dir: &Path, total_cache_space: u64) -> Result<Self, CacheError> {
        store::create_dir(base_dir, DIR_MODE)?;

        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1);

        Ok(Self {
            base_dir: base_dir.to_path_buf(),
            total_cache_space,
            types: HashMap::new(),
            id_map: HashMap::new(),
            seq: SequenceNumber::open(base_dir),
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn total_cache_space(&self) -> u64 {
        self.total_cache_space
    }

    /// Define a new cache type.  With `params` absent the type is
    /// configured from its persisted `Type.defaults` (the recovery
    /// path).
    pub fn define_type(
        &mut self,
        type_name: &str,
        params: Option<&CacheParams>,
        dir_type: bool,
    ) -> Result<(), CacheError> {
        if self.types.contains_key(type_name) {
            warn!(cache_type = type_name, "define: type already exists");
            return Err(CacheError::TypeExists(type_name.to_string()));
        }

        let avail = self
            .total_cache_space
            .saturating_sub(self.sum_of_lo_watermarks(None));
        let mut new_type = TypeCache::new(&self.base_dir, type_name);
        if new_type.configure(params, dir_type, avail) {
            info!(cache_type = type_name, "created type");
            self.types.insert(type_name.to_string(), new_type);
            Ok(())
        } else {
            Err(CacheError::Configure(type_name.to_string()))
        }
    }

    /// Reconfigure an existing type.  Parameters may be partial; zero
    /// fields leave the current values.  The dirType flag is fixed at
    /// creation and survives any change.
    pub fn change_type(&mut self, type_name: &str, params: &CacheParams) -> Result<(), CacheError> {
        let avail = self
            .total_cache_space
            .saturating_sub(self.sum_of_lo_watermarks(Some(type_name)));
        let cache = self
            .types
            .get_mut(type_name)
            .ok_or_else(|| CacheError::UnknownType(type_name.to_string()))?;
        let dir_type = cache.is_dir_type();
        if cache.configure(Some(params), dir_type, avail) {
            info!(cache_type = type_name, "configured type");
            Ok(())
        } else {
            Err(CacheError::Configure(type_name.to_string()))
        }
    }

    /// Delete a type and every object in it.  Refused while any object
    /// is pinned.  Returns the space the type occupied.
    pub fn delete_type(&mut self, type_name: &str) -> Result<u64, CacheError> {
        let cache = self
            .types
            .get(type_name)
            .ok_or_else(|| CacheError::UnknownType(type_name.to_string()))?;
        if !cache.is_cleanable() {
            warn!(cache_type = type_name, "delete: type has subscribed objects");
            return Err(CacheError::TypeInUse(type_name.to_string()));
        }

        let freed = cache.cache_size();
        let ids = cache.object_ids();
        for id in ids {
            if !self.expire_cache_object(id) {
                warn!(cache_type = type_name, id, "delete: object still subscribed");
            }
        }

        let Some(cache) = self.types.remove(type_name) else {
            return Ok(freed);
        };
        if let Err(e) = store::unlink(&cache.config_file_path()) {
            warn!(cache_type = type_name, error = %e, "delete: failed to unlink Type.defaults");
        }
        if let Err(e) = store::remove_dir_if_empty(&cache.dir_path()) {
            warn!(cache_type = type_name, error = %e, "delete: failed to remove type directory");
        }

        info!(cache_type = type_name, freed, "deleted type");
        Ok(freed)
    }

    pub fn type_exists(&self, type_name: &str) -> bool {
        self.types.contains_key(type_name)
    }

    pub fn is_dir_type(&self, type_name: &str) -> bool {
        self.types
            .get(type_name)
            .is_some_and(TypeCache::is_dir_type)
    }

    pub fn type_names(&self) -> Vec<String> {
        self.types.keys().cloned().collect()
    }

    pub fn describe_type(&self, type_name: &str) -> Option<TypeConfig> {
        self.types.get(type_name).map(|t| t.config().clone())
    }

    /// Insert a new object, substituting type defaults for zero-valued
    /// fields and evicting within the type if admission initially
    /// fails.  Returns the allocated object id.
    pub fn insert_cache_object(
        &mut self,
        type_name: &str,
        filename: &str,
        size: u64,
        cost: u32,
        lifetime: u64,
    ) -> Result<ObjectId, CacheError> {
        let cache = self
            .types
            .get(type_name)
            .ok_or_else(|| CacheError::UnknownType(type_name.to_string()))?;
        let config = cache.config();
        let size = if size == 0 { config.default_size } else { size };
        let cost = if cost == 0 { config.default_cost } else { cost };
        let lifetime = if lifetime == 0 {
            config.default_lifetime
        } else {
            lifetime
        };

        let fs_size = filesystem_file_size(size) as i64;
        if !self.admissible(type_name, fs_size) {
            info!(cache_type = type_name, needed = fs_size, "cleaning up to make space");
            self.cleanup_type(type_name, fs_size);
        }
        if !self.admissible(type_name, fs_size) {
            warn!(cache_type = type_name, size, "no space for object insert");
            return Err(CacheError::NoSpace { needed: size });
        }

        let id = self.next_object_id();
        self.insert_object(type_name, filename, id, size, cost, lifetime, false, true)?;
        info!(cache_type = type_name, id, filename, "inserted new object");
        Ok(id)
    }

    /// Insert an object rediscovered by the recovery walker, keeping
    /// its original id and persisted metadata.
    #[allow(clippy::too_many_arguments)]
    pub fn recovery_insert(
        &mut self,
        type_name: &str,
        filename: &str,
        id: ObjectId,
        size: u64,
        cost: u32,
        lifetime: u64,
        written: bool,
    ) -> Result<ObjectId, CacheError> {
        self.insert_object(type_name, filename, id, size, cost, lifetime, written, false)?;
        debug!(cache_type = type_name, id, filename, "recovered object");
        Ok(id)
    }

    #[allow(clippy::too_many_arguments)]
    fn insert_object(
        &mut self,
        type_name: &str,
        filename: &str,
        id: ObjectId,
        size: u64,
        cost: u32,
        lifetime: u64,
        written: bool,
        is_new: bool,
    ) -> Result<(), CacheError> {
        let cache = self
            .types
            .get_mut(type_name)
            .ok_or_else(|| CacheError::UnknownType(type_name.to_string()))?;
        let obj = CacheObject::new(
            &self.base_dir,
            type_name,
            id,
            filename,
            size,
            cost,
            lifetime,
            written,
            cache.is_dir_type(),
        );
        if let Err(e) = obj.initialize(is_new) {
            if is_new {
                obj.remove_backing();
            }
            return Err(e);
        }
        cache.insert(obj);
        self.id_map.insert(id, type_name.to_string());
        Ok(())
    }

    /// Pin an object and return the path the caller may open.
    pub fn subscribe_cache_object(&mut self, id: ObjectId) -> Result<PathBuf, CacheError> {
        let type_name = self
            .id_map
            .get(&id)
            .cloned()
            .ok_or(CacheError::UnknownObject(id))?;
        let cache = self
            .types
            .get_mut(&type_name)
            .ok_or(CacheError::UnknownObject(id))?;
        cache.subscribe(id)
    }

    /// Release a pin.  The type is named by the caller (derived from
    /// the path) because orphaned objects have already left the id map
    /// but must still be releasable.
    pub fn unsubscribe_cache_object(
        &mut self,
        type_name: &str,
        id: ObjectId,
    ) -> Result<(), CacheError> {
        let cache = self
            .types
            .get_mut(type_name)
            .ok_or_else(|| CacheError::UnknownType(type_name.to_string()))?;
        let outcome = cache.unsubscribe(id)?;
        if outcome == Unsubscribed::Orphaned {
            self.id_map.remove(&id);
        }
        info!(id, "object unsubscribed");
        Ok(())
    }

    /// Update an object's access time without subscribing.
    pub fn touch(&mut self, id: ObjectId) -> Result<(), CacheError> {
        let type_name = self
            .id_map
            .get(&id)
            .cloned()
            .ok_or(CacheError::UnknownObject(id))?;
        let cache = self
            .types
            .get_mut(&type_name)
            .ok_or(CacheError::UnknownObject(id))?;
        cache.touch(id)
    }

    /// Change the declared size of an object in its write window.  The
    /// returned size may equal the old one, which callers treat as a
    /// refusal.
    pub fn resize(&mut self, id: ObjectId, new_size: u64) -> Result<u64, CacheError> {
        let type_name = self
            .id_map
            .get(&id)
            .cloned()
            .ok_or(CacheError::UnknownObject(id))?;
        let old_size = self
            .types
            .get(&type_name)
            .and_then(|t| t.object(id))
            .map(CacheObject::size)
            .ok_or(CacheError::UnknownObject(id))?;

        let needed = filesystem_file_size(new_size) as i64 - filesystem_file_size(old_size) as i64;
        if !self.admissible(&type_name, needed) {
            info!(id, needed, "resize: cleaning up to make space");
            self.cleanup_type(&type_name, needed);
        }
        if !self.admissible(&type_name, needed) {
            warn!(id, "resize: no space available");
            return Ok(old_size);
        }

        let cache = self
            .types
            .get_mut(&type_name)
            .ok_or(CacheError::UnknownObject(id))?;
        cache.apply_resize(id, new_size)
    }

    /// Expire an object.  Removes the id from the global map first so a
    /// deferred deletion becomes an orphan for the periodic sweep.
    /// Returns true when the cache state satisfies the request, which
    /// includes ids it no longer knows.
    pub fn expire_cache_object(&mut self, id: ObjectId) -> bool {
        let Some(type_name) = self.id_map.remove(&id) else {
            warn!(id, "expire: cache type not found for id");
            return true;
        };
        let Some(cache) = self.types.get_mut(&type_name) else {
            warn!(cache_type = %type_name, id, "expire: no cache for type");
            return true;
        };
        let removed = cache.expire(id);
        if !removed {
            info!(id, "expire deferred, object in use");
        }
        removed
    }

    pub fn type_for_object(&self, id: ObjectId) -> Option<&str> {
        self.id_map.get(&id).map(String::as_str)
    }

    pub fn cached_object_size(&self, id: ObjectId) -> Option<u64> {
        let type_name = self.id_map.get(&id)?;
        self.types
            .get(type_name)?
            .object(id)
            .map(CacheObject::size)
    }

    pub fn cached_object_filename(&self, id: ObjectId) -> Option<String> {
        let type_name = self.id_map.get(&id)?;
        self.types
            .get(type_name)?
            .object(id)
            .map(|o| o.filename().to_string())
    }

    /// Aggregate status across all types.
    pub fn cache_status(&self) -> CacheStatus {
        let size = self.sum_of_cache_sizes();
        let num_objects = self.types.values().map(TypeCache::num_objects).sum();
        CacheStatus {
            num_types: self.types.len() as u64,
            size,
            num_objects,
            avail_space: self.sum_of_lo_watermarks(None).saturating_sub(size),
        }
    }

    pub fn type_status(&self, type_name: &str) -> Option<(u64, u64)> {
        self.types
            .get(type_name)
            .map(|t| (t.cache_size(), t.num_objects()))
    }

    pub fn sum_of_lo_watermarks(&self, exclude: Option<&str>) -> u64 {
        self.types
            .iter()
            .filter(|(name, _)| Some(name.as_str()) != exclude)
            .map(|(_, t)| t.config().lo_watermark)
            .sum()
    }

    pub fn sum_of_cache_sizes(&self) -> u64 {
        self.types.values().map(TypeCache::cache_size).sum()
    }

    /// Global space not yet claimed by any cached object, clamped at
    /// zero.
    fn avail_space(&self) -> u64 {
        self.total_cache_space
            .saturating_sub(self.sum_of_cache_sizes())
    }

    fn admissible(&self, type_name: &str, delta: i64) -> bool {
        self.types
            .get(type_name)
            .is_some_and(|t| t.check_for_size(delta, self.avail_space()))
    }

    /// Evict within one type until `needed` more bytes fit under its
    /// high watermark, then fall back to the cross-type pass when the
    /// global space is still short.
    pub fn cleanup_type(&mut self, type_name: &str, needed: i64) {
        let Some(hi) = self
            .types
            .get(type_name)
            .map(|t| t.config().hi_watermark as i64)
        else {
            return;
        };
        if needed >= hi {
            return;
        }

        loop {
            let over = self
                .types
                .get(type_name)
                .map(|t| t.cache_size() as i64 + needed >= hi)
                .unwrap_or(false);
            if !over || self.cleanup_one(type_name).is_none() {
                break;
            }
        }

        let avail = self.avail_space() as i64;
        if needed > avail {
            self.cleanup_all_types((needed - avail) as u64);
        }
    }

    /// Expire the least recently used expirable object of one type.
    /// Returns the raw size it declared, or `None` when nothing was
    /// expirable.
    fn cleanup_one(&mut self, type_name: &str) -> Option<u64> {
        loop {
            let id = self.types.get_mut(type_name)?.pop_lru_tail()?;
            let size = self
                .types
                .get(type_name)
                .and_then(|t| t.object(id))
                .map(CacheObject::size)
                .unwrap_or(0);
            if self.expire_cache_object(id) {
                info!(cache_type = type_name, id, freed = size, "evicted object");
                return Some(size);
            }
        }
    }

    /// Cross-type eviction: repeatedly expire the candidate with the
    /// lowest cache cost until `needed` filesystem bytes are freed or
    /// no type offers a candidate.  Returns the bytes freed.
    pub fn cleanup_all_types(&mut self, needed: u64) -> u64 {
        let needed = filesystem_file_size(needed);

        let mut candidates: HashMap<String, ObjectId> = self
            .types
            .iter()
            .filter_map(|(name, t)| {
                let id = t.cleanup_candidate();
                (id != 0).then(|| (name.clone(), id))
            })
            .collect();

        let mut cleaned = 0u64;
        while cleaned < needed {
            let victim = candidates
                .iter()
                .filter_map(|(name, &id)| {
                    self.types
                        .get(name)
                        .and_then(|t| t.cache_cost(id))
                        .map(|cost| (name.clone(), id, cost))
                })
                .min_by_key(|&(_, _, cost)| cost);
            let Some((type_name, id, _)) = victim else {
                break;
            };
            candidates.remove(&type_name);

            let size = self
                .types
                .get(&type_name)
                .and_then(|t| t.object(id))
                .map(|o| filesystem_file_size(o.size()))
                .unwrap_or(0);
            if self.expire_cache_object(id) {
                cleaned += size;
            }

            if cleaned < needed {
                if let Some(next) = self
                    .types
                    .get(&type_name)
                    .map(TypeCache::cleanup_candidate)
                    .filter(|&id| id != 0)
                {
                    candidates.insert(type_name, next);
                }
            }
        }

        debug!(cleaned, needed, "cross-type cleanup finished");
        cleaned
    }

    /// Expire every object whose deletion was deferred behind a
    /// subscription.  Run from the periodic maintenance worker.
    pub fn cleanup_orphans(&mut self) {
        for cache in self.types.values_mut() {
            for id in cache.expired_object_ids() {
                cache.expire(id);
            }
        }
    }

    /// Expire every unsubscribed object of every directory type.
    /// Directory objects are single-shot; this sweep reclaims them.
    pub fn cleanup_dir_types(&mut self) {
        let dir_types: Vec<String> = self
            .types
            .iter()
            .filter(|(_, t)| t.is_dir_type())
            .map(|(name, _)| name.clone())
            .collect();

        for type_name in dir_types {
            let Some(cache) = self.types.get(&type_name) else {
                continue;
            };
            let ids = cache.unsubscribed_object_ids();
            if !ids.is_empty() {
                info!(cache_type = %type_name, count = ids.len(), "cleaning directory type");
            }
            for id in ids {
                let already_expired = self
                    .types
                    .get(&type_name)
                    .and_then(|t| t.object(id))
                    .is_some_and(CacheObject::is_expired);
                if already_expired {
                    if let Some(cache) = self.types.get_mut(&type_name) {
                        cache.expire(id);
                    }
                } else {
                    self.expire_cache_object(id);
                }
            }
        }
    }

    /// Size-check a subscribed object that is still being written.
    /// Run from the maintenance worker for every live subscription.
    pub fn validate_subscribed(&self, type_name: &str, id: ObjectId) {
        let Some(obj) = self.types.get(type_name).and_then(|t| t.object(id)) else {
            warn!(cache_type = type_name, id, "validate: object does not exist");
            return;
        };
        if !obj.is_written() {
            obj.validate();
        }
    }

    /// When recovery rebuilt more state than the configured total
    /// space, evict the overrun before serving requests.
    pub fn cleanup_at_startup(&mut self) {
        let used = self.sum_of_cache_sizes();
        if used > self.total_cache_space {
            let overrun = used - self.total_cache_space;
            warn!(overrun, "cache overruns total space after recovery");
            self.cleanup_all_types(overrun);
        }
    }

    /// Allocate an object id: random high bits over the reserved
    /// sequence counter.  Regenerates on range violations and on
    /// collision with a live id.
    pub fn next_object_id(&mut self) -> ObjectId {
        loop {
            let high: u32 = self.rng.gen();
            let id = (u64::from(high) << SEQ_BITS) | self.seq.current();
            self.seq.advance();
            if id >= 1 && id <= MAX_OBJECT_ID && !self.id_map.contains_key(&id) {
                return id;
            }
            warn!(id, "regenerating invalid or colliding object id");
        }
    }

    #[cfg(test)]
    pub(crate) fn backdate_object(&mut self, id: ObjectId, secs: u64) {
        let type_name = self.id_map.get(&id).cloned().unwrap();
        self.types
            .get_mut(&type_name)
            .unwrap()
            .object_mut(id)
            .unwrap()
            .backdate_last_access(secs);
    }
}
