//! Dispatch of named service operations onto the cache engine.
//!
//! This layer validates arguments, translates engine failures into the
//! stable error taxonomy and assembles replies.  It carries no cache
//! logic of its own; every path-named call re-derives the object id
//! from the pathname and checks that the path's type segment still
//! matches the engine's id map.

use crate::cache::codec::{self, filesystem_file_size};
use crate::cache::types::{CacheParams, ObjectId, MAX_COST};
use crate::service::copier;
use crate::service::error::{ErrorCode, ReplyError};
use crate::service::request::{Request, Response, Success};
use crate::service::subscription::{SharedCacheSet, SubscriptionHandle, SubscriptionRegistry};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Outcome of one dispatched request.  A subscription handle is
/// produced by the subscribe-carrying operations; the caller owns it
/// and its drop releases the pin.
#[derive(Debug)]
pub struct Dispatched {
    pub response: Response,
    pub subscription: Option<SubscriptionHandle>,
}

impl Dispatched {
    fn reply(response: impl Into<Response>) -> Self {
        Self {
            response: response.into(),
            subscription: None,
        }
    }

    fn with_subscription(success: Success, handle: SubscriptionHandle) -> Self {
        Self {
            response: Response::Success(success),
            subscription: Some(handle),
        }
    }
}

pub struct Router {
    set: SharedCacheSet,
    subscriptions: SubscriptionRegistry,
    download_dir: PathBuf,
}

impl Router {
    pub fn new(set: SharedCacheSet, subscriptions: SubscriptionRegistry, download_dir: PathBuf) -> Self {
        Self {
            set,
            subscriptions,
            download_dir,
        }
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.subscriptions
    }

    pub fn shared_set(&self) -> SharedCacheSet {
        std::sync::Arc::clone(&self.set)
    }

    /// Handle one request.  `privileged` gates the operations reserved
    /// for trusted callers (dirType creation, copying out of the
    /// cache).
    pub async fn dispatch(&self, request: Request, privileged: bool) -> Dispatched {
        debug!(?request, privileged, "dispatching request");
        match request {
            Request::DefineType {
                type_name,
                lo_watermark,
                hi_watermark,
                size,
                cost,
                lifetime,
                dir_type,
            } => Dispatched::reply(self.define_type(
                &type_name,
                lo_watermark,
                hi_watermark,
                size,
                cost,
                lifetime,
                dir_type,
                privileged,
            )),
            Request::ChangeType {
                type_name,
                lo_watermark,
                hi_watermark,
                size,
                cost,
                lifetime,
            } => Dispatched::reply(self.change_type(
                &type_name,
                lo_watermark,
                hi_watermark,
                size,
                cost,
                lifetime,
            )),
            Request::DeleteType { type_name } => Dispatched::reply(self.delete_type(&type_name)),
            Request::DescribeType { type_name } => {
                Dispatched::reply(self.describe_type(&type_name))
            }
            Request::InsertCacheObject {
                type_name,
                file_name,
                size,
                cost,
                lifetime,
                subscribe,
            } => self.insert_cache_object(&type_name, &file_name, size, cost, lifetime, subscribe),
            Request::ResizeCacheObject {
                path_name,
                new_size,
            } => Dispatched::reply(self.resize_cache_object(&path_name, new_size)),
            Request::ExpireCacheObject { path_name } => {
                Dispatched::reply(self.expire_cache_object(&path_name))
            }
            Request::SubscribeCacheObject {
                path_name,
                subscribe,
            } => self.subscribe_cache_object(&path_name, subscribe),
            Request::TouchCacheObject { path_name } => {
                Dispatched::reply(self.touch_cache_object(&path_name))
            }
            Request::CopyCacheObject {
                path_name,
                destination,
                file_name,
            } => Dispatched::reply(
                self.copy_cache_object(&path_name, destination, file_name, privileged)
                    .await,
            ),
            Request::GetCacheStatus => Dispatched::reply(self.cache_status()),
            Request::GetCacheTypeStatus { type_name } => {
                Dispatched::reply(self.cache_type_status(&type_name))
            }
            Request::GetCacheObjectSize { path_name } => {
                Dispatched::reply(self.object_size(&path_name))
            }
            Request::GetCacheObjectFilename { path_name } => {
                Dispatched::reply(self.object_filename(&path_name))
            }
            Request::GetCacheTypes => Dispatched::reply(self.cache_types()),
            Request::GetVersion => Dispatched::reply(Ok::<_, ReplyError>(Success::Version {
                version: crate::INTERFACE_VERSION.to_string(),
            })),
        }
    }

    fn validate_type_name(type_name: &str) -> Result<(), ReplyError> {
        if type_name.is_empty() || type_name.len() > 64 {
            return Err(ReplyError::invalid_params(
                "typeName must be 1 to 64 characters.",
            ));
        }
        if type_name.starts_with('.') {
            return Err(ReplyError::invalid_params(
                "typeName must not start with a '.'.",
            ));
        }
        Ok(())
    }

    fn validate_object_fields(size: i64, cost: i64, lifetime: i64) -> Result<(), ReplyError> {
        if size < 0 {
            return Err(ReplyError::invalid_params("size must not be negative."));
        }
        if cost < 0 || cost > i64::from(MAX_COST) {
            return Err(ReplyError::invalid_params(
                "cost must be in the range of 0 to 100.",
            ));
        }
        if lifetime < 0 {
            return Err(ReplyError::invalid_params("lifetime must not be negative."));
        }
        Ok(())
    }

    fn derive_id(path_name: &str) -> Result<ObjectId, ReplyError> {
        let id = codec::object_id_from_path(Path::new(path_name));
        if id == 0 {
            return Err(ReplyError::exists(
                "Invalid object id derived from pathname.",
            ));
        }
        Ok(id)
    }

    #[allow(clippy::too_many_arguments)]
    fn define_type(
        &self,
        type_name: &str,
        lo_watermark: i64,
        hi_watermark: i64,
        size: i64,
        cost: i64,
        lifetime: i64,
        dir_type: bool,
        privileged: bool,
    ) -> Result<Success, ReplyError> {
        Self::validate_type_name(type_name)?;
        Self::validate_object_fields(size, cost, lifetime)?;
        if lo_watermark <= 0 {
            return Err(ReplyError::invalid_params(
                "loWatermark must be greater than 0.",
            ));
        }
        if hi_watermark <= lo_watermark {
            return Err(ReplyError::invalid_params(
                "hiWatermark must be greater than loWatermark.",
            ));
        }
        if dir_type && !privileged {
            return Err(ReplyError::invalid_params(
                "specifying dirType not authorized.",
            ));
        }

        let params = CacheParams::new(lo_watermark, hi_watermark, size, cost, lifetime);
        let mut set = self.set.lock().unwrap();
        if set.type_exists(type_name) {
            return Err(ReplyError::exists(format!(
                "Type '{type_name}' already exists."
            )));
        }
        set.define_type(type_name, Some(&params), dir_type)
            .map_err(|e| ReplyError::from_engine(ErrorCode::Define, &e))?;
        Ok(Success::Ack {})
    }

    fn change_type(
        &self,
        type_name: &str,
        lo_watermark: i64,
        hi_watermark: i64,
        size: i64,
        cost: i64,
        lifetime: i64,
    ) -> Result<Success, ReplyError> {
        Self::validate_object_fields(size, cost, lifetime)?;
        if lo_watermark < 0 {
            return Err(ReplyError::invalid_params(
                "loWatermark must not be negative.",
            ));
        }
        if hi_watermark != 0 && hi_watermark <= lo_watermark {
            return Err(ReplyError::invalid_params(
                "hiWatermark must be greater than loWatermark.",
            ));
        }

        let params = CacheParams::new(lo_watermark, hi_watermark, size, cost, lifetime);
        let mut set = self.set.lock().unwrap();
        set.change_type(type_name, &params)
            .map_err(|e| ReplyError::from_engine(ErrorCode::Change, &e))?;
        Ok(Success::Ack {})
    }

    fn delete_type(&self, type_name: &str) -> Result<Success, ReplyError> {
        let mut set = self.set.lock().unwrap();
        let freed_space = set
            .delete_type(type_name)
            .map_err(|e| ReplyError::from_engine(ErrorCode::Delete, &e))?;
        Ok(Success::FreedSpace { freed_space })
    }

    fn describe_type(&self, type_name: &str) -> Result<Success, ReplyError> {
        let set = self.set.lock().unwrap();
        let config = set.describe_type(type_name).ok_or_else(|| {
            ReplyError::exists(format!("Type '{type_name}' does not exist."))
        })?;
        Ok(Success::TypeDescription {
            lo_watermark: config.lo_watermark,
            hi_watermark: config.hi_watermark,
            size: config.default_size,
            cost: config.default_cost,
            lifetime: config.default_lifetime,
        })
    }

    fn insert_cache_object(
        &self,
        type_name: &str,
        file_name: &str,
        size: i64,
        cost: i64,
        lifetime: i64,
        subscribe: bool,
    ) -> Dispatched {
        match self.try_insert(type_name, file_name, size, cost, lifetime, subscribe) {
            Ok(dispatched) => dispatched,
            Err(error) => Dispatched::reply(error),
        }
    }

    fn try_insert(
        &self,
        type_name: &str,
        file_name: &str,
        size: i64,
        cost: i64,
        lifetime: i64,
        subscribe: bool,
    ) -> Result<Dispatched, ReplyError> {
        let mut set = self.set.lock().unwrap();
        if !set.type_exists(type_name) {
            return Err(ReplyError::invalid_params(format!(
                "No type '{type_name}' defined."
            )));
        }
        let config = set.describe_type(type_name).ok_or_else(|| {
            ReplyError::invalid_params(format!("No type '{type_name}' defined."))
        })?;

        // Substitute type defaults for zero-valued fields before
        // validating, as the effective values are what must hold.
        let size = if size == 0 { config.default_size as i64 } else { size };
        let cost = if cost == 0 { i64::from(config.default_cost) } else { cost };
        let lifetime = if lifetime == 0 {
            config.default_lifetime as i64
        } else {
            lifetime
        };

        if size <= 0 {
            return Err(ReplyError::invalid_params("size must be greater than 0."));
        }
        if config.dir_type && (size as u64) <= filesystem_file_size(1) {
            return Err(ReplyError::invalid_params(
                "size must be greater than 1 block when dirType = true.",
            ));
        }
        Self::validate_object_fields(size, cost, lifetime)?;
        if file_name.contains('/') {
            return Err(ReplyError::invalid_params(
                "fileName must not contain a '/'.",
            ));
        }

        let id = set
            .insert_cache_object(type_name, file_name, size as u64, cost as u32, lifetime as u64)
            .map_err(|e| ReplyError::from_engine(ErrorCode::Exists, &e))?;

        if subscribe {
            let path = set.subscribe_cache_object(id).map_err(|e| {
                ReplyError::exists(format!("SubscribeCacheObject: {e}"))
            })?;
            drop(set);
            let handle = SubscriptionHandle::new(
                self.shared_set(),
                self.subscriptions.clone(),
                type_name.to_string(),
                id,
                path.clone(),
            );
            Ok(Dispatched::with_subscription(
                Success::Inserted {
                    path_name: path.to_string_lossy().into_owned(),
                    subscribed: Some(true),
                },
                handle,
            ))
        } else {
            let path = codec::build_pathname(set.base_dir(), type_name, id, file_name, false)
                .map_err(|e| ReplyError::from_engine(ErrorCode::Exists, &e))?;
            Ok(Dispatched::reply(Success::Inserted {
                path_name: path.to_string_lossy().into_owned(),
                subscribed: None,
            }))
        }
    }

    fn resize_cache_object(&self, path_name: &str, new_size: i64) -> Result<Success, ReplyError> {
        if new_size <= 0 {
            return Err(ReplyError::invalid_params("size must be greater than 0."));
        }
        let id = Self::derive_id(path_name)?;

        let mut set = self.set.lock().unwrap();
        let path_type = codec::type_name_from_path(set.base_dir(), Path::new(path_name));
        if path_type.as_deref() != set.type_for_object(id) || path_type.is_none() {
            return Err(ReplyError::exists("pathName no longer found in cache."));
        }

        let final_size = set
            .resize(id, new_size as u64)
            .map_err(|e| ReplyError::from_engine(ErrorCode::Exists, &e))?;
        if final_size == new_size as u64 {
            Ok(Success::Resized {
                new_size: final_size,
            })
        } else {
            Err(ReplyError::new(
                ErrorCode::Resize,
                "Unable to resize object.",
            ))
        }
    }

    fn expire_cache_object(&self, path_name: &str) -> Result<Success, ReplyError> {
        let id = Self::derive_id(path_name)?;

        let mut set = self.set.lock().unwrap();
        let path_type = codec::type_name_from_path(set.base_dir(), Path::new(path_name));
        let Some(path_type) = path_type else {
            return Err(ReplyError::exists("pathName no longer found in cache."));
        };

        if set.type_for_object(id) != Some(path_type.as_str()) {
            // The object is already gone; the cache state satisfies
            // the request.
            warn!(path = path_name, "expire of unknown object treated as success");
            return Ok(Success::Ack {});
        }

        if set.expire_cache_object(id) {
            Ok(Success::Ack {})
        } else {
            Err(ReplyError::new(
                ErrorCode::InUse,
                "Expire deferred, object in use.",
            ))
        }
    }

    fn subscribe_cache_object(&self, path_name: &str, subscribe: bool) -> Dispatched {
        let result = (|| {
            if !subscribe {
                return Err(ReplyError::invalid_params("subscribe must be true."));
            }
            let id = Self::derive_id(path_name)?;

            let mut set = self.set.lock().unwrap();
            let path_type = codec::type_name_from_path(set.base_dir(), Path::new(path_name));
            if path_type.as_deref() != set.type_for_object(id) || path_type.is_none() {
                return Err(ReplyError::exists("pathName no longer found in cache."));
            }
            let type_name = path_type.unwrap_or_default();

            let path = set
                .subscribe_cache_object(id)
                .map_err(|e| ReplyError::exists(format!("SubscribeCacheObject: {e}")))?;
            drop(set);
            Ok(SubscriptionHandle::new(
                self.shared_set(),
                self.subscriptions.clone(),
                type_name,
                id,
                path,
            ))
        })();

        match result {
            Ok(handle) => {
                Dispatched::with_subscription(Success::Subscribed { subscribed: true }, handle)
            }
            Err(error) => Dispatched::reply(error),
        }
    }

    fn touch_cache_object(&self, path_name: &str) -> Result<Success, ReplyError> {
        let id = Self::derive_id(path_name)?;

        let mut set = self.set.lock().unwrap();
        let path_type = codec::type_name_from_path(set.base_dir(), Path::new(path_name));
        if path_type.as_deref() != set.type_for_object(id) || path_type.is_none() {
            return Err(ReplyError::exists("pathName no longer found in cache."));
        }
        set.touch(id)
            .map_err(|_| ReplyError::exists("Could not locate object."))?;
        Ok(Success::Ack {})
    }

    async fn copy_cache_object(
        &self,
        path_name: &str,
        destination: Option<String>,
        file_name: Option<String>,
        privileged: bool,
    ) -> Result<Success, ReplyError> {
        if !privileged {
            return Err(ReplyError::new(
                ErrorCode::Perm,
                "CopyCacheObject not authorized.",
            ));
        }
        let id = Self::derive_id(path_name)?;

        let file_name = {
            let set = self.set.lock().unwrap();
            let path_type = codec::type_name_from_path(set.base_dir(), Path::new(path_name));
            if path_type.as_deref() != set.type_for_object(id) || path_type.is_none() {
                return Err(ReplyError::exists("pathName no longer found in cache."));
            }
            if set.cached_object_size(id).is_none() {
                return Err(ReplyError::exists("Could not locate object."));
            }
            match file_name.filter(|f| !f.is_empty()) {
                Some(name) => name,
                None => set.cached_object_filename(id).filter(|f| !f.is_empty()).ok_or_else(
                    || ReplyError::new(ErrorCode::Argument, "No fileName specified or found."),
                )?,
            }
        };

        let destination = destination
            .filter(|d| !d.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| self.download_dir.clone());

        let target = copier::copy_object(Path::new(path_name), &destination, &file_name).await?;
        Ok(Success::Copied {
            new_path_name: target.to_string_lossy().into_owned(),
        })
    }

    fn cache_status(&self) -> Result<Success, ReplyError> {
        let set = self.set.lock().unwrap();
        let status = set.cache_status();
        Ok(Success::Status {
            num_types: status.num_types,
            size: status.size,
            num_objs: status.num_objects,
            avail_space: status.avail_space,
        })
    }

    fn cache_type_status(&self, type_name: &str) -> Result<Success, ReplyError> {
        let set = self.set.lock().unwrap();
        let (size, num_objs) = set.type_status(type_name).ok_or_else(|| {
            ReplyError::exists(format!("Type '{type_name}' does not exist."))
        })?;
        Ok(Success::TypeStatus { size, num_objs })
    }

    fn object_size(&self, path_name: &str) -> Result<Success, ReplyError> {
        let id = Self::derive_id(path_name)?;
        let set = self.set.lock().unwrap();
        let size = set.cached_object_size(id).ok_or_else(|| {
            ReplyError::exists(format!("Object '{path_name}' does not exist."))
        })?;
        Ok(Success::ObjectSize { size })
    }

    fn object_filename(&self, path_name: &str) -> Result<Success, ReplyError> {
        let id = Self::derive_id(path_name)?;
        let set = self.set.lock().unwrap();
        let file_name = set.cached_object_filename(id).ok_or_else(|| {
            ReplyError::exists(format!("Object '{path_name}' does not exist."))
        })?;
        Ok(Success::ObjectFilename { file_name })
    }

    fn cache_types(&self) -> Result<Success, ReplyError> {
        let set = self.set.lock().unwrap();
        let mut types = set.type_names();
        types.sort();
        Ok(Success::Types { types })
    }
}
