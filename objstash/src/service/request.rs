//! Wire types for the service boundary.
//!
//! Requests arrive as JSON objects with a `method` name and a `params`
//! object; replies are flat JSON objects carrying `returnValue` plus
//! either the operation's fields or an error code and text.

use crate::service::error::ReplyError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Every operation the service accepts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all_fields = "camelCase")]
pub enum Request {
    DefineType {
        type_name: String,
        lo_watermark: i64,
        hi_watermark: i64,
        #[serde(default)]
        size: i64,
        #[serde(default)]
        cost: i64,
        #[serde(default)]
        lifetime: i64,
        #[serde(default)]
        dir_type: bool,
    },
    ChangeType {
        type_name: String,
        #[serde(default)]
        lo_watermark: i64,
        #[serde(default)]
        hi_watermark: i64,
        #[serde(default)]
        size: i64,
        #[serde(default)]
        cost: i64,
        #[serde(default)]
        lifetime: i64,
    },
    DeleteType {
        type_name: String,
    },
    DescribeType {
        type_name: String,
    },
    InsertCacheObject {
        type_name: String,
        file_name: String,
        #[serde(default)]
        size: i64,
        #[serde(default)]
        cost: i64,
        #[serde(default)]
        lifetime: i64,
        #[serde(default)]
        subscribe: bool,
    },
    ResizeCacheObject {
        path_name: String,
        new_size: i64,
    },
    ExpireCacheObject {
        path_name: String,
    },
    SubscribeCacheObject {
        path_name: String,
        #[serde(default)]
        subscribe: bool,
    },
    TouchCacheObject {
        path_name: String,
    },
    CopyCacheObject {
        path_name: String,
        #[serde(default)]
        destination: Option<String>,
        #[serde(default)]
        file_name: Option<String>,
    },
    GetCacheStatus,
    GetCacheTypeStatus {
        type_name: String,
    },
    GetCacheObjectSize {
        path_name: String,
    },
    GetCacheObjectFilename {
        path_name: String,
    },
    GetCacheTypes,
    GetVersion,
}

/// The success payloads, one shape per operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged, rename_all_fields = "camelCase")]
pub enum Success {
    Ack {},
    FreedSpace {
        freed_space: u64,
    },
    TypeDescription {
        lo_watermark: u64,
        hi_watermark: u64,
        size: u64,
        cost: u32,
        lifetime: u64,
    },
    Inserted {
        path_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        subscribed: Option<bool>,
    },
    Resized {
        new_size: u64,
    },
    Subscribed {
        subscribed: bool,
    },
    Status {
        num_types: u64,
        size: u64,
        num_objs: u64,
        avail_space: u64,
    },
    TypeStatus {
        size: u64,
        num_objs: u64,
    },
    ObjectSize {
        size: u64,
    },
    ObjectFilename {
        file_name: String,
    },
    Types {
        types: Vec<String>,
    },
    Version {
        version: String,
    },
    Copied {
        new_path_name: String,
    },
}

/// A complete reply: exactly one success payload or one error.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Success(Success),
    Error(ReplyError),
}

impl Response {
    pub fn is_success(&self) -> bool {
        matches!(self, Response::Success(_))
    }

    /// Render the reply for the wire.
    pub fn to_value(&self) -> Value {
        match self {
            Response::Success(success) => {
                let mut value =
                    serde_json::to_value(success).unwrap_or_else(|_| json!({}));
                if let Value::Object(map) = &mut value {
                    map.insert("returnValue".to_string(), Value::Bool(true));
                }
                value
            }
            Response::Error(error) => json!({
                "returnValue": false,
                "errorCode": error.code.code(),
                "errorText": error.text,
            }),
        }
    }
}

impl From<ReplyError> for Response {
    fn from(error: ReplyError) -> Self {
        Response::Error(error)
    }
}

impl From<Success> for Response {
    fn from(success: Success) -> Self {
        Response::Success(success)
    }
}

impl From<Result<Success, ReplyError>> for Response {
    fn from(result: Result<Success, ReplyError>) -> Self {
        match result {
            Ok(success) => Response::Success(success),
            Err(error) => Response::Error(error),
        }
    }
}
