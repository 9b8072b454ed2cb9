//! Copy a cached object out of the cache into a caller-visible
//! directory, generating a unique destination name when the preferred
//! one is taken.

use crate::cache::codec;
use crate::cache::types::MAX_UNIQUE_FILE_INDEX;
use crate::service::error::{ErrorCode, ReplyError};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Copy `source` into `destination`/`file_name`.  The destination is
/// created when missing and must be a directory; name clashes append a
/// `-(N)` suffix before the extension.  Returns the new pathname.
pub async fn copy_object(
    source: &Path,
    destination: &Path,
    file_name: &str,
) -> Result<PathBuf, ReplyError> {
    match tokio::fs::metadata(destination).await {
        Ok(meta) if !meta.is_dir() => {
            return Err(ReplyError::new(
                ErrorCode::Argument,
                "Invalid destination, not a directory.",
            ));
        }
        Ok(meta) if meta.permissions().readonly() => {
            return Err(ReplyError::new(
                ErrorCode::Perm,
                "Invalid destination, no write permission.",
            ));
        }
        Ok(_) => {}
        Err(_) => {
            tokio::fs::create_dir_all(destination).await.map_err(|e| {
                ReplyError::new(ErrorCode::Directory, format!("CopyCacheObject: {e}"))
            })?;
        }
    }

    let target = unique_destination(destination, file_name).await?;
    debug!(source = %source.display(), target = %target.display(), "copying cache object");

    tokio::fs::copy(source, &target)
        .await
        .map_err(|e| ReplyError::new(ErrorCode::Copy, format!("Failed to copy object: {e}")))?;

    info!(target = %target.display(), "copied cache object");
    Ok(target)
}

async fn unique_destination(destination: &Path, file_name: &str) -> Result<PathBuf, ReplyError> {
    let basename = codec::file_basename(file_name).unwrap_or(file_name);
    let extension = codec::file_extension(file_name).unwrap_or("");

    let mut candidate = file_name.to_string();
    let mut index = 1;
    while tokio::fs::try_exists(destination.join(&candidate))
        .await
        .unwrap_or(false)
        && index < MAX_UNIQUE_FILE_INDEX
    {
        candidate = format!("{basename}-({index}){extension}");
        index += 1;
    }
    if index == MAX_UNIQUE_FILE_INDEX {
        return Err(ReplyError::new(
            ErrorCode::Argument,
            "No unique destination name found.",
        ));
    }
    Ok(destination.join(candidate))
}
