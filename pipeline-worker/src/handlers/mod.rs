pub mod analysis;
pub mod trial;
pub mod verdict;

use std::path::{Path, PathBuf};

use pipeline_common::external::ObjectStoreError;

use crate::error::HandlerError;
use crate::worker::Handlers;

/// Resolve a local directory for `prefix`: download it from object storage
/// first if either the caller's storage is enabled or the artifact already
/// lives remotely, otherwise fall back to `local_path` unchanged.
pub(crate) async fn materialize(
    handlers: &Handlers,
    remote_prefix: Option<&str>,
    local_path: Option<&str>,
    scratch_dir: &Path,
) -> Result<PathBuf, HandlerError> {
    if let Some(prefix) = remote_prefix {
        let store = handlers
            .object_store
            .as_ref()
            .ok_or_else(|| ObjectStoreError::NotFound(prefix.to_owned()))?;
        tokio::fs::create_dir_all(scratch_dir)
            .await
            .map_err(|e| HandlerError::InvalidPayload(format!("failed to create scratch dir: {e}")))?;
        store.download_prefix(prefix, scratch_dir).await?;
        return Ok(scratch_dir.to_path_buf());
    }

    match local_path {
        Some(path) => Ok(PathBuf::from(path)),
        None => Err(HandlerError::InvalidPayload(
            "neither a remote prefix nor a local path was set".to_owned(),
        )),
    }
}

pub(crate) fn scratch_dir_for(kind: &str, id: &str) -> PathBuf {
    std::env::temp_dir().join(format!("pipeline-{kind}-{id}"))
}
