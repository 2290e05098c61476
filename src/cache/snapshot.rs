//! On-disk snapshot of the commit cache.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::AppError;
use crate::models::{BranchHead, Build, BuilderStatus, BuildsByCommit, Commit};

pub const SNAPSHOT_VERSION: u32 = 1;

/// Everything needed to restart without re-reading the whole history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub version: u32,
    pub commits: Vec<Commit>,
    pub branch_heads: Vec<BranchHead>,
    pub builds_by_id: BTreeMap<i64, Build>,
    pub builds_by_commit: BuildsByCommit,
    pub builder_statuses: BTreeMap<String, BuilderStatus>,
}

/// Read a snapshot. A missing file is `Ok(None)`; anything unreadable is
/// `CorruptSnapshot`.
pub async fn read_snapshot(path: &Path) -> Result<Option<Snapshot>, AppError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(AppError::CorruptSnapshot(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            )))
        }
    };

    let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
    if snapshot.version != SNAPSHOT_VERSION {
        return Err(AppError::CorruptSnapshot(format!(
            "Unsupported snapshot version {} (expected {})",
            snapshot.version, SNAPSHOT_VERSION
        )));
    }
    Ok(Some(snapshot))
}

/// Write a snapshot atomically: serialize to a sibling temp file, then rename.
pub async fn write_snapshot(path: &Path, snapshot: &Snapshot) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let json = serde_json::to_vec(snapshot)
        .map_err(|e| AppError::Internal(format!("Failed to encode snapshot: {}", e)))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "snapshot".to_string());
    let temp_path = path.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

    if let Err(e) = tokio::fs::write(&temp_path, &json).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(e.into());
    }
    if let Err(e) = tokio::fs::rename(&temp_path, path).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(e.into());
    }

    debug!("Wrote snapshot ({} bytes) to {}", json.len(), path.display());
    Ok(())
}
