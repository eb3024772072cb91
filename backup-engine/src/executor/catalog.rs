//! Reading and removing committed backups.

use super::manifest::{backup_id_from_marker_key, BackupLayout, BackupMetadata};
use crate::repository::ObjectRepository;
use crate::utils::errors::{EngineError, Result};
use std::cmp::Ordering;

/// Newest first; equal timestamps fall back to the id so the order is total.
pub fn newest_first(a: &BackupMetadata, b: &BackupMetadata) -> Ordering {
    b.timestamp.cmp(&a.timestamp).then_with(|| b.id.cmp(&a.id))
}

/// Every committed backup under `prefix`, newest first.
///
/// Objects without a marker are not backups and are ignored. Unreadable
/// markers are logged and skipped.
pub async fn load_markers(repo: &dyn ObjectRepository, prefix: &str) -> Result<Vec<BackupMetadata>> {
    let list_prefix = if prefix.is_empty() {
        String::new()
    } else {
        format!("{prefix}/")
    };
    let mut backups = Vec::new();
    for object in repo.list(&list_prefix).await? {
        let Some(backup_id) = backup_id_from_marker_key(prefix, &object.key) else {
            continue;
        };
        let Some(bytes) = repo.get_bytes(&object.key).await? else {
            continue;
        };
        match serde_json::from_slice::<BackupMetadata>(&bytes) {
            Ok(meta) => backups.push(meta),
            Err(e) => tracing::warn!(backup_id = %backup_id, "Skipping unreadable backup metadata: {}", e),
        }
    }
    backups.sort_by(newest_first);
    Ok(backups)
}

pub async fn load_marker(repo: &dyn ObjectRepository, prefix: &str, backup_id: &str) -> Result<BackupMetadata> {
    let key = BackupLayout::new(prefix, backup_id).metadata_key();
    let bytes = repo
        .get_bytes(&key)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("backup {backup_id}")))?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Remove a committed backup. The marker goes first so a partial delete
/// never leaves a marker pointing at missing data.
pub async fn delete_backup_objects(
    repo: &dyn ObjectRepository,
    prefix: &str,
    meta: &BackupMetadata,
) -> Result<usize> {
    let layout = BackupLayout::new(prefix, &meta.id);
    repo.delete(&layout.metadata_key()).await?;
    let mut deleted = 1;
    for key in meta.referenced_keys() {
        repo.delete(&key).await?;
        deleted += 1;
    }
    deleted += repo.delete_prefix(&layout.root()).await?;
    Ok(deleted)
}
