//! Retention: keep the newest N backups of each volume.

use crate::executor::catalog::{delete_backup_objects, load_markers};
use crate::executor::manifest::BackupLayout;
use crate::repository::ObjectRepository;
use crate::snapshot::{volume_tag, SnapshotRepository, ENGINE_TAG};
use crate::utils::errors::{EngineError, Result};
use bytes::Bytes;
use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionReport {
    pub volume: String,
    /// Backup or snapshot ids still holding the volume, newest first
    pub kept: Vec<String>,
    /// Ids the volume was pruned from
    pub removed: Vec<String>,
}

fn check_keep(keep: usize) -> Result<()> {
    if keep == 0 {
        return Err(EngineError::Validation("keep count must be at least 1".into()));
    }
    Ok(())
}

/// Prune archive backups of `volume` beyond the newest `keep`.
///
/// A pruned backup holding only this volume is removed entirely. A backup
/// holding several volumes keeps its other volumes: its marker is rewritten
/// without this one before the archive is deleted.
pub async fn enforce(
    repo: &dyn ObjectRepository,
    prefix: &str,
    volume: &str,
    keep: usize,
) -> Result<RetentionReport> {
    check_keep(keep)?;
    let backups: Vec<_> = load_markers(repo, prefix)
        .await?
        .into_iter()
        .filter(|m| m.has_volume(volume))
        .collect();

    let mut report = RetentionReport {
        volume: volume.to_string(),
        ..Default::default()
    };

    for (position, meta) in backups.into_iter().enumerate() {
        if position < keep {
            report.kept.push(meta.id);
            continue;
        }

        if meta.volumes.len() == 1 {
            delete_backup_objects(repo, prefix, &meta).await?;
            tracing::info!(volume, backup_id = %meta.id, "Retention removed backup");
        } else {
            let layout = BackupLayout::new(prefix, &meta.id);
            let mut trimmed = meta.clone();
            trimmed.volumes.retain(|v| v.name != volume);
            trimmed.recompute_total();
            repo.put_bytes(&layout.metadata_key(), Bytes::from(serde_json::to_vec_pretty(&trimmed)?))
                .await?;
            for entry in meta.volumes.iter().filter(|v| v.name == volume) {
                repo.delete(&entry.archive_key).await?;
            }
            tracing::info!(volume, backup_id = %meta.id, "Retention removed volume from shared backup");
        }
        report.removed.push(meta.id);
    }

    Ok(report)
}

/// Prune snapshots of `volume` beyond the newest `keep`.
pub async fn enforce_snapshots(repo: &SnapshotRepository, volume: &str, keep: usize) -> Result<RetentionReport> {
    check_keep(keep)?;
    let tags = vec![ENGINE_TAG.to_string(), volume_tag(volume)];
    let before = repo.list_snapshots(&tags).await?;
    if before.len() > keep {
        repo.forget_keep_last(&tags, keep).await?;
    }
    let after = repo.list_snapshots(&tags).await?;

    let kept: Vec<String> = after.into_iter().map(|s| s.id).collect();
    let removed: Vec<String> = before
        .into_iter()
        .map(|s| s.id)
        .filter(|id| !kept.contains(id))
        .collect();
    if !removed.is_empty() {
        tracing::info!(volume, count = removed.len(), "Retention forgot snapshots");
    }
    Ok(RetentionReport {
        volume: volume.to_string(),
        kept,
        removed,
    })
}
