//! Compensating actions for the restore path.
//!
//! Before a restore mutates existing state it registers the action that
//! undoes the mutation. On failure the plan is unwound newest first. Each
//! step is best effort: a failing step is logged and the rest still run.

use crate::archive;
use crate::runtime::{Bind, ContainerRuntime, SCRATCH_MOUNT, VOLUME_MOUNT};
use crate::utils::errors::{EngineError, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RollbackAction {
    /// Put back a volume from the archive taken just before it was overwritten.
    RestoreVolume { volume: String, archive: PathBuf },
    /// Put back a host directory from its pre-overwrite archive.
    RestoreDirectory { path: PathBuf, archive: PathBuf },
    /// Drop a volume the restore created.
    RemoveVolume { volume: String },
    /// Drop a host directory the restore created.
    RemoveDirectory { path: PathBuf },
}

impl std::fmt::Display for RollbackAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RollbackAction::RestoreVolume { volume, .. } => write!(f, "restore volume {volume}"),
            RollbackAction::RestoreDirectory { path, .. } => {
                write!(f, "restore directory {}", path.display())
            }
            RollbackAction::RemoveVolume { volume } => write!(f, "remove volume {volume}"),
            RollbackAction::RemoveDirectory { path } => write!(f, "remove directory {}", path.display()),
        }
    }
}

/// What the interpreter needs to replay actions.
#[derive(Clone)]
pub struct RollbackContext {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub helper_image: String,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RollbackReport {
    pub succeeded: usize,
    pub failed: Vec<String>,
}

impl RollbackReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Ordered compensating actions belonging to one restore job.
#[derive(Debug, Default)]
pub struct RollbackPlan {
    actions: Vec<RollbackAction>,
}

impl RollbackPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, action: RollbackAction) {
        tracing::debug!(%action, "Rollback action registered");
        self.actions.push(action);
    }

    pub fn actions(&self) -> &[RollbackAction] {
        &self.actions
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// The restore succeeded; nothing to undo.
    pub fn commit(self) {
        if !self.actions.is_empty() {
            tracing::debug!(count = self.actions.len(), "Rollback plan discarded");
        }
    }

    /// Replay every registered action in reverse order of registration.
    pub async fn unwind(self, ctx: &RollbackContext) -> RollbackReport {
        let mut report = RollbackReport::default();
        tracing::warn!(count = self.actions.len(), "Rolling back restore");

        for action in self.actions.into_iter().rev() {
            match apply(ctx, &action).await {
                Ok(()) => {
                    tracing::info!(%action, "Rollback step applied");
                    report.succeeded += 1;
                }
                Err(e) => {
                    tracing::error!(%action, "Rollback step failed: {}", e);
                    report.failed.push(format!("{action}: {e}"));
                }
            }
        }
        report
    }
}

async fn apply(ctx: &RollbackContext, action: &RollbackAction) -> Result<()> {
    match action {
        RollbackAction::RestoreVolume { volume, archive } => {
            let (dir, file) = split_archive_path(archive)?;
            ctx.runtime
                .run_ephemeral_task(
                    &ctx.helper_image,
                    &archive::volume_restore_command(&file),
                    &[Bind::volume(volume, VOLUME_MOUNT, false), Bind::host(dir, SCRATCH_MOUNT)],
                )
                .await?
                .check(&format!("rollback of volume {volume}"))?;
            Ok(())
        }
        RollbackAction::RestoreDirectory { path, archive } => archive::replace_dir(archive, path).await,
        RollbackAction::RemoveVolume { volume } => ctx.runtime.remove_volume(volume).await,
        RollbackAction::RemoveDirectory { path } => archive::remove_dir_if_exists(path).await,
    }
}

fn split_archive_path(archive: &Path) -> Result<(PathBuf, String)> {
    let dir = archive.parent().map(Path::to_path_buf);
    let file = archive.file_name().map(|f| f.to_string_lossy().into_owned());
    match (dir, file) {
        (Some(dir), Some(file)) => Ok((dir, file)),
        _ => Err(EngineError::Validation(format!(
            "invalid rollback archive path {}",
            archive.display()
        ))),
    }
}
