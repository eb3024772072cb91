//! Restore of committed backups, with rollback of partial restores.

use super::catalog;
use super::manifest::{validate_name, AppConfigEntry, BackupMetadata, VolumeEntry};
use super::{progress, BackupService, Inner};
use crate::archive::{self, ScratchDir, CONFIG_ARCHIVE_EXT, VOLUME_ARCHIVE_EXT};
use crate::jobs::{JobKind, JobUpdate, VolumeClaim};
use crate::repository::ObjectRepository;
use crate::rollback::{RollbackAction, RollbackContext, RollbackPlan};
use crate::runtime::{Bind, SCRATCH_MOUNT, VOLUME_MOUNT};
use crate::utils::errors::{EngineError, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct RestoreRequest {
    pub backup_id: String,
    /// Subset of the backup's volumes; `None` restores all of them
    pub volumes: Option<Vec<String>>,
    /// Subset of the backup's app configs; `None` restores all of them
    pub app_ids: Option<Vec<String>>,
    /// Replace existing volumes and app directories instead of skipping them
    pub overwrite: bool,
    /// Relaunch the backup's applications once the data is back
    pub restart_apps: bool,
}

struct RestoreTask {
    job_id: String,
    repo: Arc<dyn ObjectRepository>,
    meta: BackupMetadata,
    volumes: Vec<VolumeEntry>,
    app_configs: Vec<AppConfigEntry>,
    restart: Vec<String>,
    overwrite: bool,
    claim: VolumeClaim,
}

impl BackupService {
    /// Check the backup exists, register a restore job and run it in the
    /// background. Returns the job id without waiting for the restore.
    pub async fn restore_backup(&self, request: RestoreRequest) -> Result<String> {
        validate_name("backup", &request.backup_id)?;
        let repo = self.inner.provider.open().await?;
        let prefix = self.inner.provider.prefix().await;
        let meta = catalog::load_marker(repo.as_ref(), &prefix, &request.backup_id).await?;

        let volumes = select(&meta.volumes, request.volumes.as_deref(), |v| &v.name, "volume", &meta.id)?;
        let app_configs = select(
            &meta.app_configs,
            request.app_ids.as_deref(),
            |a| &a.app_id,
            "app config",
            &meta.id,
        )?;
        let restart = if !request.restart_apps {
            Vec::new()
        } else if let Some(ids) = &request.app_ids {
            ids.clone()
        } else {
            meta.apps.clone()
        };

        let names: Vec<String> = volumes.iter().map(|v| v.name.clone()).collect();
        let claim = self.inner.running.claim(&names)?;

        let job_id = self.inner.jobs.create(JobKind::Restore, names);
        self.inner.jobs.update(
            &job_id,
            JobUpdate {
                backup_id: Some(meta.id.clone()),
                ..Default::default()
            },
        )?;
        tracing::info!(
            job_id = %job_id,
            backup_id = %meta.id,
            overwrite = request.overwrite,
            "Restore requested"
        );

        let task = RestoreTask {
            job_id: job_id.clone(),
            repo,
            meta,
            volumes,
            app_configs,
            restart,
            overwrite: request.overwrite,
            claim,
        };
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.run_restore(task).await });

        Ok(job_id)
    }
}

/// Pick the requested entries of a backup; unknown names are not found.
fn select<T: Clone>(
    entries: &[T],
    wanted: Option<&[String]>,
    name_of: impl Fn(&T) -> &String,
    kind: &str,
    backup_id: &str,
) -> Result<Vec<T>> {
    let Some(wanted) = wanted else {
        return Ok(entries.to_vec());
    };
    wanted
        .iter()
        .map(|name| {
            entries
                .iter()
                .find(|e| name_of(e) == name)
                .cloned()
                .ok_or_else(|| EngineError::NotFound(format!("{kind} {name} in backup {backup_id}")))
        })
        .collect()
}

impl Inner {
    async fn run_restore(&self, task: RestoreTask) {
        let job_id = task.job_id.clone();
        let mut plan = RollbackPlan::new();

        let outcome = match ScratchDir::create(&self.settings.scratch_dir, &format!("restore-{job_id}")).await {
            Ok(scratch) => {
                let result = self.execute_restore(&task, scratch.path(), &mut plan).await;
                let result = match result {
                    Ok(()) => {
                        plan.commit();
                        Ok(())
                    }
                    Err(e) => {
                        // Pre-restore archives live in scratch, so unwind before it goes away
                        let ctx = RollbackContext {
                            runtime: self.runtime.clone(),
                            helper_image: self.settings.helper_image.clone(),
                        };
                        let report = plan.unwind(&ctx).await;
                        if report.is_clean() {
                            Err(e.to_string())
                        } else {
                            Err(format!(
                                "{e}; rollback incomplete: {}",
                                report.failed.join("; ")
                            ))
                        }
                    }
                };
                drop(scratch);
                result
            }
            Err(e) => Err(e.to_string()),
        };

        let RestoreTask {
            meta,
            restart,
            claim,
            ..
        } = task;
        drop(claim);

        match outcome {
            Ok(()) => {
                if !restart.is_empty() {
                    if let Err(e) = self.launcher.restart_apps(&restart).await {
                        if let Err(warn_err) = self.jobs.warn(&job_id, "apps", e.to_string()) {
                            tracing::error!(job_id = %job_id, "Failed to record restart warning: {}", warn_err);
                        }
                    }
                }
                if let Err(e) = self.jobs.complete(&job_id, Some(meta)) {
                    tracing::error!(job_id = %job_id, "Failed to record completion: {}", e);
                }
            }
            Err(message) => {
                if let Err(e) = self.jobs.fail(&job_id, message) {
                    tracing::error!(job_id = %job_id, "Failed to record failure: {}", e);
                }
            }
        }
    }

    async fn execute_restore(&self, task: &RestoreTask, scratch: &Path, plan: &mut RollbackPlan) -> Result<()> {
        let job_id = task.job_id.as_str();
        self.jobs.start(job_id)?;

        let total_items = task.app_configs.len() + task.volumes.len();
        let mut done = 0;

        for entry in &task.app_configs {
            self.restore_app_config(task, entry, scratch, plan).await?;
            done += 1;
            self.jobs.set_progress(job_id, progress(done, total_items))?;
        }
        for entry in &task.volumes {
            self.restore_volume(task, entry, scratch, plan).await?;
            done += 1;
            self.jobs.set_progress(job_id, progress(done, total_items))?;
        }

        Ok(())
    }

    async fn restore_app_config(
        &self,
        task: &RestoreTask,
        entry: &AppConfigEntry,
        scratch: &Path,
        plan: &mut RollbackPlan,
    ) -> Result<()> {
        let dest = self.settings.apps_dir.join(&entry.app_id);
        let exists = tokio::fs::try_exists(&dest).await?;
        if exists && !task.overwrite {
            self.jobs.warn(
                &task.job_id,
                &format!("app:{}", entry.app_id),
                "application directory already exists and overwrite is disabled; skipped",
            )?;
            return Ok(());
        }

        let download = scratch.join(format!("app-{}.{CONFIG_ARCHIVE_EXT}", entry.app_id));
        fetch(task.repo.as_ref(), &entry.archive_key, &download).await?;

        if exists {
            let before = rollback_dir(scratch)
                .await?
                .join(format!("app-{}.{CONFIG_ARCHIVE_EXT}", entry.app_id));
            archive::pack_dir(&dest, &before).await?;
            plan.register(RollbackAction::RestoreDirectory {
                path: dest.clone(),
                archive: before,
            });
            archive::replace_dir(&download, &dest).await?;
        } else {
            plan.register(RollbackAction::RemoveDirectory { path: dest.clone() });
            archive::unpack_into(&download, &dest).await?;
        }

        tracing::info!(job_id = %task.job_id, app = %entry.app_id, "Application config restored");
        Ok(())
    }

    async fn restore_volume(
        &self,
        task: &RestoreTask,
        entry: &VolumeEntry,
        scratch: &Path,
        plan: &mut RollbackPlan,
    ) -> Result<()> {
        let volume = entry.name.as_str();
        let existing = self.runtime.inspect_volume(volume).await?;
        if existing.is_some() && !task.overwrite {
            self.jobs.warn(
                &task.job_id,
                &format!("volume:{volume}"),
                "volume already exists and overwrite is disabled; skipped",
            )?;
            return Ok(());
        }

        let file_name = format!("{volume}.{VOLUME_ARCHIVE_EXT}");
        fetch(task.repo.as_ref(), &entry.archive_key, &scratch.join(&file_name)).await?;

        if existing.is_some() {
            let rollback = rollback_dir(scratch).await?;
            self.runtime
                .run_ephemeral_task(
                    &self.settings.helper_image,
                    &archive::volume_archive_command(&file_name),
                    &[Bind::volume(volume, VOLUME_MOUNT, true), Bind::host(&rollback, SCRATCH_MOUNT)],
                )
                .await?
                .check(&format!("pre-restore archive of volume {volume}"))?;
            plan.register(RollbackAction::RestoreVolume {
                volume: volume.to_string(),
                archive: rollback.join(&file_name),
            });
        } else {
            self.runtime.create_volume(volume).await?;
            plan.register(RollbackAction::RemoveVolume {
                volume: volume.to_string(),
            });
        }

        self.runtime
            .run_ephemeral_task(
                &self.settings.helper_image,
                &archive::volume_restore_command(&file_name),
                &[Bind::volume(volume, VOLUME_MOUNT, false), Bind::host(scratch, SCRATCH_MOUNT)],
            )
            .await?
            .check(&format!("restore of volume {volume}"))?;

        tracing::info!(job_id = %task.job_id, volume, "Volume restored");
        Ok(())
    }
}

/// Directory for pre-restore snapshots, apart from downloaded archives.
async fn rollback_dir(scratch: &Path) -> Result<PathBuf> {
    let dir = scratch.join("rollback");
    tokio::fs::create_dir_all(&dir).await?;
    Ok(dir)
}

async fn fetch(repo: &dyn ObjectRepository, key: &str, dest: &Path) -> Result<()> {
    if !repo.get_to_file(key, dest).await? {
        return Err(EngineError::Integrity(format!("archive {key} missing from repository")));
    }
    Ok(())
}
