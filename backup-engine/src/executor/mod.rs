//! Archive-and-upload executor.
//!
//! Each volume is archived by a helper container into a per-job scratch
//! directory, uploaded, and removed locally. Application configuration
//! directories are packed on the host. The commit marker is uploaded last
//! and every expected key is verified; on any failure every object of the
//! backup is deleted again.

pub mod catalog;
pub mod manifest;
mod restore;

use crate::apps::AppLauncher;
use crate::archive::{self, ScratchDir, CONFIG_ARCHIVE_EXT, VOLUME_ARCHIVE_EXT};
use crate::config::Config;
use crate::jobs::{JobKind, JobRegistry, JobUpdate, RunningVolumes, VolumeClaim};
use crate::repository::{ObjectRepository, RepositoryProvider};
use crate::retention::{self, RetentionReport};
use crate::runtime::{Bind, ContainerRuntime, SCRATCH_MOUNT, VOLUME_MOUNT};
use crate::scheduled::ScheduledBackup;
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use manifest::{
    generate_backup_id, validate_name, AppConfigEntry, BackupLayout, BackupMetadata, VolumeEntry,
};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

pub use restore::RestoreRequest;

/// Progress reported until the commit marker is in place.
const MAX_PRE_COMMIT_PROGRESS: usize = 90;

#[derive(Debug, Clone, Default)]
pub struct BackupRequest {
    /// Label the backup id is derived from. Defaults to the first app id.
    pub name: Option<String>,
    pub volumes: Vec<String>,
    /// Application ids whose configuration directory is archived
    pub app_configs: Vec<String>,
    /// Applications associated with the backup, restarted on restore
    pub apps: Vec<String>,
}

/// Paths and image the executor works with.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub helper_image: String,
    pub scratch_dir: PathBuf,
    pub apps_dir: PathBuf,
}

impl ExecutorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            helper_image: config.runtime.helper_image.clone(),
            scratch_dir: config.paths.scratch_dir.clone(),
            apps_dir: config.paths.apps_dir.clone(),
        }
    }
}

#[derive(Clone)]
pub struct BackupService {
    inner: Arc<Inner>,
}

struct Inner {
    provider: Arc<dyn RepositoryProvider>,
    runtime: Arc<dyn ContainerRuntime>,
    launcher: Arc<dyn AppLauncher>,
    jobs: JobRegistry,
    running: RunningVolumes,
    settings: ExecutorSettings,
}

/// Everything a detached backup task owns.
struct BackupTask {
    job_id: String,
    backup_id: String,
    repo: Arc<dyn ObjectRepository>,
    layout: BackupLayout,
    request: BackupRequest,
    claim: VolumeClaim,
}

impl BackupService {
    pub fn new(
        provider: Arc<dyn RepositoryProvider>,
        runtime: Arc<dyn ContainerRuntime>,
        launcher: Arc<dyn AppLauncher>,
        jobs: JobRegistry,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                provider,
                runtime,
                launcher,
                jobs,
                running: RunningVolumes::new(),
                settings,
            }),
        }
    }

    pub fn jobs(&self) -> &JobRegistry {
        &self.inner.jobs
    }

    pub fn is_volume_busy(&self, volume: &str) -> bool {
        self.inner.running.contains(volume)
    }

    /// Validate the request, register a job and start the backup in the
    /// background. Returns the job id without waiting for the backup.
    pub async fn create_backup(&self, request: BackupRequest) -> Result<String> {
        if request.volumes.is_empty() && request.app_configs.is_empty() {
            return Err(EngineError::Validation("nothing to back up".into()));
        }
        check_names("volume", &request.volumes)?;
        check_names("app", &request.app_configs)?;
        check_names("app", &request.apps)?;

        let repo = self.inner.provider.open().await?;
        let prefix = self.inner.provider.prefix().await;
        let claim = self.inner.running.claim(&request.volumes)?;

        let label = request
            .name
            .as_deref()
            .or_else(|| request.apps.first().map(String::as_str))
            .or_else(|| request.app_configs.first().map(String::as_str));
        let backup_id = generate_backup_id(label, Utc::now());

        let job_id = self.inner.jobs.create(JobKind::Backup, request.volumes.clone());
        self.inner.jobs.update(
            &job_id,
            JobUpdate {
                backup_id: Some(backup_id.clone()),
                ..Default::default()
            },
        )?;
        tracing::info!(job_id = %job_id, backup_id = %backup_id, volumes = ?request.volumes, "Backup requested");

        let task = BackupTask {
            job_id: job_id.clone(),
            layout: BackupLayout::new(&prefix, &backup_id),
            backup_id,
            repo,
            request,
            claim,
        };
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.run_backup(task).await });

        Ok(job_id)
    }

    /// Every committed backup, newest first.
    pub async fn list_backups(&self) -> Result<Vec<BackupMetadata>> {
        let repo = self.inner.provider.open().await?;
        let prefix = self.inner.provider.prefix().await;
        catalog::load_markers(repo.as_ref(), &prefix).await
    }

    pub async fn get_backup(&self, backup_id: &str) -> Result<BackupMetadata> {
        let repo = self.inner.provider.open().await?;
        let prefix = self.inner.provider.prefix().await;
        catalog::load_marker(repo.as_ref(), &prefix, backup_id).await
    }

    pub async fn delete_backup(&self, backup_id: &str) -> Result<()> {
        let repo = self.inner.provider.open().await?;
        let prefix = self.inner.provider.prefix().await;
        let meta = catalog::load_marker(repo.as_ref(), &prefix, backup_id).await?;
        let deleted = catalog::delete_backup_objects(repo.as_ref(), &prefix, &meta).await?;
        tracing::info!(backup_id, objects = deleted, "Backup deleted");
        Ok(())
    }
}

impl Inner {
    async fn run_backup(&self, task: BackupTask) {
        let mut uploaded = Vec::new();
        let result = self.execute_backup(&task, &mut uploaded).await;
        if result.is_err() {
            discard_uploads(task.repo.as_ref(), &uploaded, &task.layout).await;
        }

        // Free the volumes before the terminal state is signalled
        let BackupTask { job_id, claim, .. } = task;
        drop(claim);

        match result {
            Ok(meta) => {
                tracing::info!(
                    job_id = %job_id,
                    backup_id = %meta.id,
                    total_size = meta.total_size,
                    "Backup committed"
                );
                if let Err(e) = self.jobs.complete(&job_id, Some(meta)) {
                    tracing::error!(job_id = %job_id, "Failed to record completion: {}", e);
                }
            }
            Err(e) => {
                if let Err(update_err) = self.jobs.fail(&job_id, e.to_string()) {
                    tracing::error!(job_id = %job_id, "Failed to record failure: {}", update_err);
                }
            }
        }
    }

    async fn execute_backup(&self, task: &BackupTask, uploaded: &mut Vec<String>) -> Result<BackupMetadata> {
        let job_id = task.job_id.as_str();
        let repo = task.repo.as_ref();
        let request = &task.request;
        self.jobs.start(job_id)?;

        let scratch = ScratchDir::create(&self.settings.scratch_dir, &format!("backup-{job_id}")).await?;
        let total_items = request.volumes.len() + request.app_configs.len();
        let mut done = 0;

        let mut volumes = Vec::with_capacity(request.volumes.len());
        for volume in &request.volumes {
            if self.runtime.inspect_volume(volume).await?.is_none() {
                return Err(EngineError::NotFound(format!("volume {volume}")));
            }

            let file_name = format!("{volume}.{VOLUME_ARCHIVE_EXT}");
            self.runtime
                .run_ephemeral_task(
                    &self.settings.helper_image,
                    &archive::volume_archive_command(&file_name),
                    &[
                        Bind::volume(volume, VOLUME_MOUNT, true),
                        Bind::host(scratch.path(), SCRATCH_MOUNT),
                    ],
                )
                .await?
                .check(&format!("archive of volume {volume}"))?;

            let local = scratch.path().join(&file_name);
            let size = tokio::fs::metadata(&local).await?.len();
            let key = task.layout.volume_key(volume);
            uploaded.push(key.clone());
            repo.put_file(&key, &local).await?;
            verify_keys(repo, uploaded).await?;
            tokio::fs::remove_file(&local).await?;

            tracing::info!(job_id, volume = %volume, size, "Volume archived");
            volumes.push(VolumeEntry {
                name: volume.clone(),
                size,
                archive_key: key,
            });
            done += 1;
            self.jobs.set_progress(job_id, progress(done, total_items))?;
        }

        let mut app_configs = Vec::with_capacity(request.app_configs.len());
        for app_id in &request.app_configs {
            let local = scratch.path().join(format!("app-{app_id}.{CONFIG_ARCHIVE_EXT}"));
            let size = archive::pack_dir(&self.settings.apps_dir.join(app_id), &local).await?;
            let key = task.layout.app_config_key(app_id);
            uploaded.push(key.clone());
            repo.put_file(&key, &local).await?;
            verify_keys(repo, uploaded).await?;
            tokio::fs::remove_file(&local).await?;

            tracing::info!(job_id, app = %app_id, size, "Application config archived");
            app_configs.push(AppConfigEntry {
                app_id: app_id.clone(),
                archive_key: key,
                size,
            });
            done += 1;
            self.jobs.set_progress(job_id, progress(done, total_items))?;
        }

        let mut meta = BackupMetadata {
            id: task.backup_id.clone(),
            name: request.name.clone().unwrap_or_else(|| {
                request
                    .apps
                    .first()
                    .cloned()
                    .unwrap_or_else(|| request.volumes.join(","))
            }),
            timestamp: Utc::now(),
            volumes,
            app_configs,
            apps: request.apps.clone(),
            total_size: 0,
        };
        meta.recompute_total();

        let marker = task.layout.metadata_key();
        uploaded.push(marker.clone());
        repo.put_bytes(&marker, Bytes::from(serde_json::to_vec_pretty(&meta)?))
            .await?;
        verify_keys(repo, uploaded).await?;

        Ok(meta)
    }

    async fn enforce_retention(&self, volume: &str, keep: usize) -> Result<RetentionReport> {
        if self.running.contains(volume) {
            return Err(EngineError::Conflict(format!(
                "volume {volume} has a job in flight; retention skipped"
            )));
        }
        let repo = self.provider.open().await?;
        let prefix = self.provider.prefix().await;
        retention::enforce(repo.as_ref(), &prefix, volume, keep).await
    }
}

fn progress(done: usize, total: usize) -> u8 {
    (done * MAX_PRE_COMMIT_PROGRESS / total.max(1)).min(MAX_PRE_COMMIT_PROGRESS) as u8
}

fn check_names(kind: &str, names: &[String]) -> Result<()> {
    let mut seen = HashSet::new();
    for name in names {
        validate_name(kind, name)?;
        if !seen.insert(name.as_str()) {
            return Err(EngineError::Validation(format!("duplicate {kind} {name:?}")));
        }
    }
    Ok(())
}

/// Every key must exist; a missing one fails the whole backup.
async fn verify_keys(repo: &dyn ObjectRepository, keys: &[String]) -> Result<()> {
    for key in keys {
        if repo.stat(key).await?.is_none() {
            return Err(EngineError::Integrity(format!("object {key} missing after upload")));
        }
    }
    Ok(())
}

/// Best-effort removal of a failed backup's objects, newest upload first.
async fn discard_uploads(repo: &dyn ObjectRepository, uploaded: &[String], layout: &BackupLayout) {
    for key in uploaded.iter().rev() {
        if let Err(e) = repo.delete(key).await {
            tracing::warn!(key = %key, "Failed to delete partial upload: {}", e);
        }
    }
    match repo.delete_prefix(&layout.root()).await {
        Ok(0) => {}
        Ok(n) => tracing::debug!(prefix = %layout.root(), count = n, "Removed leftover objects"),
        Err(e) => tracing::warn!(prefix = %layout.root(), "Failed to clean backup prefix: {}", e),
    }
}

#[async_trait]
impl ScheduledBackup for BackupService {
    async fn backup_volume(&self, volume: &str) -> Result<String> {
        self.create_backup(BackupRequest {
            name: Some(volume.to_string()),
            volumes: vec![volume.to_string()],
            ..Default::default()
        })
        .await
    }

    fn jobs(&self) -> &JobRegistry {
        &self.inner.jobs
    }

    async fn enforce_retention(&self, volume: &str, keep: usize) -> Result<RetentionReport> {
        self.inner.enforce_retention(volume, keep).await
    }

    fn is_volume_busy(&self, volume: &str) -> bool {
        self.inner.running.contains(volume)
    }
}
