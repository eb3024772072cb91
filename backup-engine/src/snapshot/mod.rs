//! Content-addressed executor: volumes go straight into a deduplicating
//! snapshot repository, tracked through the same job registry as archive
//! backups.

mod restic;

pub use restic::{
    derive_password, parse_snapshot_id, repository_url, volume_tag, RetentionPolicy, Snapshot,
    SnapshotRepository, SnapshotSummary, ENGINE_TAG,
};

use crate::config::Config;
use crate::executor::manifest::validate_name;
use crate::jobs::{JobKind, JobRegistry, JobUpdate, RunningVolumes, VolumeClaim};
use crate::process::CommandRunner;
use crate::repository::S3RepositoryProvider;
use crate::retention::{self, RetentionReport};
use crate::runtime::ContainerRuntime;
use crate::scheduled::ScheduledBackup;
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct SnapshotSettings {
    pub binary: String,
    pub repository_path: String,
}

impl SnapshotSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            binary: config.snapshot.binary.clone(),
            repository_path: config.snapshot.repository_path.clone(),
        }
    }
}

#[derive(Clone)]
pub struct SnapshotService {
    inner: Arc<Inner>,
}

struct Inner {
    provider: Arc<S3RepositoryProvider>,
    runner: Arc<dyn CommandRunner>,
    runtime: Arc<dyn ContainerRuntime>,
    jobs: JobRegistry,
    running: RunningVolumes,
    settings: SnapshotSettings,
}

impl SnapshotService {
    pub fn new(
        provider: Arc<S3RepositoryProvider>,
        runner: Arc<dyn CommandRunner>,
        runtime: Arc<dyn ContainerRuntime>,
        jobs: JobRegistry,
        settings: SnapshotSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                provider,
                runner,
                runtime,
                jobs,
                running: RunningVolumes::new(),
                settings,
            }),
        }
    }

    pub fn jobs(&self) -> &JobRegistry {
        &self.inner.jobs
    }

    /// Repository client for the configuration current right now.
    pub async fn repository(&self) -> Result<SnapshotRepository> {
        self.inner.open().await
    }

    pub async fn init(&self) -> Result<()> {
        self.inner.open().await?.init().await
    }

    /// Start a snapshot of `volume`. Returns the job id immediately; the job's
    /// `backup_id` carries the snapshot id once it completes.
    pub async fn create_backup(&self, volume: &str, tags: Vec<String>) -> Result<String> {
        validate_name("volume", volume)?;
        let repo = self.inner.open().await?;
        let claim = self.inner.running.claim(&[volume.to_string()])?;

        let job_id = self.inner.jobs.create(JobKind::Backup, vec![volume.to_string()]);
        tracing::info!(job_id = %job_id, volume, "Snapshot requested");

        let inner = self.inner.clone();
        let id = job_id.clone();
        let volume = volume.to_string();
        tokio::spawn(async move {
            let result = inner.run_backup(&id, &repo, &volume, &tags).await;
            inner.finish(&id, claim, result);
        });
        Ok(job_id)
    }

    /// Restore `snapshot_id` into `volume` at its original location.
    pub async fn restore(&self, snapshot_id: &str, volume: &str) -> Result<String> {
        validate_name("volume", volume)?;
        let repo = self.inner.open().await?;
        let snapshot = repo
            .list_snapshots(&[ENGINE_TAG.to_string(), volume_tag(volume)])
            .await?
            .into_iter()
            .find(|s| s.id == snapshot_id || s.short_id == snapshot_id)
            .ok_or_else(|| EngineError::NotFound(format!("snapshot {snapshot_id} of volume {volume}")))?;
        let claim = self.inner.running.claim(&[volume.to_string()])?;

        let job_id = self.inner.jobs.create(JobKind::Restore, vec![volume.to_string()]);
        self.inner.jobs.update(
            &job_id,
            JobUpdate {
                backup_id: Some(snapshot.id.clone()),
                ..Default::default()
            },
        )?;
        tracing::info!(job_id = %job_id, volume, snapshot_id = %snapshot.id, "Snapshot restore requested");

        let inner = self.inner.clone();
        let id = job_id.clone();
        let volume = volume.to_string();
        tokio::spawn(async move {
            let result = inner.run_restore(&id, &repo, &snapshot, &volume).await;
            inner.finish(&id, claim, result);
        });
        Ok(job_id)
    }

    /// Snapshots made by this engine, optionally of one volume, newest first.
    pub async fn list_snapshots(&self, volume: Option<&str>) -> Result<Vec<Snapshot>> {
        let mut tags = vec![ENGINE_TAG.to_string()];
        if let Some(volume) = volume {
            tags.push(volume_tag(volume));
        }
        self.inner.open().await?.list_snapshots(&tags).await
    }

    pub async fn forget(&self, snapshot_id: &str) -> Result<()> {
        self.inner.open().await?.forget_one(snapshot_id).await
    }

    pub async fn forget_with_policy(&self, volume: Option<&str>, policy: RetentionPolicy) -> Result<()> {
        let mut tags = vec![ENGINE_TAG.to_string()];
        if let Some(volume) = volume {
            tags.push(volume_tag(volume));
        }
        self.inner.open().await?.forget_with_policy(&tags, policy).await
    }

    pub async fn prune(&self) -> Result<()> {
        self.inner.open().await?.prune().await
    }

    pub async fn stats(&self, snapshot_id: &str) -> Result<Option<u64>> {
        Ok(self.inner.open().await?.stats(snapshot_id).await)
    }

    pub async fn check(&self) -> Result<bool> {
        self.inner.open().await?.check().await
    }
}

impl Inner {
    async fn open(&self) -> Result<SnapshotRepository> {
        let config = self.provider.current().await;
        SnapshotRepository::new(
            self.runner.clone(),
            &self.settings.binary,
            &config,
            &self.settings.repository_path,
        )
    }

    async fn volume_path(&self, volume: &str) -> Result<PathBuf> {
        self.runtime
            .inspect_volume(volume)
            .await?
            .map(|info| info.mountpoint)
            .ok_or_else(|| EngineError::NotFound(format!("volume {volume}")))
    }

    async fn run_backup(
        &self,
        job_id: &str,
        repo: &SnapshotRepository,
        volume: &str,
        tags: &[String],
    ) -> Result<()> {
        self.jobs.start(job_id)?;
        let path = self.volume_path(volume).await?;
        repo.init().await?;
        self.jobs.set_progress(job_id, 10)?;

        let snapshot_id = repo.backup(volume, &path, tags).await?;
        self.jobs.update(
            job_id,
            JobUpdate {
                progress: Some(90),
                backup_id: Some(snapshot_id.clone()),
                ..Default::default()
            },
        )?;
        if let Some(size) = repo.stats(&snapshot_id).await {
            tracing::info!(job_id, volume, snapshot_id = %snapshot_id, size, "Snapshot stored");
        }
        Ok(())
    }

    async fn run_restore(&self, job_id: &str, repo: &SnapshotRepository, snapshot: &Snapshot, volume: &str) -> Result<()> {
        self.jobs.start(job_id)?;
        let path = match self.runtime.inspect_volume(volume).await? {
            Some(info) => info.mountpoint,
            None => self.runtime.create_volume(volume).await?.mountpoint,
        };
        // The snapshot path is where the data lived when it was taken
        let original = snapshot.paths.first().map(PathBuf::from).unwrap_or(path);
        self.jobs.set_progress(job_id, 10)?;
        repo.restore(&snapshot.id, &original).await
    }

    fn finish(&self, job_id: &str, claim: VolumeClaim, result: Result<()>) {
        drop(claim);
        let recorded = match result {
            Ok(()) => self.jobs.complete(job_id, None),
            Err(e) => self.jobs.fail(job_id, e.to_string()),
        };
        if let Err(e) = recorded {
            tracing::error!(job_id, "Failed to record job outcome: {}", e);
        }
    }
}

#[async_trait]
impl ScheduledBackup for SnapshotService {
    async fn backup_volume(&self, volume: &str) -> Result<String> {
        self.create_backup(volume, vec!["scheduled".to_string()]).await
    }

    fn jobs(&self) -> &JobRegistry {
        &self.inner.jobs
    }

    async fn enforce_retention(&self, volume: &str, keep: usize) -> Result<RetentionReport> {
        if self.inner.running.contains(volume) {
            return Err(EngineError::Conflict(format!(
                "volume {volume} has a job in flight; retention skipped"
            )));
        }
        let repo = self.inner.open().await?;
        retention::enforce_snapshots(&repo, volume, keep).await
    }

    fn is_volume_busy(&self, volume: &str) -> bool {
        self.inner.running.contains(volume)
    }
}
