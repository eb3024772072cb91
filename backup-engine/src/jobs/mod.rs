//! Job registry: lifecycle and progress of every backup and restore job.
//!
//! Jobs move `Pending -> InProgress -> {Completed, Failed}` and never change
//! again once terminal. Each job carries a completion signal so callers can
//! await the terminal state instead of guessing how long a job takes.

pub mod running;
pub mod store;

use crate::executor::manifest::BackupMetadata;
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub use running::{RunningVolumes, VolumeClaim};
pub use store::{JobStore, MemoryJobStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Backup,
    Restore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    fn can_move_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Pending)
                | (Pending, InProgress)
                | (Pending, Failed)
                | (InProgress, InProgress)
                | (InProgress, Completed)
                | (InProgress, Failed)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in_progress",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Non-fatal problem recorded on a job, e.g. an item skipped during restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobWarning {
    pub item: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub status: JobStatus,
    /// 0-100
    pub progress: u8,
    pub backup_id: Option<String>,
    pub volumes: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    #[serde(default)]
    pub warnings: Vec<JobWarning>,
    pub metadata: Option<BackupMetadata>,
}

impl Job {
    pub fn new(kind: JobKind, volumes: Vec<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            status: JobStatus::Pending,
            progress: 0,
            backup_id: None,
            volumes,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            warnings: Vec::new(),
            metadata: None,
        }
    }
}

/// Partial state merged into a job. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub progress: Option<u8>,
    pub backup_id: Option<String>,
    pub error: Option<String>,
    pub warning: Option<JobWarning>,
    pub metadata: Option<BackupMetadata>,
}

impl JobUpdate {
    pub fn progress(progress: u8) -> Self {
        Self {
            progress: Some(progress),
            ..Default::default()
        }
    }
}

/// Tracks every job of this process and signals terminal states.
#[derive(Clone)]
pub struct JobRegistry {
    store: Arc<dyn JobStore>,
    signals: Arc<DashMap<String, watch::Sender<JobStatus>>>,
}

impl JobRegistry {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            signals: Arc::new(DashMap::new()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryJobStore::new()))
    }

    /// Register a new pending job and return its id.
    pub fn create(&self, kind: JobKind, volumes: Vec<String>) -> String {
        let job = Job::new(kind, volumes);
        let id = job.id.clone();
        let (tx, _rx) = watch::channel(JobStatus::Pending);
        self.signals.insert(id.clone(), tx);
        self.store.set(job);
        tracing::debug!(job_id = %id, ?kind, "Job created");
        id
    }

    pub fn get(&self, id: &str) -> Result<Job> {
        self.store
            .get(id)
            .ok_or_else(|| EngineError::NotFound(format!("job {id}")))
    }

    /// Jobs of one kind (or all), newest first.
    pub fn list(&self, kind: Option<JobKind>) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .store
            .list()
            .into_iter()
            .filter(|j| kind.map_or(true, |k| j.kind == k))
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    /// Merge `update` into the job. Terminal jobs are immutable.
    pub fn update(&self, id: &str, update: JobUpdate) -> Result<Job> {
        let mut job = self.get(id)?;
        if job.status.is_terminal() {
            return Err(EngineError::Conflict(format!("job {id} is already {}", job.status)));
        }

        if let Some(next) = update.status {
            if !job.status.can_move_to(next) {
                return Err(EngineError::Conflict(format!(
                    "job {id} cannot move from {} to {next}",
                    job.status
                )));
            }
            let now = Utc::now();
            match next {
                JobStatus::InProgress if job.started_at.is_none() => job.started_at = Some(now),
                JobStatus::Completed => {
                    job.progress = 100;
                    job.completed_at = Some(now);
                }
                JobStatus::Failed => job.completed_at = Some(now),
                _ => {}
            }
            job.status = next;
        }
        if let Some(progress) = update.progress {
            // Only completion reports 100
            job.progress = if job.status == JobStatus::Completed {
                100
            } else {
                progress.min(99)
            };
        }
        if let Some(backup_id) = update.backup_id {
            job.backup_id = Some(backup_id);
        }
        if let Some(error) = update.error {
            job.error = Some(error);
        }
        if let Some(warning) = update.warning {
            job.warnings.push(warning);
        }
        if let Some(metadata) = update.metadata {
            job.metadata = Some(metadata);
        }

        let status = job.status;
        self.store.set(job.clone());
        if let Some(tx) = self.signals.get(id) {
            tx.send_replace(status);
        }
        Ok(job)
    }

    pub fn start(&self, id: &str) -> Result<Job> {
        tracing::info!(job_id = %id, "Job started");
        self.update(
            id,
            JobUpdate {
                status: Some(JobStatus::InProgress),
                ..Default::default()
            },
        )
    }

    pub fn set_progress(&self, id: &str, progress: u8) -> Result<Job> {
        self.update(id, JobUpdate::progress(progress))
    }

    pub fn warn(&self, id: &str, item: &str, message: impl Into<String>) -> Result<Job> {
        let message = message.into();
        tracing::warn!(job_id = %id, item, "{}", message);
        self.update(
            id,
            JobUpdate {
                warning: Some(JobWarning {
                    item: item.to_string(),
                    message,
                }),
                ..Default::default()
            },
        )
    }

    pub fn complete(&self, id: &str, metadata: Option<BackupMetadata>) -> Result<Job> {
        tracing::info!(job_id = %id, "Job completed");
        self.update(
            id,
            JobUpdate {
                status: Some(JobStatus::Completed),
                metadata,
                ..Default::default()
            },
        )
    }

    pub fn fail(&self, id: &str, error: impl Into<String>) -> Result<Job> {
        let error = error.into();
        tracing::error!(job_id = %id, error = %error, "Job failed");
        self.update(
            id,
            JobUpdate {
                status: Some(JobStatus::Failed),
                error: Some(error),
                ..Default::default()
            },
        )
    }

    /// Wait until the job reaches a terminal state. Returns `None` on timeout.
    pub async fn wait_for_terminal(&self, id: &str, timeout: Option<Duration>) -> Result<Option<Job>> {
        let mut rx = self
            .signals
            .get(id)
            .map(|tx| tx.subscribe())
            .ok_or_else(|| EngineError::NotFound(format!("job {id}")))?;

        let wait = async {
            // The sender lives in the registry, so this only errors if the registry is gone
            let _ = rx.wait_for(|status| status.is_terminal()).await;
        };
        match timeout {
            Some(limit) => {
                if tokio::time::timeout(limit, wait).await.is_err() {
                    return Ok(None);
                }
            }
            None => wait.await,
        }
        self.get(id).map(Some)
    }
}
