//! What the scheduler needs from an executor.

use crate::jobs::JobRegistry;
use crate::retention::RetentionReport;
use crate::utils::errors::Result;
use async_trait::async_trait;

/// A backup engine the scheduler can drive for a single volume.
#[async_trait]
pub trait ScheduledBackup: Send + Sync {
    /// Start a backup of `volume` and return its job id immediately.
    async fn backup_volume(&self, volume: &str) -> Result<String>;

    /// Registry the started jobs are tracked in.
    fn jobs(&self) -> &JobRegistry;

    /// Keep the newest `keep` backups of `volume`.
    async fn enforce_retention(&self, volume: &str, keep: usize) -> Result<RetentionReport>;

    /// Whether a backup or restore of `volume` is in flight.
    fn is_volume_busy(&self, volume: &str) -> bool;
}
