use crate::db::connection::DbPool;
use crate::error::DaemonError;
use crate::models::schedule::{self, Schedule, UpsertScheduleRequest};
use backup_engine::jobs::JobStatus;
use backup_engine::retention::RetentionReport;
use backup_engine::scheduled::ScheduledBackup;
use backup_engine::EngineError;
use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

/// Result of one backup-then-retain cycle.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    /// Another backup or restore of the volume was in flight
    Skipped { reason: String },
    /// The backup failed or could not start (no job id)
    Failed { job_id: Option<String>, error: String },
    /// The backup did not finish within the completion timeout; retention was not run
    TimedOut { job_id: String },
    Completed {
        job_id: String,
        retention: Option<RetentionReport>,
    },
}

/// Runs a single cycle for a volume. Shared between timers and manual triggers.
struct CycleRunner {
    db: DbPool,
    engine: Arc<dyn ScheduledBackup>,
    completion_timeout: Duration,
}

impl CycleRunner {
    async fn run(&self, volume: &str, keep: usize) -> CycleOutcome {
        if self.engine.is_volume_busy(volume) {
            tracing::warn!(volume, "Skipping scheduled backup: volume busy");
            return CycleOutcome::Skipped {
                reason: format!("volume {volume} is busy"),
            };
        }

        tracing::info!(volume, "Starting scheduled backup");
        let job_id = match self.engine.backup_volume(volume).await {
            Ok(id) => id,
            Err(EngineError::Conflict(reason)) => {
                tracing::warn!(volume, %reason, "Skipping scheduled backup");
                return CycleOutcome::Skipped { reason };
            }
            Err(e) => {
                tracing::error!(volume, error = %e, "Scheduled backup could not start");
                self.record_run(volume).await;
                return CycleOutcome::Failed {
                    job_id: None,
                    error: e.to_string(),
                };
            }
        };

        let outcome = match self
            .engine
            .jobs()
            .wait_for_terminal(&job_id, Some(self.completion_timeout))
            .await
        {
            Ok(Some(job)) if job.status == JobStatus::Completed => {
                let retention = match self.engine.enforce_retention(volume, keep).await {
                    Ok(report) => {
                        tracing::info!(
                            volume,
                            kept = report.kept.len(),
                            removed = report.removed.len(),
                            "Retention enforced"
                        );
                        Some(report)
                    }
                    Err(e) => {
                        tracing::warn!(volume, error = %e, "Retention skipped");
                        None
                    }
                };
                CycleOutcome::Completed { job_id, retention }
            }
            Ok(Some(job)) => {
                let error = job.error.unwrap_or_else(|| "backup failed".into());
                tracing::warn!(volume, job_id = %job_id, %error, "Scheduled backup failed, retention skipped");
                CycleOutcome::Failed {
                    job_id: Some(job_id),
                    error,
                }
            }
            Ok(None) => {
                tracing::warn!(
                    volume,
                    job_id = %job_id,
                    timeout_secs = self.completion_timeout.as_secs(),
                    "Scheduled backup still running, retention skipped"
                );
                CycleOutcome::TimedOut { job_id }
            }
            Err(e) => CycleOutcome::Failed {
                job_id: Some(job_id),
                error: e.to_string(),
            },
        };

        self.record_run(volume).await;
        outcome
    }

    async fn record_run(&self, volume: &str) {
        let db = self.db.clone();
        let v = volume.to_string();
        let result = tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            schedule::record_run(&conn, &v, Utc::now())
        })
        .await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(volume, error = %e, "Failed to record schedule run"),
            Err(e) => tracing::warn!(volume, error = %e, "Failed to record schedule run"),
        }
    }

    async fn load(&self, volume: &str) -> Result<Option<Schedule>, DaemonError> {
        let db = self.db.clone();
        let v = volume.to_string();
        let found = tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            schedule::find_by_volume(&conn, &v)
        })
        .await??;
        Ok(found)
    }
}

/// One repeating timer per scheduled volume.
pub struct VolumeScheduler {
    scheduler: Mutex<JobScheduler>,
    timers: DashMap<String, Uuid>,
    runner: Arc<CycleRunner>,
    /// Length of one schedule "hour"
    tick_unit: Duration,
}

const HOUR: Duration = Duration::from_secs(3600);

impl VolumeScheduler {
    pub async fn new(
        db: DbPool,
        engine: Arc<dyn ScheduledBackup>,
        completion_timeout: Duration,
    ) -> anyhow::Result<Self> {
        Self::with_tick_unit(db, engine, completion_timeout, HOUR).await
    }

    /// Like `new`, with `intervalHours` counted in `tick_unit` instead of hours.
    pub async fn with_tick_unit(
        db: DbPool,
        engine: Arc<dyn ScheduledBackup>,
        completion_timeout: Duration,
        tick_unit: Duration,
    ) -> anyhow::Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: Mutex::new(scheduler),
            timers: DashMap::new(),
            runner: Arc::new(CycleRunner {
                db,
                engine,
                completion_timeout,
            }),
            tick_unit,
        })
    }

    /// Install the timer for `schedule`, replacing any previous one, and
    /// move its persisted next run to one interval from now.
    async fn register(&self, schedule: &Schedule) -> anyhow::Result<()> {
        let runner = self.runner.clone();
        let volume = schedule.volume_name.clone();
        let period = schedule.interval(self.tick_unit).ok_or_else(|| {
            anyhow::anyhow!(
                "interval of {} hours is out of range for volume {}",
                schedule.interval_hours,
                schedule.volume_name
            )
        })?;

        let job = Job::new_repeated_async(period, move |_uuid, _lock| {
            let runner = runner.clone();
            let volume = volume.clone();
            Box::pin(async move {
                // Pick up edits made since the timer was installed
                let current = match runner.load(&volume).await {
                    Ok(Some(s)) if s.enabled => s,
                    Ok(_) => return,
                    Err(e) => {
                        tracing::error!(volume = %volume, error = %e, "Failed to load schedule");
                        return;
                    }
                };
                runner.run(&volume, current.keep_count as usize).await;
            })
        })?;

        let scheduler = self.scheduler.lock().await;
        if let Some((_, old)) = self.timers.remove(&schedule.volume_name) {
            scheduler.remove(&old).await?;
        }
        let id = scheduler.add(job).await?;
        self.timers.insert(schedule.volume_name.clone(), id);
        drop(scheduler);

        let db = self.runner.db.clone();
        let v = schedule.volume_name.clone();
        tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            schedule::reset_next_run(&conn, &v, Utc::now())
        })
        .await??;

        tracing::info!(
            volume = %schedule.volume_name,
            interval_hours = schedule.interval_hours,
            "Schedule registered"
        );
        Ok(())
    }

    async fn unregister(&self, volume: &str) -> anyhow::Result<()> {
        let scheduler = self.scheduler.lock().await;
        if let Some((_, old)) = self.timers.remove(volume) {
            scheduler.remove(&old).await?;
            tracing::info!(volume, "Schedule timer removed");
        }
        Ok(())
    }

    pub async fn upsert_schedule(&self, data: UpsertScheduleRequest) -> Result<Schedule, DaemonError> {
        data.validate()?;
        let db = self.runner.db.clone();
        let saved = tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            schedule::upsert(&conn, &data)
        })
        .await??;

        if saved.enabled {
            self.register(&saved).await?;
        } else {
            self.unregister(&saved.volume_name).await?;
        }
        Ok(saved)
    }

    pub async fn delete_schedule(&self, volume: &str) -> Result<(), DaemonError> {
        let db = self.runner.db.clone();
        let v = volume.to_string();
        let deleted = tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            schedule::delete(&conn, &v)
        })
        .await??;
        self.unregister(volume).await?;
        if !deleted {
            return Err(DaemonError::NotFound(format!("no schedule for volume {volume}")));
        }
        Ok(())
    }

    pub async fn list_schedules(&self) -> Result<Vec<Schedule>, DaemonError> {
        let db = self.runner.db.clone();
        let all = tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            schedule::find_all(&conn)
        })
        .await??;
        Ok(all)
    }

    pub async fn get_schedule(&self, volume: &str) -> Result<Schedule, DaemonError> {
        self.runner
            .load(volume)
            .await?
            .ok_or_else(|| DaemonError::NotFound(format!("no schedule for volume {volume}")))
    }

    /// Run the backup-then-retain cycle of a scheduled volume right away.
    pub async fn run_now(&self, volume: &str) -> Result<CycleOutcome, DaemonError> {
        let schedule = self.get_schedule(volume).await?;
        Ok(self
            .runner
            .run(&schedule.volume_name, schedule.keep_count as usize)
            .await)
    }

    /// Re-register every enabled schedule. Returns how many timers were installed.
    pub async fn init_schedules(&self) -> anyhow::Result<usize> {
        let db = self.runner.db.clone();
        let enabled = tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            schedule::find_enabled(&conn)
        })
        .await??;

        let now = Utc::now();
        let mut count = 0;
        for s in enabled {
            // Checked before registering, which moves next_run_at forward
            let overdue = s.is_overdue(now);
            if let Err(e) = self.register(&s).await {
                tracing::error!(volume = %s.volume_name, error = %e, "Failed to register schedule");
                continue;
            }
            count += 1;
            if overdue {
                tracing::info!(volume = %s.volume_name, next_run_at = ?s.next_run_at, "Running overdue schedule");
                let runner = self.runner.clone();
                tokio::spawn(async move {
                    runner.run(&s.volume_name, s.keep_count as usize).await;
                });
            }
        }

        tracing::info!(count, "Schedules initialized");
        Ok(count)
    }

    /// Volumes that currently have a timer, sorted.
    pub fn active_timers(&self) -> Vec<String> {
        let mut volumes: Vec<String> = self.timers.iter().map(|e| e.key().clone()).collect();
        volumes.sort();
        volumes
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.start().await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use async_trait::async_trait;
    use backup_engine::jobs::{JobKind, JobRegistry};
    use std::sync::Mutex as StdMutex;

    #[derive(Clone, Copy)]
    enum Finish {
        Complete,
        Fail,
        Never,
    }

    struct FakeEngine {
        jobs: JobRegistry,
        finish: Finish,
        busy: bool,
        retained: StdMutex<Vec<(String, usize)>>,
    }

    impl FakeEngine {
        fn new(finish: Finish) -> Arc<Self> {
            Arc::new(Self {
                jobs: JobRegistry::in_memory(),
                finish,
                busy: false,
                retained: StdMutex::new(Vec::new()),
            })
        }

        fn retained(&self) -> Vec<(String, usize)> {
            self.retained.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ScheduledBackup for FakeEngine {
        async fn backup_volume(&self, volume: &str) -> backup_engine::Result<String> {
            let id = self.jobs.create(JobKind::Backup, vec![volume.to_string()]);
            let jobs = self.jobs.clone();
            let finish = self.finish;
            let job_id = id.clone();
            tokio::spawn(async move {
                jobs.start(&job_id).unwrap();
                match finish {
                    Finish::Complete => {
                        jobs.complete(&job_id, None).unwrap();
                    }
                    Finish::Fail => {
                        jobs.fail(&job_id, "archive task exited with status 2").unwrap();
                    }
                    Finish::Never => {}
                }
            });
            Ok(id)
        }

        fn jobs(&self) -> &JobRegistry {
            &self.jobs
        }

        async fn enforce_retention(&self, volume: &str, keep: usize) -> backup_engine::Result<RetentionReport> {
            self.retained.lock().unwrap().push((volume.to_string(), keep));
            Ok(RetentionReport {
                volume: volume.to_string(),
                ..Default::default()
            })
        }

        fn is_volume_busy(&self, _volume: &str) -> bool {
            self.busy
        }
    }

    fn request(volume: &str, keep: i64) -> UpsertScheduleRequest {
        UpsertScheduleRequest {
            volume_name: volume.into(),
            interval_hours: 24,
            keep_count: keep,
            enabled: true,
        }
    }

    async fn scheduler_with(engine: Arc<FakeEngine>, pool: DbPool) -> VolumeScheduler {
        VolumeScheduler::new(pool, engine, Duration::from_millis(300))
            .await
            .unwrap()
    }

    async fn wait_until(limit: Duration, done: impl Fn() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        while tokio::time::Instant::now() < deadline {
            if done() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        done()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reregistering_keeps_one_timer() {
        let (_dir, pool) = test_pool();
        let scheduler = scheduler_with(FakeEngine::new(Finish::Complete), pool).await;

        scheduler.upsert_schedule(request("db", 7)).await.unwrap();
        scheduler.upsert_schedule(request("db", 3)).await.unwrap();
        scheduler.upsert_schedule(request("files", 2)).await.unwrap();

        assert_eq!(scheduler.active_timers(), vec!["db", "files"]);
        assert_eq!(scheduler.get_schedule("db").await.unwrap().keep_count, 3);
        assert_eq!(scheduler.list_schedules().await.unwrap().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_disable_and_delete_remove_timer() {
        let (_dir, pool) = test_pool();
        let scheduler = scheduler_with(FakeEngine::new(Finish::Complete), pool).await;

        scheduler.upsert_schedule(request("db", 7)).await.unwrap();
        let mut disabled = request("db", 7);
        disabled.enabled = false;
        let saved = scheduler.upsert_schedule(disabled).await.unwrap();
        assert!(!saved.enabled);
        assert!(scheduler.active_timers().is_empty());
        // Record is kept while disabled
        assert!(scheduler.get_schedule("db").await.is_ok());

        scheduler.upsert_schedule(request("db", 7)).await.unwrap();
        scheduler.delete_schedule("db").await.unwrap();
        assert!(scheduler.active_timers().is_empty());
        assert!(matches!(
            scheduler.delete_schedule("db").await,
            Err(DaemonError::NotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_invalid_schedule_is_rejected_synchronously() {
        let (_dir, pool) = test_pool();
        let scheduler = scheduler_with(FakeEngine::new(Finish::Complete), pool).await;
        let mut bad = request("db", 0);
        assert!(matches!(
            scheduler.upsert_schedule(bad.clone()).await,
            Err(DaemonError::BadRequest(_))
        ));
        bad.keep_count = 1;
        bad.interval_hours = 0;
        assert!(scheduler.upsert_schedule(bad).await.is_err());
        assert!(scheduler.list_schedules().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_run_now_enforces_retention_after_completion() {
        let (_dir, pool) = test_pool();
        let engine = FakeEngine::new(Finish::Complete);
        let scheduler = scheduler_with(engine.clone(), pool).await;
        scheduler.upsert_schedule(request("db", 2)).await.unwrap();

        let outcome = scheduler.run_now("db").await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Completed { retention: Some(_), .. }));
        assert_eq!(engine.retained(), vec![("db".to_string(), 2)]);

        let saved = scheduler.get_schedule("db").await.unwrap();
        assert!(saved.last_run_at.is_some());
        assert!(saved.next_run_at.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_or_slow_backup_skips_retention() {
        let (_dir, pool) = test_pool();
        let engine = FakeEngine::new(Finish::Fail);
        let scheduler = scheduler_with(engine.clone(), pool.clone()).await;
        scheduler.upsert_schedule(request("db", 2)).await.unwrap();
        let outcome = scheduler.run_now("db").await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Failed { .. }));
        assert!(engine.retained().is_empty());

        let engine = FakeEngine::new(Finish::Never);
        let scheduler = scheduler_with(engine.clone(), pool).await;
        let outcome = scheduler.run_now("db").await.unwrap();
        assert!(matches!(outcome, CycleOutcome::TimedOut { .. }));
        assert!(engine.retained().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_busy_volume_is_skipped() {
        let (_dir, pool) = test_pool();
        let engine = Arc::new(FakeEngine {
            jobs: JobRegistry::in_memory(),
            finish: Finish::Complete,
            busy: true,
            retained: StdMutex::new(Vec::new()),
        });
        let scheduler = scheduler_with(engine.clone(), pool).await;
        scheduler.upsert_schedule(request("db", 2)).await.unwrap();

        let outcome = scheduler.run_now("db").await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Skipped { .. }));
        assert!(engine.jobs.list(None).is_empty());
        assert!(scheduler.get_schedule("db").await.unwrap().last_run_at.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_init_reloads_enabled_schedules() {
        let (_dir, pool) = test_pool();
        {
            let conn = pool.get().unwrap();
            schedule::upsert(&conn, &request("db", 2)).unwrap();
            let mut off = request("files", 2);
            off.enabled = false;
            schedule::upsert(&conn, &off).unwrap();
        }
        let scheduler = scheduler_with(FakeEngine::new(Finish::Complete), pool).await;
        assert_eq!(scheduler.init_schedules().await.unwrap(), 1);
        assert_eq!(scheduler.active_timers(), vec!["db"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_timer_tick_runs_cycle_until_disabled() {
        let (_dir, pool) = test_pool();
        let engine = FakeEngine::new(Finish::Complete);
        let scheduler = VolumeScheduler::with_tick_unit(
            pool.clone(),
            engine.clone(),
            Duration::from_secs(5),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        let mut hourly = request("db", 3);
        hourly.interval_hours = 1;
        scheduler.upsert_schedule(hourly).await.unwrap();
        scheduler.start().await.unwrap();

        let ran = wait_until(Duration::from_secs(10), || !engine.retained().is_empty()).await;
        assert!(ran, "timer never fired");
        assert_eq!(engine.retained()[0], ("db".to_string(), 3));
        assert!(scheduler.get_schedule("db").await.unwrap().last_run_at.is_some());

        // Disabled behind the scheduler's back: the timer still fires but must do nothing
        pool.get()
            .unwrap()
            .execute("UPDATE schedules SET enabled = 0 WHERE volume_name = 'db'", [])
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        let jobs_before = engine.jobs.list(None).len();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(engine.jobs.list(None).len(), jobs_before);
        assert_eq!(scheduler.active_timers(), vec!["db"]);

        scheduler.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_init_runs_overdue_schedule_and_moves_next_run() {
        let (_dir, pool) = test_pool();
        {
            let conn = pool.get().unwrap();
            schedule::upsert(&conn, &request("db", 2)).unwrap();
            let past = (Utc::now() - chrono::Duration::hours(3)).to_rfc3339();
            conn.execute(
                "UPDATE schedules SET next_run_at = ? WHERE volume_name = 'db'",
                rusqlite::params![past],
            )
            .unwrap();
        }
        let engine = FakeEngine::new(Finish::Complete);
        let scheduler = scheduler_with(engine.clone(), pool).await;

        assert_eq!(scheduler.init_schedules().await.unwrap(), 1);
        let ran = wait_until(Duration::from_secs(5), || !engine.retained().is_empty()).await;
        assert!(ran, "overdue schedule was not run");
        assert_eq!(engine.retained(), vec![("db".to_string(), 2)]);

        let saved = scheduler.get_schedule("db").await.unwrap();
        assert!(!saved.is_overdue(Utc::now()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_schedule_not_yet_due_is_not_run_on_init() {
        let (_dir, pool) = test_pool();
        {
            let conn = pool.get().unwrap();
            schedule::upsert(&conn, &request("db", 2)).unwrap();
        }
        let engine = FakeEngine::new(Finish::Complete);
        let scheduler = scheduler_with(engine.clone(), pool).await;
        scheduler.init_schedules().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(engine.jobs.list(None).is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_run_now_requires_schedule() {
        let (_dir, pool) = test_pool();
        let scheduler = scheduler_with(FakeEngine::new(Finish::Complete), pool).await;
        assert!(matches!(
            scheduler.run_now("db").await,
            Err(DaemonError::NotFound(_))
        ));
    }
}
