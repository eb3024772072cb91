use crate::config::AppConfig;
use crate::db::connection::{create_pool, DbPool};
use crate::db::migrate::migrate;
use crate::models::settings;
use crate::services::backup_scheduler::VolumeScheduler;
use backup_engine::apps::ComposeAppLauncher;
use backup_engine::config::{EngineKind, RepositoryConfig};
use backup_engine::executor::{BackupService, ExecutorSettings};
use backup_engine::jobs::JobRegistry;
use backup_engine::process::{CommandRunner, SystemCommandRunner};
use backup_engine::repository::S3RepositoryProvider;
use backup_engine::runtime::docker::DockerRuntime;
use backup_engine::runtime::ContainerRuntime;
use backup_engine::scheduled::ScheduledBackup;
use backup_engine::snapshot::{SnapshotService, SnapshotSettings};
use backup_engine::Config;
use std::sync::Arc;
use std::time::Duration;

pub struct AppState {
    pub db: DbPool,
    pub config: Config,
    pub provider: Arc<S3RepositoryProvider>,
    pub jobs: JobRegistry,
    pub backups: BackupService,
    pub snapshots: SnapshotService,
    pub scheduler: VolumeScheduler,
}

impl AppState {
    pub async fn build(app: &AppConfig, config: Config) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&app.data_dir)?;
        let db = create_pool(&app.db_path.to_string_lossy())?;
        migrate(&db)?;

        // Settings saved through `repo set` win over file and environment
        let mut repository = config.repository.clone();
        let pool = db.clone();
        if let Some(saved) = tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            settings::load_repository(&conn)
        })
        .await??
        {
            repository = saved;
        }
        let provider = Arc::new(S3RepositoryProvider::new(repository));

        let runner: Arc<dyn CommandRunner> = Arc::new(SystemCommandRunner::with_timeout(
            config.scheduler.command_timeout_secs.map(Duration::from_secs),
        ));
        let runtime: Arc<dyn ContainerRuntime> =
            Arc::new(DockerRuntime::connect(config.runtime.pull_helper_image)?);
        let launcher = Arc::new(ComposeAppLauncher::new(
            runner.clone(),
            config.paths.apps_dir.clone(),
        ));
        let jobs = JobRegistry::in_memory();

        let backups = BackupService::new(
            provider.clone(),
            runtime.clone(),
            launcher,
            jobs.clone(),
            ExecutorSettings::from_config(&config),
        );
        let snapshots = SnapshotService::new(
            provider.clone(),
            runner,
            runtime,
            jobs.clone(),
            SnapshotSettings::from_config(&config),
        );

        let engine: Arc<dyn ScheduledBackup> = match config.scheduler.engine {
            EngineKind::Archive => Arc::new(backups.clone()),
            EngineKind::Snapshot => Arc::new(snapshots.clone()),
        };
        let scheduler = VolumeScheduler::new(
            db.clone(),
            engine,
            Duration::from_secs(config.scheduler.completion_timeout_secs),
        )
        .await?;

        Ok(Self {
            db,
            config,
            provider,
            jobs,
            backups,
            snapshots,
            scheduler,
        })
    }

    /// Swap the repository settings and persist them for later runs.
    pub async fn update_repository(&self, repository: RepositoryConfig) -> anyhow::Result<()> {
        self.provider.update(repository.clone()).await?;
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            settings::save_repository(&conn, &repository)
        })
        .await??;
        Ok(())
    }
}
