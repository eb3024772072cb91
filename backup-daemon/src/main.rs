mod cli;
mod config;
mod db;
mod error;
mod models;
mod services;
mod state;

use crate::cli::{BackupArgs, Cli, Command, RepoCommand, RestoreArgs, ScheduleCommand, SnapshotCommand};
use crate::config::AppConfig;
use crate::error::DaemonError;
use crate::models::schedule::UpsertScheduleRequest;
use crate::state::AppState;
use backup_engine::executor::{BackupRequest, RestoreRequest};
use backup_engine::jobs::JobStatus;
use backup_engine::snapshot::RetentionPolicy;
use backup_engine::utils::logger;
use clap::Parser;
use serde::Serialize;
use tokio::signal;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            e.exit_code()
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32, DaemonError> {
    let app = AppConfig::from_env();
    let config = app.load_engine_config()?;
    logger::init(&config.log.level)?;

    let state = AppState::build(&app, config).await?;

    match cli.command {
        Command::Serve => serve(&state).await.map(|_| 0),
        Command::Backup(args) => backup(&state, args).await,
        Command::Restore(args) => restore(&state, args).await,
        Command::List => print_json(&state.backups.list_backups().await?),
        Command::Show { backup_id } => print_json(&state.backups.get_backup(&backup_id).await?),
        Command::Delete { backup_id } => {
            state.backups.delete_backup(&backup_id).await?;
            Ok(0)
        }
        Command::Snapshot(cmd) => snapshot(&state, cmd).await,
        Command::Schedule(cmd) => schedule(&state, cmd).await,
        Command::Repo(cmd) => repo(&state, cmd).await,
    }
}

async fn serve(state: &AppState) -> Result<(), DaemonError> {
    tracing::info!(engine = ?state.config.scheduler.engine, "Starting backup daemon");

    if let Err(e) = state.scheduler.init_schedules().await {
        tracing::warn!("Failed to initialize schedules: {}", e);
    }
    state.scheduler.start().await?;

    shutdown_signal().await;

    tracing::info!("Shutting down...");
    if let Err(e) = state.scheduler.shutdown().await {
        tracing::warn!("Scheduler shutdown error: {}", e);
    }
    db::connection::close_pool(&state.db);
    tracing::info!("Daemon stopped");
    Ok(())
}

async fn backup(state: &AppState, args: BackupArgs) -> Result<i32, DaemonError> {
    let job_id = state
        .backups
        .create_backup(BackupRequest {
            name: args.name,
            volumes: args.volumes,
            app_configs: args.app_configs,
            apps: args.apps,
        })
        .await?;
    wait_job(state, &job_id).await
}

async fn restore(state: &AppState, args: RestoreArgs) -> Result<i32, DaemonError> {
    let job_id = state
        .backups
        .restore_backup(RestoreRequest {
            backup_id: args.backup_id,
            volumes: non_empty(args.volumes),
            app_ids: non_empty(args.app_configs),
            overwrite: args.overwrite,
            restart_apps: args.restart_apps,
        })
        .await?;
    wait_job(state, &job_id).await
}

async fn snapshot(state: &AppState, cmd: SnapshotCommand) -> Result<i32, DaemonError> {
    let snapshots = &state.snapshots;
    match cmd {
        SnapshotCommand::Init => {
            snapshots.init().await?;
            Ok(0)
        }
        SnapshotCommand::Backup { volume, tags } => {
            let job_id = snapshots.create_backup(&volume, tags).await?;
            wait_job(state, &job_id).await
        }
        SnapshotCommand::List { volume } => print_json(&snapshots.list_snapshots(volume.as_deref()).await?),
        SnapshotCommand::Restore { snapshot_id, volume } => {
            let job_id = snapshots.restore(&snapshot_id, &volume).await?;
            wait_job(state, &job_id).await
        }
        SnapshotCommand::Forget {
            snapshot_id,
            volume,
            keep_daily,
            keep_weekly,
            keep_monthly,
        } => {
            match snapshot_id {
                Some(id) => snapshots.forget(&id).await?,
                None => {
                    let policy = RetentionPolicy {
                        daily: keep_daily,
                        weekly: keep_weekly,
                        monthly: keep_monthly,
                    };
                    snapshots.forget_with_policy(volume.as_deref(), policy).await?
                }
            }
            Ok(0)
        }
        SnapshotCommand::Prune => {
            snapshots.prune().await?;
            Ok(0)
        }
        SnapshotCommand::Stats { snapshot_id } => {
            let size = snapshots.stats(&snapshot_id).await?;
            print_json(&serde_json::json!({ "snapshotId": snapshot_id, "totalSize": size }))
        }
        SnapshotCommand::Check => {
            let healthy = snapshots.check().await?;
            print_json(&serde_json::json!({ "healthy": healthy }))?;
            Ok(if healthy { 0 } else { 1 })
        }
    }
}

async fn schedule(state: &AppState, cmd: ScheduleCommand) -> Result<i32, DaemonError> {
    let scheduler = &state.scheduler;
    match cmd {
        ScheduleCommand::Set {
            volume,
            interval_hours,
            keep,
            disabled,
        } => {
            let saved = scheduler
                .upsert_schedule(UpsertScheduleRequest {
                    volume_name: volume,
                    interval_hours,
                    keep_count: keep,
                    enabled: !disabled,
                })
                .await?;
            print_json(&saved)
        }
        ScheduleCommand::List => print_json(&scheduler.list_schedules().await?),
        ScheduleCommand::Rm { volume } => {
            scheduler.delete_schedule(&volume).await?;
            Ok(0)
        }
        ScheduleCommand::Run { volume } => print_json(&scheduler.run_now(&volume).await?),
    }
}

async fn repo(state: &AppState, cmd: RepoCommand) -> Result<i32, DaemonError> {
    let mut current = state.provider.current().await;
    match cmd {
        RepoCommand::Show => {}
        RepoCommand::Set {
            endpoint,
            bucket,
            region,
            access_key,
            secret_key,
            prefix,
        } => {
            let fields = [
                (endpoint, &mut current.endpoint),
                (bucket, &mut current.bucket),
                (region, &mut current.region),
                (access_key, &mut current.access_key),
                (secret_key, &mut current.secret_key),
                (prefix, &mut current.prefix),
            ];
            for (value, slot) in fields {
                if let Some(value) = value {
                    *slot = value;
                }
            }
            state.update_repository(current.clone()).await?;
        }
    }
    if !current.secret_key.is_empty() {
        current.secret_key = "********".into();
    }
    print_json(&current)
}

/// Block until the job is terminal, print it and map its status to an exit code.
async fn wait_job(state: &AppState, job_id: &str) -> Result<i32, DaemonError> {
    let job = state
        .jobs
        .wait_for_terminal(job_id, None)
        .await?
        .ok_or_else(|| DaemonError::Internal(anyhow::anyhow!("job {job_id} did not finish")))?;
    print_json(&job)?;
    Ok(if job.status == JobStatus::Completed { 0 } else { 1 })
}

fn print_json<T: Serialize>(value: &T) -> Result<i32, DaemonError> {
    let out = serde_json::to_string_pretty(value).map_err(anyhow::Error::from)?;
    println!("{out}");
    Ok(0)
}

fn non_empty(items: Vec<String>) -> Option<Vec<String>> {
    (!items.is_empty()).then_some(items)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl+c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
