use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "backup-daemon", version, about = "Volume backup engine daemon")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the scheduler until SIGINT/SIGTERM
    Serve,
    /// Back up volumes and app configurations as archives
    Backup(BackupArgs),
    /// Restore an archive backup
    Restore(RestoreArgs),
    /// List committed archive backups, newest first
    List,
    /// Show one archive backup
    Show { backup_id: String },
    /// Delete an archive backup
    Delete { backup_id: String },
    /// Deduplicating snapshots
    #[command(subcommand)]
    Snapshot(SnapshotCommand),
    /// Per-volume schedules
    #[command(subcommand)]
    Schedule(ScheduleCommand),
    /// Repository settings
    #[command(subcommand)]
    Repo(RepoCommand),
}

#[derive(Args, Debug)]
pub struct BackupArgs {
    /// Label used for the backup id
    #[arg(long)]
    pub name: Option<String>,
    #[arg(long = "volume", short = 'v')]
    pub volumes: Vec<String>,
    /// App ids whose configuration directory is archived
    #[arg(long = "app-config")]
    pub app_configs: Vec<String>,
    /// Apps associated with the backup
    #[arg(long = "app")]
    pub apps: Vec<String>,
}

#[derive(Args, Debug)]
pub struct RestoreArgs {
    pub backup_id: String,
    /// Restore only these volumes
    #[arg(long = "volume", short = 'v')]
    pub volumes: Vec<String>,
    /// Restore only these app configurations
    #[arg(long = "app-config")]
    pub app_configs: Vec<String>,
    /// Replace existing volumes and app directories
    #[arg(long)]
    pub overwrite: bool,
    #[arg(long)]
    pub restart_apps: bool,
}

#[derive(Subcommand, Debug)]
pub enum SnapshotCommand {
    Init,
    Backup {
        volume: String,
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    List {
        #[arg(long)]
        volume: Option<String>,
    },
    Restore {
        snapshot_id: String,
        volume: String,
    },
    /// Forget one snapshot by id, or apply a keep policy
    Forget {
        snapshot_id: Option<String>,
        #[arg(long)]
        volume: Option<String>,
        #[arg(long)]
        keep_daily: Option<u32>,
        #[arg(long)]
        keep_weekly: Option<u32>,
        #[arg(long)]
        keep_monthly: Option<u32>,
    },
    Prune,
    Stats { snapshot_id: String },
    Check,
}

#[derive(Subcommand, Debug)]
pub enum ScheduleCommand {
    /// Create or replace the schedule of a volume
    Set {
        volume: String,
        #[arg(long)]
        interval_hours: i64,
        #[arg(long, default_value_t = 7)]
        keep: i64,
        #[arg(long)]
        disabled: bool,
    },
    List,
    Rm { volume: String },
    /// Run the backup-then-retain cycle now
    Run { volume: String },
}

#[derive(Subcommand, Debug)]
pub enum RepoCommand {
    Show,
    /// Update repository settings; omitted fields keep their value
    Set {
        #[arg(long)]
        endpoint: Option<String>,
        #[arg(long)]
        bucket: Option<String>,
        #[arg(long)]
        region: Option<String>,
        #[arg(long)]
        access_key: Option<String>,
        #[arg(long)]
        secret_key: Option<String>,
        #[arg(long)]
        prefix: Option<String>,
    },
}
