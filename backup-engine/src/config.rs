//! Configuration management for the backup engine.
//!
//! Loads configuration from TOML file with environment variable overrides
//! for the repository credentials.

use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub repository: RepositoryConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// S3-compatible bucket holding every backup object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Endpoint URL, e.g. `http://minio:9000`
    #[serde(default)]
    pub endpoint: String,

    #[serde(default)]
    pub bucket: String,

    #[serde(default = "default_region")]
    pub region: String,

    #[serde(default)]
    pub access_key: String,

    #[serde(default)]
    pub secret_key: String,

    /// Key prefix under which backups are laid out
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Path-style addressing (required by most self-hosted S3 servers)
    #[serde(default = "default_true")]
    pub force_path_style: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Image used for ephemeral archive/restore tasks
    #[serde(default = "default_helper_image")]
    pub helper_image: String,

    /// Pull the helper image when it is missing locally
    #[serde(default = "default_true")]
    pub pull_helper_image: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Host directory for local archives; mounted read-write into helper tasks
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,

    /// Host directory holding one configuration directory per application
    #[serde(default = "default_apps_dir")]
    pub apps_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// restic binary
    #[serde(default = "default_restic_binary")]
    pub binary: String,

    /// Path inside the bucket holding the deduplicating repository
    #[serde(default = "default_snapshot_path")]
    pub repository_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Per-volume archives uploaded under a commit marker
    Archive,
    /// Deduplicating snapshots (restic)
    Snapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Which executor scheduled backups go through
    #[serde(default = "default_engine_kind")]
    pub engine: EngineKind,

    /// Upper bound on waiting for a scheduled backup before retention is skipped
    #[serde(default = "default_completion_timeout")]
    pub completion_timeout_secs: u64,

    /// Timeout for external commands. Unset means no timeout.
    #[serde(default)]
    pub command_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_prefix() -> String {
    "backups".to_string()
}

fn default_true() -> bool {
    true
}

fn default_helper_image() -> String {
    "alpine:3.20".to_string()
}

fn default_scratch_dir() -> PathBuf {
    PathBuf::from("/var/lib/volume-backup/scratch")
}

fn default_apps_dir() -> PathBuf {
    PathBuf::from("/var/lib/volume-backup/apps")
}

fn default_restic_binary() -> String {
    "restic".to_string()
}

fn default_snapshot_path() -> String {
    "restic".to_string()
}

fn default_engine_kind() -> EngineKind {
    EngineKind::Archive
}

fn default_completion_timeout() -> u64 {
    6 * 60 * 60
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            bucket: String::new(),
            region: default_region(),
            access_key: String::new(),
            secret_key: String::new(),
            prefix: default_prefix(),
            force_path_style: true,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            helper_image: default_helper_image(),
            pull_helper_image: true,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            scratch_dir: default_scratch_dir(),
            apps_dir: default_apps_dir(),
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            binary: default_restic_binary(),
            repository_path: default_snapshot_path(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            engine: default_engine_kind(),
            completion_timeout_secs: default_completion_timeout(),
            command_timeout_secs: None,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            repository: RepositoryConfig::default(),
            runtime: RuntimeConfig::default(),
            paths: PathsConfig::default(),
            snapshot: SnapshotConfig::default(),
            scheduler: SchedulerConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Apply environment overrides on top of the file values.
    pub fn apply_env(&mut self) {
        self.apply_vars(|key| std::env::var(key).ok());
    }

    fn apply_vars(&mut self, get: impl Fn(&str) -> Option<String>) {
        let repo = &mut self.repository;
        let overrides: [(&str, &mut String); 6] = [
            ("S3_ENDPOINT", &mut repo.endpoint),
            ("S3_BUCKET", &mut repo.bucket),
            ("S3_REGION", &mut repo.region),
            ("S3_ACCESS_KEY", &mut repo.access_key),
            ("S3_SECRET_KEY", &mut repo.secret_key),
            ("S3_PREFIX", &mut repo.prefix),
        ];
        for (key, slot) in overrides {
            if let Some(value) = get(key).filter(|v| !v.is_empty()) {
                *slot = value;
            }
        }
        if let Some(binary) = get("RESTIC_BINARY") {
            self.snapshot.binary = binary;
        }
        if let Some(dir) = get("BACKUP_SCRATCH_DIR") {
            self.paths.scratch_dir = PathBuf::from(dir);
        }
        if let Some(dir) = get("BACKUP_APPS_DIR") {
            self.paths.apps_dir = PathBuf::from(dir);
        }
    }
}

impl RepositoryConfig {
    /// Reject configurations that cannot reach a bucket.
    pub fn validate(&self) -> Result<()> {
        let missing: Vec<&str> = [
            ("endpoint", &self.endpoint),
            ("bucket", &self.bucket),
            ("access_key", &self.access_key),
            ("secret_key", &self.secret_key),
        ]
        .into_iter()
        .filter(|(_, v)| v.trim().is_empty())
        .map(|(k, _)| k)
        .collect();

        if !missing.is_empty() {
            return Err(EngineError::Config(format!(
                "repository settings missing: {}",
                missing.join(", ")
            )));
        }
        if !self.endpoint.starts_with("http://") && !self.endpoint.starts_with("https://") {
            return Err(EngineError::Config(format!(
                "repository endpoint must be an http(s) URL, got {}",
                self.endpoint
            )));
        }
        Ok(())
    }

    /// Prefix without surrounding slashes.
    pub fn normalized_prefix(&self) -> String {
        self.prefix.trim_matches('/').to_string()
    }
}
