//! Deduplicating snapshot repository driven through the restic CLI.
//!
//! The repository lives inside the configured bucket. Its password is
//! derived from the connection settings, so the same configuration always
//! opens the same repository and nothing else needs to be stored.

use crate::config::RepositoryConfig;
use crate::process::{CommandOutput, CommandRunner};
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;

/// Tag carried by every snapshot this engine creates.
pub const ENGINE_TAG: &str = "volume-backup";

pub fn volume_tag(volume: &str) -> String {
    format!("volume:{volume}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    #[serde(default)]
    pub short_id: String,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub summary: Option<SnapshotSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSummary {
    #[serde(default)]
    pub total_bytes_processed: u64,
}

impl Snapshot {
    pub fn size(&self) -> Option<u64> {
        self.summary.as_ref().map(|s| s.total_bytes_processed)
    }

    /// Volume name from the `volume:<name>` tag.
    pub fn volume(&self) -> Option<&str> {
        self.tags.iter().find_map(|t| t.strip_prefix("volume:"))
    }
}

/// Calendar retention envelope for `forget`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub daily: Option<u32>,
    pub weekly: Option<u32>,
    pub monthly: Option<u32>,
}

impl RetentionPolicy {
    fn args(&self) -> Vec<String> {
        let mut args = Vec::new();
        for (flag, value) in [
            ("--keep-daily", self.daily),
            ("--keep-weekly", self.weekly),
            ("--keep-monthly", self.monthly),
        ] {
            if let Some(n) = value {
                args.push(flag.to_string());
                args.push(n.to_string());
            }
        }
        args
    }

    pub fn is_empty(&self) -> bool {
        self.daily.is_none() && self.weekly.is_none() && self.monthly.is_none()
    }
}

pub struct SnapshotRepository {
    runner: Arc<dyn CommandRunner>,
    binary: String,
    env: Vec<(String, String)>,
}

impl SnapshotRepository {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        binary: &str,
        config: &RepositoryConfig,
        sub_path: &str,
    ) -> Result<Self> {
        config.validate()?;
        let env = vec![
            ("RESTIC_REPOSITORY".to_string(), repository_url(config, sub_path)),
            ("RESTIC_PASSWORD".to_string(), derive_password(config)),
            ("AWS_ACCESS_KEY_ID".to_string(), config.access_key.clone()),
            ("AWS_SECRET_ACCESS_KEY".to_string(), config.secret_key.clone()),
            ("AWS_DEFAULT_REGION".to_string(), config.region.clone()),
        ];
        Ok(Self {
            runner,
            binary: binary.to_string(),
            env,
        })
    }

    async fn exec(&self, args: Vec<String>) -> Result<CommandOutput> {
        self.runner.run(&self.binary, &args, &self.env).await
    }

    /// Create the repository. An already initialized repository is fine.
    pub async fn init(&self) -> Result<()> {
        let out = self.exec(vec!["init".into()]).await?;
        if out.success() {
            tracing::info!("Snapshot repository initialized");
            return Ok(());
        }
        let stderr = out.stderr.to_lowercase();
        if stderr.contains("already initialized") || stderr.contains("already exists") {
            tracing::debug!("Snapshot repository already initialized");
            return Ok(());
        }
        out.check(&self.binary).map(|_| ())
    }

    /// Snapshot `path` straight into the repository and return the snapshot id.
    pub async fn backup(&self, volume: &str, path: &Path, tags: &[String]) -> Result<String> {
        let mut all_tags = vec![ENGINE_TAG.to_string(), volume_tag(volume)];
        all_tags.extend(tags.iter().filter(|t| !t.is_empty()).cloned());

        let mut args = vec!["backup".to_string(), "--json".to_string()];
        for tag in &all_tags {
            args.push("--tag".to_string());
            args.push(tag.clone());
        }
        args.push(path.display().to_string());

        let out = self.exec(args).await?.check(&self.binary)?;
        let id = parse_snapshot_id(&out.stdout).ok_or_else(|| {
            EngineError::Integrity(format!("no snapshot id in backup output for volume {volume}"))
        })?;
        tracing::info!(volume, snapshot_id = %id, "Snapshot created");
        Ok(id)
    }

    /// Restore into the original absolute location of `path`.
    ///
    /// Targets `/` with an include filter; targeting the path itself would
    /// nest the data under a second copy of it.
    pub async fn restore(&self, snapshot_id: &str, path: &Path) -> Result<()> {
        let args = vec![
            "restore".to_string(),
            snapshot_id.to_string(),
            "--target".to_string(),
            "/".to_string(),
            "--include".to_string(),
            path.display().to_string(),
        ];
        self.exec(args).await?.check(&self.binary)?;
        tracing::info!(snapshot_id, path = %path.display(), "Snapshot restored");
        Ok(())
    }

    /// Snapshots carrying every tag in `tags`, newest first.
    pub async fn list_snapshots(&self, tags: &[String]) -> Result<Vec<Snapshot>> {
        let mut args = vec!["snapshots".to_string(), "--json".to_string()];
        if !tags.is_empty() {
            args.push("--tag".to_string());
            args.push(tags.join(","));
        }
        let out = self.exec(args).await?.check(&self.binary)?;
        let stdout = out.stdout.trim();
        let mut snapshots: Vec<Snapshot> = if stdout.is_empty() || stdout == "null" {
            Vec::new()
        } else {
            serde_json::from_str(stdout)?
        };
        snapshots.sort_by(|a, b| b.time.cmp(&a.time).then_with(|| b.id.cmp(&a.id)));
        Ok(snapshots)
    }

    pub async fn forget_with_policy(&self, tags: &[String], policy: RetentionPolicy) -> Result<()> {
        if policy.is_empty() {
            return Err(EngineError::Validation(
                "retention policy keeps nothing; refusing to forget every snapshot".into(),
            ));
        }
        let mut args = vec!["forget".to_string()];
        if !tags.is_empty() {
            args.push("--tag".to_string());
            args.push(tags.join(","));
        }
        args.extend(policy.args());
        args.push("--prune".to_string());
        self.exec(args).await?.check(&self.binary)?;
        Ok(())
    }

    /// Keep only the newest `keep` snapshots carrying `tags`.
    pub async fn forget_keep_last(&self, tags: &[String], keep: usize) -> Result<()> {
        let mut args = vec!["forget".to_string()];
        if !tags.is_empty() {
            args.push("--tag".to_string());
            args.push(tags.join(","));
        }
        args.extend(["--keep-last".to_string(), keep.to_string(), "--prune".to_string()]);
        self.exec(args).await?.check(&self.binary)?;
        Ok(())
    }

    pub async fn forget_one(&self, snapshot_id: &str) -> Result<()> {
        let out = self.exec(vec!["forget".into(), snapshot_id.to_string()]).await?;
        if !out.success() && out.stderr.to_lowercase().contains("no matching id") {
            return Err(EngineError::NotFound(format!("snapshot {snapshot_id}")));
        }
        out.check(&self.binary)?;
        tracing::info!(snapshot_id, "Snapshot forgotten");
        Ok(())
    }

    /// Reclaim space held by forgotten snapshots.
    pub async fn prune(&self) -> Result<()> {
        self.exec(vec!["prune".into()]).await?.check(&self.binary)?;
        Ok(())
    }

    /// Total size of a snapshot. `None` when it cannot be determined.
    pub async fn stats(&self, snapshot_id: &str) -> Option<u64> {
        let args = vec!["stats".to_string(), snapshot_id.to_string(), "--json".to_string()];
        let out = match self.exec(args).await.and_then(|o| o.check(&self.binary)) {
            Ok(out) => out,
            Err(e) => {
                tracing::warn!(snapshot_id, "Failed to read snapshot stats: {}", e);
                return None;
            }
        };
        serde_json::from_str::<serde_json::Value>(out.stdout.trim())
            .ok()
            .and_then(|v| v.get("total_size").and_then(|s| s.as_u64()))
    }

    /// Full integrity verification. `Ok(false)` means the check ran and failed.
    pub async fn check(&self) -> Result<bool> {
        let out = self.exec(vec!["check".into()]).await?;
        if !out.success() {
            tracing::error!("Snapshot repository check failed: {}", out.stderr.trim());
        }
        Ok(out.success())
    }
}

/// `s3:{endpoint}/{bucket}/{sub_path}`
pub fn repository_url(config: &RepositoryConfig, sub_path: &str) -> String {
    let endpoint = config.endpoint.trim_end_matches('/');
    let sub_path = sub_path.trim_matches('/');
    if sub_path.is_empty() {
        format!("s3:{endpoint}/{}", config.bucket)
    } else {
        format!("s3:{endpoint}/{}/{sub_path}", config.bucket)
    }
}

/// Hex SHA-256 over the connection settings.
pub fn derive_password(config: &RepositoryConfig) -> String {
    let mut hasher = Sha256::new();
    for part in [
        &config.endpoint,
        &config.bucket,
        &config.region,
        &config.access_key,
        &config.secret_key,
    ] {
        hasher.update(part.as_bytes());
        hasher.update(b"|");
    }
    hex::encode(hasher.finalize())
}

/// Pull the snapshot id out of `restic backup --json` output.
///
/// The summary record is authoritative. When it is missing or unreadable
/// any line carrying an id is accepted.
pub fn parse_snapshot_id(stdout: &str) -> Option<String> {
    let records: Vec<serde_json::Value> = stdout
        .lines()
        .filter_map(|line| serde_json::from_str(line.trim()).ok())
        .collect();

    let from_summary = records.iter().find_map(|r| {
        (r.get("message_type").and_then(|m| m.as_str()) == Some("summary"))
            .then(|| r.get("snapshot_id").and_then(|id| id.as_str()))
            .flatten()
    });

    from_summary
        .or_else(|| {
            records.iter().rev().find_map(|r| {
                r.get("snapshot_id")
                    .or_else(|| r.get("id"))
                    .and_then(|id| id.as_str())
            })
        })
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{valid_repository_config, FakeRestic};
    use std::path::PathBuf;

    fn repo(fake: Arc<FakeRestic>) -> SnapshotRepository {
        SnapshotRepository::new(fake, "restic", &valid_repository_config(), "restic").unwrap()
    }

    #[test]
    fn test_password_is_deterministic() {
        let config = valid_repository_config();
        assert_eq!(derive_password(&config), derive_password(&config.clone()));
        assert_eq!(derive_password(&config).len(), 64);

        let other = RepositoryConfig {
            secret_key: "different".into(),
            ..config.clone()
        };
        assert_ne!(derive_password(&config), derive_password(&other));
    }

    #[test]
    fn test_repository_url() {
        let config = RepositoryConfig {
            endpoint: "http://minio:9000/".into(),
            ..valid_repository_config()
        };
        assert_eq!(
            repository_url(&config, "/restic/"),
            format!("s3:http://minio:9000/{}/restic", config.bucket)
        );
    }

    #[test]
    fn test_parse_snapshot_id() {
        let out = concat!(
            "{\"message_type\":\"status\",\"percent_done\":0.5}\n",
            "{\"message_type\":\"summary\",\"snapshot_id\":\"abc123\"}\n"
        );
        assert_eq!(parse_snapshot_id(out).as_deref(), Some("abc123"));

        // Summary missing: fall back to any line with an id
        let out = "not json\n{\"id\":\"fallback1\"}\n";
        assert_eq!(parse_snapshot_id(out).as_deref(), Some("fallback1"));

        // Malformed summary without an id
        let out = "{\"message_type\":\"summary\"}\n{\"snapshot_id\":\"late\"}\n";
        assert_eq!(parse_snapshot_id(out).as_deref(), Some("late"));

        assert!(parse_snapshot_id("{\"message_type\":\"status\"}").is_none());
    }

    #[tokio::test]
    async fn test_init_is_idempotent() {
        let fake = Arc::new(FakeRestic::new());
        let repo = repo(fake.clone());
        repo.init().await.unwrap();
        repo.init().await.unwrap();
        assert_eq!(fake.count("init"), 2);
    }

    #[tokio::test]
    async fn test_backup_list_forget() {
        let fake = Arc::new(FakeRestic::new());
        let repo = repo(fake.clone());
        repo.init().await.unwrap();

        let id = repo
            .backup("demo", &PathBuf::from("/var/lib/docker/volumes/demo/_data"), &[])
            .await
            .unwrap();

        let listed = repo.list_snapshots(&[volume_tag("demo")]).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, id);
        assert!(listed[0].tags.contains(&ENGINE_TAG.to_string()));
        assert_eq!(listed[0].volume(), Some("demo"));

        repo.forget_one(&id).await.unwrap();
        assert!(repo.list_snapshots(&[volume_tag("demo")]).await.unwrap().is_empty());
        assert!(matches!(repo.forget_one(&id).await, Err(EngineError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_restore_targets_root_with_include() {
        let fake = Arc::new(FakeRestic::new());
        let repo = repo(fake.clone());
        repo.restore("abc", &PathBuf::from("/data/vol")).await.unwrap();

        let call = fake.last_call().unwrap();
        assert_eq!(call.args, vec!["restore", "abc", "--target", "/", "--include", "/data/vol"]);
        assert!(call.env.iter().any(|(k, _)| k == "RESTIC_PASSWORD"));
    }

    #[tokio::test]
    async fn test_stats_never_fails() {
        let fake = Arc::new(FakeRestic::new());
        let repo = repo(fake.clone());
        let id = repo.backup("demo", &PathBuf::from("/d"), &[]).await.unwrap();
        assert_eq!(repo.stats(&id).await, Some(4096));
        assert_eq!(repo.stats("unknown").await, None);
    }

    #[tokio::test]
    async fn test_forget_keep_last_and_policy() {
        let fake = Arc::new(FakeRestic::new());
        let repo = repo(fake.clone());
        for _ in 0..3 {
            repo.backup("db", &PathBuf::from("/d"), &[]).await.unwrap();
        }
        repo.forget_keep_last(&[ENGINE_TAG.into(), volume_tag("db")], 2)
            .await
            .unwrap();
        assert_eq!(repo.list_snapshots(&[volume_tag("db")]).await.unwrap().len(), 2);

        assert!(matches!(
            repo.forget_with_policy(&[], RetentionPolicy::default()).await,
            Err(EngineError::Validation(_))
        ));
        let policy = RetentionPolicy {
            daily: Some(7),
            weekly: Some(4),
            monthly: None,
        };
        repo.forget_with_policy(&[volume_tag("db")], policy).await.unwrap();
        let call = fake.last_call().unwrap();
        assert!(call.args.ends_with(&[
            "--keep-daily".to_string(),
            "7".to_string(),
            "--keep-weekly".to_string(),
            "4".to_string(),
            "--prune".to_string()
        ]));
    }

    #[tokio::test]
    async fn test_check_reports_failure() {
        let fake = Arc::new(FakeRestic::new());
        let repo = repo(fake.clone());
        assert!(repo.check().await.unwrap());
        fake.set_check_fails(true);
        assert!(!repo.check().await.unwrap());
    }
}
