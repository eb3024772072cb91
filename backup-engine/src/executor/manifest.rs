//! Backup metadata: the commit marker and object layout.
//!
//! Serialized as `metadata.json` under the backup's key prefix and uploaded
//! after every data object. A backup without it is not a backup.

use crate::archive::{CONFIG_ARCHIVE_EXT, VOLUME_ARCHIVE_EXT};
use crate::repository::join_key;
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const METADATA_FILE: &str = "metadata.json";
const MAX_LABEL_LEN: usize = 48;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupMetadata {
    pub id: String,
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub volumes: Vec<VolumeEntry>,
    #[serde(default)]
    pub app_configs: Vec<AppConfigEntry>,
    #[serde(default)]
    pub apps: Vec<String>,
    pub total_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeEntry {
    pub name: String,
    pub size: u64,
    pub archive_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfigEntry {
    pub app_id: String,
    pub archive_key: String,
    pub size: u64,
}

impl BackupMetadata {
    /// Every key this marker vouches for, data objects first.
    pub fn referenced_keys(&self) -> Vec<String> {
        self.volumes
            .iter()
            .map(|v| v.archive_key.clone())
            .chain(self.app_configs.iter().map(|a| a.archive_key.clone()))
            .collect()
    }

    pub fn has_volume(&self, volume: &str) -> bool {
        self.volumes.iter().any(|v| v.name == volume)
    }

    pub fn recompute_total(&mut self) {
        self.total_size = self.volumes.iter().map(|v| v.size).sum::<u64>()
            + self.app_configs.iter().map(|a| a.size).sum::<u64>();
    }
}

/// Key layout of one backup inside the repository.
#[derive(Debug, Clone)]
pub struct BackupLayout {
    prefix: String,
    backup_id: String,
}

impl BackupLayout {
    pub fn new(prefix: &str, backup_id: &str) -> Self {
        Self {
            prefix: prefix.trim_matches('/').to_string(),
            backup_id: backup_id.to_string(),
        }
    }

    /// Prefix of every object of this backup, with trailing slash.
    pub fn root(&self) -> String {
        format!("{}/", join_key(&[&self.prefix, &self.backup_id]))
    }

    pub fn volume_key(&self, volume: &str) -> String {
        join_key(&[
            &self.prefix,
            &self.backup_id,
            &format!("{volume}.{VOLUME_ARCHIVE_EXT}"),
        ])
    }

    pub fn app_config_key(&self, app_id: &str) -> String {
        join_key(&[
            &self.prefix,
            &self.backup_id,
            "app-configs",
            &format!("app-{app_id}.{CONFIG_ARCHIVE_EXT}"),
        ])
    }

    pub fn metadata_key(&self) -> String {
        join_key(&[&self.prefix, &self.backup_id, METADATA_FILE])
    }
}

/// Extract the backup id from a marker key `{prefix}/{id}/metadata.json`.
pub fn backup_id_from_marker_key(prefix: &str, key: &str) -> Option<String> {
    let prefix = prefix.trim_matches('/');
    let rest = if prefix.is_empty() {
        key
    } else {
        key.strip_prefix(prefix)?.strip_prefix('/')?
    };
    let id = rest.strip_suffix(METADATA_FILE)?.strip_suffix('/')?;
    (!id.is_empty() && !id.contains('/')).then(|| id.to_string())
}

/// Lowercase slug restricted to `[a-z0-9_-]`.
pub fn sanitize_label(label: &str) -> String {
    let slug: String = label
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let slug = slug.trim_matches('-');
    let slug: String = slug.chars().take(MAX_LABEL_LEN).collect();
    if slug.is_empty() {
        "backup".to_string()
    } else {
        slug
    }
}

/// `{label}-{YYYYMMDDTHHMMSSZ}-{6 hex}`; unique even for backups started in the same second.
pub fn generate_backup_id(label: Option<&str>, now: DateTime<Utc>) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{}-{}-{}",
        sanitize_label(label.unwrap_or("backup")),
        now.format("%Y%m%dT%H%M%SZ"),
        &suffix[..6]
    )
}

/// Volume names and app ids end up in object keys and helper-task scripts.
pub fn validate_name(kind: &str, name: &str) -> Result<()> {
    let valid_first = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric());
    let valid_rest = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if !valid_first || !valid_rest || name.len() > 255 {
        return Err(EngineError::Validation(format!("invalid {kind} name: {name:?}")));
    }
    Ok(())
}
