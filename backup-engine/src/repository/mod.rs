//! Object repository client.
//!
//! Uniform put/get/list/stat/delete over an S3-compatible bucket or a local
//! directory. Keys are `/`-separated regardless of backend.

pub mod localfs;
pub mod s3;

use crate::config::RepositoryConfig;
use crate::utils::errors::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;

pub use localfs::LocalFsRepository;
pub use s3::S3Repository;

/// Metadata for a single stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait ObjectRepository: Send + Sync {
    /// Upload a local file, returning the number of bytes stored.
    async fn put_file(&self, key: &str, path: &Path) -> Result<u64>;

    async fn put_bytes(&self, key: &str, data: Bytes) -> Result<()>;

    /// `None` when the key does not exist.
    async fn get_bytes(&self, key: &str) -> Result<Option<Bytes>>;

    /// Download into `path`. Returns `false` when the key does not exist.
    async fn get_to_file(&self, key: &str, path: &Path) -> Result<bool>;

    async fn stat(&self, key: &str) -> Result<Option<ObjectInfo>>;

    /// Every object whose key starts with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>>;

    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let objects = self.list(prefix).await?;
        for object in &objects {
            self.delete(&object.key).await?;
        }
        Ok(objects.len())
    }
}

/// Opens repository clients from the configuration current at call time.
///
/// Jobs open their client once at start, so a configuration change only
/// affects jobs created afterwards.
#[async_trait]
pub trait RepositoryProvider: Send + Sync {
    async fn open(&self) -> Result<Arc<dyn ObjectRepository>>;

    /// Key prefix under which backups are laid out.
    async fn prefix(&self) -> String;
}

/// Provider backed by a swappable S3 configuration.
pub struct S3RepositoryProvider {
    config: RwLock<RepositoryConfig>,
}

impl S3RepositoryProvider {
    pub fn new(config: RepositoryConfig) -> Self {
        Self {
            config: RwLock::new(config),
        }
    }

    pub async fn current(&self) -> RepositoryConfig {
        self.config.read().await.clone()
    }

    /// Replace the configuration after validating it.
    pub async fn update(&self, config: RepositoryConfig) -> Result<()> {
        config.validate()?;
        *self.config.write().await = config;
        tracing::info!("Repository configuration updated");
        Ok(())
    }
}

#[async_trait]
impl RepositoryProvider for S3RepositoryProvider {
    async fn open(&self) -> Result<Arc<dyn ObjectRepository>> {
        let config = self.current().await;
        config.validate()?;
        let repo = S3Repository::connect(&config).await?;
        Ok(Arc::new(repo))
    }

    async fn prefix(&self) -> String {
        self.config.read().await.normalized_prefix()
    }
}

/// Provider that always hands out the same client.
pub struct StaticRepositoryProvider {
    repo: Arc<dyn ObjectRepository>,
    prefix: String,
}

impl StaticRepositoryProvider {
    pub fn new(repo: Arc<dyn ObjectRepository>, prefix: impl Into<String>) -> Self {
        Self {
            repo,
            prefix: prefix.into().trim_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl RepositoryProvider for StaticRepositoryProvider {
    async fn open(&self) -> Result<Arc<dyn ObjectRepository>> {
        Ok(self.repo.clone())
    }

    async fn prefix(&self) -> String {
        self.prefix.clone()
    }
}

/// Join key segments with `/`, skipping empty segments.
pub fn join_key(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| p.trim_matches('/'))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}
