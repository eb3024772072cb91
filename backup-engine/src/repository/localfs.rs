//! Local directory backend. Each key maps to a file below the root.

use super::{ObjectInfo, ObjectRepository};
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs;
use walkdir::WalkDir;

pub struct LocalFsRepository {
    root: PathBuf,
}

impl LocalFsRepository {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.split('/').any(|seg| seg == "..") {
            return Err(EngineError::Validation(format!("invalid object key: {key}")));
        }
        Ok(self.root.join(key.trim_start_matches('/')))
    }
}

fn info_for(key: String, meta: &std::fs::Metadata) -> ObjectInfo {
    ObjectInfo {
        key,
        size: meta.len(),
        last_modified: meta.modified().ok().map(DateTime::<Utc>::from),
    }
}

#[async_trait]
impl ObjectRepository for LocalFsRepository {
    async fn put_file(&self, key: &str, path: &Path) -> Result<u64> {
        let dest = self.path_for(key)?;
        if let Some(dir) = dest.parent() {
            fs::create_dir_all(dir).await?;
        }
        Ok(fs::copy(path, dest).await?)
    }

    async fn put_bytes(&self, key: &str, data: Bytes) -> Result<()> {
        let dest = self.path_for(key)?;
        if let Some(dir) = dest.parent() {
            fs::create_dir_all(dir).await?;
        }
        fs::write(dest, &data).await?;
        Ok(())
    }

    async fn get_bytes(&self, key: &str) -> Result<Option<Bytes>> {
        match fs::read(self.path_for(key)?).await {
            Ok(buf) => Ok(Some(Bytes::from(buf))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_to_file(&self, key: &str, path: &Path) -> Result<bool> {
        let src = self.path_for(key)?;
        match fs::copy(&src, path).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn stat(&self, key: &str) -> Result<Option<ObjectInfo>> {
        match fs::metadata(self.path_for(key)?).await {
            Ok(meta) if meta.is_file() => Ok(Some(info_for(key.to_string(), &meta))),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let root = self.root.clone();
        let prefix = prefix.trim_start_matches('/').to_string();

        tokio::task::spawn_blocking(move || {
            let mut objects = Vec::new();
            if !root.exists() {
                return Ok(objects);
            }
            for entry in WalkDir::new(&root).follow_links(false) {
                let entry = entry.map_err(|e| EngineError::storage(e))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let relative = entry
                    .path()
                    .strip_prefix(&root)
                    .unwrap_or(entry.path())
                    .to_string_lossy()
                    .replace('\\', "/");
                if !relative.starts_with(&prefix) {
                    continue;
                }
                let meta = entry.metadata().map_err(|e| EngineError::storage(e))?;
                objects.push(info_for(relative, &meta));
            }
            objects.sort_by(|a, b| a.key.cmp(&b.key));
            Ok(objects)
        })
        .await?
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        // Prune now-empty parent directories up to the root
        let mut dir = path.parent().map(Path::to_path_buf);
        while let Some(d) = dir {
            if d == self.root || fs::remove_dir(&d).await.is_err() {
                break;
            }
            dir = d.parent().map(Path::to_path_buf);
        }
        Ok(())
    }
}
