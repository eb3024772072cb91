//! Archive helpers.
//!
//! Volumes are archived inside helper containers with the stock `tar`
//! binary. Application configuration directories live on the host and are
//! packed here directly with `tar` + `zstd`.

use crate::runtime::{SCRATCH_MOUNT, VOLUME_MOUNT};
use crate::utils::errors::{EngineError, Result};
use std::fs::File;
use std::path::{Path, PathBuf};

/// Extension of volume archives produced by helper tasks.
pub const VOLUME_ARCHIVE_EXT: &str = "tar.gz";
/// Extension of host-side configuration archives.
pub const CONFIG_ARCHIVE_EXT: &str = "tar.zst";

const ZSTD_LEVEL: i32 = 3;

/// Helper-task command archiving the mounted volume into the scratch mount.
pub fn volume_archive_command(file_name: &str) -> Vec<String> {
    vec![
        "sh".to_string(),
        "-c".to_string(),
        format!("tar -czf {SCRATCH_MOUNT}/{file_name} -C {VOLUME_MOUNT} ."),
    ]
}

/// Helper-task command replacing the volume contents with an archive.
pub fn volume_restore_command(file_name: &str) -> Vec<String> {
    vec![
        "sh".to_string(),
        "-c".to_string(),
        format!(
            "find {VOLUME_MOUNT} -mindepth 1 -delete && tar -xzf {SCRATCH_MOUNT}/{file_name} -C {VOLUME_MOUNT}"
        ),
    ]
}

/// Pack the contents of `src` into a zstd-compressed tar at `dest`.
/// Returns the archive size in bytes.
pub async fn pack_dir(src: &Path, dest: &Path) -> Result<u64> {
    let src = src.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || pack_dir_blocking(&src, &dest)).await?
}

fn pack_dir_blocking(src: &Path, dest: &Path) -> Result<u64> {
    if !src.is_dir() {
        return Err(EngineError::NotFound(format!("directory {}", src.display())));
    }
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file = File::create(dest)?;
    let encoder = zstd::stream::write::Encoder::new(file, ZSTD_LEVEL)?;
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    builder.append_dir_all(".", src)?;
    let encoder = builder.into_inner()?;
    encoder.finish()?.sync_all()?;

    Ok(std::fs::metadata(dest)?.len())
}

/// Unpack an archive made by [`pack_dir`] into `dest`, creating it if needed.
pub async fn unpack_into(archive: &Path, dest: &Path) -> Result<()> {
    let archive = archive.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || unpack_blocking(&archive, &dest)).await?
}

fn unpack_blocking(archive: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    let decoder = zstd::stream::read::Decoder::new(File::open(archive)?)?;
    let mut tar = tar::Archive::new(decoder);
    tar.set_preserve_permissions(true);
    tar.unpack(dest)?;
    Ok(())
}

/// Replace the whole of `dest` with the contents of `archive`.
pub async fn replace_dir(archive: &Path, dest: &Path) -> Result<()> {
    remove_dir_if_exists(dest).await?;
    unpack_into(archive, dest).await
}

pub async fn remove_dir_if_exists(dir: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Per-job scratch directory, removed on drop whatever the job outcome.
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    pub async fn create(root: &Path, name: &str) -> Result<Self> {
        let path = root.join(name);
        tokio::fs::create_dir_all(&path).await?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), "Failed to remove scratch directory: {}", e);
            }
        }
    }
}
