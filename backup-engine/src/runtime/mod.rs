//! Container runtime capability: ephemeral tasks and named volumes.

pub mod docker;

use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use std::path::PathBuf;

pub use docker::DockerRuntime;

/// Mount point inside helper tasks for the volume being archived or restored.
pub const VOLUME_MOUNT: &str = "/volume";
/// Mount point inside helper tasks for the host scratch directory.
pub const SCRATCH_MOUNT: &str = "/backup";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindSource {
    Volume(String),
    HostPath(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bind {
    pub source: BindSource,
    pub target: String,
    pub read_only: bool,
}

impl Bind {
    pub fn volume(name: &str, target: &str, read_only: bool) -> Self {
        Self {
            source: BindSource::Volume(name.to_string()),
            target: target.to_string(),
            read_only,
        }
    }

    pub fn host(path: impl Into<PathBuf>, target: &str) -> Self {
        Self {
            source: BindSource::HostPath(path.into()),
            target: target.to_string(),
            read_only: false,
        }
    }

    /// Docker `-v` syntax: `source:target[:ro]`.
    pub fn to_spec(&self) -> String {
        let source = match &self.source {
            BindSource::Volume(name) => name.clone(),
            BindSource::HostPath(path) => path.display().to_string(),
        };
        let mode = if self.read_only { ":ro" } else { "" };
        format!("{source}:{}{mode}", self.target)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    pub name: String,
    /// Absolute host path of the volume data
    pub mountpoint: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct TaskOutput {
    pub exit_code: i64,
    pub logs: String,
}

impl TaskOutput {
    /// Non-zero exit becomes an execution error carrying the task logs.
    pub fn check(self, what: &str) -> Result<Self> {
        if self.exit_code == 0 {
            return Ok(self);
        }
        Err(EngineError::Execution(format!(
            "{what} exited with status {}: {}",
            self.exit_code,
            self.logs.trim()
        )))
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Run `cmd` in a throwaway container that is removed afterwards.
    async fn run_ephemeral_task(&self, image: &str, cmd: &[String], binds: &[Bind]) -> Result<TaskOutput>;

    async fn create_volume(&self, name: &str) -> Result<VolumeInfo>;

    async fn remove_volume(&self, name: &str) -> Result<()>;

    /// `None` when the volume does not exist.
    async fn inspect_volume(&self, name: &str) -> Result<Option<VolumeInfo>>;
}
