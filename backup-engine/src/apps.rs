//! Application restart after a restore.

use crate::process::CommandRunner;
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

/// Re-launches the multi-container stacks of a set of applications.
#[async_trait]
pub trait AppLauncher: Send + Sync {
    async fn restart_apps(&self, app_ids: &[String]) -> Result<()>;
}

/// Starts each application with `docker compose up -d` from its directory
/// under the apps root.
pub struct ComposeAppLauncher {
    runner: Arc<dyn CommandRunner>,
    apps_dir: PathBuf,
}

impl ComposeAppLauncher {
    pub fn new(runner: Arc<dyn CommandRunner>, apps_dir: PathBuf) -> Self {
        Self { runner, apps_dir }
    }

    fn compose_args(&self, app_id: &str) -> Vec<String> {
        let dir = self.apps_dir.join(app_id);
        vec![
            "compose".to_string(),
            "--project-directory".to_string(),
            dir.display().to_string(),
            "-f".to_string(),
            dir.join("docker-compose.yml").display().to_string(),
            "up".to_string(),
            "-d".to_string(),
        ]
    }
}

#[async_trait]
impl AppLauncher for ComposeAppLauncher {
    async fn restart_apps(&self, app_ids: &[String]) -> Result<()> {
        let mut failed = Vec::new();
        for app_id in app_ids {
            tracing::info!(app = %app_id, "Restarting application");
            let result = self
                .runner
                .run("docker", &self.compose_args(app_id), &[])
                .await
                .and_then(|out| out.check("docker compose"));
            if let Err(e) = result {
                tracing::error!(app = %app_id, "Failed to restart application: {}", e);
                failed.push(app_id.as_str());
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Execution(format!(
                "failed to restart application(s): {}",
                failed.join(", ")
            )))
        }
    }
}
