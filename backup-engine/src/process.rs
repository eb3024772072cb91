//! Subprocess execution with captured output.

use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Convert a non-zero exit into an execution error naming the program.
    pub fn check(self, program: &str) -> Result<Self> {
        if self.success() {
            return Ok(self);
        }
        let detail = self.stderr.trim();
        let detail = if detail.is_empty() { self.stdout.trim() } else { detail };
        Err(EngineError::Execution(format!(
            "{program} exited with status {}: {}",
            self.exit_code,
            last_lines(detail, 5)
        )))
    }
}

fn last_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(n)..].join("\n")
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` to completion. A non-zero exit is reported in the output,
    /// not as an error; only failing to spawn is an error.
    async fn run(&self, program: &str, args: &[String], env: &[(String, String)]) -> Result<CommandOutput>;
}

/// Runs commands on the host with `tokio::process`.
#[derive(Debug, Clone, Default)]
pub struct SystemCommandRunner {
    timeout: Option<Duration>,
}

impl SystemCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, program: &str, args: &[String], env: &[(String, String)]) -> Result<CommandOutput> {
        tracing::debug!(program, ?args, "Running command");

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| EngineError::Execution(format!("failed to start {program}: {e}")))?;

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| {
                    EngineError::Execution(format!("{program} timed out after {}s", limit.as_secs()))
                })??,
            None => child.wait_with_output().await?,
        };

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            // Killed by a signal: no code
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}
