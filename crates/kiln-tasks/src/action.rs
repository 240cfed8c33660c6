//! Unit actions: the real work behind a unit

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::debug;

use crate::properties::ResolvedProperties;
use crate::reporter::{UnitEvent, UnitReporter};
use crate::unit::UnitId;

/// Failure of a unit's real logic
#[derive(Debug, Clone, thiserror::Error)]
pub enum WorkError {
    #[error("failed to spawn '{command}': {message}")]
    Spawn { command: String, message: String },

    #[error("command exited with code {code}: {stderr}")]
    ExitCode { code: i32, stderr: String },

    #[error("{0}")]
    Failed(String),
}

/// Everything an action may read while running
pub struct WorkContext<'a> {
    pub unit: &'a UnitId,
    pub project_dir: &'a Path,
    pub resolved: &'a ResolvedProperties,
    pub reporter: &'a dyn UnitReporter,
}

/// The logic a work unit runs when it cannot be skipped
#[async_trait]
pub trait WorkAction: Send + Sync {
    /// Stable description; feeds the default implementation identity
    fn describe(&self) -> String;

    /// Perform the work
    async fn execute(&self, ctx: &WorkContext<'_>) -> Result<(), WorkError>;
}

/// Runs a command through `sh -c` in the unit's project directory
#[derive(Debug, Clone)]
pub struct ShellAction {
    command: String,
    env: BTreeMap<String, String>,
}

impl ShellAction {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            env: BTreeMap::new(),
        }
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

#[async_trait]
impl WorkAction for ShellAction {
    fn describe(&self) -> String {
        self.command.clone()
    }

    async fn execute(&self, ctx: &WorkContext<'_>) -> Result<(), WorkError> {
        debug!(unit = %ctx.unit, command = %self.command, "running shell command");
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(ctx.project_dir)
            .envs(&self.env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| WorkError::Spawn {
                command: self.command.clone(),
                message: e.to_string(),
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (_, stderr_lines) = tokio::join!(
            forward_lines(stdout, ctx, false),
            forward_lines(stderr, ctx, true),
        );

        let status = child.wait().await.map_err(|e| WorkError::Spawn {
            command: self.command.clone(),
            message: e.to_string(),
        })?;

        if status.success() {
            Ok(())
        } else {
            Err(WorkError::ExitCode {
                code: status.code().unwrap_or(-1),
                stderr: stderr_lines.join("\n"),
            })
        }
    }
}

async fn forward_lines<R>(stream: Option<R>, ctx: &WorkContext<'_>, is_stderr: bool) -> Vec<String>
where
    R: AsyncRead + Unpin,
{
    let mut collected = Vec::new();
    let Some(stream) = stream else {
        return collected;
    };
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        ctx.reporter.report(&UnitEvent::Output {
            id: ctx.unit.clone(),
            line: line.clone(),
            is_stderr,
        });
        collected.push(line);
    }
    collected
}
