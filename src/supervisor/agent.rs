//! Production worker launcher: runs the Claude Code CLI as a
//! non-interactive subprocess inside the task workspace.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::error::{ForemanError, Result};
use crate::supervisor::{TerminateMode, WorkerHandle, WorkerLauncher};

/// Worker output log file inside the workspace, preserved with it.
const WORKER_LOG: &str = ".worker.log";

/// Launches the agent binary in print mode with the briefing on stdin.
/// Output is captured to a log file in the workspace so concurrent
/// workers do not interleave on the orchestrator's terminal.
#[derive(Debug, Clone)]
pub struct AgentLauncher {
    binary: PathBuf,
    args: Vec<String>,
}

impl AgentLauncher {
    /// Locate the `claude` binary on PATH and configure its
    /// non-interactive invocation.
    pub fn detect() -> Result<Self> {
        let binary = which::which("claude").map_err(|_| ForemanError::MissingTool {
            tool: "claude".to_string(),
        })?;
        Ok(Self {
            binary,
            args: vec![
                "-p".to_string(),
                "--dangerously-skip-permissions".to_string(),
            ],
        })
    }

    /// Use an explicit binary with no default arguments (tests,
    /// alternative agents).
    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            args: Vec::new(),
        }
    }

    /// Replace the argument list.
    #[must_use]
    pub fn with_args(mut self, args: &[&str]) -> Self {
        self.args = args.iter().map(|s| s.to_string()).collect();
        self
    }
}

#[async_trait]
impl WorkerLauncher for AgentLauncher {
    async fn launch(&self, briefing: &str, workspace: &Path) -> Result<Box<dyn WorkerHandle>> {
        let log_path = workspace.join(WORKER_LOG);
        let log_file = std::fs::File::create(&log_path)?;
        let log_err = log_file.try_clone()?;

        let mut child = Command::new(&self.binary)
            .args(&self.args)
            .current_dir(workspace)
            .stdin(Stdio::piped())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(log_err))
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(briefing.as_bytes()).await?;
            stdin.flush().await?;
        }

        debug!(workspace = %workspace.display(), "agent process started");
        Ok(Box::new(AgentHandle {
            child,
            log_path,
            exit_code: None,
        }))
    }
}

struct AgentHandle {
    child: Child,
    log_path: PathBuf,
    exit_code: Option<i32>,
}

#[async_trait]
impl WorkerHandle for AgentHandle {
    async fn wait(&mut self) -> i32 {
        if let Some(code) = self.exit_code {
            return code;
        }
        let code = match self.child.wait().await {
            Ok(status) => status.code().unwrap_or(1),
            Err(e) => {
                warn!("failed to wait on agent process: {e}");
                1
            }
        };
        self.exit_code = Some(code);
        code
    }

    async fn signal(&mut self, mode: TerminateMode) {
        if self.exit_code.is_some() {
            return;
        }
        match mode {
            TerminateMode::Graceful => {
                // tokio only exposes SIGKILL; deliver SIGTERM through the
                // platform kill command.
                if let Some(pid) = self.child.id() {
                    let _ = Command::new("kill")
                        .args(["-TERM", &pid.to_string()])
                        .status()
                        .await;
                }
            }
            TerminateMode::Forced => {
                let _ = self.child.start_kill();
            }
        }
    }

    fn summary(&self) -> String {
        // Last non-empty line of the worker log, capped.
        match std::fs::read_to_string(&self.log_path) {
            Ok(content) => content
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .map(|l| {
                    let mut s = l.trim().to_string();
                    s.truncate(200);
                    s
                })
                .unwrap_or_else(|| "no output".to_string()),
            Err(_) => "no output".to_string(),
        }
    }
}
