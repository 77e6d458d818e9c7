//! Testing infrastructure: controllable doubles for the external
//! collaborators (workspace provider and worker launcher).
//!
//! These mocks enable deterministic orchestrator tests without git or a
//! real agent binary. `MockLauncher` also backs the `--dry-run` control
//! surface.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::error::{ForemanError, Result};
use crate::supervisor::{TerminateMode, WorkerHandle, WorkerLauncher, WorkspaceProvider};

/// Scripted behavior for a mock worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedExit {
    /// Exit 0 immediately.
    Success,
    /// Exit with the given non-zero code immediately.
    Failure(i32),
    /// Never exit until force-killed.
    Hang,
}

/// Mock workspace provider. Fabricates per-branch paths and records every
/// create/merge/discard call.
#[derive(Debug)]
pub struct MockWorkspaces {
    root: PathBuf,
    created: Mutex<Vec<PathBuf>>,
    merged: Mutex<Vec<PathBuf>>,
    discarded: Mutex<Vec<PathBuf>>,
    fail_create: AtomicBool,
    fail_merge: AtomicBool,
    counter: AtomicU64,
}

impl Default for MockWorkspaces {
    fn default() -> Self {
        Self::new()
    }
}

impl MockWorkspaces {
    pub fn new() -> Self {
        Self {
            root: std::env::temp_dir().join("foreman-mock-workspaces"),
            created: Mutex::new(Vec::new()),
            merged: Mutex::new(Vec::new()),
            discarded: Mutex::new(Vec::new()),
            fail_create: AtomicBool::new(false),
            fail_merge: AtomicBool::new(false),
            counter: AtomicU64::new(0),
        }
    }

    /// Configure `create` to fail with a workspace error.
    #[must_use]
    pub fn with_create_failure(self) -> Self {
        self.fail_create.store(true, Ordering::SeqCst);
        self
    }

    /// Configure `merge` to fail with a workspace error.
    #[must_use]
    pub fn with_merge_failure(self) -> Self {
        self.fail_merge.store(true, Ordering::SeqCst);
        self
    }

    pub fn created(&self) -> Vec<PathBuf> {
        self.created.lock().expect("lock").clone()
    }

    pub fn merged(&self) -> Vec<PathBuf> {
        self.merged.lock().expect("lock").clone()
    }

    pub fn discarded(&self) -> Vec<PathBuf> {
        self.discarded.lock().expect("lock").clone()
    }
}

#[async_trait]
impl WorkspaceProvider for MockWorkspaces {
    async fn create(&self, branch: &str) -> Result<PathBuf> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(ForemanError::workspace(branch, "scripted create failure"));
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let path = self
            .root
            .join(format!("{}-{n}", branch.replace('/', "-")));
        self.created.lock().expect("lock").push(path.clone());
        Ok(path)
    }

    async fn merge(&self, path: &Path) -> Result<()> {
        if self.fail_merge.load(Ordering::SeqCst) {
            return Err(ForemanError::workspace(
                path.display().to_string(),
                "scripted merge failure",
            ));
        }
        self.merged.lock().expect("lock").push(path.to_path_buf());
        Ok(())
    }

    async fn discard(&self, path: &Path) -> Result<()> {
        self.discarded.lock().expect("lock").push(path.to_path_buf());
        Ok(())
    }
}

/// Mock worker launcher producing [`ScriptedExit`] handles.
#[derive(Debug)]
pub struct MockLauncher {
    script: ScriptedExit,
    launches: AtomicU32,
    graceful_signals: Arc<AtomicU32>,
    forced_signals: Arc<AtomicU32>,
    briefings: Mutex<Vec<String>>,
}

impl MockLauncher {
    pub fn new(script: ScriptedExit) -> Self {
        Self {
            script,
            launches: AtomicU32::new(0),
            graceful_signals: Arc::new(AtomicU32::new(0)),
            forced_signals: Arc::new(AtomicU32::new(0)),
            briefings: Mutex::new(Vec::new()),
        }
    }

    pub fn launch_count(&self) -> u32 {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn graceful_signals(&self) -> u32 {
        self.graceful_signals.load(Ordering::SeqCst)
    }

    pub fn forced_signals(&self) -> u32 {
        self.forced_signals.load(Ordering::SeqCst)
    }

    /// Briefings handed to launched workers, in launch order.
    pub fn briefings(&self) -> Vec<String> {
        self.briefings.lock().expect("lock").clone()
    }
}

#[async_trait]
impl WorkerLauncher for MockLauncher {
    async fn launch(&self, briefing: &str, _workspace: &Path) -> Result<Box<dyn WorkerHandle>> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        self.briefings.lock().expect("lock").push(briefing.to_string());
        Ok(Box::new(MockHandle {
            script: self.script,
            exited: false,
            forced: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
            graceful_signals: self.graceful_signals.clone(),
            forced_signals: self.forced_signals.clone(),
        }))
    }
}

struct MockHandle {
    script: ScriptedExit,
    exited: bool,
    forced: Arc<AtomicBool>,
    notify: Arc<Notify>,
    graceful_signals: Arc<AtomicU32>,
    forced_signals: Arc<AtomicU32>,
}

#[async_trait]
impl WorkerHandle for MockHandle {
    async fn wait(&mut self) -> i32 {
        if self.exited {
            return 0;
        }
        let code = match self.script {
            ScriptedExit::Success => 0,
            ScriptedExit::Failure(code) => code,
            ScriptedExit::Hang => {
                // Hanging workers ignore the interrupt; only a forced
                // kill releases them.
                while !self.forced.load(Ordering::SeqCst) {
                    self.notify.notified().await;
                }
                137
            }
        };
        self.exited = true;
        code
    }

    async fn signal(&mut self, mode: TerminateMode) {
        match mode {
            TerminateMode::Graceful => {
                self.graceful_signals.fetch_add(1, Ordering::SeqCst);
            }
            TerminateMode::Forced => {
                self.forced_signals.fetch_add(1, Ordering::SeqCst);
                self.forced.store(true, Ordering::SeqCst);
            }
        }
        self.notify.notify_one();
    }

    fn summary(&self) -> String {
        "mock worker finished".to_string()
    }
}
