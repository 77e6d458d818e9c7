//! Shutdown controller: the single path that ends a running session.
//!
//! Ordering is fixed: back up the state, terminate workers, requeue
//! whatever was in flight, mark the session stopped. In-flight work is
//! never lost on a kill; it returns to the backlog with its retry count
//! untouched.

use std::path::{Path, PathBuf};

use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::STATE_DIR;
use crate::error::Result;
use crate::session::SessionStatus;
use crate::store::StateStore;
use crate::supervisor::{TerminateMode, WorkerSupervisor};
use crate::task::TaskId;

const PID_FILE: &str = "foreman.pid";

/// What a shutdown did, for operator reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Id of the pre-shutdown backup; empty when the shutdown was a no-op.
    pub backup_id: String,
    /// Tasks returned to the backlog.
    pub requeued: Vec<TaskId>,
}

/// Tears down a live session in order.
pub struct ShutdownController<'a> {
    store: &'a mut StateStore,
    supervisor: &'a mut WorkerSupervisor,
}

impl<'a> ShutdownController<'a> {
    pub fn new(store: &'a mut StateStore, supervisor: &'a mut WorkerSupervisor) -> Self {
        Self { store, supervisor }
    }

    /// Run the shutdown sequence. Invoking it on a session that is
    /// already stopping or stopped is a no-op.
    ///
    /// `upgrade` carries later shutdown requests; a `Forced` arriving
    /// there during a graceful teardown cuts the grace period short.
    pub async fn run(
        self,
        mode: TerminateMode,
        upgrade: Option<watch::Receiver<Option<TerminateMode>>>,
    ) -> Result<ShutdownReport> {
        match self.store.session().status {
            SessionStatus::Stopping | SessionStatus::Stopped => {
                return Ok(ShutdownReport::default());
            }
            SessionStatus::Idle | SessionStatus::Running => {}
        }

        info!(?mode, "shutting down session");
        self.store
            .update_session(|s| s.status = SessionStatus::Stopping)?;

        // Backup precedes anything destructive.
        let backup_id = self.store.backup("shutdown")?;

        let events = self.supervisor.terminate_all(mode, upgrade).await;
        for event in &events {
            info!(
                worker = event.worker,
                task_id = event.task_id,
                workspace = %event.workspace.display(),
                "worker terminated; workspace preserved"
            );
        }

        let requeued = self.store.requeue_in_progress()?;
        self.store
            .update_session(|s| s.status = SessionStatus::Stopped)?;
        self.store.flush_projections();

        info!(requeued = requeued.len(), "session stopped");
        Ok(ShutdownReport {
            backup_id,
            requeued,
        })
    }
}

/// Recover a session whose process is gone (crash, SIGKILL): backup,
/// requeue orphans, mark stopped. No workers to terminate.
pub fn offline_shutdown(store: &mut StateStore) -> Result<ShutdownReport> {
    if matches!(
        store.session().status,
        SessionStatus::Idle | SessionStatus::Stopped
    ) {
        return Ok(ShutdownReport::default());
    }

    let backup_id = store.backup("shutdown")?;
    let requeued = store.requeue_in_progress()?;
    store.update_session(|s| s.status = SessionStatus::Stopped)?;
    store.flush_projections();

    Ok(ShutdownReport {
        backup_id,
        requeued,
    })
}

/// Forward SIGINT and SIGTERM to the orchestration loop as a graceful
/// shutdown request. A second signal while stopping escalates to forced.
pub fn spawn_signal_listener(tx: watch::Sender<Option<TerminateMode>>) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                warn!("cannot install SIGTERM handler: {e}");
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
        info!("shutdown signal received");
        let _ = tx.send(Some(TerminateMode::Graceful));

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
        warn!("second signal, forcing shutdown");
        let _ = tx.send(Some(TerminateMode::Forced));
    });
}

// =============================================================================
// Pid file: lets `foreman kill` find a live `foreman start` process.
// =============================================================================

fn pid_path(project_dir: &Path) -> PathBuf {
    project_dir.join(STATE_DIR).join(PID_FILE)
}

pub fn write_pid_file(project_dir: &Path) -> Result<()> {
    let path = pid_path(project_dir);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, std::process::id().to_string())?;
    Ok(())
}

pub fn remove_pid_file(project_dir: &Path) {
    let _ = std::fs::remove_file(pid_path(project_dir));
}

/// Pid recorded for this project, if any. A stale file from a crashed
/// run may name a dead process; check with [`process_alive`].
pub fn read_pid_file(project_dir: &Path) -> Option<u32> {
    std::fs::read_to_string(pid_path(project_dir))
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Signal 0 probe for process existence.
pub fn process_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Deliver SIGTERM to a live orchestrator process.
pub fn signal_process(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-TERM", &pid.to_string()])
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}
