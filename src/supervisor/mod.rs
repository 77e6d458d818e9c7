//! Worker supervisor: owns the lifecycle of each concurrent worker slot.
//!
//! The supervisor is the only component permitted to invoke the external
//! process launcher; it is the capability boundary for subprocess
//! autonomy. Each launched worker gets its own monitoring task that
//! suspends on process exit (bounded by the per-task deadline) and posts a
//! [`CompletionEvent`] to the supervisor's inbox, so the orchestration
//! loop never blocks on a worker directly.

pub mod agent;
pub mod worktree;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::briefing::build_briefing;
use crate::error::{ForemanError, Result};
use crate::task::{Task, TaskId, WorkerId};
use crate::worker::{SlotState, WorkerSlot};

/// How to terminate a running worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateMode {
    /// Interrupt and allow a bounded grace period before force-killing.
    Graceful,
    /// Kill immediately.
    Forced,
}

/// Final outcome of a worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// Exit code 0.
    Success { summary: String },
    /// Non-zero exit.
    Failure { error: String },
    /// Exceeded the per-task deadline and was terminated.
    TimedOut,
    /// Terminated by a shutdown request.
    Killed,
}

/// Posted by a slot's monitoring task when its worker finishes.
#[derive(Debug)]
pub struct CompletionEvent {
    pub worker: WorkerId,
    pub task_id: TaskId,
    pub outcome: WorkerOutcome,
    pub workspace: PathBuf,
}

/// Result of settling a completion against the workspace provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettledOutcome {
    /// Workspace merged; task may move to Done.
    Success,
    /// Worker reported failure; counts against the retry budget.
    WorkerFailed(String),
    /// Deadline exceeded; counts against the retry budget.
    TimedOut,
    /// Shutdown termination; the task is requeued by the caller.
    Killed,
    /// Merge failed; infrastructure fault, no retry penalty.
    WorkspaceFault(String),
}

/// Isolated workspace management, e.g. git worktrees.
#[async_trait]
pub trait WorkspaceProvider: Send + Sync {
    /// Create an isolated workspace for a branch; returns its path.
    async fn create(&self, branch: &str) -> Result<PathBuf>;
    /// Merge a finished workspace into the main line of work.
    async fn merge(&self, path: &Path) -> Result<()>;
    /// Remove a workspace without merging.
    async fn discard(&self, path: &Path) -> Result<()>;
}

/// Handle to a launched worker process. Used only by the slot's
/// monitoring task, which serializes all access.
#[async_trait]
pub trait WorkerHandle: Send {
    /// Wait for the process to exit; returns the exit code. Never
    /// errors: spawn-side failures surface as non-zero codes.
    async fn wait(&mut self) -> i32;
    /// Deliver a termination signal. Idempotent; signalling an exited
    /// process is a no-op.
    async fn signal(&mut self, mode: TerminateMode);
    /// A short human-readable summary of the worker's output, if any.
    fn summary(&self) -> String;
}

/// Launches the external worker process for a briefing in a workspace.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, briefing: &str, workspace: &Path) -> Result<Box<dyn WorkerHandle>>;
}

/// One running worker attached to a slot.
struct ActiveWorker {
    task_id: TaskId,
    kill_tx: mpsc::Sender<TerminateMode>,
    monitor: JoinHandle<()>,
}

/// Supervises the fixed pool of worker slots.
pub struct WorkerSupervisor {
    slots: Vec<WorkerSlot>,
    active: HashMap<WorkerId, ActiveWorker>,
    workspaces: std::sync::Arc<dyn WorkspaceProvider>,
    launcher: std::sync::Arc<dyn WorkerLauncher>,
    completion_tx: mpsc::UnboundedSender<CompletionEvent>,
    completion_rx: mpsc::UnboundedReceiver<CompletionEvent>,
    max_task_duration: Duration,
    graceful_timeout: Duration,
}

impl std::fmt::Debug for WorkerSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSupervisor")
            .field("slots", &self.slots.len())
            .field("active", &self.active.len())
            .finish()
    }
}

impl WorkerSupervisor {
    /// Create a supervisor with `max_workers` idle slots.
    pub fn new(
        max_workers: u32,
        workspaces: std::sync::Arc<dyn WorkspaceProvider>,
        launcher: std::sync::Arc<dyn WorkerLauncher>,
        max_task_duration: Duration,
        graceful_timeout: Duration,
    ) -> Self {
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        Self {
            slots: (1..=max_workers).map(WorkerSlot::new).collect(),
            active: HashMap::new(),
            workspaces,
            launcher,
            completion_tx,
            completion_rx,
            max_task_duration,
            graceful_timeout,
        }
    }

    // =========================================================================
    // Slot views
    // =========================================================================

    pub fn slots(&self) -> &[WorkerSlot] {
        &self.slots
    }

    /// Ids of idle slots, ascending.
    pub fn idle_workers(&self) -> Vec<WorkerId> {
        self.slots
            .iter()
            .filter(|s| s.is_idle())
            .map(|s| s.id)
            .collect()
    }

    /// Ids of busy slots, ascending.
    pub fn busy_workers(&self) -> Vec<WorkerId> {
        self.slots
            .iter()
            .filter(|s| s.is_busy())
            .map(|s| s.id)
            .collect()
    }

    /// Sticky-affinity snapshot for the scheduler.
    pub fn last_domains(&self) -> HashMap<WorkerId, String> {
        self.slots
            .iter()
            .map(|s| (s.id, s.last_domain.clone()))
            .collect()
    }

    fn slot_mut(&mut self, id: WorkerId) -> &mut WorkerSlot {
        self.slots
            .iter_mut()
            .find(|s| s.id == id)
            .expect("slot ids are fixed at construction")
    }

    // =========================================================================
    // Launch
    // =========================================================================

    /// Launch a worker for a task on an idle slot. Returns immediately;
    /// completion arrives later as a [`CompletionEvent`].
    ///
    /// A workspace creation failure surfaces as a `Workspace` error: the
    /// caller requeues the task with no retry penalty.
    pub async fn launch(&mut self, worker: WorkerId, task: &Task) -> Result<()> {
        debug_assert!(!self.active.contains_key(&worker), "slot already busy");

        let workspace = self.workspaces.create(&task.branch_name).await?;
        let briefing = build_briefing(task);

        let handle = match self.launcher.launch(&briefing, &workspace).await {
            Ok(handle) => handle,
            Err(e) => {
                return Err(ForemanError::worker_failure(
                    task.id,
                    format!("failed to launch worker: {e}"),
                ))
            }
        };

        // Room for a graceful request and a later forced escalation.
        let (kill_tx, kill_rx) = mpsc::channel(2);
        let monitor = tokio::spawn(monitor_worker(
            worker,
            task.id,
            workspace,
            handle,
            kill_rx,
            self.completion_tx.clone(),
            self.max_task_duration,
            self.graceful_timeout,
        ));

        self.active.insert(
            worker,
            ActiveWorker {
                task_id: task.id,
                kill_tx,
                monitor,
            },
        );

        let slot = self.slot_mut(worker);
        slot.state = SlotState::Busy;
        slot.current_task = Some(task.id);

        info!(
            worker,
            task_id = task.id,
            branch = %task.branch_name,
            "worker launched"
        );
        Ok(())
    }

    // =========================================================================
    // Completion
    // =========================================================================

    /// Non-blocking poll of the completion inbox.
    pub fn try_recv_completion(&mut self) -> Option<CompletionEvent> {
        self.completion_rx.try_recv().ok()
    }

    /// Settle a completion: free the slot and apply workspace policy.
    ///
    /// On success the workspace is merged and the slot's `last_domain`
    /// updated. On any non-success outcome the workspace is preserved for
    /// manual inspection; work product is never auto-discarded.
    pub async fn settle(&mut self, event: &CompletionEvent, domain: &str) -> SettledOutcome {
        if let Some(active) = self.active.remove(&event.worker) {
            // Monitor has posted its event; it is done or about to be.
            active.monitor.abort();
        }

        let slot = self.slot_mut(event.worker);
        slot.state = SlotState::Idle;
        slot.current_task = None;

        match &event.outcome {
            WorkerOutcome::Success { summary } => {
                if let Err(e) = self.workspaces.merge(&event.workspace).await {
                    warn!(task_id = event.task_id, "merge failed: {e}");
                    return SettledOutcome::WorkspaceFault(e.to_string());
                }
                let slot = self.slot_mut(event.worker);
                slot.last_domain = domain.to_string();
                debug!(task_id = event.task_id, summary = %summary, "worker succeeded");
                SettledOutcome::Success
            }
            WorkerOutcome::Failure { error } => {
                info!(
                    task_id = event.task_id,
                    workspace = %event.workspace.display(),
                    "worker failed; workspace preserved for inspection"
                );
                SettledOutcome::WorkerFailed(error.clone())
            }
            WorkerOutcome::TimedOut => SettledOutcome::TimedOut,
            WorkerOutcome::Killed => SettledOutcome::Killed,
        }
    }

    // =========================================================================
    // Termination
    // =========================================================================

    /// Request termination of one slot's worker. Idempotent: terminating
    /// an idle slot or an already-exited worker is a no-op.
    pub fn terminate(&mut self, worker: WorkerId, mode: TerminateMode) {
        if let Some(active) = self.active.get(&worker) {
            // The monitor may already have exited; a failed send is fine.
            let _ = active.kill_tx.try_send(mode);
            self.slot_mut(worker).state = SlotState::Terminating;
        }
    }

    /// Terminate every active worker and wait for all monitors to post
    /// their final events. Bounded: each monitor enforces the graceful
    /// window itself; a hard cap guards against a wedged process wait.
    ///
    /// When `upgrade` is given and the shutdown is graceful, a request for
    /// `Forced` arriving on that channel is forwarded to every monitor so
    /// the grace period is cut short.
    pub async fn terminate_all(
        &mut self,
        mode: TerminateMode,
        upgrade: Option<watch::Receiver<Option<TerminateMode>>>,
    ) -> Vec<CompletionEvent> {
        let workers: Vec<WorkerId> = self.active.keys().copied().collect();
        for worker in &workers {
            self.terminate(*worker, mode);
        }

        let forwarder = match (mode, upgrade) {
            (TerminateMode::Graceful, Some(rx)) => {
                let kill_txs: Vec<_> = self.active.values().map(|a| a.kill_tx.clone()).collect();
                Some(tokio::spawn(forward_forced_upgrade(rx, kill_txs)))
            }
            _ => None,
        };

        let cap = self.graceful_timeout + Duration::from_secs(5);
        for worker in workers {
            if let Some(active) = self.active.remove(&worker) {
                if tokio::time::timeout(cap, active.monitor).await.is_err() {
                    warn!(worker, task_id = active.task_id, "monitor did not stop in time");
                }
            }
            let slot = self.slot_mut(worker);
            slot.state = SlotState::Idle;
            slot.current_task = None;
        }

        if let Some(forwarder) = forwarder {
            forwarder.abort();
        }

        let mut events = Vec::new();
        while let Ok(event) = self.completion_rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// True when no worker is running.
    pub fn all_idle(&self) -> bool {
        self.active.is_empty()
    }
}

/// Per-slot monitoring task: waits for exit, the deadline, or a
/// termination request, then posts exactly one completion event.
#[allow(clippy::too_many_arguments)]
async fn monitor_worker(
    worker: WorkerId,
    task_id: TaskId,
    workspace: PathBuf,
    mut handle: Box<dyn WorkerHandle>,
    mut kill_rx: mpsc::Receiver<TerminateMode>,
    completion_tx: mpsc::UnboundedSender<CompletionEvent>,
    max_task_duration: Duration,
    graceful_timeout: Duration,
) {
    let outcome = tokio::select! {
        code = handle.wait() => outcome_from_exit(code, handle.as_ref()),
        _ = tokio::time::sleep(max_task_duration) => {
            warn!(worker, task_id, "worker exceeded deadline, terminating");
            shutdown_worker(&mut handle, TerminateMode::Graceful, graceful_timeout, &mut kill_rx)
                .await;
            WorkerOutcome::TimedOut
        }
        Some(mode) = kill_rx.recv() => {
            shutdown_worker(&mut handle, mode, graceful_timeout, &mut kill_rx).await;
            WorkerOutcome::Killed
        }
    };

    // The loop may already have shut the channel; nothing to do then.
    let _ = completion_tx.send(CompletionEvent {
        worker,
        task_id,
        outcome,
        workspace,
    });
}

fn outcome_from_exit(code: i32, handle: &dyn WorkerHandle) -> WorkerOutcome {
    if code == 0 {
        WorkerOutcome::Success {
            summary: handle.summary(),
        }
    } else {
        WorkerOutcome::Failure {
            error: format!("worker exited with code {code}"),
        }
    }
}

/// Forward a `Forced` request from the shutdown channel to every active
/// monitor, cutting the grace period short.
async fn forward_forced_upgrade(
    mut rx: watch::Receiver<Option<TerminateMode>>,
    kill_txs: Vec<mpsc::Sender<TerminateMode>>,
) {
    loop {
        // borrow_and_update first: the escalation may predate subscribing.
        let current = *rx.borrow_and_update();
        if current == Some(TerminateMode::Forced) {
            for tx in &kill_txs {
                let _ = tx.try_send(TerminateMode::Forced);
            }
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Graceful: interrupt, wait up to the grace period, then force-kill.
/// Forced: kill immediately. Always waits for actual exit.
///
/// During the graceful wait the kill channel stays live: a `Forced`
/// request arriving mid-grace escalates immediately instead of running
/// out the clock.
async fn shutdown_worker(
    handle: &mut Box<dyn WorkerHandle>,
    mode: TerminateMode,
    graceful_timeout: Duration,
    kill_rx: &mut mpsc::Receiver<TerminateMode>,
) {
    if mode == TerminateMode::Forced {
        handle.signal(TerminateMode::Forced).await;
        handle.wait().await;
        return;
    }

    handle.signal(TerminateMode::Graceful).await;

    let deadline = tokio::time::Instant::now() + graceful_timeout;
    let mut exited = false;
    let mut rx_open = true;
    while !exited {
        tokio::select! {
            _ = handle.wait() => exited = true,
            _ = tokio::time::sleep_until(deadline) => break,
            request = kill_rx.recv(), if rx_open => match request {
                Some(TerminateMode::Forced) => break,
                Some(TerminateMode::Graceful) => {}
                None => rx_open = false,
            },
        }
    }

    if !exited {
        warn!("grace period cut short or elapsed, force-killing worker");
        handle.signal(TerminateMode::Forced).await;
        handle.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskSpec, TaskType};
    use crate::testing::{MockLauncher, MockWorkspaces, ScriptedExit};
    use std::sync::Arc;

    fn task(id: TaskId, domain: &str) -> Task {
        Task::new(
            id,
            TaskSpec {
                title: format!("task {id}"),
                description: String::new(),
                domain: domain.to_string(),
                task_type: TaskType::Feature,
                priority: 1,
                files: vec![],
            },
        )
    }

    fn supervisor(
        workspaces: Arc<MockWorkspaces>,
        launcher: Arc<MockLauncher>,
    ) -> WorkerSupervisor {
        WorkerSupervisor::new(
            3,
            workspaces,
            launcher,
            Duration::from_secs(60),
            Duration::from_millis(50),
        )
    }

    #[tokio::test]
    async fn test_launch_marks_slot_busy() {
        let workspaces = Arc::new(MockWorkspaces::new());
        let launcher = Arc::new(MockLauncher::new(ScriptedExit::Success));
        let mut sup = supervisor(workspaces, launcher.clone());

        sup.launch(1, &task(1, "infra")).await.unwrap();
        assert_eq!(sup.idle_workers(), vec![2, 3]);
        assert_eq!(sup.busy_workers(), vec![1]);
        assert_eq!(launcher.launch_count(), 1);
    }

    #[tokio::test]
    async fn test_launch_workspace_failure_is_workspace_error() {
        let workspaces = Arc::new(MockWorkspaces::new().with_create_failure());
        let launcher = Arc::new(MockLauncher::new(ScriptedExit::Success));
        let mut sup = supervisor(workspaces, launcher.clone());

        let err = sup.launch(1, &task(1, "infra")).await.unwrap_err();
        assert!(matches!(err, ForemanError::Workspace { .. }));
        // No process launched, slot stays idle.
        assert_eq!(launcher.launch_count(), 0);
        assert_eq!(sup.idle_workers(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_success_completion_merges_and_sets_affinity() {
        let workspaces = Arc::new(MockWorkspaces::new());
        let launcher = Arc::new(MockLauncher::new(ScriptedExit::Success));
        let mut sup = supervisor(workspaces.clone(), launcher);

        sup.launch(2, &task(5, "auth")).await.unwrap();
        let event = recv_completion(&mut sup).await;
        assert_eq!(event.worker, 2);
        assert_eq!(event.task_id, 5);
        assert!(matches!(event.outcome, WorkerOutcome::Success { .. }));

        let settled = sup.settle(&event, "auth").await;
        assert_eq!(settled, SettledOutcome::Success);
        assert_eq!(workspaces.merged(), vec![event.workspace.clone()]);
        assert_eq!(sup.last_domains()[&2], "auth");
        assert!(sup.all_idle());
    }

    #[tokio::test]
    async fn test_failure_preserves_workspace() {
        let workspaces = Arc::new(MockWorkspaces::new());
        let launcher = Arc::new(MockLauncher::new(ScriptedExit::Failure(3)));
        let mut sup = supervisor(workspaces.clone(), launcher);

        sup.launch(1, &task(7, "db")).await.unwrap();
        let event = recv_completion(&mut sup).await;
        assert!(matches!(event.outcome, WorkerOutcome::Failure { .. }));

        let settled = sup.settle(&event, "db").await;
        assert!(matches!(settled, SettledOutcome::WorkerFailed(_)));
        assert!(workspaces.merged().is_empty());
        assert!(workspaces.discarded().is_empty());
        // Affinity unchanged on failure.
        assert_eq!(sup.last_domains()[&1], "");
    }

    #[tokio::test]
    async fn test_merge_failure_is_workspace_fault() {
        let workspaces = Arc::new(MockWorkspaces::new().with_merge_failure());
        let launcher = Arc::new(MockLauncher::new(ScriptedExit::Success));
        let mut sup = supervisor(workspaces, launcher);

        sup.launch(1, &task(1, "infra")).await.unwrap();
        let event = recv_completion(&mut sup).await;
        let settled = sup.settle(&event, "infra").await;
        assert!(matches!(settled, SettledOutcome::WorkspaceFault(_)));
    }

    #[tokio::test]
    async fn test_timeout_produces_timed_out() {
        let workspaces = Arc::new(MockWorkspaces::new());
        let launcher = Arc::new(MockLauncher::new(ScriptedExit::Hang));
        let mut sup = WorkerSupervisor::new(
            1,
            workspaces,
            launcher,
            Duration::from_millis(20),
            Duration::from_millis(20),
        );

        sup.launch(1, &task(1, "infra")).await.unwrap();
        let event = recv_completion(&mut sup).await;
        assert_eq!(event.outcome, WorkerOutcome::TimedOut);
    }

    #[tokio::test]
    async fn test_graceful_terminate_all() {
        let workspaces = Arc::new(MockWorkspaces::new());
        let launcher = Arc::new(MockLauncher::new(ScriptedExit::Hang));
        let mut sup = supervisor(workspaces, launcher.clone());

        sup.launch(1, &task(1, "a")).await.unwrap();
        sup.launch(2, &task(2, "b")).await.unwrap();

        let events = sup.terminate_all(TerminateMode::Graceful, None).await;
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.outcome == WorkerOutcome::Killed));
        assert!(sup.all_idle());
        assert_eq!(sup.idle_workers(), vec![1, 2, 3]);
        // Hanging workers ignore the interrupt and need the forced kill.
        assert!(launcher.forced_signals() >= 2);
    }

    #[tokio::test]
    async fn test_terminate_idle_slot_is_noop() {
        let workspaces = Arc::new(MockWorkspaces::new());
        let launcher = Arc::new(MockLauncher::new(ScriptedExit::Success));
        let mut sup = supervisor(workspaces, launcher);

        sup.terminate(1, TerminateMode::Forced);
        assert_eq!(sup.idle_workers(), vec![1, 2, 3]);
        let events = sup.terminate_all(TerminateMode::Forced, None).await;
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_forced_upgrade_cuts_grace_period_short() {
        let workspaces = Arc::new(MockWorkspaces::new());
        let launcher = Arc::new(MockLauncher::new(ScriptedExit::Hang));
        // Grace period far longer than the test is willing to wait.
        let mut sup = WorkerSupervisor::new(
            2,
            workspaces,
            launcher,
            Duration::from_secs(60),
            Duration::from_secs(5),
        );

        sup.launch(1, &task(1, "a")).await.unwrap();
        sup.launch(2, &task(2, "b")).await.unwrap();

        let (tx, rx) = watch::channel(Some(TerminateMode::Graceful));
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = tx.send(Some(TerminateMode::Forced));
        });

        let started = std::time::Instant::now();
        let events = sup.terminate_all(TerminateMode::Graceful, Some(rx)).await;
        assert!(
            started.elapsed() < Duration::from_secs(3),
            "shutdown waited out the grace period despite forced escalation"
        );
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.outcome == WorkerOutcome::Killed));
    }

    #[tokio::test]
    async fn test_second_forced_terminate_escalates() {
        let workspaces = Arc::new(MockWorkspaces::new());
        let launcher = Arc::new(MockLauncher::new(ScriptedExit::Hang));
        let mut sup = WorkerSupervisor::new(
            1,
            workspaces,
            launcher,
            Duration::from_secs(60),
            Duration::from_secs(5),
        );

        sup.launch(1, &task(1, "a")).await.unwrap();
        sup.terminate(1, TerminateMode::Graceful);
        tokio::time::sleep(Duration::from_millis(50)).await;
        sup.terminate(1, TerminateMode::Forced);

        // With a 5s grace window only the forced escalation lets the
        // completion arrive inside this poll budget.
        let event = recv_completion(&mut sup).await;
        assert_eq!(event.outcome, WorkerOutcome::Killed);
    }

    async fn recv_completion(sup: &mut WorkerSupervisor) -> CompletionEvent {
        for _ in 0..200 {
            if let Some(event) = sup.try_recv_completion() {
                return event;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no completion event arrived");
    }
}
