//! Orchestration loop: ties the store, scheduler, and supervisor together.
//!
//! One control task runs the loop; it never blocks on a worker. Each tick
//! drains completion events, applies the retry/escalation policy, and
//! hands new assignments to the supervisor. Task-level faults are handled
//! here and never abort the loop; store-level faults are fatal.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::error::{ForemanError, Result};
use crate::scheduler::select_tasks;
use crate::session::SessionStatus;
use crate::shutdown::{ShutdownController, ShutdownReport};
use crate::store::StateStore;
use crate::supervisor::{
    CompletionEvent, SettledOutcome, TerminateMode, WorkerSupervisor,
};
use crate::task::{Task, TaskStatus};

/// Totals reported after a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub completed: u32,
    pub failed_attempts: u32,
    pub escalated: u32,
    /// Set when the run ended via the shutdown controller.
    pub shutdown: Option<ShutdownReport>,
}

/// Drives the orchestration loop over a store and a supervisor.
pub struct Orchestrator {
    store: StateStore,
    supervisor: WorkerSupervisor,
    shutdown_rx: watch::Receiver<Option<TerminateMode>>,
}

impl Orchestrator {
    /// Create an orchestrator. The returned sender requests a shutdown
    /// from outside the loop (signal handler, tests).
    pub fn new(
        store: StateStore,
        supervisor: WorkerSupervisor,
    ) -> (Self, watch::Sender<Option<TerminateMode>>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(None);
        (
            Self {
                store,
                supervisor,
                shutdown_rx,
            },
            shutdown_tx,
        )
    }

    /// Read access to the store (status rendering, tests).
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Run the loop until the backlog drains, the daily limit stalls
    /// further work, or a shutdown is requested.
    pub async fn run(mut self) -> Result<(RunSummary, StateStore)> {
        // Recover tasks orphaned by a crashed prior run before anything
        // else; a task must never stay InProgress across a restart.
        let orphaned = self.store.requeue_in_progress()?;
        if !orphaned.is_empty() {
            warn!(?orphaned, "requeued tasks orphaned by a previous run");
        }

        self.store.update_session(|s| s.begin())?;
        info!(
            workers = self.supervisor.slots().len(),
            "orchestration session started"
        );

        let poll_interval =
            Duration::from_secs(self.store.session().config.poll_interval_secs);
        let mut summary = RunSummary::default();

        loop {
            while let Some(event) = self.supervisor.try_recv_completion() {
                self.apply_completion(event, &mut summary).await?;
            }

            let requested = *self.shutdown_rx.borrow();
            if let Some(mode) = requested {
                // A later Forced request on the same channel cuts the
                // graceful window short.
                let report = ShutdownController::new(&mut self.store, &mut self.supervisor)
                    .run(mode, Some(self.shutdown_rx.clone()))
                    .await?;
                summary.shutdown = Some(report);
                break;
            }

            // Pick up backlog additions made through another handle
            // (`foreman add-task` against the live session).
            self.store.reload()?;

            self.assign_work(&mut summary).await?;

            if self.finished() {
                self.store
                    .update_session(|s| s.status = SessionStatus::Stopped)?;
                info!("backlog drained, session complete");
                break;
            }

            // Sleep between ticks, but wake immediately on a shutdown
            // request.
            let mut shutdown_rx = self.shutdown_rx.clone();
            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                _ = shutdown_rx.changed() => {}
            }
        }

        self.store.flush_projections();
        Ok((summary, self.store))
    }

    /// Hand backlog tasks to idle workers for this tick. The whole pass
    /// runs on the control task between polls, so a scheduling decision
    /// is atomic and no task can be assigned twice.
    async fn assign_work(&mut self, summary: &mut RunSummary) -> Result<()> {
        if self.store.session().daily_limit_reached() {
            return Ok(());
        }

        let idle = self.supervisor.idle_workers();
        if idle.is_empty() {
            return Ok(());
        }

        let backlog: Vec<&Task> = self
            .store
            .tasks()
            .iter()
            .filter(|t| t.status == TaskStatus::Backlog)
            .collect();
        let assignments = select_tasks(&idle, &backlog, &self.supervisor.last_domains());

        for assignment in assignments {
            let task = self.store.assign_task(assignment.task, assignment.worker)?;

            if let Err(e) = self.supervisor.launch(assignment.worker, &task).await {
                match e {
                    ForemanError::Workspace { .. } => {
                        // Infrastructure fault: back to the backlog with
                        // no retry penalty.
                        warn!(task_id = task.id, "workspace creation failed: {e}");
                        self.store
                            .update_task_status(task.id, TaskStatus::Backlog)?;
                    }
                    ForemanError::WorkerFailure { .. } => {
                        warn!(task_id = task.id, "launch failed: {e}");
                        summary.failed_attempts += 1;
                        self.fail_task(task.id, summary)?;
                    }
                    other => return Err(other),
                }
            }
        }
        Ok(())
    }

    /// Apply one completion event to the store.
    async fn apply_completion(
        &mut self,
        event: CompletionEvent,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let domain = self.store.task(event.task_id)?.domain.clone();
        let settled = self.supervisor.settle(&event, &domain).await;

        match settled {
            SettledOutcome::Success => {
                self.store
                    .update_task_status(event.task_id, TaskStatus::Review)?;
                self.store
                    .update_task_status(event.task_id, TaskStatus::Done)?;
                self.store.update_session(|s| s.record_completion())?;
                summary.completed += 1;
                info!(task_id = event.task_id, "task done");
            }
            SettledOutcome::WorkerFailed(reason) => {
                warn!(task_id = event.task_id, reason, "worker failure");
                summary.failed_attempts += 1;
                self.fail_task(event.task_id, summary)?;
            }
            SettledOutcome::TimedOut => {
                warn!(task_id = event.task_id, "worker deadline exceeded");
                summary.failed_attempts += 1;
                self.fail_task(event.task_id, summary)?;
            }
            SettledOutcome::Killed => {
                // Single-slot termination outside a full shutdown; the
                // task goes straight back to the backlog.
                self.store
                    .update_task_status(event.task_id, TaskStatus::Backlog)?;
            }
            SettledOutcome::WorkspaceFault(reason) => {
                warn!(task_id = event.task_id, reason, "workspace fault, requeueing");
                self.store
                    .update_task_status(event.task_id, TaskStatus::Backlog)?;
            }
        }
        Ok(())
    }

    /// Retry/escalation policy. A task gets `max_retries` retries; the
    /// failure after the last retry escalates it, leaving `retry_count`
    /// equal to `max_retries`.
    fn fail_task(&mut self, task_id: u64, summary: &mut RunSummary) -> Result<()> {
        let max_retries = self.store.session().config.max_retries;
        let retry_count = self.store.task(task_id)?.retry_count;

        if retry_count < max_retries {
            self.store.record_failure(task_id)?;
            self.store.update_task_status(task_id, TaskStatus::Backlog)?;
        } else {
            self.store.update_task_status(task_id, TaskStatus::Failed)?;
            self.store
                .update_task_status(task_id, TaskStatus::Escalated)?;
            summary.escalated += 1;
            error!(task_id, "task escalated, human action required");
        }
        Ok(())
    }

    /// The session is finished when nothing is running and either the
    /// backlog is empty or the daily limit blocks further assignment.
    fn finished(&self) -> bool {
        if !self.supervisor.all_idle() {
            return false;
        }
        let backlog_empty = !self
            .store
            .tasks()
            .iter()
            .any(|t| t.status == TaskStatus::Backlog);
        backlog_empty || self.store.session().daily_limit_reached()
    }
}
