//! Durable state store: the single source of truth for tasks and session.
//!
//! State lives in `.foreman/state.json`. Every mutation is an atomic
//! read-modify-write: under an exclusive advisory lock the on-disk state is
//! reloaded, the change applied, and the result persisted atomically (write
//! to a temporary file, fsync, rename). Two handles over the same state
//! directory therefore never clobber each other's writes; `foreman add-task`
//! can append to the backlog while the orchestration loop is live. Task
//! transitions additionally append an audit record and notify registered
//! projections.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::Utc;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::config::{OrchestratorConfig, STATE_DIR};
use crate::error::{ForemanError, Result};
use crate::session::Session;
use crate::task::{Task, TaskId, TaskSpec, TaskStatus, WorkerId};

/// State file name.
const STATE_FILE: &str = "state.json";

/// Temporary file suffix for atomic writes.
const TMP_SUFFIX: &str = ".tmp";

/// Lock file suffix for concurrent access prevention.
const LOCK_SUFFIX: &str = ".lock";

/// Append-only transition audit log, never read by the control loop.
pub const HISTORY_FILE: &str = "history.log";

/// Directory for point-in-time backups.
const BACKUP_DIR: &str = "backups";

/// Minimum interval between projection re-renders.
const PROJECTION_DEBOUNCE: Duration = Duration::from_millis(250);

/// The full persisted record: one session, all tasks, and the id counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub session: Session,
    pub tasks: Vec<Task>,
    pub next_task_id: TaskId,
}

impl SessionState {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            session: Session::new(config),
            tasks: Vec::new(),
            next_task_id: 1,
        }
    }
}

/// One audit record per task transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: chrono::DateTime<Utc>,
    pub task_id: TaskId,
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub retry_count: u32,
}

/// A human-readable rendering of the persisted state, re-generated
/// (debounced) after mutations. Render failures are logged, never
/// propagated; projections are observers, not participants.
pub trait Projection: Send {
    fn render(&self, state: &SessionState) -> std::io::Result<()>;
}

/// Durable, atomically updated state store.
pub struct StateStore {
    dir: PathBuf,
    state: SessionState,
    projections: Vec<Box<dyn Projection>>,
    last_render: Option<Instant>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("dir", &self.dir)
            .field("tasks", &self.state.tasks.len())
            .finish()
    }
}

impl StateStore {
    /// Open the store for a project directory, loading existing state or
    /// initialising a fresh one with the given config.
    pub fn open(project_dir: &Path, config: OrchestratorConfig) -> Result<Self> {
        let dir = project_dir.join(STATE_DIR);
        let state = match Self::load_from(&dir)? {
            Some(state) => state,
            None => SessionState::new(config),
        };

        Ok(Self {
            dir,
            state,
            projections: Vec::new(),
            last_render: None,
        })
    }

    /// Register a projection subscriber.
    pub fn add_projection(&mut self, projection: Box<dyn Projection>) {
        self.projections.push(projection);
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn session(&self) -> &Session {
        &self.state.session
    }

    pub fn tasks(&self) -> &[Task] {
        &self.state.tasks
    }

    /// Look up a task by id.
    pub fn task(&self, id: TaskId) -> Result<&Task> {
        self.state
            .tasks
            .iter()
            .find(|t| t.id == id)
            .ok_or(ForemanError::NotFound { id })
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    fn state_file_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    fn lock_file_path(&self) -> PathBuf {
        self.dir.join(format!("{STATE_FILE}{LOCK_SUFFIX}"))
    }

    fn acquire_lock(&self) -> Result<File> {
        fs::create_dir_all(&self.dir)?;
        let lock_file = File::create(self.lock_file_path())?;
        FileExt::lock_exclusive(&lock_file)
            .map_err(|e| ForemanError::store(format!("failed to acquire state lock: {e}")))?;
        Ok(lock_file)
    }

    /// Write the in-memory state atomically. A partially written state is
    /// never visible to a concurrent load: content goes to a temporary
    /// file which is then renamed over the state file.
    fn write_state_file(&self) -> Result<()> {
        let tmp_path = self.dir.join(format!("{STATE_FILE}{TMP_SUFFIX}"));
        let json = serde_json::to_string_pretty(&self.state)?;

        let mut tmp_file = File::create(&tmp_path)?;
        tmp_file.write_all(json.as_bytes())?;
        tmp_file.sync_all()?;

        fs::rename(&tmp_path, self.state_file_path())?;
        Ok(())
    }

    /// Atomic read-modify-write: take the exclusive lock, refresh the
    /// in-memory view from disk (picking up writes from other handles),
    /// apply the mutation, and persist. All mutating operations funnel
    /// through here.
    fn commit<R>(&mut self, f: impl FnOnce(&mut SessionState, &Path) -> Result<R>) -> Result<R> {
        let _lock = self.acquire_lock()?;

        if let Some(state) = Self::read_state(&self.dir)? {
            self.state = state;
        }
        let result = f(&mut self.state, &self.dir)?;

        self.write_state_file()?;
        Ok(result)
    }

    /// Parse the state file without taking the lock. Callers hold the
    /// appropriate lock themselves.
    ///
    /// Unlike a disposable cache, this file is the source of truth: a
    /// corrupt state file is a hard error, never silently discarded.
    fn read_state(dir: &Path) -> Result<Option<SessionState>> {
        let state_path = dir.join(STATE_FILE);
        if !state_path.exists() {
            return Ok(None);
        }

        let mut contents = String::new();
        File::open(&state_path)?.read_to_string(&mut contents)?;

        let state: SessionState = serde_json::from_str(&contents).map_err(|e| {
            ForemanError::store_with_path(format!("corrupt state file: {e}"), state_path)
        })?;

        Ok(Some(state))
    }

    /// Load persisted state from a state directory under a shared lock,
    /// if present.
    fn load_from(dir: &Path) -> Result<Option<SessionState>> {
        let lock_path = dir.join(format!("{STATE_FILE}{LOCK_SUFFIX}"));
        let _lock = if lock_path.exists() {
            let lock_file = File::open(&lock_path)?;
            FileExt::lock_shared(&lock_file)
                .map_err(|e| ForemanError::store(format!("failed to acquire state lock: {e}")))?;
            Some(lock_file)
        } else {
            None
        };

        Self::read_state(dir)
    }

    /// Reload state from disk, replacing the in-memory view. The
    /// orchestration loop calls this each tick so backlog additions made
    /// through another handle become schedulable mid-session.
    pub fn reload(&mut self) -> Result<()> {
        if let Some(state) = Self::load_from(&self.dir)? {
            self.state = state;
        }
        Ok(())
    }

    /// Snapshot the full state to a timestamped, immutable copy. Must be
    /// called before any destructive operation. Returns the backup id.
    pub fn backup(&mut self, reason: &str) -> Result<String> {
        // Copy the freshest state, and hold the lock so no writer can
        // slip in between refresh and copy.
        let _lock = self.acquire_lock()?;
        if let Some(state) = Self::read_state(&self.dir)? {
            self.state = state;
        }
        self.write_state_file()?;

        let backup_dir = self.dir.join(BACKUP_DIR);
        fs::create_dir_all(&backup_dir)?;

        let backup_id = format!(
            "state-{}-{}",
            Utc::now().format("%Y%m%dT%H%M%S%3f"),
            reason
        );
        let backup_path = backup_dir.join(format!("{backup_id}.json"));
        fs::copy(self.state_file_path(), &backup_path)?;

        debug!(backup = %backup_path.display(), "state backed up");
        Ok(backup_id)
    }

    fn notify_projections(&mut self) {
        if let Some(last) = self.last_render {
            if last.elapsed() < PROJECTION_DEBOUNCE {
                return;
            }
        }
        self.render_projections();
    }

    /// Re-render all projections immediately, bypassing the debounce.
    pub fn flush_projections(&mut self) {
        self.render_projections();
    }

    fn render_projections(&mut self) {
        for projection in &self.projections {
            if let Err(e) = projection.render(&self.state) {
                warn!("projection render failed: {e}");
            }
        }
        self.last_render = Some(Instant::now());
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Validate and add a new task to the backlog.
    pub fn add_task(&mut self, spec: TaskSpec) -> Result<Task> {
        spec.validate()?;

        let task = self.commit(|state, _| {
            let id = state.next_task_id;
            state.next_task_id += 1;

            let task = Task::new(id, spec);
            state.tasks.push(task.clone());
            Ok(task)
        })?;
        self.notify_projections();

        debug!(task_id = task.id, domain = %task.domain, "task added");
        Ok(task)
    }

    /// Transition a task to a new status, persist, and audit.
    pub fn update_task_status(&mut self, id: TaskId, new_status: TaskStatus) -> Result<Task> {
        let task = self.commit(|state, dir| apply_transition(state, dir, id, new_status))?;
        self.notify_projections();
        Ok(task)
    }

    /// Assign a task to a worker slot and move it to `InProgress`.
    pub fn assign_task(&mut self, id: TaskId, worker: WorkerId) -> Result<Task> {
        let task = self.commit(|state, dir| {
            let task = find_task_mut(state, id)?;
            if !task.status.can_transition_to(TaskStatus::InProgress) {
                return Err(ForemanError::InvalidTransition {
                    id,
                    from: task.status,
                    to: TaskStatus::InProgress,
                });
            }
            task.assigned_worker = Some(worker);
            apply_transition(state, dir, id, TaskStatus::InProgress)
        })?;
        self.notify_projections();
        Ok(task)
    }

    /// Record a worker failure: bump the retry counter and move the task
    /// to `Failed`. The caller then requeues or escalates.
    pub fn record_failure(&mut self, id: TaskId) -> Result<Task> {
        let task = self.commit(|state, dir| {
            let task = find_task_mut(state, id)?;
            if !task.status.can_transition_to(TaskStatus::Failed) {
                return Err(ForemanError::InvalidTransition {
                    id,
                    from: task.status,
                    to: TaskStatus::Failed,
                });
            }
            task.retry_count += 1;
            apply_transition(state, dir, id, TaskStatus::Failed)
        })?;
        self.notify_projections();
        Ok(task)
    }

    /// Change a task's priority.
    pub fn reprioritize(&mut self, id: TaskId, priority: i32) -> Result<Task> {
        let task = self.commit(|state, _| {
            let task = find_task_mut(state, id)?;
            task.priority = priority;
            Ok(task.clone())
        })?;
        self.notify_projections();
        Ok(task)
    }

    /// Return every `InProgress` task to the backlog in one atomic pass.
    /// Used on kill and on recovery from a crashed prior run; never
    /// consumes a retry. Returns the requeued task ids.
    pub fn requeue_in_progress(&mut self) -> Result<Vec<TaskId>> {
        let ids = self.commit(|state, dir| {
            let ids: Vec<TaskId> = state
                .tasks
                .iter()
                .filter(|t| t.status == TaskStatus::InProgress)
                .map(|t| t.id)
                .collect();

            for &id in &ids {
                apply_transition(state, dir, id, TaskStatus::Backlog)?;
            }
            Ok(ids)
        })?;
        self.notify_projections();
        Ok(ids)
    }

    /// Drop every `Backlog` task, e.g. before re-ingesting a plan. Tasks
    /// in any other status are untouched. Returns the removed ids.
    pub fn clear_backlog(&mut self) -> Result<Vec<TaskId>> {
        let ids = self.commit(|state, _| {
            let ids: Vec<TaskId> = state
                .tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Backlog)
                .map(|t| t.id)
                .collect();
            state.tasks.retain(|t| t.status != TaskStatus::Backlog);
            Ok(ids)
        })?;
        self.notify_projections();
        Ok(ids)
    }

    /// Mutate the session record and persist.
    pub fn update_session(&mut self, f: impl FnOnce(&mut Session)) -> Result<()> {
        self.commit(|state, _| {
            f(&mut state.session);
            Ok(())
        })?;
        self.notify_projections();
        Ok(())
    }
}

fn find_task_mut(state: &mut SessionState, id: TaskId) -> Result<&mut Task> {
    state
        .tasks
        .iter_mut()
        .find(|t| t.id == id)
        .ok_or(ForemanError::NotFound { id })
}

/// Transition a task in place and append the audit record.
fn apply_transition(
    state: &mut SessionState,
    dir: &Path,
    id: TaskId,
    new_status: TaskStatus,
) -> Result<Task> {
    let task = find_task_mut(state, id)?;
    let from = task.status;

    task.transition_to(new_status).inspect_err(|e| {
        // A rejected transition is a control-plane bug.
        error!("invalid transition attempted: {e}");
    })?;

    let entry = HistoryEntry {
        timestamp: Utc::now(),
        task_id: id,
        from,
        to: new_status,
        retry_count: task.retry_count,
    };
    let task = task.clone();

    append_history(dir, &entry)?;
    Ok(task)
}

fn append_history(dir: &Path, entry: &HistoryEntry) -> Result<()> {
    let mut line = serde_json::to_string(entry)?;
    line.push('\n');

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(HISTORY_FILE))?;
    file.write_all(line.as_bytes())?;
    Ok(())
}
