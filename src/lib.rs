//! Foreman - multi-worker task orchestration for autonomous coding agents.
//!
//! Foreman keeps a durable backlog of coding tasks and drives a fixed pool
//! of agent workers through it, one isolated git worktree per task, with
//! retry, escalation, and crash-safe shutdown.
//!
//! # Architecture
//!
//! - [`store`] - Durable, atomically persisted task and session state
//! - [`scheduler`] - Domain-affinity assignment of backlog tasks to idle slots
//! - [`supervisor`] - Worker process lifecycle: launch, monitor, terminate
//! - [`orchestrator`] - The control loop tying store, scheduler, and supervisor together
//! - [`shutdown`] - Ordered teardown: backup, terminate, requeue
//! - [`metrics`] - Aggregation and export of the execution history
//! - [`ingest`] - Batch backlog ingestion from markdown plans
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Custom error types with CLI exit codes
//! - [`testing`] - Testing infrastructure (mock workspaces and launchers)
//!
//! # Example
//!
//! ```rust,ignore
//! use foreman::config::{ConfigOverrides, OrchestratorConfig};
//! use foreman::store::StateStore;
//! use foreman::task::{TaskSpec, TaskType};
//!
//! let config = OrchestratorConfig::load(".".as_ref(), &ConfigOverrides::default())?;
//! let mut store = StateStore::open(".".as_ref(), config)?;
//! store.add_task(TaskSpec {
//!     title: "add login rate limiting".into(),
//!     description: String::new(),
//!     domain: "auth".into(),
//!     task_type: TaskType::Feature,
//!     priority: 2,
//!     files: vec![],
//! })?;
//! ```

pub mod board;
pub mod briefing;
pub mod config;
pub mod error;
pub mod ingest;
pub mod metrics;
pub mod orchestrator;
pub mod scheduler;
pub mod session;
pub mod shutdown;
pub mod store;
pub mod supervisor;
pub mod task;
pub mod testing;
pub mod worker;

// Re-export commonly used types
pub use error::{ForemanError, Result};

pub use config::{ConfigOverrides, OrchestratorConfig, STATE_DIR};

pub use task::{branch_name, Task, TaskId, TaskSpec, TaskStatus, TaskType, WorkerId};

pub use store::{HistoryEntry, Projection, SessionState, StateStore};

pub use scheduler::{select_tasks, Assignment};

pub use supervisor::{
    CompletionEvent, SettledOutcome, TerminateMode, WorkerLauncher, WorkerOutcome,
    WorkerSupervisor, WorkspaceProvider,
};

pub use orchestrator::{Orchestrator, RunSummary};

pub use shutdown::{ShutdownController, ShutdownReport};

pub use metrics::MetricsSummary;
