//! Custom error types for Foreman.
//!
//! The taxonomy maps one-to-one onto the failure classes the orchestrator
//! distinguishes: boundary validation, unknown ids, state-machine
//! violations, workspace infrastructure faults, worker failures and
//! timeouts, and store-level persistence failures.

use std::path::PathBuf;
use thiserror::Error;

use crate::task::TaskStatus;

/// Main error type for Foreman operations
#[derive(Error, Debug)]
pub enum ForemanError {
    // =========================================================================
    // Boundary Errors
    // =========================================================================
    /// Task spec rejected at the boundary; never enters the store
    #[error("Validation error: {field} - {reason}")]
    Validation { field: String, reason: String },

    /// Unknown task id
    #[error("Task {id} not found")]
    NotFound { id: u64 },

    /// State-machine violation. Indicates a control-plane bug, never a
    /// normal-path outcome.
    #[error("Invalid transition for task {id}: {from} -> {to}")]
    InvalidTransition {
        id: u64,
        from: TaskStatus,
        to: TaskStatus,
    },

    // =========================================================================
    // Worker Errors
    // =========================================================================
    /// Workspace creation/merge failed. Infrastructure fault: the task
    /// returns to the backlog with no retry penalty.
    #[error("Workspace error for branch '{branch}': {message}")]
    Workspace { branch: String, message: String },

    /// The worker ran and reported failure; counts against the retry budget
    #[error("Worker failed on task {task_id}: {message}")]
    WorkerFailure { task_id: u64, message: String },

    /// Worker exceeded its deadline; treated as a worker failure
    #[error("Worker timed out on task {task_id} after {seconds}s")]
    Timeout { task_id: u64, seconds: u64 },

    // =========================================================================
    // Infrastructure Errors
    // =========================================================================
    /// State store failure. Fatal to the session: the loop stops rather
    /// than proceed with unpersisted state.
    #[error("State store error: {message}")]
    Store {
        message: String,
        path: Option<PathBuf>,
    },

    /// Failed to load or validate configuration
    #[error("Invalid configuration: {field} - {reason}")]
    Config { field: String, reason: String },

    /// Missing required external tool (e.g. the worker binary or git)
    #[error("Missing required tool: {tool}")]
    MissingTool { tool: String },

    // =========================================================================
    // Wrapped Errors
    // =========================================================================
    /// IO error wrapper
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON error wrapper
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ForemanError {
    // =========================================================================
    // Constructor helpers
    // =========================================================================

    /// Create a validation error
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a workspace error
    pub fn workspace(branch: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Workspace {
            branch: branch.into(),
            message: message.into(),
        }
    }

    /// Create a worker failure
    pub fn worker_failure(task_id: u64, message: impl Into<String>) -> Self {
        Self::WorkerFailure {
            task_id,
            message: message.into(),
        }
    }

    /// Create a store error
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
            path: None,
        }
    }

    /// Create a store error with the offending path
    pub fn store_with_path(message: impl Into<String>, path: PathBuf) -> Self {
        Self::Store {
            message: message.into(),
            path: Some(path),
        }
    }

    /// Create a configuration error
    pub fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Config {
            field: field.into(),
            reason: reason.into(),
        }
    }

    // =========================================================================
    // Classification helpers
    // =========================================================================

    /// Task-level faults are handled inside the orchestration loop via the
    /// retry/escalation policy and never abort the loop itself.
    pub fn is_task_fault(&self) -> bool {
        matches!(
            self,
            Self::Workspace { .. } | Self::WorkerFailure { .. } | Self::Timeout { .. }
        )
    }

    /// Check if this fault consumes a retry when it lands on a task.
    /// Workspace faults are infrastructure problems and do not.
    pub fn counts_against_retries(&self) -> bool {
        matches!(self, Self::WorkerFailure { .. } | Self::Timeout { .. })
    }

    /// Check if this error is fatal to the session
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Store { .. } | Self::Config { .. } | Self::MissingTool { .. }
        )
    }

    /// Get error code for exit status. Each failure class maps to a
    /// distinct code so scripts can branch on the outcome.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Validation { .. } => 2,
            Self::NotFound { .. } => 3,
            Self::InvalidTransition { .. } => 4,
            Self::Workspace { .. } => 5,
            Self::Store { .. } => 6,
            Self::Config { .. } | Self::MissingTool { .. } => 7,
            _ => 1,
        }
    }
}

/// Type alias for Foreman results
pub type Result<T> = std::result::Result<T, ForemanError>;
