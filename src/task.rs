//! Task model and lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{ForemanError, Result};

/// Identifier of a worker slot (1..=N).
pub type WorkerId = u32;

/// Identifier of a task.
pub type TaskId = u64;

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for assignment.
    Backlog,
    /// Assigned to a worker and executing.
    InProgress,
    /// Worker finished; result is being applied.
    Review,
    /// Terminal success.
    Done,
    /// Worker reported failure; transient, resolved to Backlog or Escalated.
    Failed,
    /// Terminal failure, requires human action.
    Escalated,
}

impl TaskStatus {
    /// Check if this status allows transitioning to another status.
    ///
    /// `InProgress -> Backlog` is the kill-requeue path: a session shutdown
    /// returns in-flight tasks to the backlog without consuming a retry.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Backlog, InProgress)
                | (InProgress, Review)
                | (InProgress, Failed)
                | (InProgress, Backlog)
                | (Review, Done)
                | (Failed, Backlog)
                | (Failed, Escalated)
        )
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Escalated)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Backlog => "backlog",
            Self::InProgress => "in_progress",
            Self::Review => "review",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Escalated => "escalated",
        };
        write!(f, "{s}")
    }
}

impl FromStr for TaskStatus {
    type Err = ForemanError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "backlog" => Ok(Self::Backlog),
            "in_progress" => Ok(Self::InProgress),
            "review" => Ok(Self::Review),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            "escalated" => Ok(Self::Escalated),
            other => Err(ForemanError::validation(
                "status",
                format!("unknown status '{other}'"),
            )),
        }
    }
}

/// Category of work, influences the briefing a worker receives.
///
/// The set is closed: unknown values are rejected at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Feature,
    Bugfix,
    Refactor,
    Test,
    Docs,
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Feature => "feature",
            Self::Bugfix => "bugfix",
            Self::Refactor => "refactor",
            Self::Test => "test",
            Self::Docs => "docs",
        };
        write!(f, "{s}")
    }
}

impl FromStr for TaskType {
    type Err = ForemanError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "feature" => Ok(Self::Feature),
            "bugfix" => Ok(Self::Bugfix),
            "refactor" => Ok(Self::Refactor),
            "test" => Ok(Self::Test),
            "docs" => Ok(Self::Docs),
            other => Err(ForemanError::validation(
                "task_type",
                format!("unknown task type '{other}'"),
            )),
        }
    }
}

/// User-supplied fields for a new task, validated before entering the store.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub title: String,
    pub description: String,
    pub domain: String,
    pub task_type: TaskType,
    pub priority: i32,
    /// Optional hint list of files relevant to the task, surfaced in the
    /// worker briefing.
    pub files: Vec<String>,
}

impl TaskSpec {
    /// Validate the spec. Empty `title` or `domain` is rejected.
    pub fn validate(&self) -> Result<()> {
        if self.title.trim().is_empty() {
            return Err(ForemanError::validation("title", "must not be empty"));
        }
        if self.domain.trim().is_empty() {
            return Err(ForemanError::validation("domain", "must not be empty"));
        }
        Ok(())
    }
}

/// A unit of work tracked by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique, monotonically assigned id.
    pub id: TaskId,
    pub title: String,
    pub description: String,
    /// Free-form affinity tag, e.g. "infra" or "backend".
    pub domain: String,
    pub task_type: TaskType,
    /// Lower is more urgent.
    pub priority: i32,
    pub status: TaskStatus,
    /// Set iff `status == InProgress`.
    pub assigned_worker: Option<WorkerId>,
    /// Derived from `id` on first assignment, stable thereafter.
    pub branch_name: String,
    /// Incremented on each worker failure, never decremented.
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub files: Vec<String>,
}

impl Task {
    /// Create a new backlog task from a validated spec.
    pub fn new(id: TaskId, spec: TaskSpec) -> Self {
        Self {
            id,
            title: spec.title,
            description: spec.description,
            domain: spec.domain,
            task_type: spec.task_type,
            priority: spec.priority,
            status: TaskStatus::Backlog,
            assigned_worker: None,
            branch_name: branch_name(id),
            retry_count: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            files: spec.files,
        }
    }

    /// Transition to a new status, maintaining the assignment and
    /// timestamp invariants.
    pub fn transition_to(&mut self, new_status: TaskStatus) -> Result<()> {
        if !self.status.can_transition_to(new_status) {
            return Err(ForemanError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: new_status,
            });
        }

        self.status = new_status;

        match new_status {
            TaskStatus::InProgress => {
                if self.started_at.is_none() {
                    self.started_at = Some(Utc::now());
                }
            }
            TaskStatus::Done | TaskStatus::Escalated => {
                self.completed_at = Some(Utc::now());
                self.assigned_worker = None;
            }
            // Leaving InProgress by any other route clears the assignment.
            _ => {
                self.assigned_worker = None;
            }
        }

        Ok(())
    }
}

/// Derive the deterministic branch name for a task id.
pub fn branch_name(id: TaskId) -> String {
    format!("task/{id:04}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(title: &str, domain: &str) -> TaskSpec {
        TaskSpec {
            title: title.to_string(),
            description: "desc".to_string(),
            domain: domain.to_string(),
            task_type: TaskType::Feature,
            priority: 5,
            files: vec![],
        }
    }

    #[test]
    fn test_valid_transitions() {
        assert!(TaskStatus::Backlog.can_transition_to(TaskStatus::InProgress));
        assert!(TaskStatus::InProgress.can_transition_to(TaskStatus::Review));
        assert!(TaskStatus::Review.can_transition_to(TaskStatus::Done));
        assert!(TaskStatus::InProgress.can_transition_to(TaskStatus::Failed));
        assert!(TaskStatus::InProgress.can_transition_to(TaskStatus::Backlog));
        assert!(TaskStatus::Failed.can_transition_to(TaskStatus::Backlog));
        assert!(TaskStatus::Failed.can_transition_to(TaskStatus::Escalated));
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(!TaskStatus::Done.can_transition_to(TaskStatus::Backlog));
        assert!(!TaskStatus::Escalated.can_transition_to(TaskStatus::Backlog));
        assert!(!TaskStatus::Backlog.can_transition_to(TaskStatus::Done));
        assert!(!TaskStatus::Backlog.can_transition_to(TaskStatus::Failed));
        assert!(!TaskStatus::Review.can_transition_to(TaskStatus::Failed));
        assert!(!TaskStatus::Done.can_transition_to(TaskStatus::InProgress));
    }

    #[test]
    fn test_terminal_states() {
        assert!(TaskStatus::Done.is_terminal());
        assert!(TaskStatus::Escalated.is_terminal());
        assert!(!TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
    }

    #[test]
    fn test_spec_validation() {
        assert!(spec("fix login", "auth").validate().is_ok());
        assert!(spec("", "auth").validate().is_err());
        assert!(spec("   ", "auth").validate().is_err());
        assert!(spec("fix login", "").validate().is_err());
    }

    #[test]
    fn test_branch_name_deterministic() {
        assert_eq!(branch_name(1), "task/0001");
        assert_eq!(branch_name(42), "task/0042");
        assert_eq!(branch_name(12345), "task/12345");
        let t = Task::new(7, spec("t", "d"));
        assert_eq!(t.branch_name, branch_name(7));
    }

    #[test]
    fn test_transition_sets_timestamps() {
        let mut t = Task::new(1, spec("t", "d"));
        assert!(t.started_at.is_none());

        t.assigned_worker = Some(1);
        t.transition_to(TaskStatus::InProgress).unwrap();
        assert!(t.started_at.is_some());

        t.transition_to(TaskStatus::Review).unwrap();
        t.transition_to(TaskStatus::Done).unwrap();
        assert!(t.completed_at.is_some());
        assert!(t.assigned_worker.is_none());
    }

    #[test]
    fn test_transition_clears_assignment_on_requeue() {
        let mut t = Task::new(1, spec("t", "d"));
        t.assigned_worker = Some(2);
        t.transition_to(TaskStatus::InProgress).unwrap();
        t.transition_to(TaskStatus::Backlog).unwrap();
        assert!(t.assigned_worker.is_none());
        assert_eq!(t.status, TaskStatus::Backlog);
    }

    #[test]
    fn test_invalid_transition_is_error() {
        let mut t = Task::new(3, spec("t", "d"));
        let err = t.transition_to(TaskStatus::Done).unwrap_err();
        assert!(matches!(
            err,
            ForemanError::InvalidTransition { id: 3, .. }
        ));
        assert_eq!(t.status, TaskStatus::Backlog);
    }

    #[test]
    fn test_task_type_parsing() {
        assert_eq!("bugfix".parse::<TaskType>().unwrap(), TaskType::Bugfix);
        assert!("chore".parse::<TaskType>().is_err());
    }

    #[test]
    fn test_status_serde_roundtrip() {
        let json = serde_json::to_string(&TaskStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
        let parsed: TaskStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, TaskStatus::InProgress);
    }
}
