//! Session record: process-wide orchestration state with explicit lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::OrchestratorConfig;

/// Lifecycle status of an orchestration session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// No session running.
    Idle,
    /// The orchestration loop is active.
    Running,
    /// Shutdown in progress; workers are being terminated.
    Stopping,
    /// Session torn down; all in-flight work requeued.
    Stopped,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

/// Process-wide orchestration state.
///
/// Created on `start`; torn down (status -> `Stopped`) on `kill` or clean
/// completion of all backlog under the daily limit. The embedded config is
/// loaded once at start and immutable for the session's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub status: SessionStatus,
    pub started_at: Option<DateTime<Utc>>,
    /// Successful completions counted against `config.daily_task_limit`.
    pub tasks_completed_today: u32,
    /// UTC date (YYYY-MM-DD) the counter belongs to; the counter resets
    /// when the date rolls over across a long-lived state file.
    pub completed_date: String,
    pub config: OrchestratorConfig,
}

impl Session {
    /// Create an idle session with the given config.
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            status: SessionStatus::Idle,
            started_at: None,
            tasks_completed_today: 0,
            completed_date: today(),
            config,
        }
    }

    /// Mark the session running, resetting the daily counter if the date
    /// rolled over since the last run.
    pub fn begin(&mut self) {
        self.status = SessionStatus::Running;
        self.started_at = Some(Utc::now());
        self.roll_daily_counter();
    }

    /// Record one successful task completion.
    pub fn record_completion(&mut self) {
        self.roll_daily_counter();
        self.tasks_completed_today += 1;
    }

    /// Check whether the daily throughput limit has been reached.
    pub fn daily_limit_reached(&self) -> bool {
        self.tasks_completed_today >= self.config.daily_task_limit
    }

    fn roll_daily_counter(&mut self) {
        let now = today();
        if self.completed_date != now {
            self.completed_date = now;
            self.tasks_completed_today = 0;
        }
    }
}

fn today() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}
