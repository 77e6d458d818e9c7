//! Markdown task board projection.
//!
//! A pure rendering of the persisted state into `.foreman/BOARD.md`,
//! registered as a store subscriber. Escalated tasks are surfaced at the
//! top: they are the ones waiting on a human.

use std::path::{Path, PathBuf};

use crate::store::{Projection, SessionState};
use crate::task::{Task, TaskStatus};

/// Board file name inside the state directory.
pub const BOARD_FILE: &str = "BOARD.md";

/// Renders the session state as a markdown kanban board.
#[derive(Debug)]
pub struct MarkdownBoard {
    path: PathBuf,
}

impl MarkdownBoard {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(BOARD_FILE),
        }
    }

    fn column(out: &mut String, title: &str, tasks: &[&Task]) {
        out.push_str(&format!("## {title} ({})\n\n", tasks.len()));
        if tasks.is_empty() {
            out.push_str("_empty_\n\n");
            return;
        }
        for task in tasks {
            let worker = task
                .assigned_worker
                .map(|w| format!(" [worker {w}]"))
                .unwrap_or_default();
            let retries = if task.retry_count > 0 {
                format!(" (retries: {})", task.retry_count)
            } else {
                String::new()
            };
            out.push_str(&format!(
                "- **#{}** {} | {} p{}{}{}\n",
                task.id, task.title, task.domain, task.priority, worker, retries
            ));
        }
        out.push('\n');
    }
}

impl Projection for MarkdownBoard {
    fn render(&self, state: &SessionState) -> std::io::Result<()> {
        let by_status = |status: TaskStatus| -> Vec<&Task> {
            state.tasks.iter().filter(|t| t.status == status).collect()
        };

        let mut out = String::new();
        out.push_str("# Task Board\n\n");
        out.push_str(&format!(
            "Session: {} | completed today: {}/{}\n\n",
            state.session.status,
            state.session.tasks_completed_today,
            state.session.config.daily_task_limit
        ));

        let escalated = by_status(TaskStatus::Escalated);
        if !escalated.is_empty() {
            Self::column(&mut out, "Escalated (needs human action)", &escalated);
        }

        Self::column(&mut out, "Backlog", &by_status(TaskStatus::Backlog));
        Self::column(&mut out, "In Progress", &by_status(TaskStatus::InProgress));
        Self::column(&mut out, "Review", &by_status(TaskStatus::Review));
        Self::column(&mut out, "Done", &by_status(TaskStatus::Done));
        Self::column(&mut out, "Failed", &by_status(TaskStatus::Failed));

        std::fs::write(&self.path, out)
    }
}
