//! Execution metrics over the transition audit log.
//!
//! `history.log` is append-only and written on every task transition;
//! this module is its reader. It aggregates completions, failures, and
//! escalations into a summary with per-domain breakdowns and a recent
//! failure list, rendered as a text dashboard or exported as JSON or CSV.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::warn;

use crate::error::Result;
use crate::store::{HistoryEntry, SessionState, HISTORY_FILE};
use crate::task::{TaskId, TaskStatus};

/// How many entries the recent-failure list holds.
const FAILURE_LIMIT: usize = 10;

/// Aggregated view of the execution history.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    /// Window in days; `None` means the full history.
    pub period_days: Option<u32>,
    pub completed: u32,
    pub failed_attempts: u32,
    pub escalated: u32,
    /// Completions as a percentage of settled attempts (completed plus
    /// failed). `None` when nothing settled in the window.
    pub success_rate: Option<f64>,
    /// Mean seconds from assignment to settlement, over attempts whose
    /// start and end both fall inside the window.
    pub avg_task_seconds: Option<f64>,
    pub by_domain: BTreeMap<String, DomainStats>,
    pub recent_failures: Vec<FailureRecord>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DomainStats {
    pub completed: u32,
    pub failed_attempts: u32,
    pub escalated: u32,
}

/// One failed attempt, newest first in [`MetricsSummary::recent_failures`].
#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    pub task_id: TaskId,
    pub title: String,
    pub domain: String,
    pub retry_count: u32,
    pub timestamp: DateTime<Utc>,
}

/// Read the audit log from a state directory. A missing log is an empty
/// history; a corrupt line is skipped with a warning, the rest still
/// count.
pub fn load_history(state_dir: &Path) -> Result<Vec<HistoryEntry>> {
    let path = state_dir.join(HISTORY_FILE);
    if !path.exists() {
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    for (lineno, line) in fs::read_to_string(&path)?.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!(line = lineno + 1, "skipping corrupt history entry: {e}"),
        }
    }
    Ok(entries)
}

/// Aggregate the history against the current task set. Tasks supply the
/// domain and title for each entry; entries for tasks that no longer
/// exist fall under the "unknown" domain.
pub fn summarize(
    state: &SessionState,
    history: &[HistoryEntry],
    days: Option<u32>,
) -> MetricsSummary {
    let cutoff = days.map(|d| Utc::now() - Duration::days(i64::from(d)));
    let in_window = |entry: &&HistoryEntry| match cutoff {
        Some(cutoff) => entry.timestamp >= cutoff,
        None => true,
    };

    let domain_of = |task_id: TaskId| -> String {
        state
            .tasks
            .iter()
            .find(|t| t.id == task_id)
            .map(|t| t.domain.clone())
            .unwrap_or_else(|| "unknown".to_string())
    };

    let mut summary = MetricsSummary {
        period_days: days,
        completed: 0,
        failed_attempts: 0,
        escalated: 0,
        success_rate: None,
        avg_task_seconds: None,
        by_domain: BTreeMap::new(),
        recent_failures: Vec::new(),
    };

    // Open attempt start times, keyed by task; settled when the matching
    // Review/Failed/Backlog entry arrives.
    let mut started: BTreeMap<TaskId, DateTime<Utc>> = BTreeMap::new();
    let mut durations: Vec<f64> = Vec::new();

    for entry in history.iter().filter(in_window) {
        let domain = domain_of(entry.task_id);
        let stats = summary.by_domain.entry(domain.clone()).or_default();

        match entry.to {
            TaskStatus::InProgress => {
                started.insert(entry.task_id, entry.timestamp);
            }
            TaskStatus::Done => {
                summary.completed += 1;
                stats.completed += 1;
            }
            TaskStatus::Escalated => {
                summary.escalated += 1;
                stats.escalated += 1;
            }
            TaskStatus::Failed => {
                summary.failed_attempts += 1;
                stats.failed_attempts += 1;

                let title = state
                    .tasks
                    .iter()
                    .find(|t| t.id == entry.task_id)
                    .map(|t| t.title.clone())
                    .unwrap_or_default();
                summary.recent_failures.push(FailureRecord {
                    task_id: entry.task_id,
                    title,
                    domain,
                    retry_count: entry.retry_count,
                    timestamp: entry.timestamp,
                });
            }
            TaskStatus::Backlog => {}
            TaskStatus::Review => {}
        }

        // Review and Failed both settle an attempt; Backlog after
        // InProgress is a requeue and does not count as a duration.
        if matches!(entry.to, TaskStatus::Review | TaskStatus::Failed) {
            if let Some(start) = started.remove(&entry.task_id) {
                durations.push((entry.timestamp - start).num_milliseconds() as f64 / 1000.0);
            }
        }
    }

    let settled = summary.completed + summary.failed_attempts;
    if settled > 0 {
        summary.success_rate = Some(f64::from(summary.completed) / f64::from(settled) * 100.0);
    }
    if !durations.is_empty() {
        summary.avg_task_seconds = Some(durations.iter().sum::<f64>() / durations.len() as f64);
    }

    summary.recent_failures.reverse();
    summary.recent_failures.truncate(FAILURE_LIMIT);
    summary
}

/// Render the summary as a terminal dashboard.
pub fn render_text(summary: &MetricsSummary) -> String {
    let mut out = String::new();
    let window = match summary.period_days {
        Some(days) => format!("last {days} days"),
        None => "all time".to_string(),
    };

    out.push_str(&format!("Execution metrics ({window})\n"));
    out.push_str(&format!(
        "  completed: {}  failed attempts: {}  escalated: {}\n",
        summary.completed, summary.failed_attempts, summary.escalated
    ));
    if let Some(rate) = summary.success_rate {
        out.push_str(&format!("  success rate: {rate:.1}%\n"));
    }
    if let Some(avg) = summary.avg_task_seconds {
        out.push_str(&format!("  avg task duration: {avg:.0}s\n"));
    }

    if !summary.by_domain.is_empty() {
        out.push_str("\nBy domain:\n");
        for (domain, stats) in &summary.by_domain {
            out.push_str(&format!(
                "  {domain}: {} done, {} failed, {} escalated\n",
                stats.completed, stats.failed_attempts, stats.escalated
            ));
        }
    }

    if !summary.recent_failures.is_empty() {
        out.push_str("\nRecent failures:\n");
        for failure in &summary.recent_failures {
            out.push_str(&format!(
                "  #{} {} [{}] retry {} at {}\n",
                failure.task_id,
                failure.title,
                failure.domain,
                failure.retry_count,
                failure.timestamp.format("%Y-%m-%d %H:%M:%S"),
            ));
        }
    }
    out
}

/// Export the raw history rows as CSV, one row per transition.
pub fn render_csv(state: &SessionState, history: &[HistoryEntry]) -> String {
    let mut out = String::from("timestamp,task_id,domain,from,to,retry_count\n");
    for entry in history {
        let domain = state
            .tasks
            .iter()
            .find(|t| t.id == entry.task_id)
            .map(|t| t.domain.as_str())
            .unwrap_or("unknown");
        out.push_str(&format!(
            "{},{},{},{},{},{}\n",
            entry.timestamp.to_rfc3339(),
            entry.task_id,
            domain,
            entry.from,
            entry.to,
            entry.retry_count,
        ));
    }
    out
}
