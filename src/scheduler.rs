//! Affinity scheduler: pure assignment of backlog tasks to idle workers.
//!
//! Sticky affinity amortizes the cost of re-establishing context (a loaded
//! briefing, a warmed workspace) for a worker, without starving
//! non-matching domains: on a domain miss the worker falls back to the
//! best task in the whole backlog.

use std::collections::HashMap;

use crate::task::{Task, TaskId, WorkerId};

/// One scheduling decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    pub worker: WorkerId,
    pub task: TaskId,
}

/// Select tasks for idle workers.
///
/// Deterministic: workers are served in ascending id order, candidates
/// ranked by `(priority asc, id asc)`, and a task assigned to one worker
/// is removed from the pass so no two workers receive the same task.
/// Identical inputs always give identical output.
pub fn select_tasks(
    idle_workers: &[WorkerId],
    backlog: &[&Task],
    last_domain: &HashMap<WorkerId, String>,
) -> Vec<Assignment> {
    let mut workers: Vec<WorkerId> = idle_workers.to_vec();
    workers.sort_unstable();

    let mut remaining: Vec<&Task> = backlog.to_vec();
    remaining.sort_by_key(|t| (t.priority, t.id));

    let mut assignments = Vec::new();
    for worker in workers {
        if remaining.is_empty() {
            break;
        }

        let sticky = last_domain
            .get(&worker)
            .filter(|d| !d.is_empty())
            .and_then(|domain| remaining.iter().position(|t| t.domain == **domain));

        // Sticky match wins; otherwise the best task overall. `remaining`
        // is already ranked, so position 0 is the top candidate either way.
        let index = sticky.unwrap_or(0);
        let task = remaining.remove(index);
        assignments.push(Assignment {
            worker,
            task: task.id,
        });
    }

    assignments
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskSpec, TaskType};

    fn task(id: TaskId, domain: &str, priority: i32) -> Task {
        Task::new(
            id,
            TaskSpec {
                title: format!("task {id}"),
                description: String::new(),
                domain: domain.to_string(),
                task_type: TaskType::Feature,
                priority,
                files: vec![],
            },
        )
    }

    fn domains(pairs: &[(WorkerId, &str)]) -> HashMap<WorkerId, String> {
        pairs
            .iter()
            .map(|(w, d)| (*w, d.to_string()))
            .collect()
    }

    #[test]
    fn test_empty_backlog_no_assignment() {
        let result = select_tasks(&[1, 2], &[], &HashMap::new());
        assert!(result.is_empty());
    }

    #[test]
    fn test_no_idle_workers() {
        let t = task(1, "infra", 1);
        let result = select_tasks(&[], &[&t], &HashMap::new());
        assert!(result.is_empty());
    }

    #[test]
    fn test_sticky_match_and_priority_agree() {
        // Backlog: {1, auth, prio 2}, {2, infra, prio 1}; worker sticky on
        // infra picks task 2 on both grounds.
        let a = task(1, "auth", 2);
        let b = task(2, "infra", 1);
        let result = select_tasks(&[1], &[&a, &b], &domains(&[(1, "infra")]));
        assert_eq!(result, vec![Assignment { worker: 1, task: 2 }]);
    }

    #[test]
    fn test_domain_miss_falls_back_to_priority() {
        let a = task(1, "auth", 2);
        let b = task(2, "infra", 1);
        let result = select_tasks(&[1], &[&a, &b], &domains(&[(1, "db")]));
        assert_eq!(result, vec![Assignment { worker: 1, task: 2 }]);
    }

    #[test]
    fn test_sticky_match_beats_lower_priority_elsewhere() {
        // The sticky candidate has worse priority than the global best;
        // affinity still wins.
        let a = task(1, "auth", 1);
        let b = task(2, "infra", 5);
        let result = select_tasks(&[1], &[&a, &b], &domains(&[(1, "infra")]));
        assert_eq!(result, vec![Assignment { worker: 1, task: 2 }]);
    }

    #[test]
    fn test_sticky_candidates_ranked_by_priority_then_id() {
        let a = task(1, "infra", 3);
        let b = task(2, "infra", 1);
        let c = task(3, "infra", 1);
        let result = select_tasks(&[1], &[&a, &b, &c], &domains(&[(1, "infra")]));
        assert_eq!(result, vec![Assignment { worker: 1, task: 2 }]);
    }

    #[test]
    fn test_no_double_assignment() {
        let a = task(1, "infra", 1);
        let b = task(2, "infra", 2);
        let result = select_tasks(&[1, 2], &[&a, &b], &domains(&[(1, "infra"), (2, "infra")]));
        assert_eq!(result.len(), 2);
        assert_ne!(result[0].task, result[1].task);
        // Worker 1 is served first and takes the top sticky candidate.
        assert_eq!(result[0], Assignment { worker: 1, task: 1 });
        assert_eq!(result[1], Assignment { worker: 2, task: 2 });
    }

    #[test]
    fn test_workers_served_in_id_order() {
        let a = task(1, "infra", 1);
        let result = select_tasks(&[3, 1, 2], &[&a], &HashMap::new());
        // Only one task: lowest worker id wins regardless of input order.
        assert_eq!(result, vec![Assignment { worker: 1, task: 1 }]);
    }

    #[test]
    fn test_empty_last_domain_is_not_sticky() {
        let a = task(1, "", 2);
        let b = task(2, "infra", 1);
        // A worker with no history must not sticky-match empty domains.
        let result = select_tasks(&[1], &[&a, &b], &domains(&[(1, "")]));
        assert_eq!(result, vec![Assignment { worker: 1, task: 2 }]);
    }

    #[test]
    fn test_deterministic() {
        let a = task(1, "auth", 2);
        let b = task(2, "infra", 2);
        let c = task(3, "db", 1);
        let map = domains(&[(1, "auth"), (2, "db")]);

        let first = select_tasks(&[1, 2], &[&a, &b, &c], &map);
        for _ in 0..10 {
            assert_eq!(select_tasks(&[1, 2], &[&a, &b, &c], &map), first);
        }
    }

    #[test]
    fn test_more_workers_than_tasks() {
        let a = task(1, "infra", 1);
        let result = select_tasks(&[1, 2, 3], &[&a], &HashMap::new());
        assert_eq!(result.len(), 1);
    }
}
