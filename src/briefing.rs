//! Briefing generation: the prompt text handed to a worker process.
//!
//! Pure templating over an immutable task snapshot; no side effects on
//! core state.

use crate::task::{Task, TaskType};

/// Build the briefing text for a task.
pub fn build_briefing(task: &Task) -> String {
    let mut briefing = String::new();

    briefing.push_str(&format!("# Task {}: {}\n\n", task.id, task.title));
    briefing.push_str(&format!(
        "Domain: {}\nType: {}\nBranch: {}\n\n",
        task.domain, task.task_type, task.branch_name
    ));

    if !task.description.trim().is_empty() {
        briefing.push_str("## Description\n\n");
        briefing.push_str(task.description.trim());
        briefing.push_str("\n\n");
    }

    if !task.files.is_empty() {
        briefing.push_str("## Relevant files\n\n");
        for file in &task.files {
            briefing.push_str(&format!("- {file}\n"));
        }
        briefing.push('\n');
    }

    briefing.push_str("## Instructions\n\n");
    briefing.push_str(type_instructions(task.task_type));

    if task.retry_count > 0 {
        briefing.push_str(&format!(
            "\nThis is retry attempt {}. A previous attempt failed; \
             review the existing branch state before repeating work.\n",
            task.retry_count
        ));
    }

    briefing.push_str(
        "\nWork only inside the current directory. Commit your changes to the \
         current branch when done. Exit with code 0 only if the task is complete.\n",
    );

    briefing
}

fn type_instructions(task_type: TaskType) -> &'static str {
    match task_type {
        TaskType::Feature => {
            "Implement the feature described above. Add tests covering the new behavior.\n"
        }
        TaskType::Bugfix => {
            "Reproduce the bug first, then fix it. Add a regression test that fails \
             without the fix.\n"
        }
        TaskType::Refactor => {
            "Refactor as described without changing observable behavior. Existing \
             tests must keep passing.\n"
        }
        TaskType::Test => "Add the test coverage described above. Do not change production code \
             except where a test reveals a defect worth noting.\n",
        TaskType::Docs => {
            "Update documentation as described. Keep code samples compiling.\n"
        }
    }
}
