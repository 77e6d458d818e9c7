//! Batch backlog ingestion from a markdown plan.
//!
//! Reads a human-written plan document and turns its actionable sections
//! into task specs. Only sections whose headings look like work lists
//! (implementation, steps, tasks, ...) are captured; prose sections
//! (overview, summary, ...) are skipped. Domain and task type are
//! inferred from the item text with plain keyword heuristics; the result
//! is a starting point the operator refines with `reprioritize`.

use crate::task::{TaskSpec, TaskType};

/// Heading keywords that switch capture on.
const CAPTURE_KEYWORDS: &[&str] = &[
    "implementation",
    "execution",
    "steps",
    "deployment",
    "objectives",
    "tasks",
];

/// Heading keywords that switch capture off.
const IGNORE_KEYWORDS: &[&str] = &["overview", "summary", "introduction", "conclusion"];

/// Items shorter than this are headers-in-disguise or noise.
const MIN_ITEM_LEN: usize = 10;

/// Default priority for ingested tasks; mid-scale, tune afterwards.
const DEFAULT_PRIORITY: i32 = 3;

/// Extract task specs from a markdown plan document.
pub fn parse_plan(markdown: &str) -> Vec<TaskSpec> {
    let mut specs = Vec::new();
    let mut capturing = false;
    let mut section = String::new();

    for line in markdown.lines() {
        let trimmed = line.trim();

        if let Some(heading) = heading_text(trimmed) {
            let lower = heading.to_lowercase();
            if CAPTURE_KEYWORDS.iter().any(|k| lower.contains(k)) {
                capturing = true;
                section = heading.to_string();
            } else if IGNORE_KEYWORDS.iter().any(|k| lower.contains(k)) {
                capturing = false;
            }
            // A heading matching neither list inherits the current state.
            continue;
        }

        if !capturing {
            continue;
        }
        let Some(item) = item_text(trimmed) else {
            continue;
        };
        if item.len() < MIN_ITEM_LEN {
            continue;
        }

        specs.push(TaskSpec {
            title: item.to_string(),
            description: format!("Derived from section: {section}"),
            domain: infer_domain(item),
            task_type: infer_type(item),
            priority: DEFAULT_PRIORITY,
            files: vec![],
        });
    }
    specs
}

/// `## Heading` at any level; returns the heading text.
fn heading_text(line: &str) -> Option<&str> {
    let stripped = line.strip_prefix("##")?;
    let stripped = stripped.trim_start_matches('#');
    let text = stripped.trim();
    (!text.is_empty()).then_some(text)
}

/// An actionable list item: an unchecked checkbox, a plain bullet, or a
/// numbered step. Checked boxes are already done and are skipped.
fn item_text(line: &str) -> Option<&str> {
    if let Some(rest) = line.strip_prefix("- [ ] ") {
        return Some(rest.trim());
    }
    if line.starts_with("- [x] ") || line.starts_with("- [X] ") {
        return None;
    }
    if let Some(rest) = line.strip_prefix("- ") {
        return Some(rest.trim());
    }

    // "1. step" style numbered items.
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits > 0 {
        if let Some(rest) = line[digits..].strip_prefix(". ") {
            return Some(rest.trim());
        }
    }
    None
}

fn infer_domain(text: &str) -> String {
    let lower = text.to_lowercase();
    let domain = if lower.contains("frontend") || lower.contains("ui") {
        "frontend"
    } else if lower.contains("test") {
        "test"
    } else if lower.contains("api") {
        "backend"
    } else if lower.contains("db") || lower.contains("sql") {
        "database"
    } else if lower.contains("config") || lower.contains("env") {
        "devops"
    } else {
        "general"
    };
    domain.to_string()
}

fn infer_type(text: &str) -> TaskType {
    let lower = text.to_lowercase();
    if lower.contains("fix") {
        TaskType::Bugfix
    } else if lower.contains("doc") {
        TaskType::Docs
    } else if lower.contains("test") {
        TaskType::Test
    } else if lower.contains("refactor") {
        TaskType::Refactor
    } else {
        TaskType::Feature
    }
}
