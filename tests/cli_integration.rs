//! End-to-end tests of the `foreman` binary.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn foreman(project: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("foreman").expect("binary builds");
    cmd.arg("--project").arg(project.path());
    cmd
}

fn add_task(project: &TempDir, title: &str, domain: &str, priority: &str) {
    foreman(project)
        .args([
            "add-task",
            "--title",
            title,
            "--domain",
            domain,
            "--priority",
            priority,
        ])
        .assert()
        .success();
}

#[test]
fn test_help_lists_commands() {
    Command::cargo_bin("foreman")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("start"))
        .stdout(predicate::str::contains("add-task"))
        .stdout(predicate::str::contains("kill"));
}

#[test]
fn test_version() {
    Command::cargo_bin("foreman")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("0.1.0"));
}

#[test]
fn test_add_task_and_list() {
    let project = TempDir::new().unwrap();
    add_task(&project, "wire up login", "auth", "2");

    foreman(&project)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("#1"))
        .stdout(predicate::str::contains("wire up login"))
        .stdout(predicate::str::contains("auth"));
}

#[test]
fn test_add_task_rejects_empty_title() {
    let project = TempDir::new().unwrap();
    foreman(&project)
        .args(["add-task", "--title", "", "--domain", "auth"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("Validation"));
}

#[test]
fn test_add_task_writes_board_projection() {
    let project = TempDir::new().unwrap();
    add_task(&project, "tidy configs", "infra", "3");

    let board = project.path().join(".foreman").join("BOARD.md");
    let content = std::fs::read_to_string(board).unwrap();
    assert!(content.contains("# Task Board"));
    assert!(content.contains("tidy configs"));
}

#[test]
fn test_list_filters_by_status() {
    let project = TempDir::new().unwrap();
    add_task(&project, "a", "infra", "1");

    foreman(&project)
        .args(["list", "--status", "backlog"])
        .assert()
        .success()
        .stdout(predicate::str::contains("#1"));

    foreman(&project)
        .args(["list", "--status", "done"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No tasks."));
}

#[test]
fn test_list_rejects_unknown_status() {
    let project = TempDir::new().unwrap();
    foreman(&project)
        .args(["list", "--status", "bogus"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("unknown status"));
}

#[test]
fn test_status_shows_counts() {
    let project = TempDir::new().unwrap();
    add_task(&project, "a", "infra", "1");
    add_task(&project, "b", "auth", "2");

    foreman(&project)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("backlog"))
        .stdout(predicate::str::contains("completed today: 0/15"));
}

#[test]
fn test_reprioritize_unknown_task_exits_not_found() {
    let project = TempDir::new().unwrap();
    foreman(&project)
        .args(["reprioritize", "42", "1"])
        .assert()
        .failure()
        .code(3)
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_kill_without_session() {
    let project = TempDir::new().unwrap();
    foreman(&project)
        .arg("kill")
        .assert()
        .success()
        .stdout(predicate::str::contains("No running session."));
}

#[test]
fn test_start_dry_run_drains_backlog() {
    let project = TempDir::new().unwrap();
    add_task(&project, "first", "infra", "1");
    add_task(&project, "second", "auth", "2");

    foreman(&project)
        .args(["start", "--dry-run", "--workers", "2", "--poll-interval", "1"])
        .timeout(std::time::Duration::from_secs(30))
        .assert()
        .success()
        .stdout(predicate::str::contains("2 completed"));

    foreman(&project)
        .args(["list", "--status", "done"])
        .assert()
        .success()
        .stdout(predicate::str::contains("first"))
        .stdout(predicate::str::contains("second"));
}

#[test]
fn test_start_rejects_invalid_config() {
    let project = TempDir::new().unwrap();
    foreman(&project)
        .args(["start", "--dry-run", "--workers", "0"])
        .assert()
        .failure()
        .code(7)
        .stderr(predicate::str::contains("max_workers"));
}

#[test]
fn test_metrics_summarizes_dry_run_history() {
    let project = TempDir::new().unwrap();
    add_task(&project, "first", "infra", "1");

    foreman(&project)
        .args(["start", "--dry-run", "--poll-interval", "1"])
        .timeout(std::time::Duration::from_secs(30))
        .assert()
        .success();

    foreman(&project)
        .arg("metrics")
        .assert()
        .success()
        .stdout(predicate::str::contains("completed: 1"))
        .stdout(predicate::str::contains("infra"));
}

#[test]
fn test_metrics_csv_export_to_file() {
    let project = TempDir::new().unwrap();
    add_task(&project, "first", "infra", "1");

    foreman(&project)
        .args(["start", "--dry-run", "--poll-interval", "1"])
        .timeout(std::time::Duration::from_secs(30))
        .assert()
        .success();

    let out = project.path().join("history.csv");
    foreman(&project)
        .args(["metrics", "--format", "csv", "--output"])
        .arg(&out)
        .assert()
        .success();

    let csv = std::fs::read_to_string(out).unwrap();
    assert!(csv.starts_with("timestamp,task_id,domain,from,to,retry_count"));
    assert!(csv.contains(",review,done,"));
}

#[test]
fn test_metrics_on_fresh_project_is_empty() {
    let project = TempDir::new().unwrap();
    foreman(&project)
        .arg("metrics")
        .assert()
        .success()
        .stdout(predicate::str::contains("completed: 0"));
}

#[test]
fn test_ingest_plan_dry_run_adds_nothing() {
    let project = TempDir::new().unwrap();
    let plan = project.path().join("plan.md");
    std::fs::write(
        &plan,
        "## Implementation tasks\n\n- [ ] add webhook retry support\n",
    )
    .unwrap();

    foreman(&project)
        .args(["ingest-plan"])
        .arg(&plan)
        .arg("--dry-run")
        .assert()
        .success()
        .stdout(predicate::str::contains("add webhook retry support"));

    foreman(&project)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("No tasks."));
}

#[test]
fn test_ingest_plan_populates_backlog() {
    let project = TempDir::new().unwrap();
    let plan = project.path().join("plan.md");
    std::fs::write(
        &plan,
        "## Overview\n\n- prose that must not become a task\n\n\
         ## Implementation tasks\n\n\
         - [ ] fix the login api redirect\n\
         - [ ] document the webhook payloads\n",
    )
    .unwrap();

    foreman(&project)
        .args(["ingest-plan"])
        .arg(&plan)
        .assert()
        .success()
        .stdout(predicate::str::contains("2 tasks"));

    foreman(&project)
        .args(["list", "--status", "backlog"])
        .assert()
        .success()
        .stdout(predicate::str::contains("fix the login api redirect"))
        .stdout(predicate::str::contains("document the webhook payloads"))
        .stdout(predicate::str::contains("prose that must not become a task").not());
}

#[test]
fn test_ingest_plan_clear_replaces_backlog() {
    let project = TempDir::new().unwrap();
    add_task(&project, "stale old task", "infra", "1");

    let plan = project.path().join("plan.md");
    std::fs::write(&plan, "## Tasks\n\n- [ ] the fresh replacement task\n").unwrap();

    foreman(&project)
        .args(["ingest-plan"])
        .arg(&plan)
        .arg("--clear")
        .assert()
        .success()
        .stdout(predicate::str::contains("Cleared 1 backlog tasks."));

    foreman(&project)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("the fresh replacement task"))
        .stdout(predicate::str::contains("stale old task").not());

    // Clearing is destructive, so a backup must exist.
    let backups = project.path().join(".foreman").join("backups");
    assert!(std::fs::read_dir(backups).unwrap().count() >= 1);
}

#[test]
fn test_ingest_plan_missing_file_is_validation_error() {
    let project = TempDir::new().unwrap();
    foreman(&project)
        .args(["ingest-plan", "no-such-plan.md"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("cannot read"));
}

#[test]
fn test_add_task_against_live_session_is_kept() {
    let project = TempDir::new().unwrap();
    add_task(&project, "first", "infra", "1");
    add_task(&project, "second", "auth", "2");

    // Drain the backlog, then confirm a task added afterwards through a
    // separate invocation still exists alongside the completed ones.
    foreman(&project)
        .args(["start", "--dry-run", "--workers", "1", "--poll-interval", "1"])
        .timeout(std::time::Duration::from_secs(30))
        .assert()
        .success();

    add_task(&project, "third", "db", "1");

    foreman(&project)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("first"))
        .stdout(predicate::str::contains("second"))
        .stdout(predicate::str::contains("third"));
}
