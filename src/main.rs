//! Foreman - multi-worker task orchestration for autonomous coding agents.
//!
//! The control surface: `start` runs the orchestration loop in the
//! foreground, `kill` stops a running session, and the remaining commands
//! inspect or edit the durable backlog.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;

use foreman::board::MarkdownBoard;
use foreman::config::{ConfigOverrides, OrchestratorConfig, STATE_DIR};
use foreman::orchestrator::Orchestrator;
use foreman::{ingest, metrics};
use foreman::shutdown::{
    self, offline_shutdown, spawn_signal_listener, ShutdownReport,
};
use foreman::store::StateStore;
use foreman::supervisor::agent::AgentLauncher;
use foreman::supervisor::worktree::GitWorktrees;
use foreman::supervisor::{WorkerLauncher, WorkerSupervisor, WorkspaceProvider};
use foreman::task::{Task, TaskSpec, TaskStatus, TaskType};
use foreman::testing::{MockLauncher, MockWorkspaces, ScriptedExit};
use foreman::{ForemanError, Result};

#[derive(Parser)]
#[command(name = "foreman")]
#[command(version = "0.1.0")]
#[command(about = "Multi-worker task orchestration for autonomous coding agents", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Project directory (defaults to current directory)
    #[arg(short, long, global = true, default_value = ".")]
    project: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestration loop in the foreground
    Start {
        /// Number of concurrent worker slots
        #[arg(short, long)]
        workers: Option<u32>,

        /// Maximum successful completions per UTC day
        #[arg(long)]
        max_tasks: Option<u32>,

        /// Retries before a task is escalated
        #[arg(long)]
        max_retries: Option<u32>,

        /// Grace period in seconds before an interrupted worker is force-killed
        #[arg(long)]
        graceful_timeout: Option<u64>,

        /// Seconds between orchestration loop ticks
        #[arg(long)]
        poll_interval: Option<u64>,

        /// Per-task deadline in seconds
        #[arg(long)]
        max_task_duration: Option<u64>,

        /// Use mock workers instead of the agent binary; exercises the
        /// full loop without touching git or spawning agents
        #[arg(long)]
        dry_run: bool,
    },

    /// Show the session and task board
    Status,

    /// Stop a running session, requeueing in-flight tasks
    Kill {
        /// Force-kill workers instead of waiting out the grace period
        #[arg(short, long)]
        force: bool,
    },

    /// Add a task to the backlog
    AddTask {
        /// Short task title
        #[arg(long)]
        title: String,

        /// Longer description handed to the worker
        #[arg(long, default_value = "")]
        description: String,

        /// Affinity domain, e.g. "auth" or "infra"
        #[arg(long)]
        domain: String,

        /// Kind of change
        #[arg(long = "type", value_enum, default_value = "feature")]
        task_type: TaskType,

        /// Priority; lower is more urgent
        #[arg(long, default_value = "3")]
        priority: i32,

        /// Files relevant to the task, surfaced in the worker briefing
        #[arg(long, num_args = 1..)]
        files: Vec<String>,
    },

    /// List tasks
    List {
        /// Only show tasks with this status
        #[arg(long)]
        status: Option<String>,
    },

    /// Change a task's priority
    Reprioritize {
        /// Task id
        id: u64,

        /// New priority; lower is more urgent
        priority: i32,
    },

    /// Summarize the execution history
    Metrics {
        /// Only count history from the last N days
        #[arg(long)]
        days: Option<u32>,

        /// Output format
        #[arg(long, value_enum, default_value = "text")]
        format: MetricsFormat,

        /// Write to a file instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Add tasks in bulk from a markdown plan
    IngestPlan {
        /// Path to the plan document
        plan: PathBuf,

        /// Remove existing backlog tasks first (a backup is taken)
        #[arg(long)]
        clear: bool,

        /// Show what would be added without writing anything
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum MetricsFormat {
    Text,
    Json,
    Csv,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose {
        "foreman=debug,info"
    } else {
        "foreman=info,warn"
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let project = cli.project.canonicalize().unwrap_or(cli.project.clone());
    if !project.exists() {
        eprintln!(
            "{} Project directory does not exist: {}",
            "Error:".red().bold(),
            project.display()
        );
        return std::process::ExitCode::from(1);
    }

    match run(cli.command, &project).await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {e}", "Error:".red().bold());
            std::process::ExitCode::from(e.exit_code() as u8)
        }
    }
}

async fn run(command: Commands, project: &PathBuf) -> Result<()> {
    match command {
        Commands::Start {
            workers,
            max_tasks,
            max_retries,
            graceful_timeout,
            poll_interval,
            max_task_duration,
            dry_run,
        } => {
            let overrides = ConfigOverrides {
                max_workers: workers,
                max_retries,
                daily_task_limit: max_tasks,
                graceful_timeout_secs: graceful_timeout,
                poll_interval_secs: poll_interval,
                max_task_duration_secs: max_task_duration,
            };
            cmd_start(project, &overrides, dry_run).await
        }
        Commands::Status => cmd_status(project),
        Commands::Kill { force } => cmd_kill(project, force).await,
        Commands::AddTask {
            title,
            description,
            domain,
            task_type,
            priority,
            files,
        } => cmd_add_task(
            project,
            TaskSpec {
                title,
                description,
                domain,
                task_type,
                priority,
                files,
            },
        ),
        Commands::List { status } => cmd_list(project, status.as_deref()),
        Commands::Reprioritize { id, priority } => cmd_reprioritize(project, id, priority),
        Commands::Metrics {
            days,
            format,
            output,
        } => cmd_metrics(project, days, format, output.as_deref()),
        Commands::IngestPlan {
            plan,
            clear,
            dry_run,
        } => cmd_ingest_plan(project, &plan, clear, dry_run),
    }
}

async fn cmd_start(project: &PathBuf, overrides: &ConfigOverrides, dry_run: bool) -> Result<()> {
    if let Some(pid) = shutdown::read_pid_file(project) {
        if shutdown::process_alive(pid) {
            return Err(ForemanError::validation(
                "session",
                format!("a session is already running (pid {pid}); use `foreman kill` first"),
            ));
        }
    }

    let config = OrchestratorConfig::load(project, overrides)?;

    let (workspaces, launcher): (Arc<dyn WorkspaceProvider>, Arc<dyn WorkerLauncher>) = if dry_run
    {
        println!("{} using mock workers", "Dry run:".yellow().bold());
        (
            Arc::new(MockWorkspaces::new()),
            Arc::new(MockLauncher::new(ScriptedExit::Success)),
        )
    } else {
        (
            Arc::new(GitWorktrees::new(project)),
            Arc::new(AgentLauncher::detect()?),
        )
    };

    let mut store = StateStore::open(project, config.clone())?;
    store.add_projection(Box::new(MarkdownBoard::new(&project.join(STATE_DIR))));

    let supervisor = WorkerSupervisor::new(
        config.max_workers,
        workspaces,
        launcher,
        Duration::from_secs(config.max_task_duration_secs),
        Duration::from_secs(config.graceful_timeout_secs),
    );

    let (orchestrator, shutdown_tx) = Orchestrator::new(store, supervisor);
    spawn_signal_listener(shutdown_tx);

    println!(
        "{} {} workers, daily limit {}, max {} retries",
        "Starting:".green().bold(),
        config.max_workers,
        config.daily_task_limit,
        config.max_retries
    );

    shutdown::write_pid_file(project)?;
    let result = orchestrator.run().await;
    shutdown::remove_pid_file(project);

    let (summary, store) = result?;
    println!(
        "\n{} {} completed, {} failed attempts, {} escalated",
        "Session finished:".green().bold(),
        summary.completed,
        summary.failed_attempts,
        summary.escalated
    );
    if let Some(report) = summary.shutdown {
        print_shutdown_report(&report);
    }

    let escalated: Vec<&Task> = store
        .tasks()
        .iter()
        .filter(|t| t.status == TaskStatus::Escalated)
        .collect();
    if !escalated.is_empty() {
        println!("\n{}", "Needs human action:".red().bold());
        for task in escalated {
            println!("  #{} {} ({})", task.id, task.title, task.domain);
        }
    }
    Ok(())
}

fn cmd_status(project: &PathBuf) -> Result<()> {
    let config = OrchestratorConfig::load(project, &ConfigOverrides::default())?;
    let store = StateStore::open(project, config)?;
    let session = store.session();

    let running = shutdown::read_pid_file(project)
        .map(shutdown::process_alive)
        .unwrap_or(false);

    println!("{}", "Session".bold());
    println!("  status:          {}", session.status);
    println!("  process:         {}", if running { "alive" } else { "none" });
    println!(
        "  completed today: {}/{}",
        session.tasks_completed_today, session.config.daily_task_limit
    );

    println!("\n{}", "Tasks".bold());
    for status in [
        TaskStatus::Backlog,
        TaskStatus::InProgress,
        TaskStatus::Review,
        TaskStatus::Done,
        TaskStatus::Failed,
        TaskStatus::Escalated,
    ] {
        let count = store.tasks().iter().filter(|t| t.status == status).count();
        println!("  {status:<12} {count}");
    }

    let escalated: Vec<&Task> = store
        .tasks()
        .iter()
        .filter(|t| t.status == TaskStatus::Escalated)
        .collect();
    if !escalated.is_empty() {
        println!("\n{}", "Needs human action:".red().bold());
        for task in escalated {
            println!(
                "  #{} {} ({}, retries: {})",
                task.id, task.title, task.domain, task.retry_count
            );
        }
    }
    Ok(())
}

async fn cmd_kill(project: &PathBuf, force: bool) -> Result<()> {
    let config = OrchestratorConfig::load(project, &ConfigOverrides::default())?;

    let live_pid = shutdown::read_pid_file(project).filter(|&pid| shutdown::process_alive(pid));

    let Some(pid) = live_pid else {
        // No live orchestrator: recover the state file directly.
        let mut store = StateStore::open(project, config)?;
        let report = offline_shutdown(&mut store)?;
        if report == ShutdownReport::default() {
            println!("No running session.");
        } else {
            println!("{} recovered a dead session", "Stopped:".green().bold());
            print_shutdown_report(&report);
        }
        return Ok(());
    };

    let in_flight: Vec<u64> = {
        let store = StateStore::open(project, config.clone())?;
        store
            .tasks()
            .iter()
            .filter(|t| t.status == TaskStatus::InProgress)
            .map(|t| t.id)
            .collect()
    };

    println!("Stopping session (pid {pid})...");
    shutdown::signal_process(pid);
    if force {
        // A second signal makes the orchestrator escalate to a forced
        // worker kill.
        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown::signal_process(pid);
    }

    // Wait for the orchestrator to finish its teardown.
    let deadline = Duration::from_secs(config.graceful_timeout_secs + 15);
    let start = std::time::Instant::now();
    loop {
        if !shutdown::process_alive(pid) {
            break;
        }
        if start.elapsed() > deadline {
            return Err(ForemanError::store(format!(
                "session process {pid} did not stop within {}s",
                deadline.as_secs()
            )));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    println!("{} session stopped", "Stopped:".green().bold());
    if in_flight.is_empty() {
        println!("No tasks were in flight.");
    } else {
        println!("Returned to backlog: {}", format_ids(&in_flight));
    }
    Ok(())
}

fn cmd_add_task(project: &PathBuf, spec: TaskSpec) -> Result<()> {
    let config = OrchestratorConfig::load(project, &ConfigOverrides::default())?;
    let mut store = StateStore::open(project, config)?;
    store.add_projection(Box::new(MarkdownBoard::new(&project.join(STATE_DIR))));

    let task = store.add_task(spec)?;
    store.flush_projections();
    println!(
        "{} #{} {} ({}, {}, p{})",
        "Added:".green().bold(),
        task.id,
        task.title,
        task.domain,
        task.task_type,
        task.priority
    );
    println!("  branch: {}", task.branch_name);
    Ok(())
}

fn cmd_list(project: &PathBuf, status: Option<&str>) -> Result<()> {
    let config = OrchestratorConfig::load(project, &ConfigOverrides::default())?;
    let store = StateStore::open(project, config)?;

    let filter = status.map(TaskStatus::from_str).transpose()?;
    let mut tasks: Vec<&Task> = store
        .tasks()
        .iter()
        .filter(|t| filter.is_none_or(|s| t.status == s))
        .collect();
    tasks.sort_by_key(|t| (t.priority, t.id));

    if tasks.is_empty() {
        println!("No tasks.");
        return Ok(());
    }

    for task in tasks {
        let status = match task.status {
            TaskStatus::Done => task.status.to_string().green(),
            TaskStatus::Escalated => task.status.to_string().red().bold(),
            TaskStatus::Failed => task.status.to_string().red(),
            TaskStatus::InProgress => task.status.to_string().yellow(),
            _ => task.status.to_string().normal(),
        };
        let worker = task
            .assigned_worker
            .map(|w| format!(" worker={w}"))
            .unwrap_or_default();
        let retries = if task.retry_count > 0 {
            format!(" retries={}", task.retry_count)
        } else {
            String::new()
        };
        println!(
            "#{:<4} {:<12} p{} {:<10} {}{worker}{retries}",
            task.id, status, task.priority, task.domain, task.title
        );
    }
    Ok(())
}

fn cmd_reprioritize(project: &PathBuf, id: u64, priority: i32) -> Result<()> {
    let config = OrchestratorConfig::load(project, &ConfigOverrides::default())?;
    let mut store = StateStore::open(project, config)?;

    let task = store.reprioritize(id, priority)?;
    println!(
        "{} #{} {} now at p{}",
        "Updated:".green().bold(),
        task.id,
        task.title,
        task.priority
    );
    Ok(())
}

fn cmd_metrics(
    project: &PathBuf,
    days: Option<u32>,
    format: MetricsFormat,
    output: Option<&Path>,
) -> Result<()> {
    let config = OrchestratorConfig::load(project, &ConfigOverrides::default())?;
    let store = StateStore::open(project, config)?;
    let history = metrics::load_history(&project.join(STATE_DIR))?;

    let rendered = match format {
        MetricsFormat::Text => metrics::render_text(&metrics::summarize(store.state(), &history, days)),
        MetricsFormat::Json => {
            let summary = metrics::summarize(store.state(), &history, days);
            serde_json::to_string_pretty(&summary)?
        }
        MetricsFormat::Csv => metrics::render_csv(store.state(), &history),
    };

    match output {
        Some(path) => {
            std::fs::write(path, rendered)?;
            println!("{} {}", "Written:".green().bold(), path.display());
        }
        None => print!("{rendered}"),
    }
    Ok(())
}

fn cmd_ingest_plan(project: &PathBuf, plan: &Path, clear: bool, dry_run: bool) -> Result<()> {
    let config = OrchestratorConfig::load(project, &ConfigOverrides::default())?;
    let markdown = std::fs::read_to_string(plan)
        .map_err(|e| ForemanError::validation("plan", format!("cannot read {}: {e}", plan.display())))?;

    let specs = ingest::parse_plan(&markdown);
    if specs.is_empty() {
        println!("No actionable items found in {}.", plan.display());
        return Ok(());
    }

    if dry_run {
        println!("{} {} tasks would be added:", "Dry run:".yellow().bold(), specs.len());
        for spec in &specs {
            println!("  {} ({}, {}, p{})", spec.title, spec.domain, spec.task_type, spec.priority);
        }
        if clear {
            println!("  (existing backlog tasks would be removed)");
        }
        return Ok(());
    }

    let mut store = StateStore::open(project, config)?;
    store.add_projection(Box::new(MarkdownBoard::new(&project.join(STATE_DIR))));

    if clear {
        store.backup("ingest")?;
        let removed = store.clear_backlog()?;
        if !removed.is_empty() {
            println!("Cleared {} backlog tasks.", removed.len());
        }
    }

    let mut added = 0u32;
    for spec in specs {
        let task = store.add_task(spec)?;
        println!("  #{} {} ({}, p{})", task.id, task.title, task.domain, task.priority);
        added += 1;
    }
    store.flush_projections();
    println!("{} {added} tasks from {}", "Added:".green().bold(), plan.display());
    Ok(())
}

fn print_shutdown_report(report: &ShutdownReport) {
    println!("  backup: {}", report.backup_id);
    if report.requeued.is_empty() {
        println!("  no tasks were in flight");
    } else {
        println!("  returned to backlog: {}", format_ids(&report.requeued));
    }
}

fn format_ids(ids: &[u64]) -> String {
    ids.iter()
        .map(|id| format!("#{id}"))
        .collect::<Vec<_>>()
        .join(", ")
}
