//! taskctl - CLI client for taskd.
//!
//! Local control plane client for the task orchestration daemon.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

mod client;
mod render;

use clap::{Parser, Subcommand};
use client::{Client, ClientError, CreateTaskRequest};
use task_core::KillSwitchMode;

const DEFAULT_ADDR: &str = "http://127.0.0.1:7710";

/// CLI client for the taskd orchestration daemon.
#[derive(Parser)]
#[command(name = "taskctl")]
#[command(about = "Control plane for the taskd orchestration daemon")]
#[command(version)]
struct Cli {
    /// Daemon address (default: http://127.0.0.1:7710)
    #[arg(long, global = true, env = "TASKD_ADDR")]
    addr: Option<String>,

    /// Auth token for daemon API
    #[arg(long, global = true, env = "TASKD_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Enqueue a new task
    Enqueue {
        /// Task title
        title: String,

        /// Task kind: feature, bugfix, refactor, test, doc, or infra
        #[arg(long, default_value = "feature")]
        kind: String,

        /// Explicit task id (generated when omitted)
        #[arg(long)]
        id: Option<String>,

        /// Dispatch priority (lower value dispatches first)
        #[arg(long)]
        priority: Option<i64>,

        /// Task ids that must complete first (repeatable)
        #[arg(long = "depends-on")]
        depends_on: Vec<String>,

        /// Retry budget override
        #[arg(long)]
        max_attempts: Option<u32>,
    },

    /// List tasks, optionally filtered by state
    List {
        /// Filter: pending, in_progress, completed, blocked, or cancelled
        #[arg(long)]
        state: Option<String>,
    },

    /// Show a single task
    Show { id: String },

    /// Show a task's audit trail
    Audit { id: String },

    /// Show a task's attempt history
    Attempts { id: String },

    /// Show a task's checkpoint history
    Checkpoints { id: String },

    /// Resolve a BLOCKED task back to PENDING
    Resolve {
        id: String,

        /// Note recorded in the audit trail
        #[arg(long)]
        note: Option<String>,
    },

    /// Cancel a non-terminal task
    Cancel { id: String },

    /// Show or set the kill switch
    #[command(name = "kill-switch")]
    KillSwitch {
        /// New mode: normal, safe, paused, or off (omit to show)
        mode: Option<String>,
    },

    /// Show task counts and scheduler status
    Summary,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let addr = cli.addr.unwrap_or_else(|| DEFAULT_ADDR.to_string());
    let client = Client::new(&addr, cli.token.as_deref());

    if let Err(e) = run_command(&client, cli.command).await {
        eprintln!("error: {e}");
        std::process::exit(e.exit_code());
    }
}

async fn run_command(client: &Client, command: Command) -> Result<(), ClientError> {
    match command {
        Command::Enqueue {
            title,
            kind,
            id,
            priority,
            depends_on,
            max_attempts,
        } => {
            let task = client
                .enqueue(CreateTaskRequest {
                    id,
                    title,
                    kind,
                    priority,
                    dependencies: depends_on,
                    max_attempts,
                })
                .await?;
            render::print_task_created(&task);
        }
        Command::List { state } => {
            let tasks = client.list_tasks(state.as_deref()).await?;
            render::print_task_list(&tasks);
        }
        Command::Show { id } => {
            let task = client.get_task(&id).await?;
            render::print_task_details(&task);
        }
        Command::Audit { id } => {
            let events = client.list_audit(&id).await?;
            render::print_audit(&events);
        }
        Command::Attempts { id } => {
            let attempts = client.list_attempts(&id).await?;
            render::print_attempts(&attempts);
        }
        Command::Checkpoints { id } => {
            let checkpoints = client.list_checkpoints(&id).await?;
            render::print_checkpoints(&checkpoints);
        }
        Command::Resolve { id, note } => {
            let task = client.resolve(&id, note.as_deref()).await?;
            println!("Resolved {} back to {}", task.id, task.state.as_str());
        }
        Command::Cancel { id } => {
            let task = client.cancel(&id).await?;
            println!("Cancelled {}", task.id);
        }
        Command::KillSwitch { mode } => match mode {
            Some(mode) => {
                let Some(mode) = KillSwitchMode::parse(&mode) else {
                    eprintln!("error: unknown mode: {mode} (expected normal, safe, paused, or off)");
                    std::process::exit(1);
                };
                let current = client.set_kill_switch(mode).await?;
                println!("Kill switch: {}", current.as_str());
            }
            None => {
                let current = client.kill_switch().await?;
                println!("Kill switch: {}", current.as_str());
            }
        },
        Command::Summary => {
            let summary = client.summary().await?;
            render::print_summary(&summary);
        }
    }
    Ok(())
}
