use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use uuid::Uuid;

use rigyard::{
    config::{Config, LedgerBackend},
    manager::WorkspaceManager,
    model::Rig,
    registry::RuntimeRegistration,
    runtime::ProcessRuntime,
};

#[derive(Parser)]
#[command(name = "rigyard")]
#[command(about = "A fleet scheduler for AI coding workers")]
struct Args {
    /// Workspace state directory
    #[arg(long, default_value = "./.rigyard")]
    state_dir: PathBuf,

    /// Persist the work ledger in SQLite instead of memory
    #[arg(long)]
    sqlite: bool,

    /// Command invoked to execute a bead in its workspace
    #[arg(long, default_value = "rigyard-worker")]
    worker_command: String,

    /// Comma-separated roles the default runtime registration supports
    #[arg(long, default_value = "backend,frontend,qa,docs")]
    roles: String,

    /// Concurrent sessions the default runtime registration allows
    #[arg(long, default_value = "2")]
    max_concurrency: u32,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Plan a change request into a convoy and drive it to completion
    Submit {
        /// Rig the convoy runs against
        #[arg(long)]
        rig: String,
        /// Convoy name
        #[arg(long)]
        name: String,
        /// The change request text
        request: String,
    },
    /// Print the workspace status summary
    Status,
    /// Reconcile working copies with hook records and requeue stranded beads
    Repair,
    /// Abort a running convoy
    Abort {
        convoy_id: Uuid,
        #[arg(long, default_value = "operator request")]
        reason: String,
    },
    /// Manage registered repositories
    Rig {
        #[command(subcommand)]
        command: RigCommand,
    },
}

#[derive(Subcommand)]
enum RigCommand {
    /// Register a repository
    Add {
        name: String,
        #[arg(long)]
        repo_url: String,
        #[arg(long)]
        local_path: PathBuf,
        #[arg(long, default_value = "main")]
        branch: String,
        /// Verification command run in the workspace after each bead
        #[arg(long)]
        verify: Option<String>,
    },
    /// Remove a registered repository
    Remove { name: String },
    /// List registered repositories
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Console and file logging, like a long-running service even when
    // invoked as a one-shot command
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    let logs_dir = args.state_dir.join("logs");
    std::fs::create_dir_all(&logs_dir)?;
    let file_appender = tracing_appender::rolling::daily(&logs_dir, "rigyard.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter.clone()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(env_filter),
        )
        .init();

    info!("rigyard {}", env!("CARGO_PKG_VERSION"));

    let config = Config {
        state_dir: args.state_dir.clone(),
        ledger_backend: if args.sqlite {
            LedgerBackend::Sqlite
        } else {
            LedgerBackend::Memory
        },
        ..Config::default()
    };

    let runtime = Arc::new(ProcessRuntime::new(&args.worker_command));
    let manager = WorkspaceManager::open("rigyard", config, runtime).await?;

    let roles: Vec<String> = args
        .roles
        .split(',')
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .collect();
    manager
        .register_runtime(RuntimeRegistration::new(
            "default",
            &args.worker_command,
            roles,
            args.max_concurrency,
        )?)
        .await?;

    match args.command {
        Command::Submit { rig, name, request } => {
            let report = manager.submit_request(&rig, &name, &request, "cli").await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Status => {
            let status = manager.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Repair => {
            let report = manager.repair().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Abort { convoy_id, reason } => {
            let report = manager.abort_convoy(convoy_id, &reason).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Rig { command } => match command {
            RigCommand::Add {
                name,
                repo_url,
                local_path,
                branch,
                verify,
            } => {
                let mut rig = Rig::new(name, repo_url, local_path, branch)?;
                rig.settings.verification_command = verify;
                let rig = manager.add_rig(rig).await?;
                println!("registered rig '{}' ({})", rig.name, rig.id);
            }
            RigCommand::Remove { name } => {
                let removed = manager.remove_rig(&name).await?;
                println!("removed rig '{}'", removed.name);
            }
            RigCommand::List => {
                for rig in manager.list_rigs().await {
                    println!(
                        "{}  {}  {}  {}",
                        rig.id,
                        rig.name,
                        rig.default_branch,
                        rig.local_path.display()
                    );
                }
            }
        },
    }

    Ok(())
}
