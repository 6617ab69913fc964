use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "fixloop")]
#[command(version, about = "Detect failing checks, propose a patch, apply it after approval, re-verify")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Path to fixloop.toml (defaults to ./fixloop.toml when present)
    #[arg(long, global = true, env = "FIXLOOP_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a default fixloop.toml
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Create a run for a ticket against a workspace
    Create {
        #[arg(long)]
        title: String,

        /// Ticket text
        #[arg(long, conflicts_with = "ticket_file", required_unless_present = "ticket_file")]
        ticket: Option<String>,

        /// Read the ticket text from a file
        #[arg(long)]
        ticket_file: Option<PathBuf>,

        /// Base workspace directory
        #[arg(long)]
        workspace: PathBuf,
    },
    /// Queue a run for processing
    Start { id: i64 },
    /// Record the patch decision: yes, no or rejected
    Decide { id: i64, decision: String },
    /// Re-run a run, optionally from a given step (order or name)
    Retry {
        id: i64,

        #[arg(long)]
        from: Option<String>,

        /// Recreate the sandbox from the base workspace first
        #[arg(long)]
        reset_sandbox: bool,
    },
    /// Propose a fresh patch from a clean sandbox
    Regenerate { id: i64 },
    /// Stop a run at its next checkpoint
    Cancel { id: i64 },
    /// Delete a run with its sandbox and artifacts
    Delete { id: i64 },
    /// List recent runs
    List {
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Show a run and its steps
    Status {
        id: i64,

        #[arg(long)]
        json: bool,
    },
    /// List a run's artifacts
    Artifacts { id: i64 },
    /// Override the patch backend for one run: rules, ollama or hf
    SetPatcher { id: i64, mode: String },
    /// Process queued runs
    Worker {
        /// Drain the queue once and exit
        #[arg(long)]
        once: bool,

        #[arg(long, default_value = "1")]
        concurrency: usize,
    },
    /// Start a run and process it inline until it finishes or waits for approval
    Run { id: i64 },
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    fixloop::telemetry::init(cli.verbose, cli.log_json);

    let cwd = std::env::current_dir().context("Failed to get current directory")?;
    let config_path = cli.config.as_deref();

    if let Commands::Init { force } = &cli.command {
        return cmd::cmd_init(&cwd, config_path, *force);
    }

    let app = cmd::App::open(&cwd, config_path)?;
    match &cli.command {
        Commands::Init { .. } => {}
        Commands::Create {
            title,
            ticket,
            ticket_file,
            workspace,
        } => {
            cmd::cmd_create(&app, title, ticket.as_deref(), ticket_file.as_deref(), workspace).await?
        }
        Commands::Start { id } => cmd::cmd_start(&app, *id).await?,
        Commands::Decide { id, decision } => cmd::cmd_decide(&app, *id, decision).await?,
        Commands::Retry {
            id,
            from,
            reset_sandbox,
        } => cmd::cmd_retry(&app, *id, from.as_deref(), *reset_sandbox).await?,
        Commands::Regenerate { id } => cmd::cmd_regenerate(&app, *id).await?,
        Commands::Cancel { id } => cmd::cmd_cancel(&app, *id).await?,
        Commands::Delete { id } => cmd::cmd_delete(&app, *id).await?,
        Commands::List { limit } => cmd::cmd_list(&app, *limit).await?,
        Commands::Status { id, json } => cmd::cmd_status(&app, *id, *json).await?,
        Commands::Artifacts { id } => cmd::cmd_artifacts(&app, *id).await?,
        Commands::SetPatcher { id, mode } => cmd::cmd_set_patcher(&app, *id, mode).await?,
        Commands::Worker { once, concurrency } => cmd::cmd_worker(&app, *once, *concurrency).await?,
        Commands::Run { id } => cmd::cmd_run(&app, *id).await?,
    }

    Ok(())
}
