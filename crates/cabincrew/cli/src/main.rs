//! CabinCrew CLI - operator tooling for workflow logs
//!
//! Reads a write-ahead log directory without running any engine:
//! - List workflows with their folded state
//! - Inspect one workflow's state record or raw entries
//! - Verify log integrity
//! - Archive finished workflows

use std::path::PathBuf;

use anyhow::Context;
use cabincrew_orchestrator::OrchestratorConfig;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod output;

use commands::{verify, workflow};
use output::OutputFormat;

/// CabinCrew CLI application
#[derive(Parser)]
#[command(name = "cabincrew")]
#[command(about = "CabinCrew - governed execution protocol operator CLI", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "CABINCREW_CONFIG", global = true)]
    config: Option<String>,

    /// Log level, overrides the configured one
    #[arg(long, env = "CABINCREW_LOG_LEVEL", global = true)]
    log_level: Option<String>,

    /// Print JSON instead of tables
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands
#[derive(Subcommand)]
enum Commands {
    /// List workflows in a WAL directory with their current state
    #[command(alias = "ls")]
    List {
        /// WAL directory, defaults to the configured one
        #[arg(short, long)]
        data_dir: Option<PathBuf>,
    },

    /// Print a workflow's state record
    Inspect {
        /// WAL directory, defaults to the configured one
        #[arg(short, long)]
        data_dir: Option<PathBuf>,

        /// Workflow ID
        #[arg(value_parser = workflow::parse_workflow_id)]
        workflow_id: cabincrew_types::WorkflowId,
    },

    /// Print a workflow's WAL entries in sequence order
    Log {
        /// WAL directory, defaults to the configured one
        #[arg(short, long)]
        data_dir: Option<PathBuf>,

        /// Workflow ID
        #[arg(value_parser = workflow::parse_workflow_id)]
        workflow_id: cabincrew_types::WorkflowId,
    },

    /// Verify log integrity; exits non-zero on corruption
    Verify {
        /// WAL directory, defaults to the configured one
        #[arg(short, long)]
        data_dir: Option<PathBuf>,

        /// Workflow ID, all workflows when omitted
        #[arg(value_parser = workflow::parse_workflow_id)]
        workflow_id: Option<cabincrew_types::WorkflowId>,
    },

    /// Move a completed or failed workflow's log out of the live directory
    Archive {
        /// WAL directory, defaults to the configured one
        #[arg(short, long)]
        data_dir: Option<PathBuf>,

        /// Workflow ID
        #[arg(value_parser = workflow::parse_workflow_id)]
        workflow_id: cabincrew_types::WorkflowId,

        /// Destination directory
        #[arg(long)]
        dest: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = OrchestratorConfig::load(cli.config.as_deref())
        .context("failed to load configuration")?;

    // Initialize tracing
    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    if config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .without_time()
                    .with_writer(std::io::stderr),
            )
            .init();
    }

    let format = OutputFormat::from_json_flag(cli.json);

    match cli.command {
        Commands::List { data_dir } => {
            let wal = workflow::open_wal(&config, data_dir)?;
            workflow::list(&wal, format).await
        }
        Commands::Inspect {
            data_dir,
            workflow_id,
        } => {
            let wal = workflow::open_wal(&config, data_dir)?;
            workflow::inspect(&wal, &workflow_id).await
        }
        Commands::Log {
            data_dir,
            workflow_id,
        } => {
            let wal = workflow::open_wal(&config, data_dir)?;
            workflow::log(&wal, &workflow_id, format).await
        }
        Commands::Verify {
            data_dir,
            workflow_id,
        } => {
            let wal = workflow::open_wal(&config, data_dir)?;
            if !verify::execute(&wal, workflow_id.as_ref(), format)? {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Archive {
            data_dir,
            workflow_id,
            dest,
        } => {
            let wal = workflow::open_wal(&config, data_dir)?;
            workflow::archive(&wal, &workflow_id, &dest).await
        }
    }
}
