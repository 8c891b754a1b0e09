mod commands;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use prajna_common::config::BackendKind;
use prajna_common::types::Language;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "prajna-cli")]
#[command(about = "Prajna CLI - Run, judge and inspect sandboxed submissions", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Source file and its language.
#[derive(Args)]
pub struct SourceArgs {
    /// Source file to execute
    #[arg(short, long)]
    pub file: PathBuf,

    /// Language (cpp, c++, python, py); guessed from the file extension when omitted
    #[arg(short, long)]
    pub language: Option<Language>,
}

/// Local execution settings, layered over the PRAJNA_* environment.
#[derive(Args)]
pub struct LocalArgs {
    /// Isolation backend (docker or process)
    #[arg(short, long)]
    pub backend: Option<BackendKind>,

    /// Wall-clock limit per run in milliseconds
    #[arg(long)]
    pub time_limit_ms: Option<u64>,

    /// Memory limit per run in MB
    #[arg(long)]
    pub memory_limit_mb: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a source file once, locally
    Run {
        #[command(flatten)]
        source: SourceArgs,

        /// File whose contents are fed to stdin
        #[arg(short, long)]
        stdin: Option<PathBuf>,

        #[command(flatten)]
        local: LocalArgs,
    },

    /// Judge a source file against a problem's test cases, locally
    Judge {
        #[command(flatten)]
        source: SourceArgs,

        /// Problem identifier (directory under the problems root)
        #[arg(short, long)]
        problem: String,

        /// Problems root directory
        #[arg(long)]
        problems_root: Option<PathBuf>,

        #[command(flatten)]
        local: LocalArgs,
    },

    /// Queue a judge job through Redis and print its id
    Submit {
        #[command(flatten)]
        source: SourceArgs,

        /// Problem identifier
        #[arg(short, long)]
        problem: String,
    },

    /// Execute once through a worker and wait for the outcome
    Exec {
        #[command(flatten)]
        source: SourceArgs,

        /// File whose contents are fed to stdin
        #[arg(short, long)]
        stdin: Option<PathBuf>,

        /// Caller-side wait in milliseconds (defaults to PRAJNA_ADHOC_WAIT_MS)
        #[arg(short, long)]
        wait_ms: Option<u64>,
    },

    /// Show the recorded state of a job
    Status {
        /// Job id printed by `submit`
        job_id: Uuid,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Engine logs go to stderr so stdout stays parseable
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            source,
            stdin,
            local,
        } => {
            commands::run_local(&source, stdin.as_deref(), &local).await?;
        }
        Commands::Judge {
            source,
            problem,
            problems_root,
            local,
        } => {
            commands::judge_local(&source, &problem, problems_root, &local).await?;
        }
        Commands::Submit { source, problem } => {
            commands::submit(&source, &problem).await?;
        }
        Commands::Exec {
            source,
            stdin,
            wait_ms,
        } => {
            commands::exec_remote(&source, stdin.as_deref(), wait_ms).await?;
        }
        Commands::Status { job_id } => {
            commands::status(job_id).await?;
        }
    }

    Ok(())
}
