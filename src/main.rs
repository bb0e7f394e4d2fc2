use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "mender")]
#[command(version, about = "Autonomous code-fix orchestrator with bounded retries")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Repository to operate on (defaults to the current directory)
    #[arg(long, global = true)]
    pub repo: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one fix task end to end
    Run {
        /// Issue description
        issue: String,

        /// Target files the fix should focus on
        #[arg(short, long, value_delimiter = ',')]
        files: Vec<String>,

        /// Tool domain: testing, linting, git, or search (inferred when omitted)
        #[arg(short, long)]
        domain: Option<String>,

        /// GitHub logins to request review from
        #[arg(long, value_delimiter = ',')]
        reviewers: Vec<String>,

        /// Use local-process sandboxes even when Docker is available
        #[arg(long)]
        local: bool,

        /// Skip PR creation on success
        #[arg(long)]
        no_publish: bool,
    },
    /// Build the dependency graph and print a summary
    Index,
    /// Show which tests a change to the given files would affect
    Tests {
        #[arg(required = true)]
        files: Vec<String>,
    },
    /// Parse a chat-style command and run the resulting task
    Trigger {
        text: String,

        /// Use local-process sandboxes even when Docker is available
        #[arg(long)]
        local: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let repo = match cli.repo.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Run {
            issue,
            files,
            domain,
            reviewers,
            local,
            no_publish,
        } => {
            cmd::cmd_run(
                &repo,
                issue,
                files.clone(),
                domain.as_deref(),
                reviewers.clone(),
                *local,
                *no_publish,
            )
            .await?;
        }
        Commands::Index => cmd::cmd_index(&repo)?,
        Commands::Tests { files } => cmd::cmd_tests(&repo, files)?,
        Commands::Trigger { text, local } => cmd::cmd_trigger(&repo, text, *local).await?,
    }
    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "mender=debug" } else { "mender=info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
