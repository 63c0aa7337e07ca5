use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use bughunter::agent::ClaudeAgent;
use bughunter::config::Config;
use bughunter::ingest;
use bughunter::lifecycle::LifecycleManager;
use bughunter::notify::LogNotifier;
use bughunter::store::{DbHandle, JobStore};
use bughunter::vcs::GitCliVcs;
use bughunter::workspace::WorkspaceManager;

#[derive(Parser)]
#[command(name = "bughunter")]
#[command(version, about = "Forum-thread-driven agent orchestrator")]
struct Cli {
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Recover interrupted jobs, then process platform events from stdin
    Run,
    /// List recent jobs and their states
    Jobs {
        #[arg(short, long, default_value = "20")]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config = Arc::new(Config::from_env()?);
    let db = DbHandle::new(JobStore::new(&config.db_path)?);

    let mgr = LifecycleManager::new(
        config.clone(),
        db,
        Arc::new(WorkspaceManager::new(config.clone())),
        Arc::new(ClaudeAgent::from_config(&config)),
        Arc::new(GitCliVcs),
        Arc::new(LogNotifier),
    );

    match cli.command {
        Commands::Run => {
            let recovered = mgr.recover_interrupted().await?;
            if recovered > 0 {
                info!(recovered, "Recovered interrupted jobs");
            }
            info!("Listening for platform events on stdin");
            ingest::run_stdin_loop(mgr).await?;
        }
        Commands::Jobs { limit } => {
            let jobs = mgr.list_jobs(limit).await?;
            if jobs.is_empty() {
                println!("No jobs.");
            } else {
                for job in jobs {
                    println!(
                        "#{:<5} {:<20} {:<10} attempts={} {}",
                        job.id,
                        job.state,
                        job.repo_key,
                        job.attempt_count,
                        job.pr_url
                            .as_deref()
                            .or(job.last_error.as_deref())
                            .unwrap_or("-"),
                    );
                }
            }
        }
    }
    Ok(())
}
