//! Foundry worker
//!
//! Runs the task orchestration service, or one-off debate and routing
//! commands against the same configuration.
//!
//! # Usage
//!
//! ```bash
//! # Process a batch of tasks and exit when the queue drains
//! foundry-worker run --tasks tasks.json --exit-when-idle
//!
//! # Long-running service with a durable store
//! FOUNDRY_PROVIDER_URL=http://localhost:8000/v1 \
//!   foundry-worker --config foundry.toml run --store rocksdb --store-path ./data
//!
//! # Ad-hoc debate, transcript written to a file
//! foundry-worker debate --topic "Which cache for the session store?" --out debate.json
//!
//! # Show which model a task would be routed to
//! foundry-worker classify "Add caching layer" --role developer
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use foundry_coordination::config::{FoundryConfig, StoreBackend};
use foundry_coordination::debate::format_transcript;
use foundry_worker::{read_seed_file, Service};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file (FOUNDRY_* variables override it)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the worker pool
    Run {
        /// Number of workers (overrides worker.workers)
        #[arg(long)]
        workers: Option<usize>,

        /// Task store backend: memory or rocksdb
        #[arg(long)]
        store: Option<StoreBackend>,

        /// RocksDB directory (overrides store.path)
        #[arg(long)]
        store_path: Option<PathBuf>,

        /// JSON file with tasks to submit on startup
        #[arg(long)]
        tasks: Option<PathBuf>,

        /// Stop once no task is pending or in progress
        #[arg(long, default_value_t = false)]
        exit_when_idle: bool,
    },

    /// Run a single debate and print the transcript
    Debate {
        /// Question to debate
        #[arg(long)]
        topic: String,

        /// Round budget (overrides debate.max_rounds)
        #[arg(long)]
        rounds: Option<u32>,

        /// Write the JSON transcript here
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Show the complexity tier and model a task would get
    Classify {
        /// Task title
        title: String,

        /// Task description
        #[arg(long, default_value = "")]
        description: String,

        /// Agent role
        #[arg(long, default_value = "developer")]
        role: String,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("foundry=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut config = FoundryConfig::load(args.config.as_deref()).context("Invalid configuration")?;

    match args.command {
        Command::Run {
            workers,
            store,
            store_path,
            tasks,
            exit_when_idle,
        } => {
            if let Some(workers) = workers {
                config.worker.workers = workers;
            }
            if let Some(store) = store {
                config.store.backend = store;
            }
            if let Some(path) = store_path {
                config.store.path = path;
            }
            run(config, tasks, exit_when_idle).await
        }
        Command::Debate { topic, rounds, out } => {
            if let Some(rounds) = rounds {
                config.debate.max_rounds = rounds;
            }
            debate(config, &topic, out).await
        }
        Command::Classify {
            title,
            description,
            role,
        } => classify(config, &title, &description, &role),
        Command::Config => {
            print!("{}", config.to_toml().context("Failed to render configuration")?);
            Ok(())
        }
    }
}

async fn run(config: FoundryConfig, tasks: Option<PathBuf>, exit_when_idle: bool) -> Result<()> {
    info!(
        workers = config.worker.workers,
        store = %config.store.backend,
        "Foundry worker starting"
    );
    let service = Service::build(&config)?;
    let _logging = service.log_task_events();

    if let Some(path) = tasks {
        let seeds = read_seed_file(&path)?;
        let submitted = service.seed(seeds);
        info!(count = submitted.len(), file = %path.display(), "Seed tasks submitted");
    }

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Interrupt received, shutting down"),
            Err(e) => warn!(error = %e, "Failed to listen for interrupt"),
        }
        signal.cancel();
    });

    let summary = service.run(shutdown, exit_when_idle).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn debate(config: FoundryConfig, topic: &str, out: Option<PathBuf>) -> Result<()> {
    let service = Service::build(&config)?;
    let outcome = service
        .debate
        .run(topic, config.debate.participants.clone(), Some(config.debate.max_rounds))
        .await?;

    println!("{}", format_transcript(&outcome.session));
    info!("{}", outcome.summary_line());

    if let Some(path) = out {
        let json = outcome.transcript().to_json()?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write transcript to {}", path.display()))?;
        info!(file = %path.display(), "Transcript written");
    }
    Ok(())
}

fn classify(config: FoundryConfig, title: &str, description: &str, role: &str) -> Result<()> {
    let service = Service::build(&config)?;
    let (_, selection) = service
        .router
        .select(role, title, description)
        .with_context(|| format!("Unknown agent role: {}", role))?;
    println!("{}", serde_json::to_string_pretty(&selection)?);
    Ok(())
}
