use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use relsync_sync::{ReconcileConfig, RunOptions};
use tokio_cron_scheduler::JobScheduler;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "relsync")]
#[command(about = "Reconcile primary-store relationships against the graph store")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Check one window of relationships and publish repair events.
    Reconcile(ReconcileArgs),
    /// Print the number of relationships eligible for reconciliation.
    Count,
    /// Re-run the configured window on RELSYNC_CRON until interrupted.
    Schedule(ReconcileArgs),
    /// Create the relationships table.
    Migrate,
}

#[derive(Debug, Default, Args)]
struct ReconcileArgs {
    /// Offset of the first relationship to check (overrides RELSYNC_SKIP).
    #[arg(long)]
    skip: Option<u64>,
    /// Number of relationships to check (overrides RELSYNC_COUNT).
    #[arg(long)]
    count: Option<u64>,
    /// Log repair events instead of publishing them.
    #[arg(long)]
    dry_run: bool,
}

impl ReconcileArgs {
    fn apply(&self, config: &mut ReconcileConfig) -> RunOptions {
        if let Some(skip) = self.skip {
            config.skip = skip;
        }
        if let Some(count) = self.count {
            config.count = count;
        }
        RunOptions {
            dry_run: self.dry_run,
        }
    }
}

/// Exit code for a run that stopped on the iteration ceiling.
const EXIT_MAX_ITERATIONS: u8 = 2;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = ReconcileConfig::from_env();

    let command = match cli.command {
        Some(command) => command,
        None => match relsync_sync::maybe_build_scheduler(&config, RunOptions::default()).await? {
            Some(sched) => {
                run_scheduler(sched, &config.cron).await?;
                return Ok(ExitCode::SUCCESS);
            }
            None => Commands::Reconcile(ReconcileArgs::default()),
        },
    };

    match command {
        Commands::Reconcile(args) => {
            let options = args.apply(&mut config);
            let summary = relsync_sync::run_reconcile_once(&config, options).await?;
            println!("Synced {} entries on this process", summary.processed);
            println!(
                "run_id={} visited={} excluded={} inconsistent={} published={} edges_deleted={} outcome={:?}",
                summary.run_id,
                summary.visited,
                summary.excluded,
                summary.inconsistent(),
                summary.events_published,
                summary.edges_deleted,
                summary.outcome
            );
            if !summary.outcome.is_success() {
                return Ok(ExitCode::from(EXIT_MAX_ITERATIONS));
            }
        }
        Commands::Count => {
            let total = relsync_sync::count_relationships(&config).await?;
            println!("{total}");
        }
        Commands::Schedule(args) => {
            let options = args.apply(&mut config);
            let sched = relsync_sync::build_scheduler(config.clone(), options).await?;
            run_scheduler(sched, &config.cron).await?;
        }
        Commands::Migrate => {
            relsync_sync::migrate(&config).await?;
            println!("migrations applied");
        }
    }

    Ok(ExitCode::SUCCESS)
}

async fn run_scheduler(mut sched: JobScheduler, cron: &str) -> Result<()> {
    sched.start().await.context("starting scheduler")?;
    info!(cron, "scheduler started");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}
