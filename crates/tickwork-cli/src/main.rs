use std::time::Duration;

use clap::{Parser, Subcommand};
use tickwork_core::TickworkConfig;
use tickwork_scheduler::Scheduler;
use tracing::info;

mod host;

const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("TICKWORK_GIT_SHA"), ")");

#[derive(Parser)]
#[command(name = "tickwork", version = VERSION, about = "Run the cron jobs declared in tickwork.toml")]
struct Cli {
    /// Config file (default: ~/.tickwork/tickwork.toml).
    #[arg(long, short, env = "TICKWORK_CONFIG", global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Register and start the configured jobs until Ctrl-C (the default).
    Run {
        /// Stop after this many seconds instead of waiting for Ctrl-C.
        #[arg(long)]
        run_for: Option<u64>,
    },
    /// Validate the configured cron expressions and print each job's next run.
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tickwork=info,tickwork_scheduler=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = TickworkConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        TickworkConfig::default()
    });

    match cli.command.unwrap_or(Command::Run { run_for: None }) {
        Command::Run { run_for } => run(config, run_for).await,
        Command::Check => check(&config),
    }
}

async fn run(config: TickworkConfig, run_for: Option<u64>) -> anyhow::Result<()> {
    let scheduler = Scheduler::with_config(&config.scheduler)?;
    let started = host::register_all(&scheduler, &config.jobs)?;
    info!(
        jobs = config.jobs.len(),
        started,
        version = VERSION,
        "tickwork running"
    );

    match run_for {
        Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
        None => {
            tokio::signal::ctrl_c().await?;
            info!("Ctrl-C received, stopping jobs");
        }
    }

    let timeout = config.scheduler.stop_timeout();
    if !scheduler.stop_all_and_wait(timeout).await {
        tracing::warn!(
            remaining = scheduler.not_stopped_count(),
            "some jobs were still running at exit"
        );
    }

    for (name, fired) in host::fired_counts(&scheduler) {
        info!(job = %name, fired, "job summary");
    }
    Ok(())
}

fn check(config: &TickworkConfig) -> anyhow::Result<()> {
    let planned = host::plan(&config.jobs, chrono::Utc::now());
    println!("{}", serde_json::to_string_pretty(&planned)?);

    let invalid = planned.iter().filter(|p| p.error.is_some()).count();
    if invalid > 0 {
        anyhow::bail!("{invalid} of {} jobs have invalid schedules", planned.len());
    }
    Ok(())
}
