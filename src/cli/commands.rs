//! CLI command definitions for relq.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use crate::config::RelqConfig;
use crate::job::JobRegistry;
use crate::metrics::{export_metrics, init_metrics, MetricsCollector};
use crate::process::{Clock, DelayScheduler, Process, RecoveryMonitor};
use crate::queue::JobQueue;
use crate::store::RedisStore;

/// Maintenance and inspection tool for relq job queues.
#[derive(Parser)]
#[command(name = "relq")]
#[command(about = "Maintain and inspect relq job queues")]
#[command(version)]
#[command(
    long_about = "relq runs the maintenance processes of a Redis-backed job queue and inspects its state.\n\nWorkers run inside the application that defines the job types; this tool only needs the store.\n\nExample usage:\n  relq --redis-url redis://localhost:6379 maintain"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// YAML configuration file.
    #[arg(short, long, env = "RELQ_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Redis URL, overrides the configuration file.
    #[arg(long, env = "REDIS_URL", global = true)]
    pub redis_url: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Retry expired jobs and abandon exhausted ones, periodically.
    Monitor(ProcessArgs),

    /// Promote overdue delayed jobs, periodically.
    Scheduler(ProcessArgs),

    /// Run the monitor and the scheduler together until Ctrl-C.
    Maintain,

    /// Print the number of jobs in every list.
    Stats(StatsArgs),

    /// Print queue depth metrics in Prometheus text format.
    Metrics,
}

#[derive(clap::Args)]
pub struct ProcessArgs {
    /// Run a single cycle and exit.
    #[arg(long)]
    pub once: bool,
}

#[derive(clap::Args)]
pub struct StatsArgs {
    /// Print JSON instead of a table.
    #[arg(long)]
    pub json: bool,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;
    let queue = Arc::new(
        JobQueue::connect(
            &config.redis_url,
            Arc::new(JobRegistry::new()),
            config.queue_config(),
        )
        .await?,
    );

    match cli.command {
        Commands::Monitor(args) => {
            let monitor = RecoveryMonitor::new(queue, config.monitor_config());
            run_process(monitor, args.once).await
        }
        Commands::Scheduler(args) => {
            let scheduler = DelayScheduler::new(queue, config.scheduler_config());
            run_process(scheduler, args.once).await
        }
        Commands::Maintain => run_maintain(queue, &config).await,
        Commands::Stats(args) => run_stats(&queue, args.json).await,
        Commands::Metrics => run_metrics(&queue).await,
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<RelqConfig> {
    let mut config = match &cli.config {
        Some(path) => RelqConfig::from_yaml_file(path)?,
        None => RelqConfig::default(),
    };
    if let Some(url) = &cli.redis_url {
        config.redis_url = url.clone();
    }
    config.validate()?;
    Ok(config)
}

async fn run_process<P: Process>(process: P, once: bool) -> anyhow::Result<()> {
    if once {
        let report = process.process().await;
        println!("{}: {:?}", process.name(), report);
        return Ok(());
    }

    let clock = Clock::new(process);
    until_ctrl_c(clock.run(), || clock.stop()).await
}

async fn run_maintain(queue: Arc<JobQueue<RedisStore>>, config: &RelqConfig) -> anyhow::Result<()> {
    let monitor = Clock::new(RecoveryMonitor::new(
        Arc::clone(&queue),
        config.monitor_config(),
    ));
    let scheduler = Clock::new(DelayScheduler::new(queue, config.scheduler_config()));

    let both = async {
        tokio::join!(monitor.run(), scheduler.run());
    };
    until_ctrl_c(both, || {
        monitor.stop();
        scheduler.stop();
    })
    .await
}

/// Drives `run` until it finishes or Ctrl-C arrives; on Ctrl-C calls `stop`
/// and lets `run` wind down.
async fn until_ctrl_c<F, S>(run: F, stop: S) -> anyhow::Result<()>
where
    F: Future<Output = ()>,
    S: FnOnce(),
{
    tokio::pin!(run);

    tokio::select! {
        _ = &mut run => return Ok(()),
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Ctrl-C received, finishing current cycle");
            stop();
        }
    }

    run.await;
    Ok(())
}

async fn run_stats(queue: &JobQueue<RedisStore>, json: bool) -> anyhow::Result<()> {
    let stats = queue.stats().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("{:<16} {:>8}", "list", "jobs");
    println!("{:<16} {:>8}", "pending:high", stats.pending_high);
    println!("{:<16} {:>8}", "pending:medium", stats.pending_medium);
    println!("{:<16} {:>8}", "pending:low", stats.pending_low);
    println!("{:<16} {:>8}", "processing", stats.processing);
    println!("{:<16} {:>8}", "delayed", stats.delayed);
    println!("{:<16} {:>8}", "total", stats.total_jobs());
    Ok(())
}

async fn run_metrics(queue: &JobQueue<RedisStore>) -> anyhow::Result<()> {
    init_metrics()?;
    let stats = queue.stats().await?;
    MetricsCollector::new().update_queue_depth(&stats);
    print!("{}", export_metrics());
    Ok(())
}
