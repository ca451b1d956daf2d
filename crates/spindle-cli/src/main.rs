//! Spindle CLI.
//!
//! Commands:
//! - `run`: run one demo backtest end to end on an in-memory engine
//! - `config`: print the effective engine configuration as TOML

mod momentum;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::{TimeZone, Utc};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use spindle_core::domain::{ExecutionState, METRIC_MAX_DRAWDOWN, TaskConfig, TaskKind, TaskStatus};
use spindle_core::impls::{BroadcastNotificationSink, CsvTickFeed, InMemoryTickFeed, synthetic_ticks};
use spindle_core::ports::{TaskStore, TickFeed};
use spindle_core::{EngineBuilder, EngineConfig};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "spindle", version, about = "Resumable task execution engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a momentum backtest through the worker pool and print the result.
    Run(RunArgs),
    /// Print the effective configuration as TOML.
    Config {
        /// Path to a TOML config file. Defaults are used when omitted.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Path to a TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of synthetic ticks (ignored with --csv-dir).
    #[arg(long, default_value_t = 5_000)]
    ticks: usize,

    /// Override `[executor] batch_size`.
    #[arg(long)]
    batch_size: Option<usize>,

    /// Read ticks from `{csv-dir}/{instrument}.csv` instead of generating them.
    #[arg(long)]
    csv_dir: Option<PathBuf>,

    /// Instrument to trade.
    #[arg(long, default_value = "EUR_USD")]
    instrument: String,

    /// Override `[workers] concurrency`.
    #[arg(long)]
    workers: Option<usize>,

    /// Starting balance.
    #[arg(long, default_value_t = 100_000.0)]
    balance: f64,

    /// Seed for synthetic ticks.
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Config { config } => {
            let config = load_config(config.as_deref())?;
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Ok(EngineConfig::default()),
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let mut config = load_config(args.config.as_deref())?;
    if let Some(batch_size) = args.batch_size {
        config.executor.batch_size = batch_size;
    }
    if let Some(workers) = args.workers {
        config.workers.concurrency = workers;
    }

    let feed: Arc<dyn TickFeed> = match &args.csv_dir {
        Some(dir) => Arc::new(CsvTickFeed::new(dir)),
        None => {
            let start = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).single().context("bad start time")?;
            let ticks = synthetic_ticks(&args.instrument, start, args.ticks, chrono::Duration::seconds(1), args.seed);
            Arc::new(InMemoryTickFeed::new().with_ticks(ticks))
        }
    };
    let sink = Arc::new(BroadcastNotificationSink::new(64));
    let mut notifications = sink.subscribe();

    let engine = EngineBuilder::new()
        .config(config)
        .tick_feed(feed)
        .notifier(sink)
        .register_strategy(momentum::NAME, momentum::factory)?
        .expect_strategies(&[momentum::NAME])
        .build()?;
    let background = engine.start();
    let service = engine.service();

    let task_config = TaskConfig::new(momentum::NAME, &args.instrument, args.balance)
        .with_parameters(json!({ "window": 20, "threshold": 0.0002, "allocation": 0.1 }));
    let task = service
        .create_task(format!("{}-momentum", args.instrument), TaskKind::Backtest, task_config)
        .await?;
    println!("created task {} ({})", task.id, task.name);
    service.start_task(task.id).await?;

    let final_status = loop {
        match notifications.recv().await {
            Ok(n) if n.task_id == task.id => {
                match &n.error_message {
                    Some(error) => println!("{}  {:<9} {}", n.timestamp.format("%H:%M:%S%.3f"), n.status, error),
                    None => println!("{}  {}", n.timestamp.format("%H:%M:%S%.3f"), n.status),
                }
                if n.status.is_terminal() {
                    break n.status;
                }
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "notification stream lagged");
            }
            Err(RecvError::Closed) => bail!("notification stream closed before task finished"),
        }
    };

    let sweep = engine.sweep().sweep().await;
    let view = service.status(task.id).await?;
    let state = engine
        .store()
        .load_execution_state(task.id)
        .await?
        .map(ExecutionState::from_json)
        .transpose()?;
    let events = engine.store().events_for_task(task.id).await?;
    let counts = service.counts().await?;

    println!();
    println!("task        {} {}", view.task.id, view.task.status);
    if let Some(execution) = &view.latest_execution {
        println!("execution   #{} progress {:.0}%", execution.execution_number, execution.progress);
    }
    if let Some(state) = &state {
        let (trades, wins) = momentum::trade_stats(state);
        let drawdown = state.metrics.get(METRIC_MAX_DRAWDOWN).copied().unwrap_or(0.0);
        println!("ticks       {}", state.ticks_processed);
        println!("balance     {:.2} (from {:.2})", state.current_balance, args.balance);
        println!("trades      {trades} ({wins} winning)");
        println!("drawdown    {:.2}%", drawdown * 100.0);
    }
    println!("events      {}", events.len());
    println!("consistency {} ({})", view.consistency.consistent, view.consistency.message);
    println!("sweep       success={} cleaned={}", sweep.success, sweep.cleaned);
    println!("tasks       {} total, {} in flight", counts.total(), counts.in_flight());

    background.shutdown().await;

    if final_status == TaskStatus::Failed {
        bail!(
            "task failed: {}",
            view.task.error_message.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}
