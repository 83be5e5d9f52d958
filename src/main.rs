use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use practice_metrics_lib::connector::{KeyringCredentials, ValuesFileConnector};
use practice_metrics_lib::models::{ConnectionStatus, RecomputeScope};
use practice_metrics_lib::scheduler::{ExecutorFuture, SyncExecutor, SyncScheduler};
use practice_metrics_lib::{init_tracing, AppSettings, Database, MetricsRunner, SessionContext};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(
    name = "practice-metrics",
    version,
    about = "Sync spreadsheet metrics, recompute composites and evaluate goals"
)]
struct Cli {
    /// YAML settings file
    #[arg(long, global = true, env = "PRACTICE_METRICS_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Pull one data source now
    Sync(SyncArgs),
    /// Recompute composite metrics over a date range
    Recompute(RecomputeArgs),
    /// Print progress for one goal
    Goal { goal_id: String },
    /// Run scheduled syncs until interrupted
    Watch,
    /// Store the spreadsheet access token for a data source in the OS keyring
    SetToken {
        data_source_id: String,
        #[arg(long, env = "PRACTICE_METRICS_TOKEN", hide_env_values = true)]
        token: String,
    },
    /// Remove a stored access token
    ClearToken { data_source_id: String },
}

#[derive(Debug, Args)]
struct SyncArgs {
    data_source_id: String,
    /// Overrides syncDeadlineSeconds
    #[arg(long)]
    deadline_seconds: Option<u64>,
}

#[derive(Debug, Args)]
struct RecomputeArgs {
    #[arg(long)]
    start: NaiveDate,
    /// Inclusive
    #[arg(long)]
    end: NaiveDate,
    #[arg(long)]
    clinic: Option<String>,
    /// Only composites depending on these metric ids
    #[arg(long = "metric")]
    metrics: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = AppSettings::load(cli.config.as_deref()).context("loading settings")?;
    init_tracing(&settings.log_dir, &settings.log_filter).context("initialising logging")?;

    match cli.command {
        Command::SetToken { data_source_id, token } => {
            KeyringCredentials::new().store(&data_source_id, &token)?;
            println!("token stored for {}", data_source_id);
            return Ok(());
        }
        Command::ClearToken { data_source_id } => {
            let removed = KeyringCredentials::new().clear(&data_source_id)?;
            println!("{}", if removed { "token removed" } else { "no token stored" });
            return Ok(());
        }
        command => run(command, settings).await,
    }
}

async fn run(command: Command, settings: AppSettings) -> Result<()> {
    if let Some(parent) = settings.database_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let database = Arc::new(Database::new(&settings.database_path)?);
    let connector = Arc::new(ValuesFileConnector::new(settings.values_dir.clone()));
    let runner = MetricsRunner::new(database, connector, Arc::new(KeyringCredentials::new()), settings);
    let ctx = SessionContext::system();

    match command {
        Command::Sync(args) => {
            let deadline = args.deadline_seconds.map(Duration::from_secs);
            let summary = runner.sync_data_source(&ctx, &args.data_source_id, deadline).await?;
            print_json(&summary)?;
            if summary.connection_status == ConnectionStatus::Error {
                std::process::exit(2);
            }
        }
        Command::Recompute(args) => {
            let summary = runner.recompute_composites(
                &ctx,
                RecomputeScope {
                    clinic_id: args.clinic,
                    start_date: args.start,
                    end_date: args.end,
                    changed_metric_ids: args.metrics,
                    dates: None,
                },
            )?;
            print_json(&summary)?;
        }
        Command::Goal { goal_id } => print_json(&runner.evaluate_goal(&ctx, &goal_id)?)?,
        Command::Watch => watch(runner, ctx).await?,
        Command::SetToken { .. } | Command::ClearToken { .. } => {}
    }
    Ok(())
}

async fn watch(runner: Arc<MetricsRunner>, ctx: SessionContext) -> Result<()> {
    let executor: SyncExecutor = {
        let runner = runner.clone();
        Arc::new(move |data_source_id: String| -> ExecutorFuture {
            let runner = runner.clone();
            let ctx = ctx.clone();
            Box::pin(async move {
                runner
                    .sync_data_source(&ctx, &data_source_id, None)
                    .await
                    .map(|summary| summary.connection_status)
            })
        })
    };
    let scheduler = SyncScheduler::new(runner.settings().max_concurrent_syncs, executor);
    let mut ticker = tokio::time::interval(Duration::from_secs(runner.settings().scheduler_interval_seconds));
    tracing::info!(
        interval_seconds = runner.settings().scheduler_interval_seconds,
        "watching data sources"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("watch stopped");
                return Ok(());
            }
        }
        let sources = match runner.repository().list_data_sources() {
            Ok(sources) => sources,
            Err(error) => {
                tracing::error!(error = %error, "could not list data sources");
                continue;
            }
        };
        for (data_source_id, outcome) in scheduler.run_due(&sources, Utc::now()).await {
            match outcome {
                Ok(status) => println!("{} {}", data_source_id, status.as_str()),
                Err(error) => eprintln!("{} {}", data_source_id, error),
            }
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
