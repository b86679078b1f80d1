//! CLI command definitions for repo-scout.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};

use crate::github::GraphQlClient;
use crate::metrics::{export_metrics, init_metrics};
use crate::pipeline::{sources_from_config, Pipeline, PipelineConfig};
use crate::queue::QueueStats;
use crate::storage::{RecordStore, RepositoryRow, Store, StoreSummary};

/// Repository discovery queue and rate-limited enrichment pipeline.
#[derive(Parser)]
#[command(name = "repo-scout")]
#[command(about = "Discover GitHub repositories and enrich them under a rate limit")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// SQLite database URL or path.
    #[arg(long, env = "DATABASE_URL", global = true)]
    pub database_url: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run discovery and enrichment continuously until Ctrl-C.
    Run(RunArgs),

    /// Run every enabled discovery source once and exit.
    Discover(DiscoverArgs),

    /// Print queue and record summaries.
    Stats(StatsArgs),
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Items claimed per cycle.
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Concurrent detail requests.
    #[arg(long)]
    pub max_concurrency: Option<usize>,

    /// Disable the GH Archive discovery source.
    #[arg(long)]
    pub no_archive: bool,

    /// Enable the repository search discovery source.
    #[arg(long)]
    pub search: bool,

    /// Write Prometheus metrics in text format to this file on exit.
    #[arg(long)]
    pub metrics_file: Option<PathBuf>,
}

#[derive(Parser, Debug)]
pub struct DiscoverArgs {
    /// Disable the GH Archive discovery source.
    #[arg(long)]
    pub no_archive: bool,

    /// Enable the repository search discovery source.
    #[arg(long)]
    pub search: bool,
}

#[derive(Parser, Debug)]
pub struct StatsArgs {
    /// Number of top repositories by stars to include.
    #[arg(short, long, default_value = "10")]
    pub top: u32,

    /// Output JSON instead of a table.
    #[arg(short = 'j', long)]
    pub json: bool,
}

#[derive(Debug, Serialize)]
struct StatsOutput {
    queue: QueueStats,
    records: StoreSummary,
    top: Vec<RepositoryRow>,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let mut config = PipelineConfig::from_env()?;
    if let Some(url) = cli.database_url {
        config = config.with_database_url(url);
    }

    match cli.command {
        Commands::Run(args) => run_pipeline_command(config, args).await,
        Commands::Discover(args) => run_discover_command(config, args).await,
        Commands::Stats(args) => run_stats_command(config, args).await,
    }
}

fn build_pipeline(config: PipelineConfig, store: Store) -> anyhow::Result<Pipeline> {
    if config.github_token.is_none() {
        warn!("GITHUB_TOKEN is not set; detail requests will be rejected by the API");
    }
    let api = Arc::new(GraphQlClient::new(
        config.github_token.clone(),
        config.fetch_timeout,
    ));
    let sources = sources_from_config(&config, &store);
    Ok(Pipeline::new(config, store, api)?.with_sources(sources))
}

async fn run_pipeline_command(mut config: PipelineConfig, args: RunArgs) -> anyhow::Result<()> {
    if let Some(size) = args.batch_size {
        config = config.with_batch_size(size);
    }
    if let Some(max) = args.max_concurrency {
        config = config.with_max_concurrency(max);
    }
    if args.no_archive {
        config = config.with_archive(false);
    }
    if args.search {
        config = config.with_search(true);
    }

    init_metrics()?;
    let store = Store::open(&config.database_url).await?;
    let pipeline = build_pipeline(config, store.clone())?;

    let shutdown = pipeline.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested, finishing current batch");
            shutdown.shutdown();
        }
    });

    pipeline.run().await?;

    if let Some(path) = args.metrics_file {
        std::fs::write(&path, export_metrics())?;
        info!(path = %path.display(), "Wrote metrics");
    }
    store.close().await;
    Ok(())
}

async fn run_discover_command(mut config: PipelineConfig, args: DiscoverArgs) -> anyhow::Result<()> {
    if args.no_archive {
        config = config.with_archive(false);
    }
    if args.search {
        config = config.with_search(true);
    }

    let store = Store::open(&config.database_url).await?;
    let pipeline = build_pipeline(config, store.clone())?;
    let report = pipeline.discover_once().await;

    for source in &report.sources {
        match &source.error {
            None => println!("{:<10} enqueued {}", source.source, source.enqueued),
            Some(err) => println!(
                "{:<10} enqueued {} (failed: {err})",
                source.source, source.enqueued
            ),
        }
    }
    println!("total      enqueued {}", report.total_enqueued());

    store.close().await;
    if report.failed_sources() > 0 && report.failed_sources() == report.sources.len() {
        anyhow::bail!("every discovery source failed");
    }
    Ok(())
}

async fn run_stats_command(config: PipelineConfig, args: StatsArgs) -> anyhow::Result<()> {
    let store = Store::open(&config.database_url).await?;
    let queue_stats = crate::queue::WorkQueue::new(store.clone())
        .stats(config.max_retries)
        .await?;
    let records = RecordStore::new(store.clone());
    let output = StatsOutput {
        queue: queue_stats,
        records: records.summary().await?,
        top: records.list_top(args.top).await?,
    };
    store.close().await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("=== Queue ===");
    println!("Pending:     {}", output.queue.pending);
    println!("In progress: {}", output.queue.in_progress);
    println!("Completed:   {}", output.queue.completed);
    println!("Failed:      {} ({} poisoned)", output.queue.failed, output.queue.poisoned);
    println!("Skipped:     {}", output.queue.skipped);
    println!();
    println!("=== Records ===");
    println!("Total:        {}", output.records.total_records);
    println!("Avg stars:    {:.1}", output.records.average_stars);
    println!(
        "Top language: {}",
        output.records.top_language.as_deref().unwrap_or("-")
    );
    if !output.top.is_empty() {
        println!();
        for row in &output.top {
            println!("{:>8}  {}", row.stars, row.full_name);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_command_options() {
        let cli = Cli::try_parse_from([
            "repo-scout",
            "run",
            "--batch-size",
            "50",
            "--max-concurrency",
            "5",
            "--no-archive",
            "--search",
        ])
        .expect("should parse");

        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.batch_size, Some(50));
                assert_eq!(args.max_concurrency, Some(5));
                assert!(args.no_archive);
                assert!(args.search);
                assert!(args.metrics_file.is_none());
            }
            _ => panic!("Expected Run command"),
        }
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_stats_defaults_and_global_flags() {
        let cli = Cli::try_parse_from([
            "repo-scout",
            "stats",
            "--database-url",
            "sqlite://other.db",
            "-l",
            "debug",
        ])
        .expect("should parse");

        assert_eq!(cli.database_url.as_deref(), Some("sqlite://other.db"));
        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Commands::Stats(args) => {
                assert_eq!(args.top, 10);
                assert!(!args.json);
            }
            _ => panic!("Expected Stats command"),
        }
    }

    #[test]
    fn test_unknown_command_rejected() {
        assert!(Cli::try_parse_from(["repo-scout", "generate"]).is_err());
    }
}
