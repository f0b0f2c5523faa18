// src/main.rs

mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{AggregateArgs, Cli, Command, MineArgs, SplitArgs};
use commit_miner::aggregator;
use commit_miner::config::Config;
use commit_miner::history::{ExtensionFilter, GitHistory};
use commit_miner::logging::{self, LogConfig};
use commit_miner::miner::{read_targets, MiningRun};
use commit_miner::patterns::PatternSet;
use commit_miner::publisher::{publish_with_retry, PublishOutcome, Publisher};
use commit_miner::splitter::{read_nodes, split_and_distribute};
use commit_miner::transfer::ScpTransfer;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_verbosity(cli.verbose, cli.quiet).with_env_overrides();
    if let Some(format) = cli.log_format {
        log_config = log_config.with_format(format);
    }
    logging::init(log_config);

    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let start_time = Instant::now();

    match cli.command {
        Command::Split(args) => split(&config, args)?,
        Command::Mine(args) => mine(&config, args, cli.token)?,
        Command::Aggregate(args) => aggregate(&config, args, cli.token)?,
        Command::Publish(args) => {
            let publisher = open_publisher(&config, &args.repo, cli.token)?;
            publish(&config, &publisher, &args.files)?;
        }
    }

    info!(elapsed = ?start_time.elapsed(), "Done");
    Ok(())
}

fn node_id(explicit: Option<String>) -> String {
    explicit
        .or_else(|| std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty()))
        .unwrap_or_else(|| "localhost".to_string())
}

/// Output directories are resolved against the results repository when
/// their contents are going to be published.
fn resolve_in_repo(dir: PathBuf, repo: Option<&Path>) -> PathBuf {
    match repo {
        Some(repo) if dir.is_relative() => repo.join(dir),
        _ => dir,
    }
}

fn transfer(config: &Config, user: Option<String>) -> ScpTransfer {
    ScpTransfer::new(
        config.transfer.program.clone(),
        user.or_else(|| config.transfer.user.clone()),
    )
}

fn split(config: &Config, args: SplitArgs) -> Result<()> {
    let nodes = read_nodes(&args.nodes).context("Failed to read node list")?;
    let remote_dir = args.remote_dir.unwrap_or_else(|| config.transfer.remote_dir.clone());
    let scp = transfer(config, args.user);

    let report = split_and_distribute(&args.input, &nodes, &args.split_dir, &scp, &remote_dir)
        .context("Failed to split repository list")?;
    for node in &report.unassigned {
        warn!(node = %node, "Node received no slice");
    }
    Ok(())
}

fn mine(config: &Config, args: MineArgs, token: Option<String>) -> Result<()> {
    let sets = args
        .patterns
        .iter()
        .map(PatternSet::from_csv)
        .collect::<commit_miner::Result<Vec<_>>>()
        .context("Failed to load pattern sets")?;
    let targets = read_targets(&args.input).context("Failed to read repository list")?;

    let mut settings = config.mining.settings();
    if let Some(buffer_size) = args.buffer_size {
        settings.buffer_size = buffer_size;
    }
    if let Some(max_files) = args.max_files {
        settings.max_files = max_files;
    }
    if let Some(extensions) = &args.extensions {
        settings.filter = ExtensionFilter::new(extensions);
    }

    let node = node_id(args.node_id);
    let repo = args.repo.as_deref().filter(|_| args.publish);
    let results_dir = resolve_in_repo(
        args.results_dir.unwrap_or_else(|| config.mining.results_dir.clone()),
        repo,
    );

    let publisher = repo.map(|r| open_publisher(config, r, token)).transpose()?;

    let mut run = MiningRun::new(settings, sets, &results_dir, &node)?;
    let source = GitHistory::new(&config.mining.clone_dir, config.mining.keep_clones);
    let summary = run.mine_all(&source, &targets);
    for (set, matched) in &summary.matched {
        info!(set = %set, matched, "Pattern set finished");
    }
    info!(
        repositories = summary.repositories,
        failed = summary.failed.len(),
        "Mining finished"
    );

    if summary.unwritten > 0 {
        warn!(rows = summary.unwritten, "Matched rows were not written");
    }

    if let Some(publisher) = publisher {
        let files: Vec<PathBuf> = run.shard_paths().into_iter().map(Path::to_path_buf).collect();
        publish(config, &publisher, &files)?;
    }
    Ok(())
}

fn aggregate(config: &Config, args: AggregateArgs, token: Option<String>) -> Result<()> {
    let nodes = read_nodes(&args.nodes).context("Failed to read node list")?;
    let remote_dir = args.remote_dir.unwrap_or_else(|| config.transfer.remote_dir.clone());
    let scp = transfer(config, args.user);

    let mut settings = config.aggregate.settings();
    if let Some(max_file_size) = args.max_file_size {
        settings.max_file_size = max_file_size;
    }
    if let Some(dedup) = args.dedup {
        settings.dedup = dedup;
    }

    let repo = args.repo.as_deref().filter(|_| args.publish);
    let dest_dir = resolve_in_repo(
        args.dest_dir.unwrap_or_else(|| config.aggregate.dest_dir.clone()),
        repo,
    );

    // Open the repository before the long transfer so a bad path fails early
    let publisher = repo.map(|r| open_publisher(config, r, token)).transpose()?;

    let report = aggregator::aggregate(&nodes, &scp, &remote_dir, &dest_dir, &settings)
        .context("Failed to merge results")?;
    info!(
        files = report.files.len(),
        shards = report.shards,
        rows = report.rows_written,
        duplicates = report.duplicates_dropped,
        "Aggregation finished"
    );

    if let Some(publisher) = publisher {
        publish(config, &publisher, &report.files)?;
    }
    Ok(())
}

fn open_publisher(config: &Config, repo: &Path, token: Option<String>) -> Result<Publisher> {
    let origin = node_id(None);
    let settings = config.publish.settings(token, &origin);
    Publisher::open(repo, settings)
        .with_context(|| format!("Failed to open results repository {}", repo.display()))
}

/// Publish and report. Only setup failures are errors; an unsuccessful push
/// is logged.
fn publish(config: &Config, publisher: &Publisher, files: &[PathBuf]) -> Result<()> {
    let outcome = publish_with_retry(publisher, files, config.publish.max_attempts)?;
    match outcome {
        PublishOutcome::Pushed { commit } => info!(commit = %commit, "Published results"),
        PublishOutcome::NothingToPublish => info!("No result files to publish"),
        PublishOutcome::NothingToCommit => info!("Results already up to date"),
        PublishOutcome::Aborted { reason } => warn!(reason = %reason, "Publish aborted"),
        PublishOutcome::PushRejected { reason } => warn!(reason = %reason, "Push rejected"),
    }
    Ok(())
}
