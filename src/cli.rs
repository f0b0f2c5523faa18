// src/cli.rs

use commit_miner::aggregator::DedupScope;
use commit_miner::logging::LogFormat;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// TOML configuration file; flags override its values
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Log output format [default: pretty]
    #[arg(long, value_enum, global = true)]
    pub log_format: Option<LogFormat>,

    /// Access token for pushing to the results repository
    #[arg(long, env = "COMMIT_MINER_TOKEN", global = true, hide_env_values = true)]
    pub token: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Split the repository list across nodes and copy each slice over
    Split(SplitArgs),
    /// Mine the repositories of a list for commits matching pattern sets
    Mine(MineArgs),
    /// Collect shards from all nodes and merge them
    Aggregate(AggregateArgs),
    /// Commit and push result files to the shared repository
    Publish(PublishArgs),
}

#[derive(Args, Debug)]
pub struct SplitArgs {
    /// Repository list CSV
    #[arg(short, long)]
    pub input: PathBuf,

    /// File with one node address per line
    #[arg(short, long)]
    pub nodes: PathBuf,

    /// Login name on the nodes
    #[arg(short, long)]
    pub user: Option<String>,

    /// Directory on each node receiving its slice
    #[arg(long)]
    pub remote_dir: Option<String>,

    /// Local directory for the slice files
    #[arg(long, default_value = "split")]
    pub split_dir: PathBuf,
}

#[derive(Args, Debug)]
pub struct MineArgs {
    /// Repository list CSV for this node
    #[arg(short, long)]
    pub input: PathBuf,

    /// Pattern set CSV files, one regex per row
    #[arg(short, long, num_args = 1.., required = true)]
    pub patterns: Vec<PathBuf>,

    #[arg(long)]
    pub results_dir: Option<PathBuf>,

    /// Identity of this node in shard names [default: $HOSTNAME]
    #[arg(long)]
    pub node_id: Option<String>,

    /// Matches buffered per set before flushing to disk
    #[arg(long)]
    pub buffer_size: Option<u64>,

    /// Skip commits modifying more files than this
    #[arg(long)]
    pub max_files: Option<usize>,

    /// File extensions a commit must touch, comma separated
    #[arg(long, value_delimiter = ',')]
    pub extensions: Option<Vec<String>>,

    /// Push the shards to the results repository when done
    #[arg(long, requires = "repo")]
    pub publish: bool,

    /// Local clone of the results repository
    #[arg(long)]
    pub repo: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct AggregateArgs {
    /// File with one node address per line
    #[arg(short, long)]
    pub nodes: PathBuf,

    #[arg(short, long)]
    pub user: Option<String>,

    /// Directory on each node holding its results
    #[arg(long)]
    pub remote_dir: Option<String>,

    /// Where raw shards and merged files are written
    #[arg(long)]
    pub dest_dir: Option<PathBuf>,

    /// Merged file ceiling in bytes
    #[arg(long)]
    pub max_file_size: Option<u64>,

    #[arg(long, value_enum)]
    pub dedup: Option<DedupScope>,

    /// Push the merged files to the results repository when done
    #[arg(long, requires = "repo")]
    pub publish: bool,

    #[arg(long)]
    pub repo: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct PublishArgs {
    /// Local clone of the results repository
    #[arg(long)]
    pub repo: PathBuf,

    /// Files to publish, relative to the repository root or absolute
    #[arg(short, long = "file", num_args = 1.., required = true)]
    pub files: Vec<PathBuf>,
}
