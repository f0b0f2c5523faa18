//! Optional TOML configuration.
//!
//! Every field has a default, so an absent file or a partial one is fine.
//! Command-line flags override whatever is loaded here.

use crate::aggregator::{DedupScope, MergeSettings, DEFAULT_MAX_FILE_SIZE};
use crate::error::Result;
use crate::history::ExtensionFilter;
use crate::miner::MinerSettings;
use crate::publisher::PublishSettings;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub mining: MiningConfig,
    pub aggregate: AggregateConfig,
    pub publish: PublishConfig,
    pub transfer: TransferConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct MiningConfig {
    pub buffer_size: u64,
    pub max_files: usize,
    pub extensions: Vec<String>,
    pub results_dir: PathBuf,
    /// Where remote repositories are cloned while mined
    pub clone_dir: PathBuf,
    pub keep_clones: bool,
}

impl Default for MiningConfig {
    fn default() -> Self {
        let defaults = MinerSettings::default();
        Self {
            buffer_size: defaults.buffer_size,
            max_files: defaults.max_files,
            extensions: [".cu", ".cuh", ".c", ".h", ".cpp", ".hpp"]
                .iter()
                .map(|e| e.to_string())
                .collect(),
            results_dir: PathBuf::from("analyzer/results"),
            clone_dir: std::env::temp_dir().join("commit-miner"),
            keep_clones: false,
        }
    }
}

impl MiningConfig {
    pub fn settings(&self) -> MinerSettings {
        MinerSettings {
            buffer_size: self.buffer_size,
            max_files: self.max_files,
            filter: ExtensionFilter::new(&self.extensions),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AggregateConfig {
    /// Merged file ceiling in bytes
    pub max_file_size: u64,
    pub dedup: DedupScope,
    pub dest_dir: PathBuf,
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            dedup: DedupScope::default(),
            dest_dir: PathBuf::from("analyzer/merged"),
        }
    }
}

impl AggregateConfig {
    pub fn settings(&self) -> MergeSettings {
        MergeSettings {
            max_file_size: self.max_file_size,
            dedup: self.dedup,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PublishConfig {
    pub remote: String,
    pub branch: String,
    pub author_name: String,
    pub author_email: String,
    pub username: String,
    pub max_attempts: u32,
}

impl Default for PublishConfig {
    fn default() -> Self {
        let defaults = PublishSettings::default();
        Self {
            remote: defaults.remote,
            branch: defaults.branch,
            author_name: defaults.author_name,
            author_email: defaults.author_email,
            username: defaults.username,
            max_attempts: 3,
        }
    }
}

impl PublishConfig {
    pub fn settings(&self, token: Option<String>, origin: &str) -> PublishSettings {
        PublishSettings {
            remote: self.remote.clone(),
            branch: self.branch.clone(),
            author_name: self.author_name.clone(),
            author_email: self.author_email.clone(),
            username: self.username.clone(),
            token,
            origin: origin.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct TransferConfig {
    pub program: String,
    pub user: Option<String>,
    pub remote_dir: String,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            program: "scp".to_string(),
            user: None,
            remote_dir: "githubMiningCuda/analyzer".to_string(),
        }
    }
}

impl Config {
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Load `path` when given, otherwise fall back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from(path),
            None => Ok(Self::default()),
        }
    }
}
