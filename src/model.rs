// src/model.rs

use serde::{Deserialize, Serialize};

/// Column names of every shard and merged file, in order.
pub const HEADER: [&str; 10] = [
    "Project",
    "Commit URL",
    "Commit Hash",
    "Message",
    "Commit Date",
    "Author",
    "Additions",
    "Deletions",
    "Lines Changed",
    "Files Changed",
];

/// A remote (or local) repository assigned to one worker for one mining pass
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepositoryTarget {
    url: String,
}

impl RepositoryTarget {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// The URL without a trailing slash or `.git` suffix
    fn base_url(&self) -> &str {
        let trimmed = self.url.trim_end_matches('/');
        trimmed.strip_suffix(".git").unwrap_or(trimmed)
    }

    /// Project name: the last path segment of the location
    pub fn project(&self) -> String {
        self.base_url()
            .rsplit(['/', '\\', ':'])
            .next()
            .unwrap_or_default()
            .to_string()
    }

    pub fn commit_url(&self, hash: &str) -> String {
        format!("{}/commit/{}", self.base_url(), hash)
    }
}

/// One row per (commit, matched pattern set)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommitRecord {
    #[serde(rename = "Project")]
    pub project: String,
    #[serde(rename = "Commit URL")]
    pub commit_url: String,
    #[serde(rename = "Commit Hash")]
    pub hash: String,
    #[serde(rename = "Message")]
    pub message: String,
    #[serde(rename = "Commit Date")]
    pub date: String,
    #[serde(rename = "Author")]
    pub author: String,
    #[serde(rename = "Additions")]
    pub insertions: u64,
    #[serde(rename = "Deletions")]
    pub deletions: u64,
    #[serde(rename = "Lines Changed")]
    pub lines: u64,
    #[serde(rename = "Files Changed")]
    pub files: u64,
}

impl CommitRecord {
    /// Key used by global merge deduplication within one pattern set
    pub fn dedup_key(&self) -> (String, String) {
        (self.project.clone(), self.hash.clone())
    }
}
