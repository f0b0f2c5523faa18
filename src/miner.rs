//! Per-node commit mining.
//!
//! A [`MiningRun`] owns all state of one mining invocation: the processed
//! hashes, the per-set match counters and the in-memory buffers. Nothing is
//! kept in globals, so several runs can coexist in one process.

use crate::error::{MinerError, Result};
use crate::history::{CommitDescriptor, CommitStream, ExtensionFilter, HistorySource};
use crate::model::{CommitRecord, RepositoryTarget};
use crate::patterns::PatternSet;
use crate::shard;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Column of the repository list holding the repository location.
pub const URL_COLUMN: &str = "Repository URL";

/// Date format of the `Commit Date` column.
const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%:z";

/// Tunables of a mining run.
#[derive(Debug, Clone)]
pub struct MinerSettings {
    /// Flush a set's buffer every time its match counter hits a multiple of this
    pub buffer_size: u64,
    /// Commits modifying more files than this are ignored
    pub max_files: usize,
    pub filter: ExtensionFilter,
}

impl Default for MinerSettings {
    fn default() -> Self {
        Self {
            buffer_size: 100,
            max_files: 10,
            filter: ExtensionFilter::new([".cu", ".cuh", ".c", ".h", ".cpp", ".hpp"]),
        }
    }
}

/// Commit hashes already emitted during the current run, per repository.
#[derive(Debug, Clone, Default)]
pub struct ProcessedSet {
    seen: HashMap<String, HashSet<String>>,
}

impl ProcessedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, target: &RepositoryTarget, hash: &str) -> bool {
        self.seen
            .get(target.url())
            .is_some_and(|hashes| hashes.contains(hash))
    }

    pub fn insert(&mut self, target: &RepositoryTarget, hash: impl Into<String>) -> bool {
        self.seen
            .entry(target.url().to_string())
            .or_default()
            .insert(hash.into())
    }

    /// Pre-seed hashes for a repository, e.g. from an earlier partial run.
    pub fn seed<I, S>(&mut self, target: &RepositoryTarget, hashes: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let entry = self.seen.entry(target.url().to_string()).or_default();
        entry.extend(hashes.into_iter().map(Into::into));
    }

    pub fn len(&self) -> usize {
        self.seen.values().map(HashSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Buffered output of one pattern set.
#[derive(Debug)]
struct SetOutput {
    set: PatternSet,
    path: PathBuf,
    buffer: Vec<CommitRecord>,
    matched: u64,
    flushed: u64,
}

impl SetOutput {
    fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        shard::append_records(&self.path, &self.buffer)?;
        self.flushed += self.buffer.len() as u64;
        debug!(set = self.set.name(), rows = self.buffer.len(), "Flushed buffer");
        self.buffer.clear();
        Ok(())
    }
}

/// Outcome of mining one repository.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepositoryStats {
    pub commits_seen: u64,
    pub skipped_too_large: u64,
    pub already_processed: u64,
    /// Matches per pattern set, in set order
    pub matched: Vec<u64>,
}

/// Totals of a whole run.
#[derive(Debug, Clone, Default)]
pub struct MiningSummary {
    pub repositories: usize,
    pub failed: Vec<String>,
    /// (set name, total matches)
    pub matched: Vec<(String, u64)>,
    /// Matched rows still buffered because their shard could not be written
    pub unwritten: u64,
}

/// State of one mining invocation on one node.
#[derive(Debug)]
pub struct MiningRun {
    settings: MinerSettings,
    processed: ProcessedSet,
    outputs: Vec<SetOutput>,
}

impl MiningRun {
    /// Create a run writing one shard per pattern set under `results_dir`.
    ///
    /// Shard files are created empty right away.
    pub fn new(
        settings: MinerSettings,
        sets: Vec<PatternSet>,
        results_dir: &Path,
        node_id: &str,
    ) -> Result<Self> {
        if sets.is_empty() {
            return Err(MinerError::Config("at least one pattern set is required".into()));
        }
        if node_id.is_empty() || node_id.contains(['/', '\\']) {
            return Err(MinerError::Config(format!("invalid node id '{}'", node_id)));
        }
        if let Some(set) = sets.iter().find(|s| s.name().contains('@')) {
            return Err(MinerError::Config(format!(
                "pattern set name '{}' must not contain '@'",
                set.name()
            )));
        }
        let mut outputs = Vec::with_capacity(sets.len());
        for set in sets {
            let path = results_dir.join(shard::shard_file_name(set.name(), node_id));
            shard::touch(&path)?;
            outputs.push(SetOutput {
                set,
                path,
                buffer: Vec::new(),
                matched: 0,
                flushed: 0,
            });
        }
        let settings = MinerSettings {
            buffer_size: settings.buffer_size.max(1),
            ..settings
        };
        Ok(Self {
            settings,
            processed: ProcessedSet::new(),
            outputs,
        })
    }

    pub fn with_processed(mut self, processed: ProcessedSet) -> Self {
        self.processed = processed;
        self
    }

    pub fn processed(&self) -> &ProcessedSet {
        &self.processed
    }

    pub fn shard_paths(&self) -> Vec<&Path> {
        self.outputs.iter().map(|o| o.path.as_path()).collect()
    }

    /// Rows written to disk so far, per set.
    pub fn flushed(&self) -> Vec<u64> {
        self.outputs.iter().map(|o| o.flushed).collect()
    }

    /// Mine every target in order. Failures are logged and the run moves on.
    pub fn mine_all<H: HistorySource>(&mut self, source: &H, targets: &[RepositoryTarget]) -> MiningSummary {
        let bar = ProgressBar::new(targets.len() as u64);
        if let Ok(style) = ProgressStyle::with_template("{bar:40} {pos}/{len} {msg}") {
            bar.set_style(style);
        }

        let mut summary = MiningSummary::default();
        for target in targets {
            bar.set_message(target.project());
            info!(url = target.url(), "Processing repository");
            match self.mine_repository(source, target) {
                Ok(stats) => {
                    let total: u64 = stats.matched.iter().sum();
                    info!(
                        url = target.url(),
                        matched = total,
                        commits = stats.commits_seen,
                        "Finished repository"
                    );
                }
                Err(e) => {
                    warn!(url = target.url(), error = %e, "Skipping repository");
                    summary.failed.push(target.url().to_string());
                }
            }
            summary.repositories += 1;
            bar.inc(1);
        }
        bar.finish_and_clear();

        if self.flush_all().is_err() {
            warn!("Some matched rows could not be written to their shards");
        }
        summary.unwritten = self.outputs.iter().map(|o| o.buffer.len() as u64).sum();
        summary.matched = self
            .outputs
            .iter()
            .map(|o| (o.set.name().to_string(), o.matched))
            .collect();
        summary
    }

    /// Traverse one repository, classify its commits and flush matches.
    #[allow(clippy::while_let_on_iterator)]
    pub fn mine_repository<H: HistorySource>(
        &mut self,
        source: &H,
        target: &RepositoryTarget,
    ) -> Result<RepositoryStats> {
        let mut stream = source.traverse(target, &self.settings.filter)?;
        let mut stats = RepositoryStats {
            matched: vec![0; self.outputs.len()],
            ..Default::default()
        };

        // Content accessors borrow the stream between items
        while let Some(item) = stream.next() {
            let commit = match item {
                Ok(commit) => commit,
                Err(e) => {
                    warn!(url = target.url(), error = %e, "Unreadable commit");
                    continue;
                }
            };
            stats.commits_seen += 1;

            if self.processed.contains(target, &commit.hash) {
                stats.already_processed += 1;
                continue;
            }
            if commit.files.len() > self.settings.max_files {
                stats.skipped_too_large += 1;
                continue;
            }

            let hits: Vec<usize> = self
                .outputs
                .iter()
                .enumerate()
                .filter(|(_, o)| o.set.is_match(&commit.message))
                .map(|(idx, _)| idx)
                .collect();
            if hits.is_empty() {
                continue;
            }

            debug!(hash = %commit.hash, "Pattern found in commit");
            self.inspect_sources(&stream, &commit);
            self.processed.insert(target, commit.hash.clone());

            let record = to_record(target, &commit);
            for idx in hits {
                stats.matched[idx] += 1;
                let output = &mut self.outputs[idx];
                output.buffer.push(record.clone());
                output.matched += 1;
                if output.matched % self.settings.buffer_size == 0 {
                    match output.flush() {
                        Ok(()) => info!(set = output.set.name(), matched = output.matched, "Commits added"),
                        Err(e) => warn!(
                            set = output.set.name(),
                            buffered = output.buffer.len(),
                            error = %e,
                            "Failed to flush buffer; rows kept for the next flush"
                        ),
                    }
                }
            }
        }

        self.flush_all()?;
        Ok(stats)
    }

    /// Flush every set's buffer. A failing set does not stop the others; its
    /// rows stay buffered and the first error is returned once all were tried.
    fn flush_all(&mut self) -> Result<()> {
        let mut first_error = None;
        for output in &mut self.outputs {
            if let Err(e) = output.flush() {
                warn!(
                    set = output.set.name(),
                    path = %output.path.display(),
                    buffered = output.buffer.len(),
                    error = %e,
                    "Failed to flush buffer"
                );
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Check that the before/after sources of the commit's allowed files
    /// decode as text, which is the only thing a matched commit needs from
    /// them here. The after side is not read once the before side failed.
    ///
    /// Unreadable files are skipped; the commit is kept either way.
    fn inspect_sources<S: CommitStream>(&self, stream: &S, commit: &CommitDescriptor) -> usize {
        let mut readable = 0usize;
        for file in commit.files.iter().filter(|f| self.settings.filter.allows(&f.path)) {
            let result = stream
                .source_before(file)
                .and_then(|_| stream.source_after(file));
            match result {
                Ok(_) => readable += 1,
                Err(e) => {
                    debug!(hash = %commit.hash, path = %file.path, error = %e, "Skipping unreadable file");
                }
            }
        }
        debug!(hash = %commit.hash, readable, "Inspected modified sources");
        readable
    }
}

fn to_record(target: &RepositoryTarget, commit: &CommitDescriptor) -> CommitRecord {
    CommitRecord {
        project: target.project(),
        commit_url: target.commit_url(&commit.hash),
        hash: commit.hash.clone(),
        message: commit.message.clone(),
        date: commit.date.format(DATE_FORMAT).to_string(),
        author: commit.author.clone(),
        insertions: commit.insertions,
        deletions: commit.deletions,
        lines: commit.lines,
        files: commit.files.len() as u64,
    }
}

/// Read repository targets from a repository list CSV.
///
/// Uses the `Repository URL` column when present, else the first column.
pub fn read_targets(path: &Path) -> Result<Vec<RepositoryTarget>> {
    if !path.is_file() {
        return Err(MinerError::MissingFile(path.to_path_buf()));
    }
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
    let column = reader
        .headers()?
        .iter()
        .position(|h| h.trim() == URL_COLUMN)
        .unwrap_or(0);

    let mut targets = Vec::new();
    for row in reader.records() {
        let row = row?;
        if let Some(url) = row.get(column).map(str::trim).filter(|u| !u.is_empty()) {
            targets.push(RepositoryTarget::new(url));
        }
    }
    Ok(targets)
}
