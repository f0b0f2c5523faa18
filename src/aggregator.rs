//! Collecting worker shards and merging them into size-bounded files.
//!
//! Raw shards are parsed in parallel, then deduplicated and appended one at a
//! time in discovery order. Each merged file starts with a header; once the
//! bytes written to it reach the ceiling it is closed for good and the next
//! shard goes to a file with the next numeric suffix.

use crate::error::Result;
use crate::model::CommitRecord;
use crate::shard::{self, SHARD_PREFIX};
use crate::transfer::RemoteTransfer;
use indicatif::{ParallelProgressIterator, ProgressBar};
use rayon::prelude::*;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Default merged file ceiling: 49 MiB.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 49 * 1024 * 1024;

/// Name of the directory holding per-shard deduplicated copies.
const DEDUP_DIR: &str = "deduplicated";

/// How far duplicate removal reaches during a merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum DedupScope {
    /// Exact-duplicate rows are removed within each raw shard only
    PerShard,
    /// Also drop rows whose (project, commit hash) was already merged for the
    /// same pattern set. Keeps one key per merged row in memory.
    #[default]
    Global,
}

#[derive(Debug, Clone, Copy)]
pub struct MergeSettings {
    pub max_file_size: u64,
    pub dedup: DedupScope,
}

impl Default for MergeSettings {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            dedup: DedupScope::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub files: Vec<PathBuf>,
    pub shards: usize,
    pub rows_written: u64,
    pub duplicates_dropped: u64,
}

impl MergeReport {
    fn absorb(&mut self, other: MergeReport) {
        self.files.extend(other.files);
        self.shards += other.shards;
        self.rows_written += other.rows_written;
        self.duplicates_dropped += other.duplicates_dropped;
    }
}

fn node_dir_name(node: &str) -> String {
    node.chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect()
}

/// Download every node's shards into `raw_dir/<node>/`.
///
/// Returns the nodes whose transfer failed; their shards are missing from
/// this run.
pub fn collect<T: RemoteTransfer>(nodes: &[String], transfer: &T, remote_dir: &str, raw_dir: &Path) -> Vec<String> {
    let pattern = format!("{}/{}*.csv", remote_dir.trim_end_matches('/'), SHARD_PREFIX);
    let mut failed = Vec::new();
    for node in nodes {
        let dest = raw_dir.join(node_dir_name(node));
        match transfer.download(node, &pattern, &dest) {
            Ok(()) => info!(node = %node, "Copied result shards"),
            Err(e) => {
                warn!(node = %node, error = %e, "Error while copying files; node skipped");
                failed.push(node.clone());
            }
        }
    }
    failed
}

/// Find raw shards under `raw_dir`, grouped by pattern set, each group
/// sorted by path.
pub fn discover(raw_dir: &Path) -> Result<BTreeMap<String, Vec<PathBuf>>> {
    let mut groups: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
    let mut pending = vec![raw_dir.to_path_buf()];
    while let Some(dir) = pending.pop() {
        if !dir.is_dir() {
            continue;
        }
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                if path.file_name().is_some_and(|n| n != DEDUP_DIR) {
                    pending.push(path);
                }
                continue;
            }
            let set = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(shard::shard_set_name);
            if let Some(set) = set {
                groups.entry(set).or_default().push(path);
            }
        }
    }
    for shards in groups.values_mut() {
        shards.sort();
    }
    Ok(groups)
}

/// Sequence of merged files for one pattern set.
struct MergedWriter {
    base: PathBuf,
    counter: u32,
    current: Option<File>,
    bytes: u64,
    max_file_size: u64,
    files: Vec<PathBuf>,
}

impl MergedWriter {
    fn new(base: PathBuf, max_file_size: u64) -> Self {
        Self {
            base,
            counter: 1,
            current: None,
            bytes: 0,
            max_file_size,
            files: Vec::new(),
        }
    }

    fn current_path(&self) -> PathBuf {
        let stem = self.base.file_name().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
        self.base.with_file_name(format!("{}_{}.csv", stem, self.counter))
    }

    /// Append a deduplicated shard file whose header is `header_len` bytes long.
    fn append(&mut self, source: &Path, header_len: u64) -> Result<()> {
        let mut input = File::open(source)?;
        let mut file = match self.current.take() {
            Some(file) => {
                input.seek(SeekFrom::Start(header_len))?;
                file
            }
            None => {
                let path = self.current_path();
                debug!(path = %path.display(), "Opening merged file");
                let file = File::create(&path)?;
                self.files.push(path);
                file
            }
        };

        let copied = io::copy(&mut input, &mut file)?;
        file.flush()?;
        self.bytes += copied;

        if self.bytes >= self.max_file_size {
            // Dropped here and never reopened; the next shard starts a new file
            self.counter += 1;
            self.bytes = 0;
        } else {
            self.current = Some(file);
        }
        Ok(())
    }
}

/// Merge the raw shards of one pattern set.
pub fn merge_set(
    set: &str,
    shards: &[PathBuf],
    dedup_dir: &Path,
    dest_dir: &Path,
    stamp: &str,
    settings: &MergeSettings,
) -> Result<MergeReport> {
    fs::create_dir_all(dedup_dir)?;
    fs::create_dir_all(dest_dir)?;

    let bar = ProgressBar::new(shards.len() as u64);
    bar.set_message(format!("Loading {} shards", set));
    let loaded: Vec<(&PathBuf, Result<Vec<CommitRecord>>)> = shards
        .par_iter()
        .progress_with(bar)
        .map(|path| (path, shard::read_records(path)))
        .collect();

    let header = shard::header_bytes()?;
    let base = dest_dir.join(format!("commit_analysis_result_{}_{}", set, stamp));
    let mut writer = MergedWriter::new(base, settings.max_file_size.max(1));
    let mut seen_keys: HashSet<(String, String)> = HashSet::new();
    let mut report = MergeReport::default();

    for (path, records) in loaded {
        let records = match records {
            Ok(records) => records,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unreadable shard");
                continue;
            }
        };
        report.shards += 1;

        let total = records.len() as u64;
        let unique = dedup_shard(records, settings.dedup, &mut seen_keys);
        report.duplicates_dropped += total - unique.len() as u64;
        if unique.is_empty() {
            continue;
        }

        let file_name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        let dedup_path = dedup_dir.join(format!("deduplicated_{}", file_name));
        let mut payload = header.clone();
        payload.extend(shard::encode_records(&unique)?);
        fs::write(&dedup_path, &payload)?;

        writer.append(&dedup_path, header.len() as u64)?;
        report.rows_written += unique.len() as u64;
    }

    report.files = writer.files;
    info!(
        set,
        files = report.files.len(),
        rows = report.rows_written,
        duplicates = report.duplicates_dropped,
        "Merged shards"
    );
    Ok(report)
}

/// Drop exact duplicates within the shard, plus already merged commits when
/// the scope is global. First occurrences win.
fn dedup_shard(
    records: Vec<CommitRecord>,
    scope: DedupScope,
    seen_keys: &mut HashSet<(String, String)>,
) -> Vec<CommitRecord> {
    let mut local: HashSet<CommitRecord> = HashSet::with_capacity(records.len());
    let mut unique = Vec::with_capacity(records.len());
    for record in records {
        if local.contains(&record) {
            continue;
        }
        if scope == DedupScope::Global && !seen_keys.insert(record.dedup_key()) {
            continue;
        }
        local.insert(record.clone());
        unique.push(record);
    }
    unique
}

/// Merge every pattern set found under `raw_dir` into `dest_dir`.
pub fn merge(raw_dir: &Path, dest_dir: &Path, stamp: &str, settings: &MergeSettings) -> Result<MergeReport> {
    let groups = discover(raw_dir)?;
    if groups.is_empty() {
        warn!(raw_dir = %raw_dir.display(), "No result shards found");
    }
    let dedup_dir = raw_dir.join(DEDUP_DIR);
    let mut report = MergeReport::default();
    for (set, shards) in &groups {
        report.absorb(merge_set(set, shards, &dedup_dir, dest_dir, stamp, settings)?);
    }
    Ok(report)
}

/// Pull shards from every node, then merge them under `dest_dir`.
pub fn aggregate<T: RemoteTransfer>(
    nodes: &[String],
    transfer: &T,
    remote_dir: &str,
    dest_dir: &Path,
    settings: &MergeSettings,
) -> Result<MergeReport> {
    let raw_dir = dest_dir.join("raw");
    fs::create_dir_all(&raw_dir)?;
    let failed = collect(nodes, transfer, remote_dir, &raw_dir);
    if !failed.is_empty() {
        warn!(failed = failed.len(), "Some nodes contributed no shards");
    }
    let stamp = chrono::Local::now().format("%Y%m%d%H%M%S").to_string();
    merge(&raw_dir, dest_dir, &stamp, settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::tests::record;
    use crate::shard::{append_records, shard_file_name};
    use crate::transfer::tests::{failed, ok, MockExecutor};
    use crate::transfer::ScpTransfer;
    use tempfile::tempdir;

    fn settings(max_file_size: u64, dedup: DedupScope) -> MergeSettings {
        MergeSettings { max_file_size, dedup }
    }

    fn rows_in(paths: &[PathBuf]) -> usize {
        paths.iter().map(|p| shard::read_records(p).unwrap().len()).sum()
    }

    #[test]
    fn test_global_dedup_removes_cross_shard_duplicates() {
        let dir = tempdir().unwrap();
        let raw = dir.path().join("raw");
        let shared = record("kernels", "c0", "race condition");
        // N1 = 3, N2 = 4, K = 1
        append_records(
            &raw.join("n1").join(shard_file_name("concurrency", "n1")),
            &[shared.clone(), record("kernels", "a1", "x"), record("kernels", "a2", "y")],
        )
        .unwrap();
        append_records(
            &raw.join("n2").join(shard_file_name("concurrency", "n2")),
            &[shared, record("kernels", "b1", "x"), record("kernels", "b2", "y"), record("kernels", "b3", "z")],
        )
        .unwrap();

        let report = merge(&raw, dir.path(), "20240101000000", &settings(DEFAULT_MAX_FILE_SIZE, DedupScope::Global)).unwrap();

        assert_eq!(report.files.len(), 1);
        assert_eq!(report.rows_written, 6);
        assert_eq!(report.duplicates_dropped, 1);
        assert_eq!(rows_in(&report.files), 6);
        let text = fs::read_to_string(&report.files[0]).unwrap();
        assert_eq!(text.matches("Commit Hash").count(), 1);
        assert!(report.files[0].ends_with("commit_analysis_result_concurrency_20240101000000_1.csv"));
    }

    #[test]
    fn test_per_shard_dedup_only_removes_local_duplicates() {
        let dir = tempdir().unwrap();
        let raw = dir.path().join("raw");
        let dup = record("kernels", "c0", "race condition");
        append_records(
            &raw.join(shard_file_name("concurrency", "n1")),
            &[dup.clone(), dup.clone(), record("kernels", "a1", "x")],
        )
        .unwrap();
        append_records(&raw.join(shard_file_name("concurrency", "n2")), &[dup]).unwrap();

        let report = merge(&raw, dir.path(), "t", &settings(DEFAULT_MAX_FILE_SIZE, DedupScope::PerShard)).unwrap();

        assert_eq!(report.rows_written, 3);
        assert_eq!(report.duplicates_dropped, 1);
        assert_eq!(rows_in(&report.files), 3);
    }

    #[test]
    fn test_rollover_opens_new_file_once_ceiling_reached() {
        let dir = tempdir().unwrap();
        let raw = dir.path().join("raw");
        let first = raw.join(shard_file_name("security", "a"));
        let second = raw.join(shard_file_name("security", "b"));
        let third = raw.join(shard_file_name("security", "c"));
        append_records(&first, &[record("p", "1", "m"), record("p", "2", "m")]).unwrap();
        append_records(&second, &[record("p", "3", "m")]).unwrap();
        append_records(&third, &[record("p", "4", "m")]).unwrap();

        // Ceiling equals the first shard's size: the first merged file is
        // full right after it.
        let ceiling = fs::metadata(&first).unwrap().len();
        let report = merge(&raw, dir.path(), "t", &settings(ceiling, DedupScope::Global)).unwrap();

        assert_eq!(report.files.len(), 2);
        assert_eq!(fs::metadata(&report.files[0]).unwrap().len(), ceiling);
        let hashes: Vec<_> = shard::read_records(&report.files[0]).unwrap().into_iter().map(|r| r.hash).collect();
        assert_eq!(hashes, vec!["1", "2"]);
        let hashes: Vec<_> = shard::read_records(&report.files[1]).unwrap().into_iter().map(|r| r.hash).collect();
        assert_eq!(hashes, vec!["3", "4"]);
        assert!(report.files[1].to_string_lossy().ends_with("_2.csv"));
    }

    #[test]
    fn test_rollover_below_ceiling_keeps_single_file() {
        let dir = tempdir().unwrap();
        let raw = dir.path().join("raw");
        let first = raw.join(shard_file_name("security", "a"));
        append_records(&first, &[record("p", "1", "m")]).unwrap();
        append_records(&raw.join(shard_file_name("security", "b")), &[record("p", "2", "m")]).unwrap();

        let ceiling = fs::metadata(&first).unwrap().len() + 1;
        let report = merge(&raw, dir.path(), "t", &settings(ceiling, DedupScope::Global)).unwrap();

        assert_eq!(report.files.len(), 1);
        assert_eq!(rows_in(&report.files), 2);
    }

    #[test]
    fn test_sets_merge_into_separate_files() {
        let dir = tempdir().unwrap();
        let raw = dir.path().join("raw");
        append_records(&raw.join(shard_file_name("security", "n1")), &[record("p", "1", "overflow")]).unwrap();
        append_records(&raw.join(shard_file_name("concurrency", "n1")), &[record("p", "1", "race")]).unwrap();

        let report = merge(&raw, dir.path(), "t", &MergeSettings::default()).unwrap();

        assert_eq!(report.files.len(), 2);
        assert_eq!(report.rows_written, 2);
    }

    #[test]
    fn test_empty_and_unrelated_files_are_ignored() {
        let dir = tempdir().unwrap();
        let raw = dir.path().join("raw");
        shard::touch(&raw.join(shard_file_name("security", "n1"))).unwrap();
        fs::write(raw.join("notes.csv"), "a,b\n").unwrap();

        let report = merge(&raw, dir.path(), "t", &MergeSettings::default()).unwrap();
        assert!(report.files.is_empty());
        assert_eq!(report.rows_written, 0);
    }

    #[test]
    fn test_collect_skips_failed_nodes() {
        let dir = tempdir().unwrap();
        let mock = MockExecutor::new(vec![failed("Permission denied"), ok()]);
        let scp = ScpTransfer::with_executor("scp", Some("miner".into()), mock.clone());
        let nodes = vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()];

        let failed_nodes = collect(&nodes, &scp, "githubMiningCuda/analyzer/results/", dir.path());

        assert_eq!(failed_nodes, vec!["10.0.0.1"]);
        let calls = mock.calls();
        assert_eq!(
            calls[1].args[0],
            "miner@10.0.0.2:githubMiningCuda/analyzer/results/github_repo_analysis_result_*.csv"
        );
        assert!(calls[1].args[1].ends_with("10.0.0.2"));
    }
}
