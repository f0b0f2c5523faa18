//! Partitioning the repository list across worker nodes.

use crate::error::{MinerError, Result};
use crate::transfer::RemoteTransfer;
use csv::StringRecord;
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// A repository list with its header row, rows kept verbatim.
#[derive(Debug, Clone)]
pub struct RepositoryList {
    pub headers: StringRecord,
    pub rows: Vec<StringRecord>,
}

impl RepositoryList {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Result of distributing slices to nodes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SplitReport {
    pub assigned: Vec<String>,
    /// Nodes whose transfer failed; their slice is not mined this run
    pub unassigned: Vec<String>,
}

pub fn read_repository_list(path: &Path) -> Result<RepositoryList> {
    if !path.is_file() {
        return Err(MinerError::MissingFile(path.to_path_buf()));
    }
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
    let headers = reader.headers()?.clone();
    let rows = reader.records().collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(RepositoryList { headers, rows })
}

/// Read node identifiers, one per line. Blank lines are ignored.
pub fn read_nodes(path: &Path) -> Result<Vec<String>> {
    if !path.is_file() {
        return Err(MinerError::MissingFile(path.to_path_buf()));
    }
    let nodes: Vec<String> = fs::read_to_string(path)?
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect();
    if nodes.is_empty() {
        return Err(MinerError::Config(format!(
            "node list {} is empty",
            path.display()
        )));
    }
    Ok(nodes)
}

/// Contiguous, order-preserving slice bounds for `parts` nodes.
///
/// The first `len % parts` slices get one extra row, so every row is
/// assigned exactly once.
pub fn partition(len: usize, parts: usize) -> Vec<Range<usize>> {
    if parts == 0 {
        return Vec::new();
    }
    let base = len / parts;
    let remainder = len % parts;
    let mut start = 0;
    (0..parts)
        .map(|i| {
            let size = base + usize::from(i < remainder);
            let range = start..start + size;
            start += size;
            range
        })
        .collect()
}

pub fn split_file_name(node: &str) -> String {
    format!("github_repositories_{}.csv", node)
}

/// Write one input file per node into `split_dir`.
pub fn write_slices(list: &RepositoryList, nodes: &[String], split_dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    fs::create_dir_all(split_dir)?;
    let ranges = partition(list.len(), nodes.len());
    if nodes.is_empty() {
        return Ok(Vec::new());
    }
    let remainder = list.len() % nodes.len();
    if remainder != 0 {
        warn!(
            rows = list.len(),
            nodes = nodes.len(),
            remainder,
            "Repository count not divisible by node count; leading nodes get one extra row"
        );
    }

    let mut files = Vec::with_capacity(nodes.len());
    for (node, range) in nodes.iter().zip(ranges) {
        let path = split_dir.join(split_file_name(node));
        let mut writer = csv::WriterBuilder::new().flexible(true).from_path(&path)?;
        writer.write_record(&list.headers)?;
        for row in &list.rows[range.clone()] {
            writer.write_record(row)?;
        }
        writer.flush()?;
        info!(node = %node, rows = range.len(), path = %path.display(), "Wrote slice");
        files.push((node.clone(), path));
    }
    Ok(files)
}

/// Upload each node's slice. A failed upload leaves that node unassigned.
pub fn distribute<T: RemoteTransfer>(files: &[(String, PathBuf)], transfer: &T, remote_dir: &str) -> SplitReport {
    let mut report = SplitReport::default();
    for (node, path) in files {
        info!(node = %node, file = %path.display(), "Copying slice");
        match transfer.upload(path, node, remote_dir) {
            Ok(()) => report.assigned.push(node.clone()),
            Err(e) => {
                warn!(node = %node, error = %e, "Transfer failed; slice left unassigned");
                report.unassigned.push(node.clone());
            }
        }
    }
    report
}

/// Split `input` across `nodes` and ship every slice.
pub fn split_and_distribute<T: RemoteTransfer>(
    input: &Path,
    nodes: &[String],
    split_dir: &Path,
    transfer: &T,
    remote_dir: &str,
) -> Result<SplitReport> {
    let list = read_repository_list(input)?;
    let files = write_slices(&list, nodes, split_dir)?;
    let report = distribute(&files, transfer, remote_dir);
    info!(
        assigned = report.assigned.len(),
        unassigned = report.unassigned.len(),
        "File split and copy on remote nodes completed"
    );
    Ok(report)
}
