//! Append-only CSV shards of commit records.
//!
//! Rows are serialized into memory first and appended with a single write,
//! so a shard never ends in a partial row. The header is written only when
//! the file is empty at the time of the write.

use crate::error::Result;
use crate::model::{CommitRecord, HEADER};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// File name prefix of per-node mining output shards.
pub const SHARD_PREFIX: &str = "github_repo_analysis_result_";

/// Pattern set name used for shards that carry no set component.
pub const DEFAULT_SET: &str = "default";

/// Name of the output shard for one pattern set on one node.
pub fn shard_file_name(set: &str, node: &str) -> String {
    format!("{}{}@{}.csv", SHARD_PREFIX, set, node)
}

/// Recover the pattern set name from a shard file name.
///
/// The set ends at the first `@`; node ids may contain `@` themselves.
/// Returns `None` when the name does not follow the shard naming convention.
pub fn shard_set_name(file_name: &str) -> Option<String> {
    let stem = file_name.strip_prefix(SHARD_PREFIX)?.strip_suffix(".csv")?;
    match stem.split_once('@') {
        Some((set, _node)) if !set.is_empty() => Some(set.to_string()),
        _ => Some(DEFAULT_SET.to_string()),
    }
}

/// Serialize the header row.
pub fn header_bytes() -> Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer.write_record(HEADER)?;
    writer.flush()?;
    Ok(writer.into_inner().map_err(|e| e.into_error())?)
}

/// Serialize records without a header.
pub fn encode_records(records: &[CommitRecord]) -> Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;
    Ok(writer.into_inner().map_err(|e| e.into_error())?)
}

/// Make sure the shard file exists, creating it empty if needed.
pub fn touch(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)?;
    Ok(())
}

/// Append records to a shard, writing the header first if the file is empty.
///
/// Returns the number of bytes appended. Appending nothing leaves the file
/// untouched.
pub fn append_records(path: &Path, records: &[CommitRecord]) -> Result<u64> {
    if records.is_empty() {
        return Ok(0);
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut payload = Vec::new();
    if file.metadata()?.len() == 0 {
        payload.extend(header_bytes()?);
    }
    payload.extend(encode_records(records)?);

    file.write_all(&payload)?;
    file.flush()?;
    Ok(payload.len() as u64)
}

/// Load every record of a shard (header expected on the first line).
pub fn read_records(path: &Path) -> Result<Vec<CommitRecord>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut records = Vec::new();
    for row in reader.deserialize() {
        records.push(row?);
    }
    Ok(records)
}

/// List shard files directly under `dir`, sorted by name.
pub fn list_shards(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut shards = Vec::new();
    if !dir.is_dir() {
        return Ok(shards);
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_shard = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(shard_set_name)
            .is_some();
        if path.is_file() && is_shard {
            shards.push(path);
        }
    }
    shards.sort();
    Ok(shards)
}
