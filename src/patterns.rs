//! Named, ordered sets of commit-message patterns.

use crate::error::{MinerError, Result};
use regex::Regex;
use std::path::Path;

/// An immutable named collection of compiled patterns.
///
/// A message matches the set when any pattern finds a match anywhere in it.
#[derive(Debug, Clone)]
pub struct PatternSet {
    name: String,
    patterns: Vec<Regex>,
}

impl PatternSet {
    pub fn new(name: impl Into<String>, patterns: Vec<Regex>) -> Self {
        Self {
            name: name.into(),
            patterns,
        }
    }

    /// Compile a set from pattern strings.
    pub fn from_strs<S: AsRef<str>>(name: impl Into<String>, sources: &[S]) -> std::result::Result<Self, regex::Error> {
        let patterns = sources
            .iter()
            .map(|s| Regex::new(s.as_ref()))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self::new(name, patterns))
    }

    /// Load a set from a CSV definition file.
    ///
    /// The first column of every non-empty row is one pattern; there is no
    /// header row. The set is named after the file stem.
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(MinerError::MissingFile(path.to_path_buf()));
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(path)?;

        let mut patterns = Vec::new();
        for (idx, row) in reader.records().enumerate() {
            let row = row?;
            let Some(source) = row.get(0).filter(|s| !s.is_empty()) else {
                continue;
            };
            let regex = Regex::new(source).map_err(|source| MinerError::Pattern {
                file: path.to_path_buf(),
                row: idx + 1,
                source,
            })?;
            patterns.push(regex);
        }

        if patterns.is_empty() {
            return Err(MinerError::EmptyPatternSet(path.to_path_buf()));
        }

        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "patterns".to_string());
        Ok(Self::new(name, patterns))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn is_match(&self, message: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(message))
    }
}
