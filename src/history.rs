// src/history.rs

//! Commit history traversal.
//!
//! A [`HistorySource`] turns a [`RepositoryTarget`] into a lazy, forward-only
//! [`CommitStream`], oldest commit first. Per-file contents are read on demand
//! and may fail independently of the commit they belong to.

use crate::error::Result;
use crate::model::RepositoryTarget;
use chrono::{DateTime, FixedOffset, Offset, TimeZone, Utc};
use git2::{DiffFindOptions, DiffOptions, Oid, Repository, Sort};
use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Allow-list of file extensions a commit must touch to be traversed.
///
/// An empty filter allows every file.
#[derive(Debug, Clone, Default)]
pub struct ExtensionFilter {
    extensions: Vec<String>,
}

impl ExtensionFilter {
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let extensions = extensions
            .into_iter()
            .map(|ext| {
                let ext = ext.as_ref().trim();
                if ext.starts_with('.') {
                    ext.to_string()
                } else {
                    format!(".{}", ext)
                }
            })
            .filter(|ext| ext.len() > 1)
            .collect();
        Self { extensions }
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }

    pub fn allows(&self, path: &str) -> bool {
        self.is_empty() || self.extensions.iter().any(|ext| path.ends_with(ext.as_str()))
    }
}

/// A file touched by a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifiedFile {
    pub path: String,
    /// Blob before the change, `None` for added files
    pub old_id: Option<Oid>,
    /// Blob after the change, `None` for deleted files
    pub new_id: Option<Oid>,
}

/// Everything the miner needs to know about one commit.
#[derive(Debug, Clone)]
pub struct CommitDescriptor {
    pub hash: String,
    pub message: String,
    pub date: DateTime<FixedOffset>,
    pub author: String,
    pub insertions: u64,
    pub deletions: u64,
    pub lines: u64,
    pub files: Vec<ModifiedFile>,
}

/// A lazy sequence of commits with per-file content accessors.
pub trait CommitStream: Iterator<Item = Result<CommitDescriptor>> {
    fn source_before(&self, file: &ModifiedFile) -> Result<Option<String>>;
    fn source_after(&self, file: &ModifiedFile) -> Result<Option<String>>;
}

/// Produces commit streams for repository targets.
pub trait HistorySource {
    type Stream: CommitStream;

    fn traverse(&self, target: &RepositoryTarget, filter: &ExtensionFilter) -> Result<Self::Stream>;
}

/// git2-backed history source.
///
/// Local paths are opened in place. Anything else is cloned (bare) under
/// `clone_dir` and removed again once the stream is dropped, unless
/// `keep_clones` is set.
#[derive(Debug, Clone)]
pub struct GitHistory {
    clone_dir: PathBuf,
    keep_clones: bool,
}

impl GitHistory {
    pub fn new(clone_dir: impl Into<PathBuf>, keep_clones: bool) -> Self {
        Self {
            clone_dir: clone_dir.into(),
            keep_clones,
        }
    }

    fn open_or_clone(&self, target: &RepositoryTarget) -> Result<(Repository, Option<PathBuf>)> {
        let local = Path::new(target.url());
        if local.exists() {
            return Ok((Repository::open(local)?, None));
        }

        let dest = self.clone_dir.join(clone_dir_name(target));
        if dest.exists() {
            fs::remove_dir_all(&dest)?;
        }
        fs::create_dir_all(&self.clone_dir)?;
        info!(url = target.url(), dest = %dest.display(), "Cloning repository");
        let repo = git2::build::RepoBuilder::new()
            .bare(true)
            .clone(target.url(), &dest)?;

        let cleanup = (!self.keep_clones).then_some(dest);
        Ok((repo, cleanup))
    }
}

/// Clone directory name: the project name reduced to `[A-Za-z0-9_-]` plus a
/// hash of the full URL. Always a single fresh path component of `clone_dir`.
fn clone_dir_name(target: &RepositoryTarget) -> String {
    let project: String = target
        .project()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_') { c } else { '_' })
        .collect();
    let mut hasher = DefaultHasher::new();
    target.url().hash(&mut hasher);
    format!("{}-{:016x}", project, hasher.finish())
}

impl HistorySource for GitHistory {
    type Stream = GitCommitStream;

    fn traverse(&self, target: &RepositoryTarget, filter: &ExtensionFilter) -> Result<GitCommitStream> {
        let (repo, cleanup) = self.open_or_clone(target)?;

        // Oldest first, parents before children
        let mut oids = Vec::new();
        {
            let mut revwalk = repo.revwalk()?;
            revwalk.push_head()?;
            revwalk.set_sorting(Sort::TOPOLOGICAL | Sort::TIME | Sort::REVERSE)?;
            for oid in revwalk {
                oids.push(oid?);
            }
        }
        debug!(url = target.url(), commits = oids.len(), "Collected revisions");

        Ok(GitCommitStream {
            repo,
            oids: oids.into_iter(),
            filter: filter.clone(),
            cleanup,
        })
    }
}

/// Commit stream over a git2 repository.
pub struct GitCommitStream {
    repo: Repository,
    oids: std::vec::IntoIter<Oid>,
    filter: ExtensionFilter,
    cleanup: Option<PathBuf>,
}

impl GitCommitStream {
    /// Describe one commit, or `None` when it touches no allowed file.
    fn describe(&self, oid: Oid) -> Result<Option<CommitDescriptor>> {
        let commit = self.repo.find_commit(oid)?;

        let parent_tree = if commit.parent_count() > 0 {
            Some(commit.parent(0)?.tree()?)
        } else {
            None
        };
        let current_tree = commit.tree()?;

        let mut diff_opts = DiffOptions::new();
        diff_opts.include_untracked(false);
        diff_opts.ignore_filemode(true);

        let mut diff = self.repo.diff_tree_to_tree(
            parent_tree.as_ref(),
            Some(&current_tree),
            Some(&mut diff_opts),
        )?;
        diff.find_similar(Some(DiffFindOptions::new().renames(true)))?;

        let files: Vec<ModifiedFile> = diff
            .deltas()
            .filter_map(|delta| {
                let path = delta
                    .new_file()
                    .path()
                    .or_else(|| delta.old_file().path())?
                    .to_string_lossy()
                    .into_owned();
                let blob_id = |id: Oid| (!id.is_zero()).then_some(id);
                Some(ModifiedFile {
                    path,
                    old_id: blob_id(delta.old_file().id()),
                    new_id: blob_id(delta.new_file().id()),
                })
            })
            .collect();

        if !files.iter().any(|f| self.filter.allows(&f.path)) {
            return Ok(None);
        }

        let stats = diff.stats()?;
        let insertions = stats.insertions() as u64;
        let deletions = stats.deletions() as u64;

        let time = commit.time();
        let offset = FixedOffset::east_opt(time.offset_minutes() * 60).unwrap_or_else(|| Utc.fix());
        let date = offset
            .timestamp_opt(time.seconds(), 0)
            .single()
            .ok_or_else(|| git2::Error::from_str("commit time out of range"))?;

        let author = commit.author();
        let author_name = author.name().unwrap_or("Unknown").to_string();

        Ok(Some(CommitDescriptor {
            hash: oid.to_string(),
            message: String::from_utf8_lossy(commit.message_bytes()).trim().to_string(),
            date,
            author: author_name,
            insertions,
            deletions,
            lines: insertions + deletions,
            files,
        }))
    }

    fn read_blob(&self, id: Option<Oid>) -> Result<Option<String>> {
        let Some(id) = id else {
            return Ok(None);
        };
        let blob = self.repo.find_blob(id)?;
        let text = std::str::from_utf8(blob.content())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Some(text.to_string()))
    }
}

impl Iterator for GitCommitStream {
    type Item = Result<CommitDescriptor>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let oid = self.oids.next()?;
            match self.describe(oid) {
                Ok(Some(descriptor)) => return Some(Ok(descriptor)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

impl CommitStream for GitCommitStream {
    fn source_before(&self, file: &ModifiedFile) -> Result<Option<String>> {
        self.read_blob(file.old_id)
    }

    fn source_after(&self, file: &ModifiedFile) -> Result<Option<String>> {
        self.read_blob(file.new_id)
    }
}

impl Drop for GitCommitStream {
    fn drop(&mut self) {
        if let Some(path) = self.cleanup.take() {
            let _ = fs::remove_dir_all(&path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{commit_files, init_repo};
    use tempfile::tempdir;

    #[test]
    fn test_extension_filter_normalizes_dots() {
        let filter = ExtensionFilter::new(["cu", ".cuh", " .cpp "]);
        assert!(filter.allows("src/kernel.cu"));
        assert!(filter.allows("include/kernel.cuh"));
        assert!(filter.allows("main.cpp"));
        assert!(!filter.allows("README.md"));
        assert!(ExtensionFilter::default().allows("anything.txt"));
    }

    #[test]
    fn test_traverse_is_chronological_and_filtered() {
        let dir = tempdir().unwrap();
        let repo = init_repo(dir.path());
        commit_files(&repo, &[("kernel.cu", "a")], "Add kernel");
        commit_files(&repo, &[("README.md", "docs")], "Docs only");
        commit_files(&repo, &[("kernel.cu", "b"), ("notes.txt", "x")], "Fix race condition");

        let source = GitHistory::new(dir.path().join("clones"), false);
        let target = RepositoryTarget::new(dir.path().to_string_lossy());
        let filter = ExtensionFilter::new([".cu"]);

        let commits: Vec<_> = source
            .traverse(&target, &filter)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();

        let messages: Vec<_> = commits.iter().map(|c| c.message.as_str()).collect();
        assert_eq!(messages, vec!["Add kernel", "Fix race condition"]);
        assert_eq!(commits[1].files.len(), 2);
        assert_eq!(commits[1].author, "Test User");
        assert_eq!(commits[1].lines, commits[1].insertions + commits[1].deletions);
    }

    #[test]
    fn test_source_accessors_read_blobs() {
        let dir = tempdir().unwrap();
        let repo = init_repo(dir.path());
        commit_files(&repo, &[("kernel.cu", "old\n")], "Add kernel");
        commit_files(&repo, &[("kernel.cu", "new\n")], "Change kernel");

        let source = GitHistory::new(dir.path().join("clones"), false);
        let target = RepositoryTarget::new(dir.path().to_string_lossy());
        let mut stream = source.traverse(&target, &ExtensionFilter::default()).unwrap();

        let first = stream.next().unwrap().unwrap();
        assert_eq!(stream.source_before(&first.files[0]).unwrap(), None);

        let second = stream.next().unwrap().unwrap();
        let file = &second.files[0];
        assert_eq!(stream.source_before(file).unwrap().as_deref(), Some("old\n"));
        assert_eq!(stream.source_after(file).unwrap().as_deref(), Some("new\n"));
        assert!(stream.next().is_none());
    }

    #[test]
    fn test_clone_is_removed_after_drop() {
        let origin = tempdir().unwrap();
        let repo = init_repo(origin.path());
        commit_files(&repo, &[("a.c", "int x;")], "Initial");

        let work = tempdir().unwrap();
        let clone_dir = work.path().join("clones");
        let source = GitHistory::new(&clone_dir, false);
        // file:// forces a clone instead of opening in place
        let url = format!("file://{}", origin.path().display());
        let target = RepositoryTarget::new(url);

        let stream = source.traverse(&target, &ExtensionFilter::default()).unwrap();
        assert!(clone_dir.join(clone_dir_name(&target)).exists());
        assert_eq!(stream.count(), 1);
        assert!(!clone_dir.join(clone_dir_name(&target)).exists());
    }

    fn commit_at(repo: &Repository, files: &[(&str, &str)], message: &str, time: i64, parents: &[Oid]) -> Oid {
        let mut builder = repo.treebuilder(None).unwrap();
        for (path, content) in files {
            let blob = repo.blob(content.as_bytes()).unwrap();
            builder.insert(path, blob, 0o100644).unwrap();
        }
        let tree = repo.find_tree(builder.write().unwrap()).unwrap();
        let sig = git2::Signature::new("Test User", "test@test.com", &git2::Time::new(time, 0)).unwrap();
        let parents: Vec<git2::Commit> = parents.iter().map(|id| repo.find_commit(*id).unwrap()).collect();
        let parents: Vec<&git2::Commit> = parents.iter().collect();
        repo.commit(None, &sig, &sig, message, &tree, &parents).unwrap()
    }

    #[test]
    fn test_parallel_branches_come_out_by_commit_time() {
        let dir = tempdir().unwrap();
        let repo = init_repo(dir.path());
        let root = commit_at(&repo, &[("r.c", "r")], "root", 1_000, &[]);
        let late = commit_at(&repo, &[("r.c", "r"), ("x.c", "x")], "late branch", 3_000, &[root]);
        let early = commit_at(&repo, &[("r.c", "r"), ("y.c", "y")], "early branch", 2_000, &[root]);
        let merge = commit_at(
            &repo,
            &[("r.c", "r"), ("x.c", "x"), ("y.c", "y")],
            "merge",
            4_000,
            &[late, early],
        );
        repo.reference("refs/heads/main", merge, true, "test").unwrap();
        repo.set_head("refs/heads/main").unwrap();

        let source = GitHistory::new(dir.path().join("clones"), false);
        let target = RepositoryTarget::new(dir.path().to_string_lossy());
        let messages: Vec<String> = source
            .traverse(&target, &ExtensionFilter::default())
            .unwrap()
            .map(|c| c.unwrap().message)
            .collect();

        assert_eq!(messages, vec!["root", "early branch", "late branch", "merge"]);
    }

    #[test]
    fn test_clone_dir_name_stays_inside_clone_dir() {
        for url in ["https://github.com/acme/..", "https://github.com/acme/.", "git@host:", "https://h/a/b\\c"] {
            let name = clone_dir_name(&RepositoryTarget::new(url));
            assert!(!name.is_empty());
            assert!(!name.contains(['/', '\\', '.']), "{url} -> {name}");
        }

        let first = clone_dir_name(&RepositoryTarget::new("https://github.com/acme/kernels"));
        let second = clone_dir_name(&RepositoryTarget::new("https://github.com/other/kernels"));
        assert!(first.starts_with("kernels-"));
        assert_ne!(first, second);
    }

    #[test]
    fn test_failed_clone_of_dot_dot_url_leaves_parent_alone() {
        let work = tempdir().unwrap();
        let precious = work.path().join("precious.txt");
        fs::write(&precious, "keep me").unwrap();
        let clone_dir = work.path().join("clones");
        fs::create_dir_all(clone_dir.join("cached")).unwrap();

        let source = GitHistory::new(&clone_dir, false);
        let url = format!("file://{}/missing/..", work.path().join("nowhere").display());
        let target = RepositoryTarget::new(url);
        assert_eq!(target.project(), "..");

        assert!(source.traverse(&target, &ExtensionFilter::default()).is_err());
        assert!(precious.exists());
        assert!(clone_dir.join("cached").exists());
    }
}
