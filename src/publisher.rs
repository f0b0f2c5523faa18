//! Publishing result files into the shared results repository.
//!
//! Every attempt runs fetch → fast-forward → stage → commit → push against
//! the configured remote branch. Concurrency control is optimistic: when
//! another writer wins the race the push is rejected, the local commit is
//! rolled back and [`PublishOutcome::PushRejected`] is returned. Retrying is
//! the caller's business (see [`publish_with_retry`]).

use crate::error::{MinerError, Result};
use git2::build::CheckoutBuilder;
use git2::{Cred, FetchOptions, Oid, PushOptions, RemoteCallbacks, Repository, ResetType, Signature};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct PublishSettings {
    pub remote: String,
    pub branch: String,
    pub author_name: String,
    pub author_email: String,
    /// User for token authentication
    pub username: String,
    pub token: Option<String>,
    /// Identity of the publishing host, used in the commit message
    pub origin: String,
}

impl Default for PublishSettings {
    fn default() -> Self {
        Self {
            remote: "origin".to_string(),
            branch: "main".to_string(),
            author_name: "commit-miner".to_string(),
            author_email: "commit-miner@localhost".to_string(),
            username: "commit-miner".to_string(),
            token: None,
            origin: "localhost".to_string(),
        }
    }
}

/// Progress of one publish attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishState {
    Idle,
    Fetched,
    PulledUpToDate,
    Staged,
    Committed,
}

/// How a publish attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// None of the files exist yet
    NothingToPublish,
    /// The files are identical to what the branch already holds
    NothingToCommit,
    /// Fetch or fast-forward failed; nothing was committed
    Aborted { reason: String },
    Pushed { commit: String },
    /// The remote refused the push; the local commit was rolled back
    PushRejected { reason: String },
}

impl PublishOutcome {
    /// Whether a fresh attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PublishOutcome::Aborted { .. } | PublishOutcome::PushRejected { .. })
    }
}

pub struct Publisher {
    repo: Repository,
    workdir: PathBuf,
    settings: PublishSettings,
}

impl Publisher {
    /// Open the local clone of the shared results repository.
    pub fn open<P: AsRef<Path>>(path: P, settings: PublishSettings) -> Result<Self> {
        let repo = Repository::open(path.as_ref())?;
        let workdir = repo
            .workdir()
            .ok_or_else(|| MinerError::Config("results repository must have a working tree".into()))?
            .canonicalize()?;
        if repo.find_remote(&settings.remote).is_err() {
            return Err(MinerError::UnknownRemote(settings.remote.clone()));
        }
        Ok(Self {
            repo,
            workdir,
            settings,
        })
    }

    pub fn settings(&self) -> &PublishSettings {
        &self.settings
    }

    /// Run one complete publish attempt for `files`.
    ///
    /// Relative paths are taken relative to the repository root.
    pub fn publish(&self, files: &[PathBuf]) -> Result<PublishOutcome> {
        let existing: Vec<PathBuf> = files
            .iter()
            .filter_map(|file| {
                let full = if file.is_absolute() { file.clone() } else { self.workdir.join(file) };
                if full.is_file() {
                    Some(full)
                } else {
                    info!(file = %file.display(), "File does not exist; skipping commit and push");
                    None
                }
            })
            .collect();
        if existing.is_empty() {
            return Ok(PublishOutcome::NothingToPublish);
        }

        let mut attempt = PublishAttempt::new(self, existing)?;
        attempt.run()
    }

    fn branch_ref(&self) -> String {
        format!("refs/heads/{}", self.settings.branch)
    }

    fn tracking_ref(&self) -> String {
        format!("refs/remotes/{}/{}", self.settings.remote, self.settings.branch)
    }

    fn callbacks<'a>(&self) -> RemoteCallbacks<'a> {
        let mut callbacks = RemoteCallbacks::new();
        if let Some(token) = self.settings.token.clone() {
            let username = self.settings.username.clone();
            let mut tried = false;
            callbacks.credentials(move |_url, _username_from_url, _allowed| {
                // libgit2 keeps asking on rejected credentials
                if tried {
                    return Err(git2::Error::from_str("token authentication failed"));
                }
                tried = true;
                Cred::userpass_plaintext(&username, &token)
            });
        }
        callbacks
    }

    fn relative_path(&self, file: &Path) -> Result<PathBuf> {
        let canonical = file.canonicalize()?;
        canonical
            .strip_prefix(&self.workdir)
            .map(Path::to_path_buf)
            .map_err(|_| {
                MinerError::Config(format!(
                    "{} is outside the results repository {}",
                    file.display(),
                    self.workdir.display()
                ))
            })
    }
}

/// One pass through the publish state machine.
struct PublishAttempt<'p> {
    publisher: &'p Publisher,
    files: Vec<PathBuf>,
    state: PublishState,
    /// Branch tip before our commit, rollback target
    base: Option<Oid>,
    tree: Option<Oid>,
    commit: Option<Oid>,
}

impl<'p> PublishAttempt<'p> {
    fn new(publisher: &'p Publisher, files: Vec<PathBuf>) -> Result<Self> {
        let files = files
            .iter()
            .map(|f| publisher.relative_path(f))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            publisher,
            files,
            state: PublishState::Idle,
            base: None,
            tree: None,
            commit: None,
        })
    }

    fn repo(&self) -> &'p Repository {
        &self.publisher.repo
    }

    fn run(&mut self) -> Result<PublishOutcome> {
        if let Err(reason) = self.fetch() {
            warn!(reason = %reason, "Failed to fetch remote changes");
            return Ok(PublishOutcome::Aborted { reason });
        }
        if let Err(reason) = self.fast_forward() {
            warn!(reason = %reason, "Failed to pull remote changes");
            return Ok(PublishOutcome::Aborted { reason });
        }
        if !self.stage()? {
            info!("No changes to commit");
            return Ok(PublishOutcome::NothingToCommit);
        }
        self.commit()?;
        self.push()
    }

    /// Idle → Fetched
    fn fetch(&mut self) -> std::result::Result<(), String> {
        debug_assert_eq!(self.state, PublishState::Idle);
        let settings = &self.publisher.settings;
        let mut remote = self
            .repo()
            .find_remote(&settings.remote)
            .map_err(|e| e.message().to_string())?;
        let refspec = format!("+{}:{}", self.publisher.branch_ref(), self.publisher.tracking_ref());
        let mut options = FetchOptions::new();
        options.remote_callbacks(self.publisher.callbacks());
        remote
            .fetch(&[refspec.as_str()], Some(&mut options), None)
            .map_err(|e| e.message().to_string())?;
        self.state = PublishState::Fetched;
        Ok(())
    }

    fn remote_tip(&self) -> Option<Oid> {
        self.repo()
            .find_reference(&self.publisher.tracking_ref())
            .ok()
            .and_then(|r| r.target())
    }

    fn local_tip(&self) -> Option<Oid> {
        self.repo()
            .find_reference(&self.publisher.branch_ref())
            .ok()
            .and_then(|r| r.target())
    }

    /// Fetched → PulledUpToDate
    fn fast_forward(&mut self) -> std::result::Result<(), String> {
        debug_assert_eq!(self.state, PublishState::Fetched);
        let repo = self.repo();
        let branch_ref = self.publisher.branch_ref();
        let local = self.local_tip();
        let remote = self.remote_tip();

        let move_to = match (local, remote) {
            (_, None) => None,
            (None, Some(remote)) => Some(remote),
            (Some(local), Some(remote)) if local == remote => None,
            (Some(local), Some(remote)) => {
                let behind = repo.graph_descendant_of(remote, local).map_err(|e| e.message().to_string())?;
                let ahead = repo.graph_descendant_of(local, remote).map_err(|e| e.message().to_string())?;
                if behind {
                    Some(remote)
                } else if ahead {
                    None
                } else {
                    return Err(format!(
                        "local branch {} has diverged from {}",
                        branch_ref,
                        self.publisher.tracking_ref()
                    ));
                }
            }
        };

        if let Some(target) = move_to {
            let commit = repo.find_commit(target).map_err(|e| e.message().to_string())?;
            let mut checkout = CheckoutBuilder::new();
            checkout.safe();
            repo.checkout_tree(commit.as_object(), Some(&mut checkout))
                .map_err(|e| e.message().to_string())?;
            repo.reference(&branch_ref, target, true, "commit-miner: fast-forward")
                .map_err(|e| e.message().to_string())?;
            info!(tip = %target, "Fast-forwarded to remote tip");
        }
        repo.set_head(&branch_ref).map_err(|e| e.message().to_string())?;

        self.base = self.local_tip();
        self.state = PublishState::PulledUpToDate;
        Ok(())
    }

    /// PulledUpToDate → Staged. Returns false when there is nothing to commit.
    fn stage(&mut self) -> Result<bool> {
        debug_assert_eq!(self.state, PublishState::PulledUpToDate);
        let repo = self.repo();
        let mut index = repo.index()?;
        for file in &self.files {
            index.add_path(file)?;
        }
        index.write()?;
        let tree = index.write_tree()?;

        let head_tree = match self.base {
            Some(base) => Some(repo.find_commit(base)?.tree_id()),
            None => None,
        };
        if head_tree == Some(tree) {
            return Ok(false);
        }
        self.tree = Some(tree);
        self.state = PublishState::Staged;
        Ok(true)
    }

    /// Staged → Committed
    fn commit(&mut self) -> Result<Oid> {
        debug_assert_eq!(self.state, PublishState::Staged);
        let repo = self.repo();
        let settings = &self.publisher.settings;
        let tree_id = self
            .tree
            .ok_or_else(|| MinerError::Config("commit requested before staging".into()))?;
        let tree = repo.find_tree(tree_id)?;
        let signature = Signature::now(&settings.author_name, &settings.author_email)?;
        let parent = match self.base {
            Some(base) => Some(repo.find_commit(base)?),
            None => None,
        };
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let message = format!("Update result file from the host: {}", settings.origin);

        let oid = repo.commit(Some("HEAD"), &signature, &signature, &message, &tree, &parents)?;
        debug!(commit = %oid, "Created commit");
        self.commit = Some(oid);
        self.state = PublishState::Committed;
        Ok(oid)
    }

    /// Committed → Pushed | PushRejected
    fn push(&mut self) -> Result<PublishOutcome> {
        debug_assert_eq!(self.state, PublishState::Committed);
        let settings = &self.publisher.settings;
        let branch_ref = self.publisher.branch_ref();
        let refspec = format!("{}:{}", branch_ref, branch_ref);
        let mut remote = self.repo().find_remote(&settings.remote)?;

        let mut rejection: Option<String> = None;
        let result = {
            let mut callbacks = self.publisher.callbacks();
            callbacks.push_update_reference(|refname, status| {
                if let Some(status) = status {
                    rejection = Some(format!("{}: {}", refname, status));
                }
                Ok(())
            });
            let mut options = PushOptions::new();
            options.remote_callbacks(callbacks);
            remote.push(&[refspec.as_str()], Some(&mut options))
        };

        let reason = match (result, rejection) {
            (Ok(()), None) => {
                let commit = self.commit.map(|c| c.to_string()).unwrap_or_default();
                info!(commit = %commit, "Changes committed and pushed successfully");
                return Ok(PublishOutcome::Pushed { commit });
            }
            (_, Some(reason)) => reason,
            (Err(e), None) => e.message().to_string(),
        };

        warn!(reason = %reason, "Push rejected");
        self.rollback()?;
        Ok(PublishOutcome::PushRejected { reason })
    }

    /// Undo the unpushed commit, keeping the working tree as it is.
    fn rollback(&self) -> Result<()> {
        let repo = self.repo();
        match self.base {
            Some(base) => {
                let commit = repo.find_commit(base)?;
                repo.reset(commit.as_object(), ResetType::Mixed, None)?;
            }
            None => {
                repo.find_reference(&self.publisher.branch_ref())?.delete()?;
            }
        }
        Ok(())
    }
}

/// Publish with up to `max_attempts` attempts, each starting from a fresh fetch.
pub fn publish_with_retry(publisher: &Publisher, files: &[PathBuf], max_attempts: u32) -> Result<PublishOutcome> {
    let attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let outcome = publisher.publish(files)?;
        if !outcome.is_retryable() || attempt >= attempts {
            return Ok(outcome);
        }
        warn!(attempt, max_attempts = attempts, outcome = ?outcome, "Publish attempt failed; retrying");
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{commit_files, init_repo};
    use std::fs;
    use tempfile::{tempdir, TempDir};

    /// A bare shared remote with one commit on `main`, plus a clone of it.
    struct Fixture {
        _root: TempDir,
        remote_path: PathBuf,
        root_path: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let root = tempdir().unwrap();
            let root_path = root.path().to_path_buf();

            let seed_path = root_path.join("seed");
            let seed = init_repo(&seed_path);
            commit_files(&seed, &[("README.md", "results\n")], "Initial commit");
            let head = seed.head().unwrap().target().unwrap();
            seed.reference("refs/heads/main", head, true, "main").unwrap();

            let remote_path = root_path.join("shared.git");
            git2::build::RepoBuilder::new()
                .bare(true)
                .branch("main")
                .clone(seed_path.to_str().unwrap(), &remote_path)
                .unwrap();

            Self {
                _root: root,
                remote_path,
                root_path,
            }
        }

        fn clone(&self, name: &str) -> PathBuf {
            let path = self.root_path.join(name);
            let repo = git2::build::RepoBuilder::new()
                .branch("main")
                .clone(self.remote_path.to_str().unwrap(), &path)
                .unwrap();
            drop(repo);
            path
        }

        fn remote_head(&self) -> Oid {
            let remote = Repository::open_bare(&self.remote_path).unwrap();
            let head = remote.find_reference("refs/heads/main").unwrap().target().unwrap();
            head
        }

        fn remote_log_len(&self) -> usize {
            let remote = Repository::open_bare(&self.remote_path).unwrap();
            let mut walk = remote.revwalk().unwrap();
            walk.push_ref("refs/heads/main").unwrap();
            walk.count()
        }
    }

    fn settings(origin: &str) -> PublishSettings {
        PublishSettings {
            origin: origin.to_string(),
            ..Default::default()
        }
    }

    fn write_result(clone: &Path, name: &str, content: &str) -> PathBuf {
        let rel = PathBuf::from("analyzer/results").join(name);
        let full = clone.join(&rel);
        fs::create_dir_all(full.parent().unwrap()).unwrap();
        fs::write(&full, content).unwrap();
        rel
    }

    #[test]
    fn test_publish_pushes_new_file() {
        let fixture = Fixture::new();
        let clone = fixture.clone("node1");
        let rel = write_result(&clone, "github_repo_analysis_result_concurrency@n1.csv", "Project\n");

        let publisher = Publisher::open(&clone, settings("10.0.0.1")).unwrap();
        let outcome = publisher.publish(&[rel.clone()]).unwrap();

        let PublishOutcome::Pushed { commit } = outcome else {
            panic!("expected push, got {outcome:?}");
        };
        assert_eq!(fixture.remote_head().to_string(), commit);

        let remote = Repository::open_bare(&fixture.remote_path).unwrap();
        let head = remote.find_commit(fixture.remote_head()).unwrap();
        assert_eq!(head.message(), Some("Update result file from the host: 10.0.0.1"));
        assert_eq!(head.author().name(), Some("commit-miner"));
        assert!(head.tree().unwrap().get_path(&rel).is_ok());
    }

    #[test]
    fn test_missing_file_is_nothing_to_publish() {
        let fixture = Fixture::new();
        let clone = fixture.clone("node1");
        let publisher = Publisher::open(&clone, settings("n1")).unwrap();

        let outcome = publisher.publish(&[PathBuf::from("analyzer/results/absent.csv")]).unwrap();
        assert_eq!(outcome, PublishOutcome::NothingToPublish);
        assert_eq!(fixture.remote_log_len(), 1);
    }

    #[test]
    fn test_unchanged_file_is_nothing_to_commit() {
        let fixture = Fixture::new();
        let clone = fixture.clone("node1");
        let rel = write_result(&clone, "shard.csv", "a\n");
        let publisher = Publisher::open(&clone, settings("n1")).unwrap();

        assert!(matches!(publisher.publish(&[rel.clone()]).unwrap(), PublishOutcome::Pushed { .. }));
        assert_eq!(publisher.publish(&[rel]).unwrap(), PublishOutcome::NothingToCommit);
        assert_eq!(fixture.remote_log_len(), 2);
    }

    #[test]
    fn test_failed_fetch_aborts_without_commit() {
        let fixture = Fixture::new();
        let clone = fixture.clone("node1");
        let rel = write_result(&clone, "shard.csv", "a\n");
        {
            let repo = Repository::open(&clone).unwrap();
            repo.remote_set_url("origin", clone.join("does-not-exist.git").to_str().unwrap())
                .unwrap();
        }
        let before = Repository::open(&clone).unwrap().head().unwrap().target();

        let publisher = Publisher::open(&clone, settings("n1")).unwrap();
        let outcome = publisher.publish(&[rel]).unwrap();

        assert!(matches!(outcome, PublishOutcome::Aborted { .. }));
        assert!(outcome.is_retryable());
        let after = Repository::open(&clone).unwrap().head().unwrap().target();
        assert_eq!(before, after);
        assert_eq!(fixture.remote_log_len(), 1);
    }

    #[test]
    fn test_publish_fast_forwards_over_other_writers() {
        let fixture = Fixture::new();
        let first = fixture.clone("node1");
        let second = fixture.clone("node2");

        let rel1 = write_result(&first, "n1.csv", "one\n");
        Publisher::open(&first, settings("n1")).unwrap().publish(&[rel1.clone()]).unwrap();

        let rel2 = write_result(&second, "n2.csv", "two\n");
        let outcome = Publisher::open(&second, settings("n2")).unwrap().publish(&[rel2.clone()]).unwrap();
        assert!(matches!(outcome, PublishOutcome::Pushed { .. }));

        // Neither writer's file was lost
        let remote = Repository::open_bare(&fixture.remote_path).unwrap();
        let tree = remote.find_commit(fixture.remote_head()).unwrap().tree().unwrap();
        assert!(tree.get_path(&rel1).is_ok());
        assert!(tree.get_path(&rel2).is_ok());
        assert_eq!(fixture.remote_log_len(), 3);
        assert!(second.join(&rel1).is_file());
    }

    #[test]
    fn test_lost_race_is_rejected_and_rolled_back() {
        let fixture = Fixture::new();
        let winner = fixture.clone("winner");
        let loser = fixture.clone("loser");

        let loser_rel = write_result(&loser, "loser.csv", "late\n");
        let loser_publisher = Publisher::open(&loser, settings("loser")).unwrap();
        let full = loser.join(&loser_rel);
        let mut attempt = PublishAttempt::new(&loser_publisher, vec![full]).unwrap();
        attempt.fetch().unwrap();
        attempt.fast_forward().unwrap();
        let base = attempt.base;

        // The winner pushes between the loser's fetch and push
        let winner_rel = write_result(&winner, "winner.csv", "first\n");
        let outcome = Publisher::open(&winner, settings("winner")).unwrap().publish(&[winner_rel]).unwrap();
        assert!(matches!(outcome, PublishOutcome::Pushed { .. }));

        assert!(attempt.stage().unwrap());
        attempt.commit().unwrap();
        let outcome = attempt.push().unwrap();
        assert!(matches!(outcome, PublishOutcome::PushRejected { .. }), "{outcome:?}");
        assert_eq!(attempt.local_tip(), base);
        assert!(loser.join(&loser_rel).is_file());

        // A fresh attempt picks up the winner's commit and succeeds
        let outcome = publish_with_retry(&loser_publisher, &[loser_rel], 3).unwrap();
        assert!(matches!(outcome, PublishOutcome::Pushed { .. }));
        assert_eq!(fixture.remote_log_len(), 3);
    }

    #[test]
    fn test_open_rejects_unknown_remote() {
        let fixture = Fixture::new();
        let clone = fixture.clone("node1");
        let settings = PublishSettings {
            remote: "upstream".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            Publisher::open(&clone, settings),
            Err(MinerError::UnknownRemote(_))
        ));
    }
}
