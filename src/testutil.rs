//! Helpers shared by unit tests that need real git repositories.

use git2::{Oid, Repository, Signature};
use std::fs;
use std::path::Path;

/// Initialize a non-bare repository with a configured identity.
pub fn init_repo(path: &Path) -> Repository {
    let repo = Repository::init(path).expect("init repository");
    {
        let mut config = repo.config().expect("open repository config");
        config.set_str("user.name", "Test User").unwrap();
        config.set_str("user.email", "test@test.com").unwrap();
    }
    repo
}

/// Write files into the worktree and commit them on HEAD.
pub fn commit_files(repo: &Repository, files: &[(&str, &str)], message: &str) -> Oid {
    let workdir = repo.workdir().expect("non-bare repository");
    let mut index = repo.index().unwrap();
    for (path, content) in files {
        let full = workdir.join(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&full, content).unwrap();
        index.add_path(Path::new(path)).unwrap();
    }
    index.write().unwrap();
    let tree_id = index.write_tree().unwrap();
    let tree = repo.find_tree(tree_id).unwrap();

    let sig = Signature::now("Test User", "test@test.com").unwrap();
    let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
    let parents: Vec<&git2::Commit> = parent.iter().collect();
    repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
        .unwrap()
}
