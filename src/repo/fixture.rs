//! Throwaway git repositories for tests.

use git2::{Oid, Repository, Signature, Time};
use std::cell::Cell;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

pub struct FixtureRepo {
    dir: TempDir,
    repo: Repository,
    clock: Cell<i64>,
}

impl FixtureRepo {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        Self {
            dir,
            repo,
            clock: Cell::new(1_700_000_000),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Commit as the default author. Returns the full commit id.
    pub fn commit(&self, message: &str, files: &[(&str, &str)]) -> String {
        self.commit_as("Ada Lovelace", "ada@example.com", message, files)
    }

    /// Write `files` (relative path, content) and commit them. Each commit is
    /// one hour after the previous one.
    pub fn commit_as(
        &self,
        name: &str,
        email: &str,
        message: &str,
        files: &[(&str, &str)],
    ) -> String {
        let mut index = self.repo.index().unwrap();
        for (rel, content) in files {
            let full = self.dir.path().join(rel);
            if let Some(parent) = full.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(&full, content).unwrap();
            index.add_path(Path::new(rel)).unwrap();
        }
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = self.repo.find_tree(tree_id).unwrap();

        let when = self.clock.get();
        self.clock.set(when + 3600);
        let sig = Signature::new(name, email, &Time::new(when, 0)).unwrap();

        let parent = self
            .repo
            .head()
            .ok()
            .and_then(|head| head.peel_to_commit().ok());
        let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();

        let oid: Oid = self
            .repo
            .commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
            .unwrap();
        oid.to_string()
    }

    pub fn set_origin(&self, url: &str) {
        self.repo.remote("origin", url).unwrap();
    }
}
