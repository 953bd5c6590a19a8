//! Typed bindings over the `git` subprocess.
//!
//! One process per operation, arguments assembled per call. Every
//! invocation passes `safe.directory=*` so repositories created by another
//! uid (containers, Termux) stay usable. Commits are authored as
//! `volodyslav <volodyslav>`.

use std::path::Path;
use std::sync::Arc;

use crate::error::{RunnerError, StoreError};
use crate::fs;
use crate::proc::{CommandOutput, CommandRunner};

const BRANCH: &str = "master";
const USER_NAME: &str = "user.name=volodyslav";
const USER_EMAIL: &str = "user.email=volodyslav";

/// Cheap-clone handle over a shared [`CommandRunner`].
#[derive(Debug, Clone)]
pub struct Git {
    runner: Arc<CommandRunner>,
}

impl Git {
    pub fn new(runner: Arc<CommandRunner>) -> Self {
        Self { runner }
    }

    async fn git(
        &self,
        cwd: Option<&Path>,
        args: &[&str],
    ) -> Result<CommandOutput, RunnerError> {
        let mut full: Vec<&str> = vec!["-c", "safe.directory=*"];
        full.extend_from_slice(args);
        self.runner.run("git", &full, cwd).await
    }

    /// Initialize an empty repository on `master` with one empty commit,
    /// accepting pushes into the checked-out branch.
    pub async fn init(&self, path: &Path) -> Result<(), RunnerError> {
        fs::create_directory(path)
            .await
            .map_err(|source| RunnerError::Spawn {
                command: "git".to_string(),
                source,
            })?;
        self.git(Some(path), &["init", "--initial-branch", BRANCH])
            .await?;
        self.make_pushable(path).await?;
        // An empty initial commit so the branch exists for clones.
        self.git(
            Some(path),
            &[
                "-c",
                USER_NAME,
                "-c",
                USER_EMAIL,
                "commit",
                "--allow-empty",
                "-m",
                "Initial commit",
            ],
        )
        .await?;
        // Write the index; `.git/index` is how an initialized repository
        // is recognized on the next transaction.
        self.git(Some(path), &["reset", "--hard"]).await?;
        Ok(())
    }

    /// Shallow single-branch clone of `source` into `dest`.
    pub async fn clone_shallow(&self, source: &str, dest: &Path) -> Result<(), RunnerError> {
        let dest = dest.display().to_string();
        self.git(
            None,
            &[
                "clone",
                "--depth=1",
                "--single-branch",
                "--branch",
                BRANCH,
                source,
                &dest,
            ],
        )
        .await?;
        Ok(())
    }

    /// Allow pushes into this repository's checked-out branch.
    pub async fn make_pushable(&self, path: &Path) -> Result<(), RunnerError> {
        self.git(
            Some(path),
            &["config", "receive.denyCurrentBranch", "updateInstead"],
        )
        .await?;
        Ok(())
    }

    /// Pull from `origin`, merging when the histories diverged (a rejected
    /// transaction leaves the working repository one commit ahead).
    pub async fn pull(&self, path: &Path) -> Result<(), RunnerError> {
        self.git(
            Some(path),
            &["-c", USER_NAME, "-c", USER_EMAIL, "pull", "--no-rebase", "--no-edit"],
        )
        .await?;
        Ok(())
    }

    /// Push `master` to `origin`. Rejection is the retriable [`StoreError::Push`].
    pub async fn push(&self, path: &Path) -> Result<(), StoreError> {
        match self.git(Some(path), &["push", "origin", BRANCH]).await {
            Ok(_) => Ok(()),
            Err(RunnerError::ProcessFailed { stderr, .. }) => Err(StoreError::Push {
                from: path.to_path_buf(),
                stderr,
            }),
            Err(other) => Err(other.into()),
        }
    }

    /// Stage everything and record a commit.
    pub async fn commit_all(&self, path: &Path, message: &str) -> Result<(), RunnerError> {
        self.git(Some(path), &["add", "--all"]).await?;
        self.git(
            Some(path),
            &["-c", USER_NAME, "-c", USER_EMAIL, "commit", "-m", message],
        )
        .await?;
        Ok(())
    }

    /// One-line commit subjects, newest first.
    pub async fn log_subjects(&self, path: &Path) -> Result<Vec<String>, RunnerError> {
        let out = self.git(Some(path), &["log", "--format=%s"]).await?;
        Ok(out.stdout.lines().map(str::to_string).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn git_available() -> bool {
        CommandRunner::new().resolve("git").is_ok()
    }

    fn test_git() -> Git {
        Git::new(Arc::new(CommandRunner::new()))
    }

    #[tokio::test]
    async fn init_creates_a_repository_on_master() {
        if !git_available() {
            eprintln!("git not found; skipping");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        let git = test_git();
        git.init(&repo).await.unwrap();

        assert!(repo.join(".git").join("index").exists() || repo.join(".git").exists());
        let subjects = git.log_subjects(&repo).await.unwrap();
        assert_eq!(subjects, vec!["Initial commit".to_string()]);
    }

    #[tokio::test]
    async fn commit_all_records_the_configured_author() {
        if !git_available() {
            eprintln!("git not found; skipping");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        let git = test_git();
        git.init(&repo).await.unwrap();

        fs::write_text(&repo.join("file.txt"), "contents").await.unwrap();
        git.commit_all(&repo, "Add file").await.unwrap();

        let out = git
            .git(Some(&repo), &["log", "-n1", "--format=%an <%ae>"])
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "volodyslav <volodyslav>");
    }

    #[tokio::test]
    async fn clone_shallow_copies_the_branch_tip() {
        if !git_available() {
            eprintln!("git not found; skipping");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let origin = dir.path().join("origin");
        let git = test_git();
        git.init(&origin).await.unwrap();
        fs::write_text(&origin.join("a.txt"), "a").await.unwrap();
        git.commit_all(&origin, "Add a").await.unwrap();

        let clone = dir.path().join("clone");
        git.clone_shallow(&origin.display().to_string(), &clone)
            .await
            .unwrap();
        assert_eq!(
            fs::read_text(&clone.join("a.txt")).await.unwrap(),
            "a"
        );
    }
}
