//! Narrow version-control seam.
//!
//! The workspace store only needs a handful of git operations: create an
//! isolated working copy on a new branch, commit, hard-reset, list/prune.
//! They are wrapped behind [`GitBackend`] so tests can substitute an
//! in-memory fake instead of invoking the real binary.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

use crate::error::{Error, Result};

/// A working copy as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkingCopy {
    pub path: PathBuf,
    pub branch: String,
}

#[async_trait]
pub trait GitBackend: Send + Sync {
    /// Create an isolated working copy at `worktree_path` on a new branch
    /// `branch` derived from `base_branch`.
    async fn create_working_copy(
        &self,
        repo: &Path,
        worktree_path: &Path,
        branch: &str,
        base_branch: &str,
    ) -> Result<()>;

    /// Stage and commit everything in `worktree`. Returns the commit hash,
    /// or `None` when there was nothing to commit.
    async fn commit_all(&self, worktree: &Path, message: &str) -> Result<Option<String>>;

    /// Hard-reset `worktree` to `commit`, discarding later changes.
    async fn reset_hard(&self, worktree: &Path, commit: &str) -> Result<()>;

    /// Current HEAD commit of `worktree`.
    async fn head(&self, worktree: &Path) -> Result<String>;

    /// Whether the checkout at `repo` has no uncommitted changes.
    async fn is_clean(&self, repo: &Path) -> Result<bool>;

    /// Whether `branch` exists in `repo`.
    async fn branch_exists(&self, repo: &Path, branch: &str) -> Result<bool>;

    /// All linked working copies of `repo` (the main checkout excluded).
    async fn list_working_copies(&self, repo: &Path) -> Result<Vec<WorkingCopy>>;

    /// Remove the working copy at `worktree_path`.
    async fn remove_working_copy(&self, repo: &Path, worktree_path: &Path) -> Result<()>;

    /// Drop stale working-copy references.
    async fn prune(&self, repo: &Path) -> Result<()>;
}

/// Backend shelling out to the `git` binary.
#[derive(Debug, Default, Clone)]
pub struct GitCli;

impl GitCli {
    async fn run(&self, dir: &Path, args: &[&str]) -> Result<String> {
        debug!(dir = %dir.display(), ?args, "running git");
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .await
            .map_err(|e| Error::Io(format!("failed to spawn git: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Internal(format!(
                "git {} failed: {}",
                args.first().unwrap_or(&""),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl GitBackend for GitCli {
    async fn create_working_copy(
        &self,
        repo: &Path,
        worktree_path: &Path,
        branch: &str,
        base_branch: &str,
    ) -> Result<()> {
        if let Some(parent) = worktree_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Io(e.to_string()))?;
        }
        let path = worktree_path.to_string_lossy().to_string();
        self.run(
            repo,
            &["worktree", "add", "-b", branch, &path, base_branch],
        )
        .await?;
        Ok(())
    }

    async fn commit_all(&self, worktree: &Path, message: &str) -> Result<Option<String>> {
        self.run(worktree, &["add", "-A"]).await?;

        // Exit status 0 from `diff --cached --quiet` means nothing staged
        let staged = Command::new("git")
            .args(["diff", "--cached", "--quiet"])
            .current_dir(worktree)
            .output()
            .await
            .map_err(|e| Error::Io(format!("failed to spawn git: {e}")))?;
        if staged.status.success() {
            return Ok(None);
        }

        self.run(worktree, &["commit", "-m", message]).await?;
        let hash = self.run(worktree, &["rev-parse", "HEAD"]).await?;
        Ok(Some(hash.trim().to_string()))
    }

    async fn reset_hard(&self, worktree: &Path, commit: &str) -> Result<()> {
        self.run(worktree, &["reset", "--hard", commit]).await?;
        // Untracked files introduced after the checkpoint must go too for
        // the byte-identical guarantee
        self.run(worktree, &["clean", "-fd"]).await?;
        Ok(())
    }

    async fn head(&self, worktree: &Path) -> Result<String> {
        let out = self.run(worktree, &["rev-parse", "HEAD"]).await?;
        Ok(out.trim().to_string())
    }

    async fn is_clean(&self, repo: &Path) -> Result<bool> {
        let out = self.run(repo, &["status", "--porcelain"]).await?;
        Ok(out.trim().is_empty())
    }

    async fn branch_exists(&self, repo: &Path, branch: &str) -> Result<bool> {
        let refname = format!("refs/heads/{branch}");
        let output = Command::new("git")
            .args(["show-ref", "--verify", "--quiet", &refname])
            .current_dir(repo)
            .output()
            .await
            .map_err(|e| Error::Io(format!("failed to spawn git: {e}")))?;
        Ok(output.status.success())
    }

    async fn list_working_copies(&self, repo: &Path) -> Result<Vec<WorkingCopy>> {
        let out = self.run(repo, &["worktree", "list", "--porcelain"]).await?;

        let mut copies = Vec::new();
        let mut current_path: Option<PathBuf> = None;
        for line in out.lines() {
            if let Some(path) = line.strip_prefix("worktree ") {
                current_path = Some(PathBuf::from(path));
            } else if let Some(branch) = line.strip_prefix("branch ") {
                if let Some(path) = current_path.take() {
                    let branch = branch
                        .strip_prefix("refs/heads/")
                        .unwrap_or(branch)
                        .to_string();
                    copies.push(WorkingCopy { path, branch });
                }
            }
        }

        // The first entry is the main checkout itself
        let canonical_repo = repo.canonicalize().unwrap_or_else(|_| repo.to_path_buf());
        copies.retain(|wc| {
            let canonical = wc.path.canonicalize().unwrap_or_else(|_| wc.path.clone());
            canonical != canonical_repo
        });
        Ok(copies)
    }

    async fn remove_working_copy(&self, repo: &Path, worktree_path: &Path) -> Result<()> {
        let path = worktree_path.to_string_lossy().to_string();
        let result = self
            .run(repo, &["worktree", "remove", "--force", &path])
            .await;
        if let Err(e) = result {
            // Already gone is fine; everything else is not
            if !format!("{e}").contains("is not a working tree") {
                return Err(e);
            }
        }
        if worktree_path.exists() {
            tokio::fs::remove_dir_all(worktree_path).await.ok();
        }
        Ok(())
    }

    async fn prune(&self, repo: &Path) -> Result<()> {
        self.run(repo, &["worktree", "prune"]).await?;
        Ok(())
    }
}
