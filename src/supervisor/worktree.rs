//! Git worktree workspace provider.
//!
//! Each task branch gets its own checkout under
//! `.foreman/worktrees/<branch>`, so concurrent workers never touch the
//! same working tree. Merging happens in the main repository; worktrees
//! are only removed after a successful merge.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::config::STATE_DIR;
use crate::error::{ForemanError, Result};
use crate::supervisor::WorkspaceProvider;

/// Workspace provider backed by `git worktree`.
#[derive(Debug, Clone)]
pub struct GitWorktrees {
    repo_dir: PathBuf,
}

impl GitWorktrees {
    pub fn new(repo_dir: impl AsRef<Path>) -> Self {
        Self {
            repo_dir: repo_dir.as_ref().to_path_buf(),
        }
    }

    fn worktree_path(&self, branch: &str) -> PathBuf {
        self.repo_dir
            .join(STATE_DIR)
            .join("worktrees")
            .join(branch.replace('/', "-"))
    }

    async fn git(&self, cwd: &Path, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(cwd)
            .output()
            .await
            .map_err(|e| ForemanError::workspace(args.join(" "), format!("git not runnable: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ForemanError::workspace(
                args.join(" "),
                stderr.trim().to_string(),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl WorkspaceProvider for GitWorktrees {
    async fn create(&self, branch: &str) -> Result<PathBuf> {
        let path = self.worktree_path(branch);
        if path.exists() {
            // A prior attempt left its worktree behind; reuse it so the
            // worker sees the earlier branch state.
            debug!(branch, "reusing existing worktree");
            return Ok(path);
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let path_str = path.to_string_lossy().to_string();

        // First assignment creates the branch; a retry reattaches to it.
        let fresh = self
            .git(
                &self.repo_dir,
                &["worktree", "add", &path_str, "-b", branch],
            )
            .await;
        if fresh.is_err() {
            self.git(&self.repo_dir, &["worktree", "add", &path_str, branch])
                .await?;
        }

        debug!(branch, path = %path.display(), "worktree created");
        Ok(path)
    }

    async fn merge(&self, path: &Path) -> Result<()> {
        let branch = self
            .git(path, &["rev-parse", "--abbrev-ref", "HEAD"])
            .await?;

        self.git(
            &self.repo_dir,
            &[
                "merge",
                "--no-ff",
                &branch,
                "-m",
                &format!("Merge branch '{branch}'"),
            ],
        )
        .await?;

        // The branch is merged; the checkout is no longer needed.
        let path_str = path.to_string_lossy().to_string();
        self.git(&self.repo_dir, &["worktree", "remove", &path_str])
            .await?;

        debug!(branch, "worktree merged and removed");
        Ok(())
    }

    async fn discard(&self, path: &Path) -> Result<()> {
        let path_str = path.to_string_lossy().to_string();
        self.git(
            &self.repo_dir,
            &["worktree", "remove", "--force", &path_str],
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worktree_path_flattens_branch() {
        let provider = GitWorktrees::new("/repo");
        assert_eq!(
            provider.worktree_path("task/0042"),
            PathBuf::from("/repo/.foreman/worktrees/task-0042")
        );
    }

    #[tokio::test]
    async fn test_create_fails_outside_a_repo() {
        let temp = tempfile::TempDir::new().unwrap();
        let provider = GitWorktrees::new(temp.path());
        let err = provider.create("task/0001").await.unwrap_err();
        assert!(matches!(err, ForemanError::Workspace { .. }));
    }
}
