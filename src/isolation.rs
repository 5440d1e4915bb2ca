//! Git-based workflow/task isolation: one branch per workflow, one worktree
//! per task, merged back into the workflow branch as tasks complete.
//!
//! Shells out to `git` via `tokio::process::Command` rather than binding
//! libgit2 — worktree setup, cleanup, and branch merges are all a handful
//! of plain subprocess calls, and three configurable merge strategies sit
//! on top of one merge call.

use crate::config::MergeStrategy;
use crate::errors::{DomainError, Result};
use crate::phases::executor::GitChangeDetector;
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// One branch per workflow, one worktree per task, merged back per
/// [`MergeStrategy`], with a failure-to-create-worktree fallback to
/// non-isolated (in-place) execution.
#[async_trait::async_trait]
pub trait IsolationManager: Send + Sync {
    async fn initialize_workflow(&self, workflow_id: &str) -> Result<String>;
    async fn create_task_worktree(&self, workflow_id: &str, task_id: &str) -> Result<(PathBuf, String)>;
    async fn merge_task_to_workflow(&self, task_branch: &str, workflow_branch: &str) -> Result<bool>;
    async fn remove_task_worktree(&self, worktree_path: &Path) -> Result<()>;
    async fn cleanup_workflow(&self, workflow_id: &str) -> Result<()>;
    fn workflow_branch(&self, workflow_id: &str) -> String;
    fn task_branch(&self, workflow_id: &str, task_id: &str) -> String;
    fn merge_strategy(&self) -> MergeStrategy;
}

pub struct GitIsolationManager {
    repo_path: PathBuf,
    base_branch: String,
    merge_strategy: MergeStrategy,
}

impl GitIsolationManager {
    pub fn new(repo_path: impl Into<PathBuf>, base_branch: impl Into<String>, merge_strategy: MergeStrategy) -> Self {
        Self {
            repo_path: repo_path.into(),
            base_branch: base_branch.into(),
            merge_strategy,
        }
    }

    async fn run_git(&self, args: &[&str]) -> Result<std::process::Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.repo_path)
            .output()
            .await
            .map_err(|e| DomainError::Internal(format!("failed to run git {args:?}: {e}")))
    }

}

#[async_trait::async_trait]
impl IsolationManager for GitIsolationManager {
    async fn initialize_workflow(&self, workflow_id: &str) -> Result<String> {
        let branch = self.workflow_branch(workflow_id);
        let output = self
            .run_git(&["branch", &branch, &self.base_branch])
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.contains("already exists") {
                return Err(DomainError::Merge {
                    task_branch: branch.clone(),
                    target_branch: self.base_branch.clone(),
                });
            }
        }
        Ok(branch)
    }

    async fn create_task_worktree(&self, workflow_id: &str, task_id: &str) -> Result<(PathBuf, String)> {
        let branch = self.task_branch(workflow_id, task_id);
        let worktree_path = self
            .repo_path
            .join(".quorum-worktrees")
            .join(workflow_id)
            .join(task_id);

        if let Some(parent) = worktree_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DomainError::Internal(format!("failed to create worktree parent dir: {e}")))?;
        }

        let worktree_str = worktree_path
            .to_str()
            .ok_or_else(|| DomainError::Internal("worktree path is not valid UTF-8".into()))?;
        let workflow_branch = self.workflow_branch(workflow_id);

        let output = self
            .run_git(&["worktree", "add", "-b", &branch, worktree_str, &workflow_branch])
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(DomainError::Internal(format!(
                "git worktree creation failed for task {task_id}, falling back to non-isolated execution: {stderr}"
            )));
        }

        Ok((worktree_path, branch))
    }

    async fn merge_task_to_workflow(&self, task_branch: &str, workflow_branch: &str) -> Result<bool> {
        let head_output = self
            .run_git(&["rev-parse", "--abbrev-ref", "HEAD"])
            .await?;
        let original_branch = String::from_utf8_lossy(&head_output.stdout).trim().to_string();

        let checkout = self.run_git(&["checkout", workflow_branch]).await?;
        if !checkout.status.success() {
            return Err(DomainError::Merge {
                task_branch: task_branch.to_string(),
                target_branch: workflow_branch.to_string(),
            });
        }

        let message = format!("Merge {task_branch}");
        let output = self
            .run_git(&["merge", "--no-ff", "-m", &message, task_branch])
            .await?;

        if !output.status.success() {
            let _ = self.run_git(&["merge", "--abort"]).await;
            if original_branch != workflow_branch {
                let _ = self.run_git(&["checkout", &original_branch]).await;
            }
            return Ok(false);
        }

        Ok(true)
    }

    async fn remove_task_worktree(&self, worktree_path: &Path) -> Result<()> {
        let path_str = worktree_path
            .to_str()
            .ok_or_else(|| DomainError::Internal("worktree path is not valid UTF-8".into()))?;
        let output = self
            .run_git(&["worktree", "remove", "--force", path_str])
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DomainError::Internal(format!(
                "git worktree remove failed: {}",
                stderr.trim()
            )));
        }
        Ok(())
    }

    async fn cleanup_workflow(&self, workflow_id: &str) -> Result<()> {
        let worktrees_dir = self.repo_path.join(".quorum-worktrees").join(workflow_id);
        if worktrees_dir.exists() {
            let _ = self.run_git(&["worktree", "prune"]).await;
            let _ = tokio::fs::remove_dir_all(&worktrees_dir).await;
        }
        Ok(())
    }

    fn workflow_branch(&self, workflow_id: &str) -> String {
        format!("quorum/{workflow_id}")
    }

    fn task_branch(&self, workflow_id: &str, task_id: &str) -> String {
        format!("quorum/{workflow_id}/{task_id}")
    }

    fn merge_strategy(&self) -> MergeStrategy {
        self.merge_strategy
    }
}

/// Detects uncommitted changes in a task's worktree — used by the executor's
/// output validation, where file changes override a low token count.
pub struct WorktreeChangeDetector;

impl GitChangeDetector for WorktreeChangeDetector {
    fn has_changes(&self, work_dir: &Path) -> bool {
        if !work_dir.exists() {
            return false;
        }
        std::process::Command::new("git")
            .args(["status", "--porcelain"])
            .current_dir(work_dir)
            .output()
            .map(|o| o.status.success() && !o.stdout.is_empty())
            .unwrap_or(false)
    }
}
