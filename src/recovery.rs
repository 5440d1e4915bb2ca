//! Crash Recovery Manager.
//!
//! On startup, scans for workflows left `Running` with a stale heartbeat
//! (the zombie detector's remit while the engine is up; this module is the
//! equivalent pass for when the whole process died). For each, any
//! in-progress git operation is aborted, uncommitted worktree changes are
//! committed to a recovery branch so no agent work is silently lost, and
//! `Running` tasks are reset to `Pending` with an incremented retry count so
//! the next run re-enters the Executor cleanly. Best-effort throughout: one
//! workflow's recovery failure is logged and does not block the others.
//!
//! The abort-and-restore pattern generalizes "abort one failed merge" to
//! "abort whatever git operation was in flight across every task
//! worktree".

use crate::errors::Result;
use crate::workflow::{StateManager, TaskStatus, WorkflowState, WorkflowStatus};
use std::sync::Arc;
use tokio::process::Command;
use tracing::{info, warn};

pub struct RecoveryManager {
    state_manager: Arc<dyn StateManager>,
    repo_path: std::path::PathBuf,
}

impl RecoveryManager {
    pub fn new(state_manager: Arc<dyn StateManager>, repo_path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            state_manager,
            repo_path: repo_path.into(),
        }
    }

    /// Runs recovery across every workflow currently marked `Running` in the
    /// state store. Idempotent: running it twice in a row is a no-op the
    /// second time, since the first pass resets tasks to `Pending` and the
    /// workflow to `Paused`.
    pub async fn recover_all(&self) -> Result<Vec<String>> {
        let mut recovered = Vec::new();
        for id in self.state_manager.list_ids().await? {
            let Some(state) = self.state_manager.load(&id).await? else {
                continue;
            };
            if state.status != WorkflowStatus::Running {
                continue;
            }
            match self.recover_one(state).await {
                Ok(()) => recovered.push(id),
                Err(err) => warn!(workflow_id = %id, %err, "workflow recovery failed, skipping"),
            }
        }
        Ok(recovered)
    }

    async fn recover_one(&self, mut state: WorkflowState) -> Result<()> {
        let workflow_id = state.workflow_id.clone();
        info!(workflow_id = %workflow_id, "recovering crashed workflow");

        self.abort_in_progress_git_operation(&self.repo_path).await;

        for (task_id, task) in state.tasks.iter_mut() {
            if task.status != TaskStatus::Running {
                continue;
            }

            if let Some(worktree_path) = task.worktree_path.clone() {
                let path = std::path::PathBuf::from(&worktree_path);
                self.abort_in_progress_git_operation(&path).await;
                if let Err(err) = self.commit_uncommitted_changes(&path, task_id).await {
                    warn!(workflow_id = %workflow_id, task_id, %err, "failed to preserve uncommitted worktree changes");
                }
            }

            task.status = TaskStatus::Pending;
            task.retries += 1;
            task.resumable = true;
        }

        state.status = WorkflowStatus::Paused;
        self.state_manager.save(&state).await?;
        self.state_manager.clear_workflow_running(&workflow_id).await?;
        Ok(())
    }

    /// Aborts any merge/rebase/cherry-pick left in progress in `dir`.
    /// Best-effort: git returns a non-zero exit for "nothing to abort",
    /// which is the expected common case and not logged as an error.
    async fn abort_in_progress_git_operation(&self, dir: &std::path::Path) {
        for op in [
            ["merge", "--abort"].as_slice(),
            ["rebase", "--abort"].as_slice(),
            ["cherry-pick", "--abort"].as_slice(),
        ] {
            let _ = Command::new("git").args(op).current_dir(dir).output().await;
        }
    }

    /// Commits any uncommitted changes in `worktree_path` to a recovery
    /// branch so they are not lost when the task is reset and its worktree
    /// is eventually removed.
    async fn commit_uncommitted_changes(
        &self,
        worktree_path: &std::path::Path,
        task_id: &str,
    ) -> Result<()> {
        let status = Command::new("git")
            .args(["status", "--porcelain"])
            .current_dir(worktree_path)
            .output()
            .await
            .map_err(|e| crate::errors::DomainError::Internal(format!("git status failed: {e}")))?;
        if status.stdout.is_empty() {
            return Ok(());
        }

        let recovery_branch = format!("quorum-recovery/{task_id}");
        let _ = Command::new("git")
            .args(["checkout", "-b", &recovery_branch])
            .current_dir(worktree_path)
            .output()
            .await;
        let _ = Command::new("git")
            .args(["add", "-A"])
            .current_dir(worktree_path)
            .output()
            .await;
        let commit = Command::new("git")
            .args(["commit", "-m", "recover uncommitted changes after crash"])
            .current_dir(worktree_path)
            .output()
            .await
            .map_err(|e| crate::errors::DomainError::Internal(format!("git commit failed: {e}")))?;
        if !commit.status.success() {
            warn!(task_id, "recovery commit produced no changes or failed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::store::FileStateManager;
    use crate::workflow::TaskState;

    fn init_repo(dir: &std::path::Path) {
        let run = |args: &[&str]| {
            std::process::Command::new("git")
                .args(args)
                .current_dir(dir)
                .output()
                .unwrap()
        };
        run(&["init", "-q"]);
        run(&["config", "user.email", "test@example.com"]);
        run(&["config", "user.name", "test"]);
        std::fs::write(dir.join("README.md"), "hello").unwrap();
        run(&["add", "."]);
        run(&["commit", "-q", "-m", "init"]);
    }

    #[tokio::test]
    async fn recover_resets_running_tasks_to_pending_with_incremented_retries() {
        let repo_dir = tempfile::tempdir().unwrap();
        init_repo(repo_dir.path());

        let state_dir = tempfile::tempdir().unwrap();
        let state_manager: Arc<dyn StateManager> =
            Arc::new(FileStateManager::new(state_dir.path().join("state")).unwrap());

        let mut state = WorkflowState::initialize("p");
        state.status = WorkflowStatus::Running;
        let mut task = TaskState::new("t1", "Task 1", "mock-a");
        task.status = TaskStatus::Running;
        task.retries = 0;
        state.add_task(task);
        state_manager.save(&state).await.unwrap();
        state_manager.set_workflow_running(&state.workflow_id).await.unwrap();

        let manager = RecoveryManager::new(state_manager.clone(), repo_dir.path());
        let recovered = manager.recover_all().await.unwrap();
        assert_eq!(recovered, vec![state.workflow_id.clone()]);

        let reloaded = state_manager.load(&state.workflow_id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, WorkflowStatus::Paused);
        assert_eq!(reloaded.tasks["t1"].status, TaskStatus::Pending);
        assert_eq!(reloaded.tasks["t1"].retries, 1);
        assert!(reloaded.tasks["t1"].resumable);
    }

    #[tokio::test]
    async fn non_running_workflow_is_skipped() {
        let repo_dir = tempfile::tempdir().unwrap();
        init_repo(repo_dir.path());
        let state_dir = tempfile::tempdir().unwrap();
        let state_manager: Arc<dyn StateManager> =
            Arc::new(FileStateManager::new(state_dir.path().join("state")).unwrap());
        let state = WorkflowState::initialize("p");
        state_manager.save(&state).await.unwrap();

        let manager = RecoveryManager::new(state_manager, repo_dir.path());
        let recovered = manager.recover_all().await.unwrap();
        assert!(recovered.is_empty());
    }
}
