//! `StateManager`: load/save/lock, running-workflow tracking, zombie
//! discovery, and reconciliation of crashed-but-recoverable analyze output.
//!
//! Each workflow is a whole-record JSON snapshot on disk rather than a
//! line-oriented append log, since `WorkflowState` is a structured record
//! that gets rewritten in place, not appended to. Locking uses `fs2` for
//! single-writer guarantees.

use crate::errors::{DomainError, Result};
use crate::workflow::state::{Checkpoint, CheckpointType, Phase, WorkflowState, WorkflowStatus};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use fs2::FileExt;
use std::collections::HashSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

/// Abstraction over persistence, mirroring the external `StateManager`
/// interface: load/save, workflow-scoped locking, running-set tracking, and
/// zombie discovery. A single process implementation ([`FileStateManager`])
/// is provided; tests may supply an in-memory double.
#[async_trait]
pub trait StateManager: Send + Sync {
    async fn save(&self, state: &WorkflowState) -> Result<()>;
    async fn load(&self, workflow_id: &str) -> Result<Option<WorkflowState>>;
    async fn list_ids(&self) -> Result<Vec<String>>;

    async fn acquire_workflow_lock(&self, workflow_id: &str) -> Result<WorkflowLock>;

    async fn set_workflow_running(&self, workflow_id: &str) -> Result<()>;
    async fn clear_workflow_running(&self, workflow_id: &str) -> Result<()>;
    async fn list_running_workflows(&self) -> Result<Vec<String>>;

    async fn update_heartbeat(&self, workflow_id: &str) -> Result<()>;
    async fn find_zombie_workflows(&self, stale_threshold: ChronoDuration) -> Result<Vec<String>>;

    /// Removes the state record and, if `remove_reports` is set, the report
    /// directory. Refuses to purge a workflow currently in the running-set.
    async fn purge(&self, workflow_id: &str, remove_reports: bool) -> Result<()>;
}

/// RAII guard for a workflow's exclusive lock. Dropping it releases the
/// underlying file lock.
pub struct WorkflowLock {
    file: File,
}

impl Drop for WorkflowLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

pub struct FileStateManager {
    base_dir: PathBuf,
    running: Mutex<HashSet<String>>,
}

impl FileStateManager {
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)
            .map_err(|e| DomainError::Internal(format!("failed to create state dir: {e}")))?;
        Ok(Self {
            base_dir,
            running: Mutex::new(HashSet::new()),
        })
    }

    fn state_path(&self, workflow_id: &str) -> PathBuf {
        self.base_dir.join(format!("{workflow_id}.json"))
    }

    fn lock_path(&self, workflow_id: &str) -> PathBuf {
        self.base_dir.join(format!("{workflow_id}.lock"))
    }

    fn reports_dir(&self, workflow_id: &str) -> PathBuf {
        self.base_dir
            .parent()
            .unwrap_or(&self.base_dir)
            .join("reports")
            .join(workflow_id)
    }

    /// If `analyze-phase/consolidated.md` exists with non-trivial length
    /// (>= 512 bytes) and no `consolidated_analysis` checkpoint is present,
    /// synthesize one from the file plus a `phase_complete(Analyze)`.
    /// Narrow by policy — only the Analyze phase.
    fn reconcile(&self, state: &mut WorkflowState) {
        if state
            .checkpoints
            .iter()
            .any(|c| c.kind == CheckpointType::ConsolidatedAnalysis)
        {
            return;
        }
        let consolidated = self
            .reports_dir(&state.workflow_id)
            .join("analyze-phase")
            .join("consolidated.md");
        let Ok(contents) = fs::read_to_string(&consolidated) else {
            return;
        };
        if contents.len() < 512 || !crate::validators::is_valid_analysis_output(&contents) {
            return;
        }
        warn!(
            workflow_id = %state.workflow_id,
            "reconciling missing consolidated_analysis checkpoint from on-disk artifact"
        );
        state.append_checkpoint(
            Checkpoint::new(
                CheckpointType::ConsolidatedAnalysis,
                Some(Phase::Analyze),
                "reconciled from consolidated.md",
            )
            .with_data("content", serde_json::Value::String(contents)),
        );
        state.append_checkpoint(Checkpoint::new(
            CheckpointType::PhaseComplete,
            Some(Phase::Analyze),
            "reconciled",
        ));
        state.append_checkpoint(Checkpoint::new(
            CheckpointType::Reconciled,
            Some(Phase::Analyze),
            "state reconciled on load",
        ));
    }
}

#[async_trait]
impl StateManager for FileStateManager {
    async fn save(&self, state: &WorkflowState) -> Result<()> {
        let path = self.state_path(&state.workflow_id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(state)
            .map_err(|e| DomainError::Internal(format!("failed to serialize state: {e}")))?;
        fs::write(&tmp, json)
            .map_err(|e| DomainError::Internal(format!("failed to write state: {e}")))?;
        fs::rename(&tmp, &path)
            .map_err(|e| DomainError::Internal(format!("failed to commit state write: {e}")))?;
        Ok(())
    }

    async fn load(&self, workflow_id: &str) -> Result<Option<WorkflowState>> {
        let path = self.state_path(workflow_id);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)
            .map_err(|e| DomainError::Internal(format!("failed to read state: {e}")))?;
        let mut state: WorkflowState = serde_json::from_slice(&bytes)
            .map_err(|e| DomainError::Parse {
                what: "workflow state".into(),
                message: e.to_string(),
            })?;
        self.reconcile(&mut state);
        Ok(Some(state))
    }

    async fn list_ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let entries = fs::read_dir(&self.base_dir)
            .map_err(|e| DomainError::Internal(format!("failed to list state dir: {e}")))?;
        for entry in entries.flatten() {
            if let Some(name) = entry.path().file_stem().and_then(|s| s.to_str()) {
                if entry.path().extension().and_then(|e| e.to_str()) == Some("json") {
                    ids.push(name.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn acquire_workflow_lock(&self, workflow_id: &str) -> Result<WorkflowLock> {
        let path = self.lock_path(workflow_id);
        let file = File::create(&path)
            .map_err(|e| DomainError::Internal(format!("failed to open lock file: {e}")))?;
        file.lock_exclusive()
            .map_err(|e| DomainError::Internal(format!("failed to acquire workflow lock: {e}")))?;
        Ok(WorkflowLock { file })
    }

    async fn set_workflow_running(&self, workflow_id: &str) -> Result<()> {
        self.running
            .lock()
            .map_err(|_| DomainError::Internal("running-set mutex poisoned".into()))?
            .insert(workflow_id.to_string());
        Ok(())
    }

    async fn clear_workflow_running(&self, workflow_id: &str) -> Result<()> {
        self.running
            .lock()
            .map_err(|_| DomainError::Internal("running-set mutex poisoned".into()))?
            .remove(workflow_id);
        Ok(())
    }

    async fn list_running_workflows(&self) -> Result<Vec<String>> {
        Ok(self
            .running
            .lock()
            .map_err(|_| DomainError::Internal("running-set mutex poisoned".into()))?
            .iter()
            .cloned()
            .collect())
    }

    async fn update_heartbeat(&self, workflow_id: &str) -> Result<()> {
        if let Some(mut state) = self.load(workflow_id).await? {
            state.heartbeat_at = Some(Utc::now());
            self.save(&state).await?;
        }
        Ok(())
    }

    async fn find_zombie_workflows(&self, stale_threshold: ChronoDuration) -> Result<Vec<String>> {
        let now: DateTime<Utc> = Utc::now();
        let mut zombies = Vec::new();
        for id in self.list_ids().await? {
            let Some(state) = self.load(&id).await? else {
                continue;
            };
            if state.status != WorkflowStatus::Running {
                continue;
            }
            let stale = match state.heartbeat_at {
                Some(hb) => now - hb > stale_threshold,
                None => true,
            };
            if stale {
                zombies.push(id);
            }
        }
        Ok(zombies)
    }

    async fn purge(&self, workflow_id: &str, remove_reports: bool) -> Result<()> {
        if self
            .running
            .lock()
            .map_err(|_| DomainError::Internal("running-set mutex poisoned".into()))?
            .contains(workflow_id)
        {
            return Err(DomainError::Policy {
                operation: "purge".into(),
                reason: format!("workflow {workflow_id} is currently running"),
            });
        }
        let path = self.state_path(workflow_id);
        if path.exists() {
            fs::remove_file(&path)
                .map_err(|e| DomainError::Internal(format!("failed to remove state: {e}")))?;
        }
        let lock_path = self.lock_path(workflow_id);
        if lock_path.exists() {
            let _ = fs::remove_file(&lock_path);
        }
        if remove_reports {
            let dir = self.reports_dir(workflow_id);
            if dir.exists() {
                fs::remove_dir_all(&dir).map_err(|e| {
                    DomainError::Internal(format!("failed to remove report dir: {e}"))
                })?;
            }
        }
        info!(workflow_id, "workflow purged");
        Ok(())
    }
}

pub fn default_state_dir(base: impl AsRef<Path>) -> PathBuf {
    base.as_ref().join(".quorum").join("state")
}
