//! Heartbeat writer + zombie detector.
//!
//! Every tracked workflow gets a background task that refreshes
//! `heartbeat_at` on an interval; a second background task periodically
//! scans for `Running` workflows whose heartbeat has gone stale and either
//! auto-resumes them (if configured and under the resume budget) or marks
//! them `Failed`. Two independent tokio intervals rather than one
//! foreground loop, so detection keeps running even while a workflow is
//! mid-phase.

use crate::checkpoint::CheckpointWriter;
use crate::config::HeartbeatConfig;
use crate::errors::Result;
use crate::workflow::{StateManager, WorkflowStatus};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Re-entry point the zombie detector uses to actually drive a paused
/// workflow's remaining phases, rather than just flipping its status and
/// leaving it parked. Implemented by `Runner`; kept as a trait here so this
/// module doesn't need to depend on the orchestrator directly.
#[async_trait]
pub trait WorkflowResumer: Send + Sync {
    async fn resume_workflow(&self, workflow_id: &str) -> Result<()>;
}

/// Per-process tracking of in-flight workflows, for the 3x-threshold
/// in-process heuristic: a workflow actively running in *this* process is
/// never a zombie even if its on-disk heartbeat looks stale, unless it has
/// gone silent for 3x the configured interval (a genuinely hung task, not
/// just a slow write).
#[derive(Default)]
pub struct InProcessTracker {
    last_seen: Mutex<std::collections::HashMap<String, std::time::Instant>>,
}

impl InProcessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn touch(&self, workflow_id: &str) {
        self.last_seen
            .lock()
            .await
            .insert(workflow_id.to_string(), std::time::Instant::now());
    }

    pub async fn forget(&self, workflow_id: &str) {
        self.last_seen.lock().await.remove(workflow_id);
    }

    /// True only if this workflow is being actively touched in this process
    /// and hasn't gone silent for 3x the interval. A workflow this process
    /// has never seen (e.g. left behind by a prior process) is not "active"
    /// even though it's also not "hung" by this definition.
    async fn is_active(&self, workflow_id: &str, interval: std::time::Duration) -> bool {
        match self.last_seen.lock().await.get(workflow_id) {
            Some(last) => last.elapsed() <= interval * 3,
            None => false,
        }
    }
}

pub struct HeartbeatWriter {
    state_manager: Arc<dyn StateManager>,
    tracker: Arc<InProcessTracker>,
    config: HeartbeatConfig,
}

impl HeartbeatWriter {
    pub fn new(
        state_manager: Arc<dyn StateManager>,
        tracker: Arc<InProcessTracker>,
        config: HeartbeatConfig,
    ) -> Self {
        Self {
            state_manager,
            tracker,
            config,
        }
    }

    /// Spawns a background task that refreshes the workflow's heartbeat
    /// (both the in-process tracker and the on-disk timestamp) on
    /// `config.interval()` until the returned handle is aborted.
    pub fn spawn(&self, workflow_id: String) -> JoinHandle<()> {
        let state_manager = self.state_manager.clone();
        let tracker = self.tracker.clone();
        let interval = self.config.interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                tracker.touch(&workflow_id).await;
                if let Err(err) = state_manager.update_heartbeat(&workflow_id).await {
                    warn!(workflow_id, %err, "failed to write heartbeat");
                }
            }
        })
    }
}

pub struct ZombieDetector {
    state_manager: Arc<dyn StateManager>,
    tracker: Arc<InProcessTracker>,
    config: HeartbeatConfig,
    resumer: Arc<dyn WorkflowResumer>,
}

impl ZombieDetector {
    pub fn new(
        state_manager: Arc<dyn StateManager>,
        tracker: Arc<InProcessTracker>,
        config: HeartbeatConfig,
        resumer: Arc<dyn WorkflowResumer>,
    ) -> Self {
        Self {
            state_manager,
            tracker,
            config,
            resumer,
        }
    }

    /// Spawns the periodic scan, checking every `config.check_interval()`.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        let interval = self.config.check_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(err) = self.scan_once().await {
                    warn!(%err, "zombie scan failed");
                }
            }
        })
    }

    /// One scan pass: find stale `Running` workflows and either auto-resume
    /// or mark them `Failed`, skipping any still genuinely active in this
    /// process per the 3x in-process heuristic.
    pub async fn scan_once(&self) -> Result<()> {
        let stale_threshold = self.config.stale_threshold();
        let zombies = self.state_manager.find_zombie_workflows(stale_threshold).await?;

        for workflow_id in zombies {
            if self.tracker.is_active(&workflow_id, self.config.interval()).await {
                continue;
            }

            let Some(mut state) = self.state_manager.load(&workflow_id).await? else {
                continue;
            };

            CheckpointWriter::zombie_detected(&mut state, "heartbeat stale beyond threshold");

            if self.config.auto_resume && state.resume_count < self.config.max_resumes {
                state.resume_count += 1;
                state.status = WorkflowStatus::Paused;
                CheckpointWriter::auto_resume(&mut state);
                info!(workflow_id, resume_count = state.resume_count, "auto-resuming zombie workflow");

                self.state_manager.save(&state).await?;
                self.state_manager.clear_workflow_running(&workflow_id).await?;

                let resumer = self.resumer.clone();
                let resumed_id = workflow_id.clone();
                tokio::spawn(async move {
                    if let Err(err) = resumer.resume_workflow(&resumed_id).await {
                        warn!(workflow_id = %resumed_id, %err, "auto-resume failed to re-enter the phase pipeline");
                    }
                });
            } else {
                state.status = WorkflowStatus::Failed;
                warn!(workflow_id, "marking zombie workflow as failed, resume budget exhausted");
                self.state_manager.save(&state).await?;
                self.state_manager.clear_workflow_running(&workflow_id).await?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::store::FileStateManager;
    use crate::workflow::WorkflowState;
    use chrono::Duration as ChronoDuration;

    fn config() -> HeartbeatConfig {
        HeartbeatConfig {
            interval_secs: 1,
            stale_threshold_secs: 1,
            check_interval_secs: 1,
            auto_resume: false,
            max_resumes: 3,
        }
    }

    struct NoopResumer;

    #[async_trait]
    impl WorkflowResumer for NoopResumer {
        async fn resume_workflow(&self, _workflow_id: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn scan_marks_stale_workflow_failed_when_auto_resume_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let manager: Arc<dyn StateManager> =
            Arc::new(FileStateManager::new(dir.path().join("state")).unwrap());
        let mut state = WorkflowState::initialize("p");
        state.status = WorkflowStatus::Running;
        state.heartbeat_at = Some(chrono::Utc::now() - ChronoDuration::minutes(5));
        manager.save(&state).await.unwrap();
        manager.set_workflow_running(&state.workflow_id).await.unwrap();

        let tracker = Arc::new(InProcessTracker::new());
        let detector = ZombieDetector::new(manager.clone(), tracker, config(), Arc::new(NoopResumer));
        detector.scan_once().await.unwrap();

        let reloaded = manager.load(&state.workflow_id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, WorkflowStatus::Failed);
    }

    #[tokio::test]
    async fn scan_auto_resumes_when_enabled_and_under_budget() {
        let dir = tempfile::tempdir().unwrap();
        let manager: Arc<dyn StateManager> =
            Arc::new(FileStateManager::new(dir.path().join("state")).unwrap());
        let mut state = WorkflowState::initialize("p");
        state.status = WorkflowStatus::Running;
        state.heartbeat_at = Some(chrono::Utc::now() - ChronoDuration::minutes(5));
        manager.save(&state).await.unwrap();
        manager.set_workflow_running(&state.workflow_id).await.unwrap();

        let mut cfg = config();
        cfg.auto_resume = true;
        let tracker = Arc::new(InProcessTracker::new());
        let detector = ZombieDetector::new(manager.clone(), tracker, cfg, Arc::new(NoopResumer));
        detector.scan_once().await.unwrap();

        let reloaded = manager.load(&state.workflow_id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, WorkflowStatus::Paused);
        assert_eq!(reloaded.resume_count, 1);
    }

    #[tokio::test]
    async fn in_process_tracker_protects_actively_touched_workflow() {
        let tracker = InProcessTracker::new();
        tracker.touch("wf-1").await;
        assert!(tracker.is_active("wf-1", std::time::Duration::from_secs(10)).await);
        assert!(!tracker.is_active("wf-unknown", std::time::Duration::from_secs(10)).await);
    }
}
