//! Top-level orchestration.
//!
//! Wires every phase runner, the state store, heartbeat tracking, and git
//! isolation together over a single `WorkflowState`: four phases, each
//! independently resumable, bracketed by workflow-level locking, heartbeat
//! tracking, and crash recovery.

use crate::agents::{AgentRegistry, Capabilities};
use crate::checkpoint::CheckpointWriter;
use crate::config::QuorumToml;
use crate::errors::{DomainError, Result};
use crate::heartbeat::{HeartbeatWriter, InProcessTracker, WorkflowResumer, ZombieDetector};
use crate::interfaces::{
    DefaultModeEnforcer, DefaultRateLimiterGetter, FileReportWriter, LogLevel, OutputNotifier,
    PlainPromptRenderer, ReportWriter, TracingNotifier,
};
use crate::isolation::{GitIsolationManager, IsolationManager, WorktreeChangeDetector};
use crate::phases::analyzer::ExecutionMode as AnalyzerExecutionMode;
use crate::phases::{Analyzer, Executor, Planner, Refiner};
use crate::recovery::RecoveryManager;
use crate::retry::BackoffRetryExecutor;
use crate::workflow::{Phase, StateManager, WorkflowState, WorkflowStatus};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Owns everything a run needs beyond the per-workflow `WorkflowState`:
/// the config, the state store, the agent registry, and where the repo and
/// reports live on disk. One `Runner` is built per process and reused
/// across every workflow it drives.
pub struct Runner {
    state_manager: Arc<dyn StateManager>,
    registry: Arc<dyn AgentRegistry>,
    config: QuorumToml,
    repo_path: PathBuf,
    reports_root: PathBuf,
    notifier: Arc<dyn OutputNotifier>,
    tracker: Arc<InProcessTracker>,
}

impl Runner {
    pub fn new(
        state_manager: Arc<dyn StateManager>,
        registry: Arc<dyn AgentRegistry>,
        config: QuorumToml,
        repo_path: impl Into<PathBuf>,
    ) -> Self {
        let repo_path = repo_path.into();
        let reports_root = repo_path.join(&config.report.base_dir);
        Self {
            state_manager,
            registry,
            config,
            repo_path,
            reports_root,
            notifier: Arc::new(TracingNotifier),
            tracker: Arc::new(InProcessTracker::new()),
        }
    }

    /// Recovers every workflow a prior process left `Running` with no
    /// chance to clean up. Call once at startup, before accepting new work
    /// — the zombie detector covers the equivalent case for a process
    /// that is still alive but has gone quiet.
    pub async fn recover_crashed_workflows(&self) -> Result<Vec<String>> {
        let recovery = RecoveryManager::new(self.state_manager.clone(), &self.repo_path);
        recovery.recover_all().await
    }

    /// Spawns the background zombie scan. The returned handle should be
    /// aborted on clean shutdown; left running otherwise. Requires an
    /// `Arc<Runner>` since the detector needs to hand itself back to the
    /// detector as the thing that re-enters the phase pipeline on
    /// auto-resume.
    pub fn spawn_zombie_detector(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let resumer: Arc<dyn WorkflowResumer> = self.clone();
        let detector = Arc::new(ZombieDetector::new(
            self.state_manager.clone(),
            self.tracker.clone(),
            self.config.heartbeat.clone(),
            resumer,
        ));
        detector.spawn()
    }

    /// Starts a brand new workflow from a prompt.
    pub async fn start(&self, prompt: impl Into<String>) -> Result<WorkflowState> {
        let state = WorkflowState::initialize(prompt);
        self.drive(state).await
    }

    /// Resumes a previously paused or crashed workflow from its checkpoint
    /// log's resume point.
    pub async fn resume(&self, workflow_id: &str) -> Result<WorkflowState> {
        let state = self
            .state_manager
            .load(workflow_id)
            .await?
            .ok_or_else(|| DomainError::NoStateToResume {
                workflow_id: workflow_id.to_string(),
            })?;
        self.drive(state).await
    }

    async fn drive(&self, mut state: WorkflowState) -> Result<WorkflowState> {
        if state.prompt.trim().is_empty() {
            return Err(DomainError::Validation("prompt must not be empty".into()));
        }

        let workflow_id = state.workflow_id.clone();
        let _lock = self.state_manager.acquire_workflow_lock(&workflow_id).await?;
        let report_writer: Arc<dyn ReportWriter> =
            Arc::new(FileReportWriter::new(&self.reports_root, &workflow_id)?);

        state.status = WorkflowStatus::Running;
        state.report_path = Some(self.reports_root.join(&workflow_id).to_string_lossy().to_string());
        self.state_manager.set_workflow_running(&workflow_id).await?;
        self.state_manager.save(&state).await?;
        self.notifier.workflow_state_updated(&workflow_id, "running");

        let heartbeat_writer = HeartbeatWriter::new(
            self.state_manager.clone(),
            self.tracker.clone(),
            self.config.heartbeat.clone(),
        );
        self.tracker.touch(&workflow_id).await;
        let heartbeat_handle = heartbeat_writer.spawn(workflow_id.clone());

        let result = self.run_phases(&mut state, report_writer.clone()).await;

        heartbeat_handle.abort();
        self.tracker.forget(&workflow_id).await;

        match result {
            Ok(()) => {
                self.finalize(&workflow_id).await;
                state.status = WorkflowStatus::Completed;
                self.state_manager.save(&state).await?;
                self.state_manager.clear_workflow_running(&workflow_id).await?;
                self.notifier.workflow_state_updated(&workflow_id, "completed");
                info!(workflow_id, "workflow completed");
                Ok(state)
            }
            Err(err) => {
                let phase = state.current_phase;
                CheckpointWriter::error(&mut state, phase, None, err.kind(), &err.to_string());
                state.status = if err.is_cancellation() {
                    WorkflowStatus::Aborted
                } else {
                    WorkflowStatus::Failed
                };
                let _ = report_writer.write_error(&format!("{err}"));
                self.state_manager.save(&state).await?;
                self.state_manager.clear_workflow_running(&workflow_id).await?;
                self.notifier.workflow_state_updated(&workflow_id, "failed");
                Err(err)
            }
        }
    }

    async fn run_phases(&self, state: &mut WorkflowState, report_writer: Arc<dyn ReportWriter>) -> Result<()> {
        let renderer = Arc::new(PlainPromptRenderer);

        state.current_phase = Phase::Refine;
        let refiner = Refiner::new(
            self.registry.clone(),
            renderer.clone(),
            report_writer.clone(),
            self.notifier.clone(),
            self.config.refiner.agent.clone(),
            self.config.refiner.enabled,
            self.config.workflow.dry_run,
        );
        refiner.run(state).await?;

        state.current_phase = Phase::Analyze;
        let analyzer_mode = match self.config.execution_mode {
            crate::config::ExecutionMode::SingleAgent => AnalyzerExecutionMode::SingleAgent,
            crate::config::ExecutionMode::MultiAgent => AnalyzerExecutionMode::MultiAgent,
        };
        let analyzer_agents = self.registry.available_for_phase(Phase::Analyze).await;
        let analyzer = Analyzer::new(
            self.registry.clone(),
            renderer.clone(),
            report_writer.clone(),
            self.notifier.clone(),
            analyzer_mode,
            self.config.single_agent.agent.clone(),
            analyzer_agents,
            self.config.moderator.clone(),
            self.config.phases.analyze(),
        );
        analyzer.run(state).await?;

        state.current_phase = Phase::Plan;
        let available_agents = self.describe_available_agents(Phase::Plan).await;
        let planner = Planner::new(
            self.registry.clone(),
            renderer.clone(),
            report_writer.clone(),
            self.notifier.clone(),
            self.config.single_agent.agent.clone(),
            available_agents,
            self.config.phases.plan(),
        );
        planner.run(state).await?;

        state.current_phase = Phase::Execute;
        let isolation = self.build_isolation_manager();
        let mode_enforcer = Arc::new(DefaultModeEnforcer::new(
            self.config.workflow.deny_tools.clone(),
            false,
            self.config.workflow.dry_run,
        ));
        let rate_limiter_getter = Arc::new(DefaultRateLimiterGetter::new(
            self.config.workflow.rate_limit_permits_per_agent,
        ));
        let retry_executor = Arc::new(BackoffRetryExecutor::new(self.config.workflow.max_retries));
        let executor = Executor::new(
            self.registry.clone(),
            renderer,
            report_writer,
            self.notifier.clone(),
            mode_enforcer,
            rate_limiter_getter,
            Arc::new(WorktreeChangeDetector),
            retry_executor,
            isolation,
            self.config.workflow.concurrency,
            self.config.phases.execute(),
            self.config.max_cost_per_task,
            self.config.max_cost_per_workflow,
        );
        executor.run(state).await?;

        Ok(())
    }

    /// Opens the one workflow-level pull request, gated on
    /// `config.finalization.auto_pr`. A `gh pr create` failure is logged and
    /// swallowed rather than failing an otherwise-completed workflow; the
    /// branch and the merged work are still there even if this step can't
    /// reach GitHub.
    async fn finalize(&self, workflow_id: &str) {
        if !self.config.finalization.auto_pr {
            return;
        }
        let Some(isolation) = self.build_isolation_manager() else {
            return;
        };
        let workflow_branch = isolation.workflow_branch(workflow_id);
        let title = format!("[quorum] Workflow {workflow_id}");
        let body = format!("Automated pull request for workflow `{workflow_id}`.");

        let output = tokio::process::Command::new("gh")
            .args([
                "pr",
                "create",
                "--title",
                &title,
                "--body",
                &body,
                "--base",
                &self.config.finalization.pr_base_branch,
                "--head",
                &workflow_branch,
            ])
            .current_dir(&self.repo_path)
            .output()
            .await;

        match output {
            Ok(output) if output.status.success() => {
                let url = String::from_utf8_lossy(&output.stdout).trim().to_string();
                info!(workflow_id, pr_url = %url, "opened finalization pull request");
            }
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                self.notifier.log(
                    LogLevel::Warn,
                    "runner",
                    &format!("gh pr create failed for workflow {workflow_id}: {stderr}"),
                );
            }
            Err(err) => {
                self.notifier.log(
                    LogLevel::Warn,
                    "runner",
                    &format!("failed to run gh pr create for workflow {workflow_id}: {err}"),
                );
            }
        }
    }

    fn build_isolation_manager(&self) -> Option<Arc<dyn IsolationManager>> {
        if !self.config.git_isolation.enabled {
            return None;
        }
        Some(Arc::new(GitIsolationManager::new(
            &self.repo_path,
            self.config.git_isolation.base_branch.clone(),
            self.config.git_isolation.merge_strategy,
        )))
    }

    /// Builds the `(name, strengths)` pairs the planner's prompt shows the
    /// agent as its menu of downstream executors.
    async fn describe_available_agents(&self, phase: Phase) -> Vec<(String, String)> {
        self.registry
            .available_for_phase(phase)
            .await
            .into_iter()
            .map(|name| {
                let strengths = self
                    .registry
                    .get(&name)
                    .map(|agent| describe_capabilities(&agent.capabilities()))
                    .unwrap_or_else(|| "general purpose".to_string());
                (name, strengths)
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl WorkflowResumer for Runner {
    async fn resume_workflow(&self, workflow_id: &str) -> Result<()> {
        self.resume(workflow_id).await.map(|_| ())
    }
}

fn describe_capabilities(caps: &Capabilities) -> String {
    let mut parts = Vec::new();
    if caps.supports_tools {
        parts.push("tool use");
    }
    if caps.supports_images {
        parts.push("image input");
    }
    if caps.supports_streaming {
        parts.push("streaming output");
    }
    if parts.is_empty() {
        "general purpose".to_string()
    } else {
        parts.join(", ")
    }
}
