//! Phase 4: the Executor.
//!
//! Runs the task DAG level by level — every task in a level is ready
//! (dependencies satisfied) and runs concurrently, bounded by a configured
//! concurrency cap; the next level only starts once the current one's
//! checkpoints are written. Each task goes through rate limit → render →
//! retry → validate output.

use crate::agents::{AgentRegistry, ExecuteParams, ExecuteResult, OutputFormat};
use crate::checkpoint::CheckpointWriter;
use crate::config::MergeStrategy;
use crate::dag::{DagBuilder, TaskGraph};
use crate::errors::{DomainError, ErrorKind, Result};
use crate::interfaces::{
    LogLevel, ModeEnforcer, Operation, OutputNotifier, PromptRenderer, RateLimiterGetter,
    ReportWriter, TaskExecuteParams,
};
use crate::isolation::IsolationManager;
use crate::retry::BackoffRetryExecutor;
use crate::workflow::{Phase, TaskState, TaskStatus, WorkflowState};
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Names a task's work as needing real output, so an empty or token-free
/// result on one of these is treated as a failure rather than a no-op
/// success.
const IMPLEMENTATION_KEYWORDS: &[&str] = &["implement", "create", "add", "build"];

/// Detects whether a task's work directory has uncommitted changes after
/// execution. The engine's own isolation manager is the real implementation;
/// this seam lets the executor run standalone (and be tested) before that
/// manager exists.
pub trait GitChangeDetector: Send + Sync {
    fn has_changes(&self, work_dir: &std::path::Path) -> bool;
}

pub struct NoGitChangeDetector;

impl GitChangeDetector for NoGitChangeDetector {
    fn has_changes(&self, _work_dir: &std::path::Path) -> bool {
        false
    }
}

struct TaskOutcome {
    id: String,
    status: TaskStatus,
    output: Option<String>,
    tokens_in: u64,
    tokens_out: u64,
    cost_usd: f64,
    error: Option<String>,
    worktree_path: Option<String>,
    task_branch: Option<String>,
    merge_pending: bool,
}

pub struct Executor {
    registry: Arc<dyn AgentRegistry>,
    renderer: Arc<dyn PromptRenderer>,
    report_writer: Arc<dyn ReportWriter>,
    notifier: Arc<dyn OutputNotifier>,
    mode_enforcer: Arc<dyn ModeEnforcer>,
    rate_limiter_getter: Arc<dyn RateLimiterGetter>,
    git_change_detector: Arc<dyn GitChangeDetector>,
    retry_executor: Arc<BackoffRetryExecutor>,
    isolation: Option<Arc<dyn IsolationManager>>,
    concurrency: usize,
    timeout: Duration,
    max_cost_per_task: f64,
    max_cost_per_workflow: f64,
}

impl Executor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<dyn AgentRegistry>,
        renderer: Arc<dyn PromptRenderer>,
        report_writer: Arc<dyn ReportWriter>,
        notifier: Arc<dyn OutputNotifier>,
        mode_enforcer: Arc<dyn ModeEnforcer>,
        rate_limiter_getter: Arc<dyn RateLimiterGetter>,
        git_change_detector: Arc<dyn GitChangeDetector>,
        retry_executor: Arc<BackoffRetryExecutor>,
        isolation: Option<Arc<dyn IsolationManager>>,
        concurrency: usize,
        timeout: Duration,
        max_cost_per_task: f64,
        max_cost_per_workflow: f64,
    ) -> Self {
        Self {
            registry,
            renderer,
            report_writer,
            notifier,
            mode_enforcer,
            rate_limiter_getter,
            git_change_detector,
            retry_executor,
            isolation,
            concurrency: concurrency.max(1),
            timeout,
            max_cost_per_task,
            max_cost_per_workflow,
        }
    }

    pub async fn run(&self, state: &mut WorkflowState) -> Result<()> {
        if state.is_phase_completed(Phase::Execute) {
            self.notifier.task_skipped(&state.workflow_id, "execute");
            return Ok(());
        }

        self.notifier.phase_started(&state.workflow_id, Phase::Execute);
        CheckpointWriter::phase_start(state, Phase::Execute);

        let mut builder = DagBuilder::new();
        for id in &state.task_order {
            builder.add_task(id.clone())?;
        }
        for id in &state.task_order {
            let deps = state.tasks[id].dependencies.clone();
            for dep in deps {
                builder.add_dependency(id, &dep)?;
            }
        }
        let graph = builder.build()?;

        let workflow_branch = if let Some(isolation) = &self.isolation {
            match isolation.initialize_workflow(&state.workflow_id).await {
                Ok(branch) => Some(branch),
                Err(err) => {
                    self.notifier.log(
                        LogLevel::Warn,
                        "executor",
                        &format!("failed to initialize git isolation, running in-place: {err}"),
                    );
                    None
                }
            }
        } else {
            None
        };

        let mut completed: HashSet<String> = state.completed_task_ids().into_iter().collect();

        loop {
            let ready = graph.ready_tasks(&completed);
            if ready.is_empty() {
                break;
            }

            for id in &ready {
                CheckpointWriter::task_start(state, id);
                if let Some(task) = state.tasks.get_mut(id) {
                    task.status = TaskStatus::Running;
                }
                self.notifier.task_started(&state.workflow_id, id);
            }

            let snapshots: Vec<(TaskState, Vec<String>)> = ready
                .iter()
                .map(|id| {
                    let task = state.tasks[id].clone();
                    let dependency_outputs: Vec<String> = task
                        .dependencies
                        .iter()
                        .filter_map(|d| state.tasks.get(d))
                        .filter_map(|t| t.output.clone())
                        .collect();
                    (task, dependency_outputs)
                })
                .collect();

            let attachments_context: Vec<String> = state
                .attachments
                .iter()
                .map(|a| format!("{} ({})", a.name, a.path))
                .collect();

            let workflow_id = state.workflow_id.clone();
            let outcomes: Vec<TaskOutcome> = stream::iter(snapshots.into_iter().map(|(task, deps)| {
                let attachments_context = attachments_context.clone();
                let workflow_id = workflow_id.clone();
                let workflow_branch = workflow_branch.clone();
                async move {
                    self.execute_task(&workflow_id, workflow_branch.as_deref(), task, deps, attachments_context)
                        .await
                }
            }))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

            for outcome in outcomes {
                self.apply_outcome(state, outcome);
            }

            self.merge_pending_tasks(state, &ready, workflow_branch.as_deref()).await;

            if self.max_cost_per_workflow > 0.0
                && state.metrics.total_cost_usd > self.max_cost_per_workflow
            {
                self.fail_tasks_over_workflow_budget(state, &ready);
                let err = DomainError::Budget {
                    scope: "workflow".into(),
                    spent: state.metrics.total_cost_usd,
                    limit: self.max_cost_per_workflow,
                };
                CheckpointWriter::error(state, Phase::Execute, None, err.kind(), &err.to_string());
                return Err(err);
            }

            let failed_blocking: Vec<&String> = ready
                .iter()
                .filter(|id| {
                    state
                        .tasks
                        .get(*id)
                        .map(|t| t.status == TaskStatus::Failed)
                        .unwrap_or(false)
                })
                .collect();
            if !failed_blocking.is_empty() {
                return Err(DomainError::PermanentAgent {
                    agent: "executor".into(),
                    message: format!("task(s) failed: {failed_blocking:?}"),
                });
            }

            completed.extend(ready);
        }

        CheckpointWriter::phase_complete(state, Phase::Execute);
        Ok(())
    }

    async fn execute_task(
        &self,
        workflow_id: &str,
        workflow_branch: Option<&str>,
        task: TaskState,
        dependency_outputs: Vec<String>,
        attachments_context: Vec<String>,
    ) -> TaskOutcome {
        let empty_outcome = |status, error: Option<String>| TaskOutcome {
            id: task.id.clone(),
            status,
            output: None,
            tokens_in: 0,
            tokens_out: 0,
            cost_usd: 0.0,
            error,
            worktree_path: None,
            task_branch: None,
            merge_pending: false,
        };

        if self.mode_enforcer.is_dry_run() {
            return TaskOutcome {
                output: Some("dry run: execution skipped".into()),
                ..empty_outcome(TaskStatus::Skipped, None)
            };
        }

        let op = Operation {
            name: task.id.clone(),
            op_type: "task_execute".into(),
            tool: task.cli.clone(),
            has_side_effects: true,
            requires_confirmation: false,
            in_workspace: true,
            allowed_in_sandbox: false,
            is_destructive: false,
        };
        if let Err(err) = self.mode_enforcer.can_execute(&op) {
            return empty_outcome(TaskStatus::Failed, Some(err.to_string()));
        }

        let (agent, fellback) = self.registry.resolve(&task.cli);
        if fellback {
            self.notifier.log(
                LogLevel::Warn,
                "executor",
                &format!("task '{}' requested unknown agent '{}', using default", task.id, task.cli),
            );
        }

        let limiter = self.rate_limiter_getter.get(agent.name());
        limiter.acquire().await;

        let prompt = self.renderer.task_execute(&TaskExecuteParams {
            task_name: task.name.clone(),
            task_description: task.description.clone(),
            dependency_outputs,
            attachments_context,
        });

        let (work_dir, worktree_path, task_branch) = match (&self.isolation, workflow_branch) {
            (Some(isolation), Some(workflow_branch)) => {
                match isolation.create_task_worktree(workflow_id, &task.id).await {
                    Ok((path, branch)) => {
                        let path_string = path.to_string_lossy().to_string();
                        (path, Some(path_string), Some(branch))
                    }
                    Err(err) => {
                        self.notifier.log(
                            LogLevel::Warn,
                            "executor",
                            &format!(
                                "task '{}' worktree creation failed, running in-place: {err}",
                                task.id
                            ),
                        );
                        (PathBuf::from("."), None, None)
                    }
                }
            }
            _ => (
                task.worktree_path
                    .as_ref()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(".")),
                None,
                None,
            ),
        };

        let notifier = self.notifier.clone();
        let timeout = self.timeout;
        let result = self
            .retry_executor
            .execute_with_notify(
                || {
                    let agent = agent.clone();
                    let prompt = prompt.clone();
                    let work_dir = work_dir.clone();
                    async move {
                        agent
                            .execute(ExecuteParams {
                                prompt,
                                format: OutputFormat::Text,
                                model: task.model.clone(),
                                timeout,
                                sandbox: false,
                                phase: Phase::Execute,
                                work_dir,
                            })
                            .await
                    }
                },
                |attempt, err| {
                    notifier.log(
                        LogLevel::Warn,
                        "executor",
                        &format!("task '{}' retry {attempt}: {err}", task.id),
                    );
                },
            )
            .await;

        let mut outcome = match result {
            Ok(exec_result) => self.finish_task(&task, &work_dir, exec_result),
            Err(err) => empty_outcome(TaskStatus::Failed, Some(err.to_string())),
        };
        outcome.worktree_path = worktree_path.clone();
        outcome.task_branch = task_branch.clone();

        if outcome.status == TaskStatus::Completed {
            if let (Some(isolation), Some(workflow_branch), Some(task_branch)) =
                (&self.isolation, workflow_branch, &task_branch)
            {
                if isolation.merge_strategy() != MergeStrategy::Sequential {
                    outcome.merge_pending = true;
                } else {
                    match isolation.merge_task_to_workflow(task_branch, workflow_branch).await {
                        Ok(true) => {
                            if let Some(path) = &worktree_path {
                                if let Err(err) = isolation.remove_task_worktree(std::path::Path::new(path)).await {
                                    self.notifier.log(
                                        LogLevel::Warn,
                                        "executor",
                                        &format!("failed to remove worktree for task '{}': {err}", task.id),
                                    );
                                }
                            }
                        }
                        Ok(false) => {
                            outcome.status = TaskStatus::Failed;
                            outcome.error = Some(format!(
                                "merge of task branch '{task_branch}' into '{workflow_branch}' conflicted"
                            ));
                        }
                        Err(err) => {
                            outcome.status = TaskStatus::Failed;
                            outcome.error = Some(format!("merge failed: {err}"));
                        }
                    }
                }
            }
        }

        outcome
    }

    fn finish_task(
        &self,
        task: &TaskState,
        work_dir: &std::path::Path,
        result: ExecuteResult,
    ) -> TaskOutcome {
        let changed_files = self.git_change_detector.has_changes(work_dir);
        let has_real_work =
            result.tokens_out > 0 || result.has_file_modifying_tool_call() || changed_files;
        let looks_like_implementation = IMPLEMENTATION_KEYWORDS
            .iter()
            .any(|kw| task.name.to_lowercase().contains(kw));

        if !has_real_work && looks_like_implementation {
            return TaskOutcome {
                id: task.id.clone(),
                status: TaskStatus::Failed,
                output: Some(result.output),
                tokens_in: result.tokens_in,
                tokens_out: result.tokens_out,
                cost_usd: result.cost_usd,
                error: Some(
                    "no output tokens and no file changes for an implementation task".into(),
                ),
                worktree_path: None,
                task_branch: None,
                merge_pending: false,
            };
        }

        if self.max_cost_per_task > 0.0 && result.cost_usd > self.max_cost_per_task {
            return TaskOutcome {
                id: task.id.clone(),
                status: TaskStatus::Failed,
                output: Some(result.output),
                tokens_in: result.tokens_in,
                tokens_out: result.tokens_out,
                cost_usd: result.cost_usd,
                error: Some(format!(
                    "task cost {:.4} exceeded max_cost_per_task {:.4}",
                    result.cost_usd, self.max_cost_per_task
                )),
                worktree_path: None,
                task_branch: None,
                merge_pending: false,
            };
        }

        TaskOutcome {
            id: task.id.clone(),
            status: TaskStatus::Completed,
            output: Some(result.output),
            tokens_in: result.tokens_in,
            tokens_out: result.tokens_out,
            cost_usd: result.cost_usd,
            error: None,
            worktree_path: None,
            task_branch: None,
            merge_pending: false,
        }
    }

    /// Marks whichever just-completed task(s) in this level actually pushed
    /// the workflow total over `max_cost_per_workflow` as `Failed`, rather
    /// than leaving them `Completed` while only the phase fails. Walks the
    /// level in task order, accumulating cost from the tasks outside this
    /// level, so the first task whose own cost tips the running total past
    /// the limit (and anything after it) is the one charged with the
    /// overage.
    fn fail_tasks_over_workflow_budget(&self, state: &mut WorkflowState, ready: &[String]) {
        let this_level_cost: f64 = ready
            .iter()
            .filter_map(|id| state.tasks.get(id))
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.cost_usd)
            .sum();
        let mut running = state.metrics.total_cost_usd - this_level_cost;
        let mut over_budget = false;

        for id in ready {
            let Some(task) = state.tasks.get(id) else { continue };
            if task.status != TaskStatus::Completed {
                continue;
            }
            running += task.cost_usd;
            if !over_budget && running <= self.max_cost_per_workflow {
                continue;
            }
            over_budget = true;

            let message = format!(
                "workflow cost {:.4} exceeded max_cost_per_workflow {:.4}",
                running, self.max_cost_per_workflow
            );
            if let Some(task) = state.tasks.get_mut(id) {
                task.status = TaskStatus::Failed;
                task.error = Some(message.clone());
            }
            CheckpointWriter::error(state, Phase::Execute, Some(id.as_str()), ErrorKind::Budget, &message);
            self.notifier.task_failed(&state.workflow_id, id, &message);
        }
    }

    /// Merges every task in this level left `merge_pending` by
    /// [`execute_task`] once the whole level has finished, rather than as
    /// each task completes: what "batched (per-level)" and "parallel"
    /// merge strategies mean in practice. `Sequential` merges inline in
    /// `execute_task` and never leaves anything pending here.
    async fn merge_pending_tasks(
        &self,
        state: &mut WorkflowState,
        ready: &[String],
        workflow_branch: Option<&str>,
    ) {
        let Some(isolation) = self.isolation.clone() else { return };
        let Some(workflow_branch) = workflow_branch.map(str::to_string) else { return };
        let strategy = isolation.merge_strategy();
        if strategy == MergeStrategy::Sequential {
            return;
        }

        let pending: Vec<(String, String, Option<String>)> = ready
            .iter()
            .filter_map(|id| {
                let task = state.tasks.get(id)?;
                if !task.merge_pending {
                    return None;
                }
                let branch = task.branch.clone()?;
                Some((id.clone(), branch, task.worktree_path.clone()))
            })
            .collect();
        if pending.is_empty() {
            return;
        }

        let results: Vec<(String, Option<String>, Result<bool>)> = if strategy == MergeStrategy::Parallel {
            stream::iter(pending.into_iter().map(|(id, branch, worktree_path)| {
                let isolation = isolation.clone();
                let workflow_branch = workflow_branch.clone();
                async move {
                    let result = isolation.merge_task_to_workflow(&branch, &workflow_branch).await;
                    (id, worktree_path, result)
                }
            }))
            .buffer_unordered(self.concurrency)
            .collect()
            .await
        } else {
            let mut out = Vec::with_capacity(pending.len());
            for (id, branch, worktree_path) in pending {
                let result = isolation.merge_task_to_workflow(&branch, &workflow_branch).await;
                out.push((id, worktree_path, result));
            }
            out
        };

        for (id, worktree_path, result) in results {
            match result {
                Ok(true) => {
                    if let Some(task) = state.tasks.get_mut(&id) {
                        task.merge_pending = false;
                    }
                    if let Some(path) = worktree_path {
                        if let Err(err) = isolation.remove_task_worktree(std::path::Path::new(&path)).await {
                            self.notifier.log(
                                LogLevel::Warn,
                                "executor",
                                &format!("failed to remove worktree for task '{id}': {err}"),
                            );
                        }
                    }
                }
                Ok(false) => {
                    let message = format!(
                        "merge of task '{id}' branch into '{workflow_branch}' conflicted"
                    );
                    if let Some(task) = state.tasks.get_mut(&id) {
                        task.status = TaskStatus::Failed;
                        task.error = Some(message.clone());
                    }
                    CheckpointWriter::error(state, Phase::Execute, Some(id.as_str()), ErrorKind::Merge, &message);
                    self.notifier.task_failed(&state.workflow_id, &id, &message);
                }
                Err(err) => {
                    let message = format!("merge failed: {err}");
                    if let Some(task) = state.tasks.get_mut(&id) {
                        task.status = TaskStatus::Failed;
                        task.error = Some(message.clone());
                    }
                    CheckpointWriter::error(state, Phase::Execute, Some(id.as_str()), ErrorKind::Merge, &message);
                    self.notifier.task_failed(&state.workflow_id, &id, &message);
                }
            }
        }
    }

    fn apply_outcome(&self, state: &mut WorkflowState, outcome: TaskOutcome) {
        state.metrics.total_tokens_in += outcome.tokens_in;
        state.metrics.total_tokens_out += outcome.tokens_out;
        state.metrics.total_cost_usd += outcome.cost_usd;

        let workflow_id = state.workflow_id.clone();
        let report_writer = self.report_writer.clone();
        let id = outcome.id.clone();

        if let Some(task) = state.tasks.get_mut(&id) {
            task.status = outcome.status;
            task.tokens_in = outcome.tokens_in;
            task.tokens_out = outcome.tokens_out;
            task.cost_usd = outcome.cost_usd;
            task.error = outcome.error.clone();
            if outcome.status == TaskStatus::Failed {
                task.worktree_path = outcome.worktree_path.clone();
            }
            if outcome.status == TaskStatus::Completed {
                task.worktree_path = outcome.worktree_path.clone();
                task.branch = outcome.task_branch.clone();
                task.merge_pending = outcome.merge_pending;
            }
            if let Some(output) = outcome.output {
                let spill_id = id.clone();
                task.set_output(output, || format!("task-{spill_id}-output.txt"));
            }
        }

        match outcome.status {
            TaskStatus::Completed => {
                CheckpointWriter::task_complete(state, &id);
                self.notifier.task_completed(&workflow_id, &id);
            }
            TaskStatus::Failed => {
                let message = outcome.error.clone().unwrap_or_else(|| "task failed".into());
                CheckpointWriter::error(
                    state,
                    Phase::Execute,
                    Some(&id),
                    ErrorKind::PermanentAgent,
                    &message,
                );
                self.notifier.task_failed(&workflow_id, &id, &message);
                let _ = report_writer.write_error(&format!("task {id} failed: {message}"));
            }
            TaskStatus::Skipped => {
                self.notifier.task_skipped(&workflow_id, &id);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{ExecuteResult as AgentExecuteResult, MockAgent, MockAgentRegistry};
    use crate::interfaces::{
        DefaultModeEnforcer, DefaultRateLimiterGetter, FileReportWriter, PlainPromptRenderer,
        TracingNotifier,
    };

    fn harness(
        agents: Vec<Arc<dyn crate::agents::Agent>>,
        dry_run: bool,
    ) -> (Executor, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let report_writer = Arc::new(FileReportWriter::new(dir.path(), "wf-1").unwrap());
        let mut registry = MockAgentRegistry::new(agents[0].name().to_string());
        for agent in agents {
            registry = registry.with_agent(agent);
        }
        let executor = Executor::new(
            Arc::new(registry),
            Arc::new(PlainPromptRenderer),
            report_writer,
            Arc::new(TracingNotifier),
            Arc::new(DefaultModeEnforcer::new(vec![], false, dry_run)),
            Arc::new(DefaultRateLimiterGetter::new(4)),
            Arc::new(NoGitChangeDetector),
            Arc::new(BackoffRetryExecutor::new(1)),
            None,
            4,
            Duration::from_secs(5),
            0.0,
            0.0,
        );
        (executor, dir)
    }

    fn task(id: &str, name: &str, cli: &str, deps: Vec<&str>) -> TaskState {
        let mut t = TaskState::new(id, name, cli);
        t.dependencies = deps.into_iter().map(String::from).collect();
        t
    }

    /// Records every merge call it's given rather than shelling out to git,
    /// so tests can assert on when a merge actually ran.
    struct MockIsolationManager {
        strategy: MergeStrategy,
        merge_calls: std::sync::Mutex<Vec<String>>,
    }

    impl MockIsolationManager {
        fn new(strategy: MergeStrategy) -> Self {
            Self {
                strategy,
                merge_calls: std::sync::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl IsolationManager for MockIsolationManager {
        async fn initialize_workflow(&self, workflow_id: &str) -> Result<String> {
            Ok(format!("wf/{workflow_id}"))
        }

        async fn create_task_worktree(&self, workflow_id: &str, task_id: &str) -> Result<(PathBuf, String)> {
            Ok((PathBuf::from("."), format!("wf/{workflow_id}/{task_id}")))
        }

        async fn merge_task_to_workflow(&self, task_branch: &str, _workflow_branch: &str) -> Result<bool> {
            self.merge_calls.lock().unwrap().push(task_branch.to_string());
            Ok(true)
        }

        async fn remove_task_worktree(&self, _worktree_path: &std::path::Path) -> Result<()> {
            Ok(())
        }

        async fn cleanup_workflow(&self, _workflow_id: &str) -> Result<()> {
            Ok(())
        }

        fn workflow_branch(&self, workflow_id: &str) -> String {
            format!("wf/{workflow_id}")
        }

        fn task_branch(&self, workflow_id: &str, task_id: &str) -> String {
            format!("wf/{workflow_id}/{task_id}")
        }

        fn merge_strategy(&self) -> MergeStrategy {
            self.strategy
        }
    }

    #[tokio::test]
    async fn independent_tasks_all_complete() {
        let agent = Arc::new(MockAgent::new("mock-a", "did the work"));
        let (executor, _dir) = harness(vec![agent], false);
        let mut state = WorkflowState::initialize("prompt");
        state.add_task(task("a", "Setup repo", "mock-a", vec![]));
        state.add_task(task("b", "Write docs", "mock-a", vec![]));
        executor.run(&mut state).await.unwrap();
        assert!(state.is_phase_completed(Phase::Execute));
        assert_eq!(state.tasks["a"].status, TaskStatus::Completed);
        assert_eq!(state.tasks["b"].status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn dependent_task_runs_after_dependency_and_sees_its_output() {
        let agent = Arc::new(MockAgent::with_responses(
            "mock-a",
            vec![
                AgentExecuteResult {
                    output: "setup done".into(),
                    model: "m".into(),
                    tokens_in: 5,
                    tokens_out: 5,
                    cost_usd: 0.0,
                    duration: Duration::from_millis(1),
                    tool_calls: Vec::new(),
                },
                AgentExecuteResult {
                    output: "built on setup".into(),
                    model: "m".into(),
                    tokens_in: 5,
                    tokens_out: 5,
                    cost_usd: 0.0,
                    duration: Duration::from_millis(1),
                    tool_calls: Vec::new(),
                },
            ],
        ));
        let (executor, _dir) = harness(vec![agent], false);
        let mut state = WorkflowState::initialize("prompt");
        state.add_task(task("a", "Implement setup", "mock-a", vec![]));
        state.add_task(task("b", "Implement followup", "mock-a", vec!["a"]));
        executor.run(&mut state).await.unwrap();
        assert_eq!(state.tasks["a"].status, TaskStatus::Completed);
        assert_eq!(state.tasks["b"].status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn dry_run_skips_every_task_without_calling_agent() {
        let agent = Arc::new(MockAgent::new("mock-a", "should not be called"));
        let (executor, _dir) = harness(vec![agent], true);
        let mut state = WorkflowState::initialize("prompt");
        state.add_task(task("a", "Implement something", "mock-a", vec![]));
        executor.run(&mut state).await.unwrap();
        assert_eq!(state.tasks["a"].status, TaskStatus::Skipped);
    }

    #[tokio::test]
    async fn implementation_task_with_no_tokens_and_no_changes_fails() {
        let agent = Arc::new(MockAgent::with_responses(
            "mock-a",
            vec![AgentExecuteResult {
                output: String::new(),
                model: "m".into(),
                tokens_in: 0,
                tokens_out: 0,
                cost_usd: 0.0,
                duration: Duration::from_millis(1),
                tool_calls: Vec::new(),
            }],
        ));
        let (executor, _dir) = harness(vec![agent], false);
        let mut state = WorkflowState::initialize("prompt");
        state.add_task(task("a", "Implement the feature", "mock-a", vec![]));
        let err = executor.run(&mut state).await.unwrap_err();
        assert!(matches!(err, DomainError::PermanentAgent { .. }));
        assert_eq!(state.tasks["a"].status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn already_completed_phase_is_skipped() {
        let agent = Arc::new(MockAgent::new("mock-a", "output"));
        let (executor, _dir) = harness(vec![agent], false);
        let mut state = WorkflowState::initialize("prompt");
        CheckpointWriter::phase_complete(&mut state, Phase::Execute);
        let checkpoint_count_before = state.checkpoints.len();
        executor.run(&mut state).await.unwrap();
        assert_eq!(state.checkpoints.len(), checkpoint_count_before);
    }

    #[tokio::test]
    async fn parallel_merge_strategy_defers_merge_until_the_level_completes() {
        let agent = Arc::new(MockAgent::new("mock-a", "did the work"));
        let dir = tempfile::tempdir().unwrap();
        let report_writer = Arc::new(FileReportWriter::new(dir.path(), "wf-1").unwrap());
        let registry = MockAgentRegistry::new("mock-a".to_string()).with_agent(agent);
        let isolation: Arc<dyn IsolationManager> =
            Arc::new(MockIsolationManager::new(MergeStrategy::Parallel));
        let executor = Executor::new(
            Arc::new(registry),
            Arc::new(PlainPromptRenderer),
            report_writer,
            Arc::new(TracingNotifier),
            Arc::new(DefaultModeEnforcer::new(vec![], false, false)),
            Arc::new(DefaultRateLimiterGetter::new(4)),
            Arc::new(NoGitChangeDetector),
            Arc::new(BackoffRetryExecutor::new(1)),
            Some(isolation),
            4,
            Duration::from_secs(5),
            0.0,
            0.0,
        );
        let mut state = WorkflowState::initialize("prompt");
        state.add_task(task("a", "Setup repo", "mock-a", vec![]));
        state.add_task(task("b", "Write docs", "mock-a", vec![]));
        executor.run(&mut state).await.unwrap();
        assert_eq!(state.tasks["a"].status, TaskStatus::Completed);
        assert_eq!(state.tasks["b"].status, TaskStatus::Completed);
        assert!(!state.tasks["a"].merge_pending);
        assert!(!state.tasks["b"].merge_pending);
        assert!(state.tasks["a"].branch.is_some());
    }

    #[tokio::test]
    async fn workflow_budget_overage_fails_the_task_that_tips_it_over() {
        let agent_a = Arc::new(MockAgent::with_responses(
            "mock-a",
            vec![AgentExecuteResult {
                output: "a done".into(),
                model: "m".into(),
                tokens_in: 5,
                tokens_out: 5,
                cost_usd: 0.6,
                duration: Duration::from_millis(1),
                tool_calls: Vec::new(),
            }],
        ));
        let agent_b = Arc::new(MockAgent::with_responses(
            "mock-b",
            vec![AgentExecuteResult {
                output: "b done".into(),
                model: "m".into(),
                tokens_in: 5,
                tokens_out: 5,
                cost_usd: 0.5,
                duration: Duration::from_millis(1),
                tool_calls: Vec::new(),
            }],
        ));
        let dir = tempfile::tempdir().unwrap();
        let report_writer = Arc::new(FileReportWriter::new(dir.path(), "wf-1").unwrap());
        let registry = MockAgentRegistry::new("mock-a".to_string())
            .with_agent(agent_a)
            .with_agent(agent_b);
        let executor = Executor::new(
            Arc::new(registry),
            Arc::new(PlainPromptRenderer),
            report_writer,
            Arc::new(TracingNotifier),
            Arc::new(DefaultModeEnforcer::new(vec![], false, false)),
            Arc::new(DefaultRateLimiterGetter::new(4)),
            Arc::new(NoGitChangeDetector),
            Arc::new(BackoffRetryExecutor::new(1)),
            None,
            4,
            Duration::from_secs(5),
            0.0,
            1.0,
        );
        let mut state = WorkflowState::initialize("prompt");
        state.add_task(task("a", "Setup repo", "mock-a", vec![]));
        state.add_task(task("b", "Write docs", "mock-b", vec![]));
        let err = executor.run(&mut state).await.unwrap_err();
        assert!(matches!(err, DomainError::Budget { .. }));
        assert_eq!(state.tasks["a"].status, TaskStatus::Completed);
        assert_eq!(state.tasks["b"].status, TaskStatus::Failed);
    }
}
