//! The remaining external interfaces: `PromptRenderer`, `RateLimiterGetter`,
//! `ModeEnforcer`, `ReportWriter`, `OutputNotifier`.
//!
//! Each is an interface abstraction over a concrete service, consumed only
//! through its capability set — the engine owns no templating engine and
//! no transport.

use crate::errors::{DomainError, Result};
use crate::workflow::Phase;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

// ---------------------------------------------------------------------
// PromptRenderer
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RefinePromptParams {
    pub original_prompt: String,
}

#[derive(Debug, Clone)]
pub struct AnalyzeV1Params {
    pub prompt: String,
}

#[derive(Debug, Clone)]
pub struct AnalyzeVnRefineParams {
    pub prompt: String,
    pub round: u32,
    pub agreements: Vec<String>,
    pub divergences: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ModeratorEvaluateParams {
    pub round: u32,
    pub analyses: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SynthesizeAnalysisParams {
    pub accepted_outputs: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PlanComprehensiveParams {
    pub effective_prompt: String,
    pub consolidated_analysis: String,
    pub available_agents: Vec<(String, String)>,
    pub tasks_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct TaskExecuteParams {
    pub task_name: String,
    pub task_description: String,
    pub dependency_outputs: Vec<String>,
    pub attachments_context: Vec<String>,
}

/// One render operation per template; each takes a typed parameter record.
pub trait PromptRenderer: Send + Sync {
    fn refine_prompt(&self, params: &RefinePromptParams) -> String;
    fn analyze_v1(&self, params: &AnalyzeV1Params) -> String;
    fn analyze_vn_refine(&self, params: &AnalyzeVnRefineParams) -> String;
    fn moderator_evaluate(&self, params: &ModeratorEvaluateParams) -> String;
    fn synthesize_analysis(&self, params: &SynthesizeAnalysisParams) -> String;
    fn plan_comprehensive(&self, params: &PlanComprehensiveParams) -> String;
    fn task_execute(&self, params: &TaskExecuteParams) -> String;
}

/// Plain-text templates — good enough for the engine's own tests; a richer
/// renderer (handlebars/tera) is an external collaborator.
pub struct PlainPromptRenderer;

impl PromptRenderer for PlainPromptRenderer {
    fn refine_prompt(&self, params: &RefinePromptParams) -> String {
        format!(
            "Refine the following request into a clearer, more actionable prompt.\n\n{}",
            params.original_prompt
        )
    }

    fn analyze_v1(&self, params: &AnalyzeV1Params) -> String {
        format!("Analyze the following request in depth.\n\n{}", params.prompt)
    }

    fn analyze_vn_refine(&self, params: &AnalyzeVnRefineParams) -> String {
        format!(
            "Round {} analysis. Prior agreements: {:?}. Prior divergences: {:?}.\n\n{}",
            params.round, params.agreements, params.divergences, params.prompt
        )
    }

    fn moderator_evaluate(&self, params: &ModeratorEvaluateParams) -> String {
        format!(
            "Evaluate consensus across {} analyses for round {}. Respond with CONSENSUS_SCORE: NN%.\n\n{}",
            params.analyses.len(),
            params.round,
            params.analyses.join("\n---\n")
        )
    }

    fn synthesize_analysis(&self, params: &SynthesizeAnalysisParams) -> String {
        format!(
            "Synthesize a single consolidated markdown analysis from these inputs:\n\n{}",
            params.accepted_outputs.join("\n---\n")
        )
    }

    fn plan_comprehensive(&self, params: &PlanComprehensiveParams) -> String {
        let agents = params
            .available_agents
            .iter()
            .map(|(name, strengths)| format!("- {name}: {strengths}"))
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "Produce a task plan for:\n{}\n\nAnalysis:\n{}\n\nAvailable agents:\n{}\n\nWrite task files into {} as task-N-<name>.md and return a JSON manifest.",
            params.effective_prompt,
            params.consolidated_analysis,
            agents,
            params.tasks_dir.display()
        )
    }

    fn task_execute(&self, params: &TaskExecuteParams) -> String {
        format!(
            "Task: {}\n\n{}\n\nDependency outputs:\n{}\n\nAttachments:\n{}",
            params.task_name,
            params.task_description,
            params.dependency_outputs.join("\n---\n"),
            params.attachments_context.join("\n")
        )
    }
}

// ---------------------------------------------------------------------
// RateLimiterGetter
// ---------------------------------------------------------------------

/// A blocking gate, one per agent name.
pub struct RateLimiter {
    semaphore: Semaphore,
}

impl RateLimiter {
    pub fn new(permits: usize) -> Self {
        Self {
            semaphore: Semaphore::new(permits),
        }
    }

    pub async fn acquire(&self) {
        // Leaked permit: the gate is released by dropping the whole
        // limiter, not per-call, so callers don't need to hold a guard
        // across await points they don't control.
        self.semaphore.acquire().await.expect("semaphore closed").forget();
    }
}

pub trait RateLimiterGetter: Send + Sync {
    fn get(&self, agent_name: &str) -> std::sync::Arc<RateLimiter>;
}

pub struct DefaultRateLimiterGetter {
    limiters: Mutex<HashMap<String, std::sync::Arc<RateLimiter>>>,
    permits_per_agent: usize,
}

impl DefaultRateLimiterGetter {
    pub fn new(permits_per_agent: usize) -> Self {
        Self {
            limiters: Mutex::new(HashMap::new()),
            permits_per_agent,
        }
    }
}

impl RateLimiterGetter for DefaultRateLimiterGetter {
    fn get(&self, agent_name: &str) -> std::sync::Arc<RateLimiter> {
        let mut limiters = self.limiters.lock().expect("rate limiter mutex poisoned");
        limiters
            .entry(agent_name.to_string())
            .or_insert_with(|| std::sync::Arc::new(RateLimiter::new(self.permits_per_agent)))
            .clone()
    }
}

// ---------------------------------------------------------------------
// ModeEnforcer
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Operation {
    pub name: String,
    pub op_type: String,
    pub tool: String,
    pub has_side_effects: bool,
    pub requires_confirmation: bool,
    pub in_workspace: bool,
    pub allowed_in_sandbox: bool,
    pub is_destructive: bool,
}

pub trait ModeEnforcer: Send + Sync {
    fn can_execute(&self, op: &Operation) -> Result<()>;
    fn is_sandboxed(&self) -> bool;
    fn is_dry_run(&self) -> bool;
}

/// Enforces `workflow.deny_tools` and dry-run gating; everything else is
/// permitted.
pub struct DefaultModeEnforcer {
    deny_tools: Vec<String>,
    sandboxed: bool,
    dry_run: bool,
}

impl DefaultModeEnforcer {
    pub fn new(deny_tools: Vec<String>, sandboxed: bool, dry_run: bool) -> Self {
        Self {
            deny_tools,
            sandboxed,
            dry_run,
        }
    }
}

impl ModeEnforcer for DefaultModeEnforcer {
    fn can_execute(&self, op: &Operation) -> Result<()> {
        if self.deny_tools.iter().any(|t| t == &op.tool) {
            return Err(DomainError::Policy {
                operation: op.name.clone(),
                reason: format!("tool '{}' is denied by configuration", op.tool),
            });
        }
        if self.sandboxed && op.has_side_effects && !op.allowed_in_sandbox {
            return Err(DomainError::Policy {
                operation: op.name.clone(),
                reason: "side-effecting operation not allowed in sandbox".into(),
            });
        }
        if self.dry_run && op.has_side_effects {
            return Err(DomainError::Policy {
                operation: op.name.clone(),
                reason: "side-effecting operation suppressed by dry-run".into(),
            });
        }
        Ok(())
    }

    fn is_sandboxed(&self) -> bool {
        self.sandboxed
    }

    fn is_dry_run(&self) -> bool {
        self.dry_run
    }
}

// ---------------------------------------------------------------------
// ReportWriter
// ---------------------------------------------------------------------

pub trait ReportWriter: Send + Sync {
    fn moderator_report_path(&self, round: u32) -> PathBuf;
    fn write_moderator_report(&self, round: u32, data: &str) -> Result<()>;
    fn write_original_prompt(&self, s: &str) -> Result<()>;
    fn write_refined_prompt(&self, s: &str, metrics: &str) -> Result<()>;
    fn write_task_plan(&self, content: &str) -> Result<()>;
    fn ensure_tasks_dir(&self) -> Result<PathBuf>;
    fn tasks_dir(&self) -> PathBuf;
    fn write_error(&self, content: &str) -> Result<()>;
    fn write_consolidated_analysis(&self, content: &str) -> Result<()>;
    fn consolidated_analysis_path(&self) -> PathBuf;
}

/// Writes into `reports/<workflow-id>/...`, the persisted state layout.
pub struct FileReportWriter {
    base_dir: PathBuf,
}

impl FileReportWriter {
    pub fn new(reports_root: impl AsRef<Path>, workflow_id: &str) -> Result<Self> {
        let base_dir = reports_root.as_ref().join(workflow_id);
        std::fs::create_dir_all(base_dir.join("analyze-phase"))
            .map_err(|e| DomainError::Internal(format!("failed to create report dir: {e}")))?;
        std::fs::create_dir_all(base_dir.join("plan").join("tasks"))
            .map_err(|e| DomainError::Internal(format!("failed to create plan dir: {e}")))?;
        std::fs::create_dir_all(base_dir.join("attachments"))
            .map_err(|e| DomainError::Internal(format!("failed to create attachments dir: {e}")))?;
        Ok(Self { base_dir })
    }

    fn write(&self, rel: impl AsRef<Path>, content: &str) -> Result<()> {
        let path = self.base_dir.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| DomainError::Internal(format!("failed to create dir: {e}")))?;
        }
        std::fs::write(&path, content)
            .map_err(|e| DomainError::Internal(format!("failed to write {}: {e}", path.display())))
    }
}

impl ReportWriter for FileReportWriter {
    fn moderator_report_path(&self, round: u32) -> PathBuf {
        self.base_dir
            .join("analyze-phase")
            .join(format!("moderator-round-{round}.md"))
    }

    fn write_moderator_report(&self, round: u32, data: &str) -> Result<()> {
        self.write(
            Path::new("analyze-phase").join(format!("moderator-round-{round}.md")),
            data,
        )
    }

    fn write_original_prompt(&self, s: &str) -> Result<()> {
        self.write("original-prompt.md", s)
    }

    fn write_refined_prompt(&self, s: &str, metrics: &str) -> Result<()> {
        self.write("refined-prompt.md", &format!("{s}\n\n<!-- {metrics} -->\n"))
    }

    fn write_task_plan(&self, content: &str) -> Result<()> {
        self.write(Path::new("plan").join("execution-graph.md"), content)
    }

    fn ensure_tasks_dir(&self) -> Result<PathBuf> {
        let dir = self.tasks_dir();
        std::fs::create_dir_all(&dir)
            .map_err(|e| DomainError::Internal(format!("failed to create tasks dir: {e}")))?;
        Ok(dir)
    }

    fn tasks_dir(&self) -> PathBuf {
        self.base_dir.join("plan").join("tasks")
    }

    fn write_error(&self, content: &str) -> Result<()> {
        self.write("error.md", content)
    }

    fn write_consolidated_analysis(&self, content: &str) -> Result<()> {
        self.write(Path::new("analyze-phase").join("consolidated.md"), content)
    }

    fn consolidated_analysis_path(&self) -> PathBuf {
        self.base_dir.join("analyze-phase").join("consolidated.md")
    }
}

// ---------------------------------------------------------------------
// OutputNotifier
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentEventKind {
    Started,
    Output,
    Completed,
    Failed,
}

pub trait OutputNotifier: Send + Sync {
    fn log(&self, level: LogLevel, source: &str, message: &str);
    fn phase_started(&self, workflow_id: &str, phase: Phase);
    fn task_started(&self, workflow_id: &str, task_id: &str);
    fn task_completed(&self, workflow_id: &str, task_id: &str);
    fn task_failed(&self, workflow_id: &str, task_id: &str, reason: &str);
    fn task_skipped(&self, workflow_id: &str, task_id: &str);
    fn workflow_state_updated(&self, workflow_id: &str, status: &str);
    fn agent_event(&self, kind: AgentEventKind, agent: &str, message: &str);
}

/// Structured-logging notifier: every event is a `tracing` span/event keyed
/// by `workflow_id`/`phase`/`task_id`, matching the ambient logging stack.
/// A first-class concrete `OutputNotifier`.
pub struct TracingNotifier;

impl OutputNotifier for TracingNotifier {
    fn log(&self, level: LogLevel, source: &str, message: &str) {
        match level {
            LogLevel::Debug => tracing::debug!(source, message),
            LogLevel::Info => info!(source, message),
            LogLevel::Warn => warn!(source, message),
            LogLevel::Error => error!(source, message),
        }
    }

    fn phase_started(&self, workflow_id: &str, phase: Phase) {
        info!(workflow_id, %phase, "phase started");
    }

    fn task_started(&self, workflow_id: &str, task_id: &str) {
        info!(workflow_id, task_id, "task started");
    }

    fn task_completed(&self, workflow_id: &str, task_id: &str) {
        info!(workflow_id, task_id, "task completed");
    }

    fn task_failed(&self, workflow_id: &str, task_id: &str, reason: &str) {
        warn!(workflow_id, task_id, reason, "task failed");
    }

    fn task_skipped(&self, workflow_id: &str, task_id: &str) {
        info!(workflow_id, task_id, "task skipped (already completed)");
    }

    fn workflow_state_updated(&self, workflow_id: &str, status: &str) {
        info!(workflow_id, status, "workflow state updated");
    }

    fn agent_event(&self, kind: AgentEventKind, agent: &str, message: &str) {
        info!(agent, kind = ?kind, message);
    }
}
