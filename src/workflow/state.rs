//! The persisted data model: `WorkflowState`, `TaskState`, `Checkpoint`.
//!
//! Tagged variants throughout — no string-typing at boundaries. Mutation is
//! the job of the phase runners and [`super::store`]; this module only
//! defines the shape and a handful of pure derivations (`is_phase_completed`,
//! `resume_point`) that read the checkpoint log without mutating it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Maximum size, in bytes, of a [`TaskState::output`] kept inline; larger
/// output spills to `output_file` on disk.
pub const MAX_INLINE_OUTPUT_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Refine,
    Analyze,
    Plan,
    Execute,
}

impl Phase {
    pub const ORDER: [Phase; 4] = [Phase::Refine, Phase::Analyze, Phase::Plan, Phase::Execute];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Refine => "refine",
            Phase::Analyze => "analyze",
            Phase::Plan => "plan",
            Phase::Execute => "execute",
        }
    }

    pub fn next(&self) -> Option<Phase> {
        let idx = Self::ORDER.iter().position(|p| p == self)?;
        Self::ORDER.get(idx + 1).copied()
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointType {
    PhaseStart,
    PhaseComplete,
    ConsolidatedAnalysis,
    ModeratorRound,
    TaskStart,
    TaskComplete,
    Error,
    AutoResume,
    ZombieDetected,
    Reconciled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: CheckpointType,
    pub phase: Option<Phase>,
    pub task_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    #[serde(default)]
    pub data: HashMap<String, Value>,
}

impl Checkpoint {
    pub fn new(kind: CheckpointType, phase: Option<Phase>, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            phase,
            task_id: None,
            timestamp: Utc::now(),
            message: message.into(),
            data: HashMap::new(),
        }
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_data(mut self, key: &str, value: Value) -> Self {
        self.data.insert(key.to_string(), value);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskState {
    pub id: String,
    pub name: String,
    pub description: String,
    pub phase: Phase,
    pub status: TaskStatus,
    pub cli: String,
    pub model: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub worktree_path: Option<String>,
    pub branch: Option<String>,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub resumable: bool,
    #[serde(default)]
    pub merge_pending: bool,
    pub output: Option<String>,
    pub output_file: Option<String>,
    #[serde(default)]
    pub tokens_in: u64,
    #[serde(default)]
    pub tokens_out: u64,
    #[serde(default)]
    pub cost_usd: f64,
    pub error: Option<String>,
}

impl TaskState {
    pub fn new(id: impl Into<String>, name: impl Into<String>, cli: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            phase: Phase::Plan,
            status: TaskStatus::Pending,
            cli: cli.into(),
            model: None,
            dependencies: Vec::new(),
            worktree_path: None,
            branch: None,
            retries: 0,
            resumable: false,
            merge_pending: false,
            output: None,
            output_file: None,
            tokens_in: 0,
            tokens_out: 0,
            cost_usd: 0.0,
            error: None,
        }
    }

    /// Store output inline, or spill to `output_file` when it exceeds
    /// [`MAX_INLINE_OUTPUT_SIZE`].
    pub fn set_output(&mut self, output: String, spill_path: impl FnOnce() -> String) {
        if output.len() > MAX_INLINE_OUTPUT_SIZE {
            self.output_file = Some(spill_path());
            self.output = None;
        } else {
            self.output = Some(output);
            self.output_file = None;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub path: String,
    pub size: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metrics {
    #[serde(default)]
    pub total_tokens_in: u64,
    #[serde(default)]
    pub total_tokens_out: u64,
    #[serde(default)]
    pub total_cost_usd: f64,
    #[serde(default)]
    pub duration_secs: f64,
    pub consensus_score: Option<f64>,
    #[serde(default)]
    pub needs_human_review: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub workflow_id: String,
    pub prompt: String,
    pub optimized_prompt: Option<String>,
    pub status: WorkflowStatus,
    pub current_phase: Phase,
    pub tasks: HashMap<String, TaskState>,
    pub task_order: Vec<String>,
    pub checkpoints: Vec<Checkpoint>,
    pub metrics: Metrics,
    pub attachments: Vec<Attachment>,
    pub report_path: Option<String>,
    pub workflow_branch: Option<String>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub resume_count: u32,
    pub max_resumes: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowState {
    /// Generates a unique, monotonic, human-legible workflow id:
    /// `wf-<yyyymmdd-hhmmss>-<short-uuid>`.
    pub fn new_id() -> String {
        let now = Utc::now();
        let short = Uuid::new_v4().simple().to_string();
        format!("wf-{}-{}", now.format("%Y%m%d-%H%M%S"), &short[..8])
    }

    pub fn initialize(prompt: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            workflow_id: Self::new_id(),
            prompt: prompt.into(),
            optimized_prompt: None,
            status: WorkflowStatus::Pending,
            current_phase: Phase::Refine,
            tasks: HashMap::new(),
            task_order: Vec::new(),
            checkpoints: Vec::new(),
            metrics: Metrics::default(),
            attachments: Vec::new(),
            report_path: None,
            workflow_branch: None,
            heartbeat_at: None,
            resume_count: 0,
            max_resumes: 3,
            created_at: now,
            updated_at: now,
        }
    }

    /// The effective prompt: refined if present, else original.
    pub fn effective_prompt(&self) -> &str {
        self.optimized_prompt.as_deref().unwrap_or(&self.prompt)
    }

    /// Pure append — callers are responsible for persisting afterwards.
    pub fn append_checkpoint(&mut self, checkpoint: Checkpoint) {
        self.checkpoints.push(checkpoint);
        self.updated_at = Utc::now();
    }

    pub fn add_task(&mut self, task: TaskState) {
        if !self.tasks.contains_key(&task.id) {
            self.task_order.push(task.id.clone());
        }
        self.tasks.insert(task.id.clone(), task);
    }

    /// Scans checkpoints for a `phase_complete` of phase `p`.
    pub fn is_phase_completed(&self, phase: Phase) -> bool {
        self.checkpoints
            .iter()
            .any(|c| c.kind == CheckpointType::PhaseComplete && c.phase == Some(phase))
    }

    /// The latest `consolidated_analysis` checkpoint, if any.
    pub fn latest_consolidated_analysis(&self) -> Option<&Checkpoint> {
        self.checkpoints
            .iter()
            .rev()
            .find(|c| c.kind == CheckpointType::ConsolidatedAnalysis)
    }

    /// The resume point: the latest `phase_start` without a matching
    /// `phase_complete`. `from_start` is true if no phase has started.
    pub fn resume_point(&self) -> ResumePoint {
        let latest_start = self
            .checkpoints
            .iter()
            .rev()
            .find(|c| c.kind == CheckpointType::PhaseStart);

        let Some(start) = latest_start else {
            return ResumePoint {
                phase: Phase::Refine,
                task_id: None,
                from_start: true,
            };
        };

        let phase = start.phase.unwrap_or(Phase::Refine);
        if self.is_phase_completed(phase) {
            return match phase.next() {
                Some(next) => ResumePoint {
                    phase: next,
                    task_id: None,
                    from_start: false,
                },
                None => ResumePoint {
                    phase,
                    task_id: None,
                    from_start: false,
                },
            };
        }

        ResumePoint {
            phase,
            task_id: start.task_id.clone(),
            from_start: false,
        }
    }

    pub fn completed_task_ids(&self) -> Vec<String> {
        self.task_order
            .iter()
            .filter(|id| {
                self.tasks
                    .get(*id)
                    .map(|t| matches!(t.status, TaskStatus::Completed | TaskStatus::Skipped))
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumePoint {
    pub phase: Phase,
    pub task_id: Option<String>,
    pub from_start: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_id_is_prefixed_and_unique() {
        let a = WorkflowState::new_id();
        let b = WorkflowState::new_id();
        assert!(a.starts_with("wf-"));
        assert_ne!(a, b);
    }

    #[test]
    fn is_phase_completed_reflects_checkpoint_log() {
        let mut state = WorkflowState::initialize("prompt");
        assert!(!state.is_phase_completed(Phase::Refine));
        state.append_checkpoint(Checkpoint::new(
            CheckpointType::PhaseComplete,
            Some(Phase::Refine),
            "done",
        ));
        assert!(state.is_phase_completed(Phase::Refine));
        assert!(!state.is_phase_completed(Phase::Analyze));
    }

    #[test]
    fn resume_point_defaults_to_refine_from_start() {
        let state = WorkflowState::initialize("prompt");
        let rp = state.resume_point();
        assert!(rp.from_start);
        assert_eq!(rp.phase, Phase::Refine);
    }

    #[test]
    fn resume_point_advances_past_completed_phase() {
        let mut state = WorkflowState::initialize("prompt");
        state.append_checkpoint(Checkpoint::new(
            CheckpointType::PhaseStart,
            Some(Phase::Refine),
            "start",
        ));
        state.append_checkpoint(Checkpoint::new(
            CheckpointType::PhaseComplete,
            Some(Phase::Refine),
            "done",
        ));
        let rp = state.resume_point();
        assert!(!rp.from_start);
        assert_eq!(rp.phase, Phase::Analyze);
    }

    #[test]
    fn resume_point_reports_in_progress_phase_and_task() {
        let mut state = WorkflowState::initialize("prompt");
        state.append_checkpoint(
            Checkpoint::new(CheckpointType::PhaseStart, Some(Phase::Execute), "start")
                .with_task("task-1"),
        );
        let rp = state.resume_point();
        assert_eq!(rp.phase, Phase::Execute);
        assert_eq!(rp.task_id.as_deref(), Some("task-1"));
    }

    #[test]
    fn add_task_keeps_task_order_unique() {
        let mut state = WorkflowState::initialize("prompt");
        state.add_task(TaskState::new("t1", "Task 1", "mock-a"));
        state.add_task(TaskState::new("t1", "Task 1 updated", "mock-a"));
        assert_eq!(state.task_order, vec!["t1".to_string()]);
        assert_eq!(state.tasks.len(), 1);
    }

    #[test]
    fn set_output_spills_large_output_to_file() {
        let mut task = TaskState::new("t1", "Task", "mock-a");
        let big = "x".repeat(MAX_INLINE_OUTPUT_SIZE + 1);
        task.set_output(big, || "reports/wf/t1.out".to_string());
        assert!(task.output.is_none());
        assert_eq!(task.output_file.as_deref(), Some("reports/wf/t1.out"));
    }

    #[test]
    fn set_output_keeps_small_output_inline() {
        let mut task = TaskState::new("t1", "Task", "mock-a");
        task.set_output("small".to_string(), || "unused".to_string());
        assert_eq!(task.output.as_deref(), Some("small"));
        assert!(task.output_file.is_none());
    }
}
