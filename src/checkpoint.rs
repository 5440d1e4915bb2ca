//! Checkpoint Manager: typed writers for each checkpoint kind, on top of
//! the pure `WorkflowState::append_checkpoint`. Every non-trivial action in
//! a phase runner is preceded by an in-progress checkpoint and followed by
//! a completion checkpoint; these helpers are the single place that shape
//! matters so call sites stay declarative.
//!
//! Reconciliation from on-disk artifacts lives in
//! [`crate::workflow::store::FileStateManager`] — it runs on every load,
//! not just explicitly.

use crate::workflow::{Checkpoint, CheckpointType, Phase, WorkflowState};
use serde_json::{json, Value};

pub struct CheckpointWriter;

impl CheckpointWriter {
    pub fn phase_start(state: &mut WorkflowState, phase: Phase) {
        state.append_checkpoint(Checkpoint::new(
            CheckpointType::PhaseStart,
            Some(phase),
            format!("{phase} started"),
        ));
    }

    pub fn phase_start_task(state: &mut WorkflowState, phase: Phase, task_id: &str) {
        state.append_checkpoint(
            Checkpoint::new(
                CheckpointType::PhaseStart,
                Some(phase),
                format!("{phase} resumed at task {task_id}"),
            )
            .with_task(task_id),
        );
    }

    pub fn phase_complete(state: &mut WorkflowState, phase: Phase) {
        state.append_checkpoint(Checkpoint::new(
            CheckpointType::PhaseComplete,
            Some(phase),
            format!("{phase} complete"),
        ));
    }

    pub fn consolidated_analysis(state: &mut WorkflowState, content: &str) {
        state.append_checkpoint(
            Checkpoint::new(
                CheckpointType::ConsolidatedAnalysis,
                Some(Phase::Analyze),
                "consolidated analysis produced",
            )
            .with_data("content", Value::String(content.to_string())),
        );
    }

    pub fn moderator_round(
        state: &mut WorkflowState,
        round: u32,
        score: f64,
        agreements: &[String],
        divergences: &[String],
    ) {
        state.append_checkpoint(
            Checkpoint::new(
                CheckpointType::ModeratorRound,
                Some(Phase::Analyze),
                format!("round {round} scored {score:.2}"),
            )
            .with_data(
                "round",
                json!({
                    "round": round,
                    "score": score,
                    "agreements": agreements,
                    "divergences": divergences,
                }),
            ),
        );
    }

    pub fn task_start(state: &mut WorkflowState, task_id: &str) {
        state.append_checkpoint(
            Checkpoint::new(CheckpointType::TaskStart, Some(Phase::Execute), "task started")
                .with_task(task_id),
        );
    }

    pub fn task_complete(state: &mut WorkflowState, task_id: &str) {
        state.append_checkpoint(
            Checkpoint::new(
                CheckpointType::TaskComplete,
                Some(Phase::Execute),
                "task complete",
            )
            .with_task(task_id),
        );
    }

    pub fn error(
        state: &mut WorkflowState,
        phase: Phase,
        task_id: Option<&str>,
        kind: crate::errors::ErrorKind,
        message: &str,
    ) {
        let mut cp = Checkpoint::new(CheckpointType::Error, Some(phase), message.to_string())
            .with_data("kind", Value::String(kind.to_string()));
        if let Some(id) = task_id {
            cp = cp.with_task(id);
        }
        state.append_checkpoint(cp);
    }

    pub fn auto_resume(state: &mut WorkflowState) {
        state.append_checkpoint(Checkpoint::new(
            CheckpointType::AutoResume,
            Some(state.current_phase),
            format!("auto-resumed (resume_count={})", state.resume_count),
        ));
    }

    pub fn zombie_detected(state: &mut WorkflowState, reason: &str) {
        state.append_checkpoint(Checkpoint::new(
            CheckpointType::ZombieDetected,
            Some(state.current_phase),
            reason.to_string(),
        ));
    }
}
