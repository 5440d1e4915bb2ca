//! Phase 1: best-effort prompt refinement.
//!
//! One render call, one agent invocation, write the result to disk — but
//! the contract is strictly best-effort: any failure — agent error, empty
//! output, output too short to be a real refinement — falls back to the
//! original prompt rather than failing the phase.

use crate::agents::{AgentRegistry, ExecuteParams, OutputFormat};
use crate::checkpoint::CheckpointWriter;
use crate::errors::Result;
use crate::interfaces::{OutputNotifier, PromptRenderer, ReportWriter, RefinePromptParams};
use crate::workflow::{Phase, WorkflowState};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Below this length a refinement is indistinguishable from a degenerate
/// echo or truncation and is treated as a failure.
const MIN_REFINED_LEN: usize = 10;

pub struct Refiner {
    registry: Arc<dyn AgentRegistry>,
    renderer: Arc<dyn PromptRenderer>,
    report_writer: Arc<dyn ReportWriter>,
    notifier: Arc<dyn OutputNotifier>,
    agent_name: String,
    enabled: bool,
    dry_run: bool,
}

impl Refiner {
    pub fn new(
        registry: Arc<dyn AgentRegistry>,
        renderer: Arc<dyn PromptRenderer>,
        report_writer: Arc<dyn ReportWriter>,
        notifier: Arc<dyn OutputNotifier>,
        agent_name: impl Into<String>,
        enabled: bool,
        dry_run: bool,
    ) -> Self {
        Self {
            registry,
            renderer,
            report_writer,
            notifier,
            agent_name: agent_name.into(),
            enabled,
            dry_run,
        }
    }

    pub async fn run(&self, state: &mut WorkflowState) -> Result<()> {
        if state.is_phase_completed(Phase::Refine) {
            self.notifier.task_skipped(&state.workflow_id, "refine");
            return Ok(());
        }

        self.notifier.phase_started(&state.workflow_id, Phase::Refine);
        CheckpointWriter::phase_start(state, Phase::Refine);
        let _ = self.report_writer.write_original_prompt(&state.prompt);

        if !self.enabled || self.dry_run {
            state.optimized_prompt = Some(state.prompt.clone());
            CheckpointWriter::phase_complete(state, Phase::Refine);
            return Ok(());
        }

        let refined = self.attempt_refine(&state.prompt).await;
        let (final_prompt, metrics) = match refined {
            Some(text) => (text, "refiner=ok"),
            None => (state.prompt.clone(), "refiner=fallback"),
        };
        let _ = self
            .report_writer
            .write_refined_prompt(&final_prompt, metrics);
        state.optimized_prompt = Some(final_prompt);

        CheckpointWriter::phase_complete(state, Phase::Refine);
        Ok(())
    }

    async fn attempt_refine(&self, original_prompt: &str) -> Option<String> {
        let (agent, fellback) = self.registry.resolve(&self.agent_name);
        if fellback {
            self.notifier.log(
                crate::interfaces::LogLevel::Warn,
                "refiner",
                &format!("agent '{}' unavailable, used default", self.agent_name),
            );
        }

        let prompt = self.renderer.refine_prompt(&RefinePromptParams {
            original_prompt: original_prompt.to_string(),
        });

        let params = ExecuteParams {
            prompt,
            format: OutputFormat::Text,
            model: None,
            timeout: Duration::from_secs(120),
            sandbox: false,
            phase: Phase::Refine,
            work_dir: PathBuf::from("."),
        };

        match agent.execute(params).await {
            Ok(result) if result.output.trim().len() >= MIN_REFINED_LEN => Some(result.output),
            Ok(_) => None,
            Err(err) => {
                self.notifier.log(
                    crate::interfaces::LogLevel::Warn,
                    "refiner",
                    &format!("refine call failed, falling back to original prompt: {err}"),
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{MockAgent, MockAgentRegistry};
    use crate::interfaces::{FileReportWriter, PlainPromptRenderer, TracingNotifier};

    fn harness(
        agent: Arc<dyn crate::agents::Agent>,
        enabled: bool,
        dry_run: bool,
    ) -> (Refiner, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let report_writer = Arc::new(FileReportWriter::new(dir.path(), "wf-1").unwrap());
        let registry = Arc::new(MockAgentRegistry::new("mock-a").with_agent(agent));
        let refiner = Refiner::new(
            registry,
            Arc::new(PlainPromptRenderer),
            report_writer,
            Arc::new(TracingNotifier),
            "mock-a",
            enabled,
            dry_run,
        );
        (refiner, dir)
    }

    #[tokio::test]
    async fn successful_refinement_replaces_prompt() {
        let agent = Arc::new(MockAgent::new("mock-a", "a much more detailed refined prompt"));
        let (refiner, _dir) = harness(agent, true, false);
        let mut state = WorkflowState::initialize("short");
        refiner.run(&mut state).await.unwrap();
        assert_eq!(
            state.optimized_prompt.as_deref(),
            Some("a much more detailed refined prompt")
        );
        assert!(state.is_phase_completed(Phase::Refine));
    }

    #[tokio::test]
    async fn agent_failure_falls_back_to_original_prompt() {
        let agent = Arc::new(MockAgent::failing("mock-a", "boom"));
        let (refiner, _dir) = harness(agent, true, false);
        let mut state = WorkflowState::initialize("original prompt");
        refiner.run(&mut state).await.unwrap();
        assert_eq!(state.optimized_prompt.as_deref(), Some("original prompt"));
    }

    #[tokio::test]
    async fn dry_run_skips_agent_call_entirely() {
        let agent: Arc<dyn crate::agents::Agent> = Arc::new(MockAgent::new("mock-a", "should not be used"));
        let (refiner, _dir) = harness(agent, true, true);
        let mut state = WorkflowState::initialize("original");
        refiner.run(&mut state).await.unwrap();
        assert_eq!(state.optimized_prompt.as_deref(), Some("original"));
    }

    #[tokio::test]
    async fn already_completed_phase_is_skipped() {
        let agent = Arc::new(MockAgent::new("mock-a", "refined"));
        let (refiner, _dir) = harness(agent, true, false);
        let mut state = WorkflowState::initialize("original");
        CheckpointWriter::phase_complete(&mut state, Phase::Refine);
        let checkpoint_count_before = state.checkpoints.len();
        refiner.run(&mut state).await.unwrap();
        assert_eq!(state.checkpoints.len(), checkpoint_count_before);
    }
}
