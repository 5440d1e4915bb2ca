//! Phase 2: the Analyzer + Semantic Moderator — the hardest subsystem.
//!
//! Single-agent mode runs one configured agent once and treats its output
//! as the consolidated analysis; the moderator is bypassed entirely.
//! Multi-agent consensus mode bounds iteration between a pool of analyzer
//! agents and one moderator agent, terminating on the first of (in this
//! order) max-rounds, abort-threshold, stagnation, or consensus-reached.
//!
//! Grounded on `review/dispatcher.rs`'s parallel-fan-out-then-aggregate
//! shape (`run_parallel_reviews`/`join_all`) and `review/arbiter.rs`'s
//! tolerant free-text parsing, generalized from a one-shot review into a
//! multi-round loop per this engine's consensus rules.

use crate::agents::{AgentRegistry, ExecuteParams, OutputFormat};
use crate::checkpoint::CheckpointWriter;
use crate::config::ModeratorConfig;
use crate::errors::{DomainError, Result};
use crate::interfaces::{
    AnalyzeV1Params, AnalyzeVnRefineParams, LogLevel, ModeratorEvaluateParams, OutputNotifier,
    PromptRenderer, ReportWriter, SynthesizeAnalysisParams,
};
use crate::retry::BackoffRetryExecutor;
use crate::validators;
use crate::workflow::{Phase, WorkflowState};
use futures::future::join_all;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Above this size an analyzer's raw output is summarized before being fed
/// to the moderator.
const CONTEXT_BUDGET_BYTES: usize = 80 * 1024;
const TRUNCATION_SENTINEL: &str = "...[see full report]...";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    SingleAgent,
    MultiAgent,
}

pub struct Analyzer {
    registry: Arc<dyn AgentRegistry>,
    renderer: Arc<dyn PromptRenderer>,
    report_writer: Arc<dyn ReportWriter>,
    notifier: Arc<dyn OutputNotifier>,
    retry: BackoffRetryExecutor,
    mode: ExecutionMode,
    single_agent: String,
    analyzer_agents: Vec<String>,
    moderator: ModeratorConfig,
    timeout: Duration,
}

impl Analyzer {
    pub fn new(
        registry: Arc<dyn AgentRegistry>,
        renderer: Arc<dyn PromptRenderer>,
        report_writer: Arc<dyn ReportWriter>,
        notifier: Arc<dyn OutputNotifier>,
        mode: ExecutionMode,
        single_agent: impl Into<String>,
        analyzer_agents: Vec<String>,
        moderator: ModeratorConfig,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            renderer,
            report_writer,
            notifier,
            retry: BackoffRetryExecutor::default(),
            mode,
            single_agent: single_agent.into(),
            analyzer_agents,
            moderator,
            timeout,
        }
    }

    pub async fn run(&self, state: &mut WorkflowState) -> Result<()> {
        if state.is_phase_completed(Phase::Analyze) {
            self.notifier.task_skipped(&state.workflow_id, "analyze");
            return Ok(());
        }

        self.notifier.phase_started(&state.workflow_id, Phase::Analyze);
        CheckpointWriter::phase_start(state, Phase::Analyze);

        let consolidated = match self.mode {
            ExecutionMode::SingleAgent => self.run_single_agent(state).await?,
            ExecutionMode::MultiAgent => self.run_consensus(state).await?,
        };

        let _ = self.report_writer.write_consolidated_analysis(&consolidated);
        CheckpointWriter::consolidated_analysis(state, &consolidated);
        CheckpointWriter::phase_complete(state, Phase::Analyze);
        Ok(())
    }

    async fn run_single_agent(&self, state: &WorkflowState) -> Result<String> {
        let (agent, _) = self.registry.resolve(&self.single_agent);
        let prompt = self.renderer.analyze_v1(&AnalyzeV1Params {
            prompt: state.effective_prompt().to_string(),
        });
        let work_dir = PathBuf::from(".");
        let timeout = self.timeout;
        let result = self
            .retry
            .execute(|| {
                let agent = agent.clone();
                let prompt = prompt.clone();
                let work_dir = work_dir.clone();
                async move {
                    agent
                        .execute(ExecuteParams {
                            prompt,
                            format: OutputFormat::Text,
                            model: None,
                            timeout,
                            sandbox: false,
                            phase: Phase::Analyze,
                            work_dir,
                        })
                        .await
                }
            })
            .await?;

        if !validators::is_valid_analysis_output(&result.output) {
            return Err(DomainError::Parse {
                what: "single-agent analysis output".into(),
                message: "output failed quality validation".into(),
            });
        }
        Ok(result.output)
    }

    async fn run_consensus(&self, state: &mut WorkflowState) -> Result<String> {
        let mut agreements: Vec<String> = Vec::new();
        let mut divergences: Vec<String> = Vec::new();
        let mut prev_score: Option<f64> = None;
        let mut best: Option<(f64, Vec<String>)> = None;
        let mut round: u32 = 1;

        loop {
            let accepted = self.run_round(state, round, &agreements, &divergences).await?;
            if accepted.len() < self.moderator.min_successful_agents as usize {
                return Err(DomainError::Internal(format!(
                    "only {} of {} analyzer agents succeeded in round {round}; minimum is {}",
                    accepted.len(),
                    self.analyzer_agents.len(),
                    self.moderator.min_successful_agents
                )));
            }

            let summarized: Vec<String> = accepted.iter().map(|s| summarize_for_budget(s)).collect();
            let evaluation = self
                .run_moderator(state, round, &summarized)
                .await?;

            CheckpointWriter::moderator_round(
                state,
                round,
                evaluation.score,
                &evaluation.agreements,
                &evaluation.divergences,
            );
            let _ = self
                .report_writer
                .write_moderator_report(round, &evaluation.raw);

            agreements = evaluation.agreements.clone();
            divergences = evaluation.divergences.clone();

            if best
                .as_ref()
                .map(|(score, _)| evaluation.score > *score)
                .unwrap_or(true)
            {
                best = Some((evaluation.score, accepted.clone()));
            }

            if round >= self.moderator.max_rounds {
                if evaluation.score < self.moderator.warning_threshold {
                    state.metrics.needs_human_review = true;
                }
                state.metrics.consensus_score = Some(evaluation.score);
                return self.synthesize(state, &accepted, &best).await;
            }

            if round >= self.moderator.min_rounds && evaluation.score < self.moderator.abort_threshold {
                return Err(DomainError::ConsensusFailure {
                    workflow_id: state.workflow_id.clone(),
                    round,
                    score: evaluation.score,
                    threshold: self.moderator.abort_threshold,
                });
            }

            if let Some(prev) = prev_score {
                if round > self.moderator.min_rounds
                    && (evaluation.score - prev) < self.moderator.stagnation_threshold
                {
                    state.metrics.consensus_score = Some(evaluation.score);
                    return self.synthesize(state, &accepted, &best).await;
                }
            }

            if evaluation.score >= self.moderator.threshold && round >= self.moderator.min_rounds {
                state.metrics.consensus_score = Some(evaluation.score);
                return self.synthesize(state, &accepted, &best).await;
            }

            prev_score = Some(evaluation.score);
            round += 1;
        }
    }

    async fn run_round(
        &self,
        state: &WorkflowState,
        round: u32,
        agreements: &[String],
        divergences: &[String],
    ) -> Result<Vec<String>> {
        let futures = self.analyzer_agents.iter().map(|name| {
            let (agent, _) = self.registry.resolve(name);
            let prompt = if round == 1 {
                self.renderer.analyze_v1(&AnalyzeV1Params {
                    prompt: state.effective_prompt().to_string(),
                })
            } else {
                self.renderer.analyze_vn_refine(&AnalyzeVnRefineParams {
                    prompt: state.effective_prompt().to_string(),
                    round,
                    agreements: agreements.to_vec(),
                    divergences: divergences.to_vec(),
                })
            };
            let timeout = self.timeout;
            async move {
                let outcome = self
                    .retry
                    .execute(|| {
                        let agent = agent.clone();
                        let prompt = prompt.clone();
                        async move {
                            agent
                                .execute(ExecuteParams {
                                    prompt,
                                    format: OutputFormat::Text,
                                    model: None,
                                    timeout,
                                    sandbox: false,
                                    phase: Phase::Analyze,
                                    work_dir: PathBuf::from("."),
                                })
                                .await
                        }
                    })
                    .await;
                match outcome {
                    Ok(result) if validators::is_valid_analysis_output(&result.output) => {
                        Some(result.output)
                    }
                    Ok(_) => None,
                    Err(err) => {
                        self.notifier.log(
                            LogLevel::Warn,
                            "analyzer",
                            &format!("analyzer agent failed in round {round}: {err}"),
                        );
                        None
                    }
                }
            }
        });

        Ok(join_all(futures).await.into_iter().flatten().collect())
    }

    async fn run_moderator(
        &self,
        state: &WorkflowState,
        round: u32,
        analyses: &[String],
    ) -> Result<ModeratorEvaluation> {
        let (agent, _) = self.registry.resolve(&self.moderator.agent);
        let prompt = self.renderer.moderator_evaluate(&ModeratorEvaluateParams {
            round,
            analyses: analyses.to_vec(),
        });
        let timeout = self.timeout;
        let result = self
            .retry
            .execute(|| {
                let agent = agent.clone();
                let prompt = prompt.clone();
                async move {
                    let result = agent
                        .execute(ExecuteParams {
                            prompt,
                            format: OutputFormat::Text,
                            model: None,
                            timeout,
                            sandbox: false,
                            phase: Phase::Analyze,
                            work_dir: PathBuf::from("."),
                        })
                        .await?;
                    if !validators::is_valid_moderator_output(&result.output) {
                        return Err(DomainError::Parse {
                            what: "moderator output".into(),
                            message: "failed isValidModeratorOutput".into(),
                        });
                    }
                    let Some(score) = validators::parse_consensus_score(&result.output) else {
                        return Err(DomainError::Parse {
                            what: "moderator consensus score".into(),
                            message: "no recognized score shape".into(),
                        });
                    };
                    Ok((result.output, score))
                }
            })
            .await;
        let _ = state;
        let (raw, score) = result?;
        let (agreements, divergences) = extract_agreements_divergences(&raw);
        Ok(ModeratorEvaluation {
            score,
            raw,
            agreements,
            divergences,
        })
    }

    async fn synthesize(
        &self,
        state: &WorkflowState,
        accepted: &[String],
        best: &Option<(f64, Vec<String>)>,
    ) -> Result<String> {
        let (agent, _) = self.registry.resolve(&self.single_agent);
        let prompt = self.renderer.synthesize_analysis(&SynthesizeAnalysisParams {
            accepted_outputs: accepted.to_vec(),
        });
        let outcome = agent
            .execute(ExecuteParams {
                prompt,
                format: OutputFormat::Text,
                model: None,
                timeout: self.timeout,
                sandbox: false,
                phase: Phase::Analyze,
                work_dir: PathBuf::from("."),
            })
            .await;
        let _ = state;
        match outcome {
            Ok(result) if validators::is_valid_analysis_output(&result.output) => Ok(result.output),
            _ => {
                let fallback = best
                    .as_ref()
                    .map(|(_, outputs)| outputs.join("\n\n---\n\n"))
                    .unwrap_or_else(|| accepted.join("\n\n---\n\n"));
                self.notifier.log(
                    LogLevel::Warn,
                    "analyzer",
                    "synthesis call failed, falling back to highest-scoring round's combined outputs",
                );
                Ok(fallback)
            }
        }
    }
}

struct ModeratorEvaluation {
    score: f64,
    raw: String,
    agreements: Vec<String>,
    divergences: Vec<String>,
}

/// Heuristic extraction of a moderator's free-form "Agreements: a, b.
/// Divergences: c, d." lines into lists for the next round's prompt.
/// Missing sections simply yield an empty list — the moderator's score is
/// still authoritative regardless.
fn extract_agreements_divergences(raw: &str) -> (Vec<String>, Vec<String>) {
    let agreements = extract_labeled_list(raw, "agreements");
    let divergences = extract_labeled_list(raw, "divergences");
    (agreements, divergences)
}

fn extract_labeled_list(raw: &str, label: &str) -> Vec<String> {
    let lower = raw.to_lowercase();
    let Some(pos) = lower.find(&format!("{label}:")) else {
        return Vec::new();
    };
    let after = &raw[pos + label.len() + 1..];
    let end = after.find('\n').unwrap_or(after.len());
    after[..end]
        .split(|c| c == ',' || c == ';')
        .map(|s| s.trim().trim_end_matches('.').to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Summarizes an over-budget analyzer output: keeps the head up to the
/// budget, cut at the nearest paragraph boundary, with a truncation
/// sentinel appended. Short outputs pass through unchanged.
fn summarize_for_budget(s: &str) -> String {
    if s.len() <= CONTEXT_BUDGET_BYTES {
        return s.to_string();
    }
    let window = &s[..CONTEXT_BUDGET_BYTES];
    let cut = window.rfind("\n\n").unwrap_or(window.len());
    format!("{}\n\n{}", &window[..cut], TRUNCATION_SENTINEL)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{MockAgent, MockAgentRegistry};
    use crate::interfaces::{FileReportWriter, PlainPromptRenderer, TracingNotifier};

    fn registry_with(agents: Vec<(&str, &str)>) -> Arc<MockAgentRegistry> {
        let mut reg = MockAgentRegistry::new(agents[0].0);
        for (name, output) in agents {
            reg = reg.with_agent(Arc::new(MockAgent::new(name, output)));
        }
        Arc::new(reg)
    }

    fn registry_from_agents(
        default_name: &str,
        agents: Vec<Arc<dyn crate::agents::Agent>>,
    ) -> Arc<MockAgentRegistry> {
        let mut reg = MockAgentRegistry::new(default_name);
        for agent in agents {
            reg = reg.with_agent(agent);
        }
        Arc::new(reg)
    }

    fn harness(
        mode: ExecutionMode,
        registry: Arc<MockAgentRegistry>,
        analyzer_agents: Vec<String>,
        moderator: ModeratorConfig,
    ) -> (Analyzer, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let report_writer = Arc::new(FileReportWriter::new(dir.path(), "wf-1").unwrap());
        let analyzer = Analyzer::new(
            registry,
            Arc::new(PlainPromptRenderer),
            report_writer,
            Arc::new(TracingNotifier),
            mode,
            "mock-a",
            analyzer_agents,
            moderator,
            Duration::from_secs(5),
        );
        (analyzer, dir)
    }

    #[tokio::test]
    async fn single_agent_mode_uses_one_call_as_consolidated_analysis() {
        let registry = registry_with(vec![(
            "mock-a",
            "# Analysis\n\nThis is a thorough single-agent analysis with enough detail.",
        )]);
        let (analyzer, _dir) = harness(ExecutionMode::SingleAgent, registry, vec![], ModeratorConfig::default());
        let mut state = WorkflowState::initialize("prompt");
        analyzer.run(&mut state).await.unwrap();
        assert!(state.is_phase_completed(Phase::Analyze));
        assert!(state.latest_consolidated_analysis().is_some());
    }

    #[tokio::test]
    async fn consensus_terminates_when_score_meets_threshold_at_min_rounds() {
        let registry = registry_from_agents(
            "mock-a",
            vec![
                Arc::new(MockAgent::new(
                    "mock-a",
                    "# Analysis\n\nDetailed analysis from agent A with real content.",
                )),
                Arc::new(MockAgent::new(
                    "moderator",
                    "CONSENSUS_SCORE: 85%\n\nAgreements: shared approach. Divergences: none significant.",
                )),
            ],
        );
        let moderator = ModeratorConfig {
            enabled: true,
            agent: "moderator".into(),
            threshold: 0.8,
            min_rounds: 1,
            max_rounds: 5,
            warning_threshold: 0.6,
            stagnation_threshold: 0.05,
            abort_threshold: 0.3,
            min_successful_agents: 1,
        };
        let (analyzer, _dir) = harness(
            ExecutionMode::MultiAgent,
            registry,
            vec!["mock-a".into()],
            moderator,
        );
        let mut state = WorkflowState::initialize("prompt");
        analyzer.run(&mut state).await.unwrap();
        assert_eq!(state.metrics.consensus_score, Some(0.85));
        assert!(state.is_phase_completed(Phase::Analyze));
    }

    #[tokio::test]
    async fn abort_threshold_below_min_rounds_continues_instead_of_failing() {
        // round < min_rounds: a low score must not trigger the abort rule.
        let registry = registry_from_agents(
            "mock-a",
            vec![
                Arc::new(MockAgent::new(
                    "mock-a",
                    "# Analysis\n\nSome content with enough length here.",
                )),
                Arc::new(MockAgent::with_responses(
                    "moderator",
                    vec![
                        crate::agents::ExecuteResult {
                            output: "CONSENSUS_SCORE: 10%".into(),
                            model: "m".into(),
                            tokens_in: 1,
                            tokens_out: 1,
                            cost_usd: 0.0,
                            duration: Duration::from_secs(0),
                            tool_calls: vec![],
                        },
                        crate::agents::ExecuteResult {
                            output: "CONSENSUS_SCORE: 90%".into(),
                            model: "m".into(),
                            tokens_in: 1,
                            tokens_out: 1,
                            cost_usd: 0.0,
                            duration: Duration::from_secs(0),
                            tool_calls: vec![],
                        },
                    ],
                )),
            ],
        );
        let moderator = ModeratorConfig {
            enabled: true,
            agent: "moderator".into(),
            threshold: 0.8,
            min_rounds: 2,
            max_rounds: 5,
            warning_threshold: 0.6,
            stagnation_threshold: 0.05,
            abort_threshold: 0.3,
            min_successful_agents: 1,
        };
        let (analyzer, _dir) = harness(
            ExecutionMode::MultiAgent,
            registry,
            vec!["mock-a".into()],
            moderator,
        );
        let mut state = WorkflowState::initialize("prompt");
        analyzer.run(&mut state).await.unwrap();
        assert_eq!(state.metrics.consensus_score, Some(0.9));
    }

    #[test]
    fn summarize_for_budget_leaves_short_text_unchanged() {
        let text = "short analysis";
        assert_eq!(summarize_for_budget(text), text);
    }

    #[test]
    fn summarize_for_budget_truncates_oversized_text_at_paragraph_boundary() {
        let mut big = "intro paragraph\n\n".to_string();
        big.push_str(&"x".repeat(CONTEXT_BUDGET_BYTES));
        let summarized = summarize_for_budget(&big);
        assert!(summarized.len() < big.len());
        assert!(summarized.ends_with(TRUNCATION_SENTINEL));
    }
}
