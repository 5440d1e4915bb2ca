//! Phase 3: the Planner.
//!
//! One "comprehensive planning" call to a single configured agent, expected
//! to write individual task files to the tasks directory and return a JSON
//! manifest. Parsing is layered exactly like the validators module's
//! analysis/moderator parsing: raw JSON, then fenced blocks, then balanced
//! brace scan, then envelope unwrapping, with a final disk-scan fallback
//! for when the manifest never comes back but the task files did.

use crate::agents::{AgentRegistry, ExecuteParams, OutputFormat};
use crate::checkpoint::CheckpointWriter;
use crate::dag::TaskGraph;
use crate::errors::{DomainError, Result};
use crate::interfaces::{OutputNotifier, PlanComprehensiveParams, PromptRenderer, ReportWriter};
use crate::workflow::{Phase, TaskState, WorkflowState};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct Manifest {
    tasks: Vec<ManifestTask>,
    #[serde(default)]
    #[allow(dead_code)]
    execution_levels: Vec<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct ManifestTask {
    id: String,
    name: String,
    #[serde(default)]
    file: Option<String>,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    #[allow(dead_code)]
    complexity: Option<String>,
    cli: String,
}

pub struct Planner {
    registry: Arc<dyn AgentRegistry>,
    renderer: Arc<dyn PromptRenderer>,
    report_writer: Arc<dyn ReportWriter>,
    notifier: Arc<dyn OutputNotifier>,
    agent_name: String,
    available_agents: Vec<(String, String)>,
    timeout: Duration,
}

impl Planner {
    pub fn new(
        registry: Arc<dyn AgentRegistry>,
        renderer: Arc<dyn PromptRenderer>,
        report_writer: Arc<dyn ReportWriter>,
        notifier: Arc<dyn OutputNotifier>,
        agent_name: impl Into<String>,
        available_agents: Vec<(String, String)>,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            renderer,
            report_writer,
            notifier,
            agent_name: agent_name.into(),
            available_agents,
            timeout,
        }
    }

    pub async fn run(&self, state: &mut WorkflowState) -> Result<()> {
        if state.is_phase_completed(Phase::Plan) {
            self.notifier.task_skipped(&state.workflow_id, "plan");
            return Ok(());
        }

        self.notifier.phase_started(&state.workflow_id, Phase::Plan);
        CheckpointWriter::phase_start(state, Phase::Plan);

        let consolidated = state
            .latest_consolidated_analysis()
            .and_then(|c| c.data.get("content"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| DomainError::MissingConsolidatedAnalysis {
                workflow_id: state.workflow_id.clone(),
            })?
            .to_string();

        let tasks_dir = self.report_writer.ensure_tasks_dir()?;
        let (agent, _) = self.registry.resolve(&self.agent_name);
        let prompt = self.renderer.plan_comprehensive(&PlanComprehensiveParams {
            effective_prompt: state.effective_prompt().to_string(),
            consolidated_analysis: consolidated,
            available_agents: self.available_agents.clone(),
            tasks_dir: tasks_dir.clone(),
        });

        let result = agent
            .execute(ExecuteParams {
                prompt,
                format: OutputFormat::Json,
                model: None,
                timeout: self.timeout,
                sandbox: false,
                phase: Phase::Plan,
                work_dir: tasks_dir.clone(),
            })
            .await?;

        let manifest = parse_manifest(&result.output).or_else(|| scan_tasks_dir(&tasks_dir));
        let Some(manifest_tasks) = manifest else {
            return Err(DomainError::Parse {
                what: "task plan manifest".into(),
                message: "no JSON manifest parsed and disk scan found no task files".into(),
            });
        };

        for manifest_task in &manifest_tasks {
            let (resolved_agent, fellback) = self.registry.resolve(&manifest_task.cli);
            if fellback {
                self.notifier.log(
                    crate::interfaces::LogLevel::Warn,
                    "planner",
                    &format!(
                        "task '{}' requested unknown agent '{}', using default '{}'",
                        manifest_task.id,
                        manifest_task.cli,
                        resolved_agent.name()
                    ),
                );
            }
            let mut task = TaskState::new(&manifest_task.id, &manifest_task.name, resolved_agent.name());
            task.description = manifest_task.description.clone();
            task.dependencies = manifest_task.dependencies.clone();
            task.phase = Phase::Execute;
            state.add_task(task);
        }

        let lenient_tasks: Vec<crate::dag::DagTask> = manifest_tasks
            .iter()
            .map(|t| crate::dag::DagTask {
                id: t.id.clone(),
                dependencies: t.dependencies.clone(),
            })
            .collect();
        let (_graph, dropped) = TaskGraph::from_tasks_lenient(lenient_tasks);
        for (from, to) in dropped {
            self.notifier.log(
                crate::interfaces::LogLevel::Warn,
                "planner",
                &format!("task '{from}' depends on unknown task '{to}', dependency dropped"),
            );
        }

        let _ = self
            .report_writer
            .write_task_plan(&format!("# Execution Graph\n\n{} tasks planned", manifest_tasks.len()));

        CheckpointWriter::phase_complete(state, Phase::Plan);
        Ok(())
    }
}

struct ParsedTask {
    id: String,
    name: String,
    description: String,
    dependencies: Vec<String>,
    cli: String,
}

fn parse_manifest(output: &str) -> Option<Vec<ParsedTask>> {
    let mut candidates = vec![output.to_string()];
    if let Some(extracted) = crate::validators::extract_balanced_json(output) {
        candidates.push(extracted);
    }

    for candidate in candidates.into_iter() {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&candidate) {
            let unwrapped = crate::validators::unwrap_envelope(&value);
            if let Ok(manifest) = serde_json::from_value::<Manifest>(unwrapped) {
                return Some(
                    manifest
                        .tasks
                        .into_iter()
                        .map(|t| ParsedTask {
                            id: t.id,
                            name: t.name,
                            description: t.file.unwrap_or_default(),
                            dependencies: t.dependencies,
                            cli: t.cli,
                        })
                        .collect(),
                );
            }
        }
    }
    None
}

/// Fallback: scan `task-*.md` files in the tasks directory, parsing the
/// `# Task: <Name>` / `**Task ID**:` / `**Assigned Agent**:` /
/// `**Dependencies**:` header convention.
fn scan_tasks_dir(tasks_dir: &std::path::Path) -> Option<Vec<ParsedTask>> {
    let mut tasks = Vec::new();
    let entries = std::fs::read_dir(tasks_dir).ok()?;
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("task-") && n.ends_with(".md"))
                .unwrap_or(false)
        })
        .collect();
    paths.sort();

    for path in paths {
        let Ok(content) = std::fs::read_to_string(&path) else {
            continue;
        };
        let name = extract_header_value(&content, "# Task: ").unwrap_or_else(|| "untitled".into());
        let id = extract_field(&content, "**Task ID**:").unwrap_or_else(|| name.clone());
        let cli = extract_field(&content, "**Assigned Agent**:").unwrap_or_else(|| "default".into());
        let dependencies = extract_field(&content, "**Dependencies**:")
            .map(|s| {
                s.split(',')
                    .map(|d| d.trim().to_string())
                    .filter(|d| !d.is_empty() && d != "none")
                    .collect()
            })
            .unwrap_or_default();
        tasks.push(ParsedTask {
            id,
            name,
            description: content.clone(),
            dependencies,
            cli,
        });
    }

    if tasks.is_empty() {
        None
    } else {
        Some(tasks)
    }
}

fn extract_header_value(content: &str, prefix: &str) -> Option<String> {
    content
        .lines()
        .find(|l| l.starts_with(prefix))
        .map(|l| l[prefix.len()..].trim().to_string())
}

fn extract_field(content: &str, label: &str) -> Option<String> {
    content.lines().find_map(|l| {
        let trimmed = l.trim();
        trimmed
            .strip_prefix(label)
            .map(|rest| rest.trim().to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{MockAgent, MockAgentRegistry};
    use crate::interfaces::{FileReportWriter, PlainPromptRenderer, TracingNotifier};

    fn harness(output: &str) -> (Planner, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let report_writer = Arc::new(FileReportWriter::new(dir.path(), "wf-1").unwrap());
        let registry = Arc::new(
            MockAgentRegistry::new("mock-a").with_agent(Arc::new(MockAgent::new("mock-a", output))),
        );
        let planner = Planner::new(
            registry,
            Arc::new(PlainPromptRenderer),
            report_writer,
            Arc::new(TracingNotifier),
            "mock-a",
            vec![("mock-a".into(), "general purpose".into())],
            Duration::from_secs(5),
        );
        (planner, dir)
    }

    fn state_with_analysis() -> WorkflowState {
        let mut state = WorkflowState::initialize("build a thing");
        CheckpointWriter::consolidated_analysis(&mut state, "# Analysis\n\ncontent");
        state
    }

    #[tokio::test]
    async fn parses_json_manifest_and_populates_tasks() {
        let output = r#"```json
{"tasks": [{"id": "t1", "name": "Setup", "file": "task-1-setup.md", "dependencies": [], "complexity": "low", "cli": "mock-a"}], "execution_levels": [["t1"]]}
```"#;
        let (planner, _dir) = harness(output);
        let mut state = state_with_analysis();
        planner.run(&mut state).await.unwrap();
        assert!(state.is_phase_completed(Phase::Plan));
        assert_eq!(state.task_order, vec!["t1".to_string()]);
    }

    #[tokio::test]
    async fn falls_back_to_disk_scan_when_output_is_unparseable() {
        let (planner, dir) = harness("not json at all, sorry");
        let tasks_dir = dir.path().join("wf-1").join("plan").join("tasks");
        std::fs::create_dir_all(&tasks_dir).unwrap();
        std::fs::write(
            tasks_dir.join("task-1-setup.md"),
            "# Task: Setup\n\n**Task ID**: t1\n**Assigned Agent**: mock-a\n**Complexity**: low\n**Dependencies**: none\n",
        )
        .unwrap();
        let mut state = state_with_analysis();
        planner.run(&mut state).await.unwrap();
        assert_eq!(state.task_order, vec!["t1".to_string()]);
    }

    #[tokio::test]
    async fn missing_consolidated_analysis_fails_fast() {
        let (planner, _dir) = harness("{}");
        let mut state = WorkflowState::initialize("prompt");
        let err = planner.run(&mut state).await.unwrap_err();
        assert!(matches!(err, DomainError::MissingConsolidatedAnalysis { .. }));
    }
}
