//! CLI front-end: `quorum run|status|list|resume`.
//!
//! A minimal operational surface over [`Runner`], not a rich front-end —
//! the engine's interfaces-only scope (agent process adapters, prompt
//! renderer, report writer, etc. are all pluggable) stops at this binary's
//! edge too. A flat `Commands` enum covering the engine's four entry
//! points: run a new workflow, resume one, check status, list them all.

use crate::agents::{AgentRegistry, MockAgent, MockAgentRegistry};
use crate::config::QuorumToml;
use crate::errors::{DomainError, Result};
use crate::runner::Runner;
use crate::workflow::store::FileStateManager;
use crate::workflow::{StateManager, WorkflowState};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "quorum")]
#[command(version, about = "Multi-agent workflow orchestration engine")]
pub struct Cli {
    /// Repository the workflow operates on. Defaults to the current directory.
    #[arg(long, global = true)]
    pub repo: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a new workflow from a prompt, driving refine/analyze/plan/execute to completion.
    Run { prompt: String },
    /// Resume a paused or crashed workflow from its last checkpoint.
    Resume { workflow_id: String },
    /// Show a single workflow's current status.
    Status { workflow_id: String },
    /// List every known workflow id with its status and current phase.
    List,
}

pub async fn run(cli: Cli) -> Result<()> {
    let repo_path = match cli.repo {
        Some(path) => path,
        None => std::env::current_dir().map_err(|err| DomainError::Internal(err.to_string()))?,
    };
    let quorum_dir = repo_path.join(".quorum");
    let config = QuorumToml::load_or_default(&quorum_dir)
        .map_err(|err| DomainError::Internal(err.to_string()))?;
    let state_manager: Arc<dyn StateManager> =
        Arc::new(FileStateManager::new(quorum_dir.join("state"))?);
    let registry = build_registry(&config);
    let runner = Arc::new(Runner::new(state_manager.clone(), registry, config, repo_path));

    for workflow_id in runner.recover_crashed_workflows().await? {
        tracing::info!(workflow_id, "recovered crashed workflow at startup");
    }
    let _zombie_detector = runner.spawn_zombie_detector();

    match cli.command {
        Commands::Run { prompt } => print_summary(&runner.start(prompt).await?),
        Commands::Resume { workflow_id } => print_summary(&runner.resume(&workflow_id).await?),
        Commands::Status { workflow_id } => {
            let state = state_manager.load(&workflow_id).await?.ok_or_else(|| {
                DomainError::NoStateToResume {
                    workflow_id: workflow_id.clone(),
                }
            })?;
            print_summary(&state);
        }
        Commands::List => {
            for workflow_id in state_manager.list_ids().await? {
                if let Some(state) = state_manager.load(&workflow_id).await? {
                    println!(
                        "{}\t{:?}\t{}\t{} tasks",
                        state.workflow_id,
                        state.status,
                        state.current_phase,
                        state.tasks.len()
                    );
                }
            }
        }
    }

    Ok(())
}

fn print_summary(state: &WorkflowState) {
    println!("workflow {}", state.workflow_id);
    println!("status:  {:?}", state.status);
    println!("phase:   {}", state.current_phase);
    println!("tasks:   {}", state.tasks.len());
    if let Some(report_path) = &state.report_path {
        println!("report:  {report_path}");
    }
}

/// The engine deliberately has no concrete agent process adapter (see
/// `agents.rs`'s module doc) — that integration point is out of scope.
/// This wires a mock registry from the agent names the config already
/// names, so `run`/`resume` are exercisable against this binary without a
/// real integration plugged in. A library consumer embedding the engine
/// should construct its own `Arc<dyn AgentRegistry>` and drive `Runner`
/// directly rather than go through this CLI.
fn build_registry(config: &QuorumToml) -> Arc<dyn AgentRegistry> {
    let mut names = vec![
        config.single_agent.agent.clone(),
        config.refiner.agent.clone(),
        config.moderator.agent.clone(),
    ];
    names.extend(config.agent_phase_models.keys().cloned());
    names.sort();
    names.dedup();

    let mut registry = MockAgentRegistry::new(config.single_agent.agent.clone());
    for name in names {
        registry = registry.with_agent(Arc::new(MockAgent::new(
            name,
            "no agent process adapter is wired into this binary; see agents.rs",
        )));
    }
    Arc::new(registry)
}
