//! Layered TOML configuration: `QuorumToml` loads `.quorum/quorum.toml` and
//! exposes every knob from the configuration surface as a typed, nested
//! struct. A missing config file is not an error: `load_or_default` falls
//! back to `Default::default()`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    SingleAgent,
    MultiAgent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SingleAgentConfig {
    #[serde(default = "default_agent_name")]
    pub agent: String,
    #[serde(default)]
    pub model: Option<String>,
}

impl Default for SingleAgentConfig {
    fn default() -> Self {
        Self {
            agent: default_agent_name(),
            model: None,
        }
    }
}

fn default_agent_name() -> String {
    "mock-a".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeratorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_agent_name")]
    pub agent: String,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default = "default_min_rounds")]
    pub min_rounds: u32,
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: f64,
    #[serde(default = "default_stagnation_threshold")]
    pub stagnation_threshold: f64,
    #[serde(default = "default_abort_threshold")]
    pub abort_threshold: f64,
    #[serde(default = "default_min_successful_agents")]
    pub min_successful_agents: u32,
}

impl Default for ModeratorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            agent: default_agent_name(),
            threshold: default_threshold(),
            min_rounds: default_min_rounds(),
            max_rounds: default_max_rounds(),
            warning_threshold: default_warning_threshold(),
            stagnation_threshold: default_stagnation_threshold(),
            abort_threshold: default_abort_threshold(),
            min_successful_agents: default_min_successful_agents(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_threshold() -> f64 {
    0.8
}
fn default_min_rounds() -> u32 {
    1
}
fn default_max_rounds() -> u32 {
    5
}
fn default_warning_threshold() -> f64 {
    0.6
}
fn default_stagnation_threshold() -> f64 {
    0.05
}
fn default_abort_threshold() -> f64 {
    0.3
}
fn default_min_successful_agents() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefinerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_agent_name")]
    pub agent: String,
}

impl Default for RefinerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            agent: default_agent_name(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    #[default]
    Sequential,
    Batched,
    Parallel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitIsolationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
    #[serde(default)]
    pub merge_strategy: MergeStrategy,
    #[serde(default = "default_true")]
    pub auto_merge: bool,
}

impl Default for GitIsolationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_branch: default_base_branch(),
            merge_strategy: MergeStrategy::default(),
            auto_merge: true,
        }
    }
}

fn default_base_branch() -> String {
    "main".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizationConfig {
    #[serde(default)]
    pub auto_pr: bool,
    #[serde(default)]
    pub auto_push: bool,
    #[serde(default = "default_true")]
    pub auto_merge: bool,
    #[serde(default = "default_base_branch")]
    pub pr_base_branch: String,
    #[serde(default)]
    pub merge_strategy: MergeStrategy,
}

impl Default for FinalizationConfig {
    fn default() -> Self {
        Self {
            auto_pr: false,
            auto_push: false,
            auto_merge: true,
            pr_base_branch: default_base_branch(),
            merge_strategy: MergeStrategy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default = "default_workflow_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub deny_tools: Vec<String>,
    /// How many ready tasks the Executor runs concurrently within a level.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Permits per agent name in the shared rate limiter.
    #[serde(default = "default_rate_limit_permits")]
    pub rate_limit_permits_per_agent: usize,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_workflow_timeout_secs(),
            max_retries: default_max_retries(),
            dry_run: false,
            deny_tools: Vec::new(),
            concurrency: default_concurrency(),
            rate_limit_permits_per_agent: default_rate_limit_permits(),
        }
    }
}

fn default_workflow_timeout_secs() -> u64 {
    3600
}
fn default_max_retries() -> u32 {
    3
}
fn default_concurrency() -> usize {
    4
}
fn default_rate_limit_permits() -> usize {
    2
}

impl WorkflowConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTimeouts {
    #[serde(default = "default_phase_timeout_secs")]
    pub analyze_secs: u64,
    #[serde(default = "default_phase_timeout_secs")]
    pub plan_secs: u64,
    #[serde(default = "default_phase_timeout_secs")]
    pub execute_secs: u64,
    #[serde(default = "default_grace_period_secs")]
    pub analyze_process_grace_period_secs: u64,
}

impl Default for PhaseTimeouts {
    fn default() -> Self {
        Self {
            analyze_secs: default_phase_timeout_secs(),
            plan_secs: default_phase_timeout_secs(),
            execute_secs: default_phase_timeout_secs(),
            analyze_process_grace_period_secs: default_grace_period_secs(),
        }
    }
}

fn default_phase_timeout_secs() -> u64 {
    600
}
fn default_grace_period_secs() -> u64 {
    15
}

impl PhaseTimeouts {
    pub fn analyze(&self) -> Duration {
        Duration::from_secs(self.analyze_secs)
    }
    pub fn plan(&self) -> Duration {
        Duration::from_secs(self.plan_secs)
    }
    pub fn execute(&self) -> Duration {
        Duration::from_secs(self.execute_secs)
    }
    pub fn analyze_grace_period(&self) -> Duration {
        Duration::from_secs(self.analyze_process_grace_period_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_heartbeat_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_stale_threshold_secs")]
    pub stale_threshold_secs: u64,
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    #[serde(default)]
    pub auto_resume: bool,
    #[serde(default = "default_max_resumes")]
    pub max_resumes: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_heartbeat_interval_secs(),
            stale_threshold_secs: default_stale_threshold_secs(),
            check_interval_secs: default_check_interval_secs(),
            auto_resume: false,
            max_resumes: default_max_resumes(),
        }
    }
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}
fn default_stale_threshold_secs() -> u64 {
    120
}
fn default_check_interval_secs() -> u64 {
    60
}
fn default_max_resumes() -> u32 {
    3
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
    pub fn stale_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_threshold_secs as i64)
    }
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_report_base_dir")]
    pub base_dir: String,
    #[serde(default)]
    pub use_utc: bool,
    #[serde(default)]
    pub include_raw: bool,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_dir: default_report_base_dir(),
            use_utc: false,
            include_raw: false,
        }
    }
}

fn default_report_base_dir() -> String {
    "reports".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuorumToml {
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    #[serde(default)]
    pub single_agent: SingleAgentConfig,
    #[serde(default)]
    pub moderator: ModeratorConfig,
    #[serde(default)]
    pub refiner: RefinerConfig,
    #[serde(default)]
    pub git_isolation: GitIsolationConfig,
    #[serde(default)]
    pub finalization: FinalizationConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub phases: PhaseTimeouts,
    /// 0 = unlimited.
    #[serde(default)]
    pub max_cost_per_task: f64,
    /// 0 = unlimited.
    #[serde(default)]
    pub max_cost_per_workflow: f64,
    /// `agent_phase_models[agent][phase]` — precedence: task model > phase
    /// override > agent default.
    #[serde(default)]
    pub agent_phase_models: std::collections::HashMap<String, std::collections::HashMap<String, String>>,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
}

impl QuorumToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("failed to parse quorum.toml")
    }

    /// Loads `<quorum_dir>/quorum.toml`, or `Default::default()` if absent.
    pub fn load_or_default(quorum_dir: &Path) -> Result<Self> {
        let path = quorum_dir.join("quorum.toml");
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("failed to serialize quorum.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Resolves the model for an agent in a phase: a task-level override
    /// wins, then the phase override, then the agent's own default.
    pub fn resolve_model(
        &self,
        agent: &str,
        phase: &str,
        task_model: Option<&str>,
    ) -> Option<String> {
        if let Some(m) = task_model {
            return Some(m.to_string());
        }
        self.agent_phase_models
            .get(agent)
            .and_then(|phases| phases.get(phase))
            .cloned()
    }
}
