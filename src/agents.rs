//! External agent interfaces: `AgentRegistry` and `Agent`.
//!
//! Out of scope for this crate is the concrete adapter that spawns a CLI
//! process and parses its stdout — that lives with the individual agent
//! integrations. This module defines the capability contract the rest of
//! the engine consumes, plus a `MockAgent`/`MockAgentRegistry` test double
//! pair for exercising the rest of the engine without a real process
//! adapter wired in.

use crate::errors::{DomainError, Result};
use crate::workflow::Phase;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    pub supports_json: bool,
    pub supports_streaming: bool,
    pub supports_tools: bool,
    pub supports_images: bool,
    pub max_context_tokens: u64,
    pub max_output_tokens: u64,
}

#[derive(Debug, Clone)]
pub struct ExecuteParams {
    pub prompt: String,
    pub format: OutputFormat,
    pub model: Option<String>,
    pub timeout: Duration,
    pub sandbox: bool,
    pub phase: Phase,
    pub work_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ToolCall {
    pub tool: String,
    pub target: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExecuteResult {
    pub output: String,
    pub model: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
    pub duration: Duration,
    pub tool_calls: Vec<ToolCall>,
}

impl ExecuteResult {
    /// Whether any tool call looks like it mutated the workspace —
    /// write/edit/create/bash/str_replace — used by the executor's output
    /// validation.
    pub fn has_file_modifying_tool_call(&self) -> bool {
        const MUTATING: &[&str] = &["write", "edit", "create", "bash", "str_replace"];
        self.tool_calls
            .iter()
            .any(|tc| MUTATING.iter().any(|m| tc.tool.to_lowercase().contains(m)))
    }
}

#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;
    fn capabilities(&self) -> Capabilities;
    async fn ping(&self) -> Result<()>;
    async fn execute(&self, params: ExecuteParams) -> Result<ExecuteResult>;
}

#[async_trait]
pub trait AgentRegistry: Send + Sync {
    fn get(&self, name: &str) -> Option<std::sync::Arc<dyn Agent>>;
    fn list(&self) -> Vec<String>;
    async fn available(&self) -> Vec<String>;
    async fn available_for_phase(&self, phase: Phase) -> Vec<String>;
    fn default_agent_name(&self) -> &str;

    /// Shell-like tokens (bash, sh, zsh, fish, powershell, terminal, shell,
    /// command, cli, default, auto) resolve to the default agent. Unknown
    /// agents also fall back to the default, with a caller-visible warning
    /// flag so the planner can log it.
    fn resolve(&self, requested: &str) -> (std::sync::Arc<dyn Agent>, bool) {
        const SHELL_LIKE: &[&str] = &[
            "bash", "sh", "zsh", "fish", "powershell", "terminal", "shell", "command", "cli",
            "default", "auto",
        ];
        let lower = requested.to_lowercase();
        if !SHELL_LIKE.contains(&lower.as_str()) {
            if let Some(agent) = self.get(requested) {
                return (agent, false);
            }
        }
        let fallback = self
            .get(self.default_agent_name())
            .expect("default agent must be registered");
        (fallback, true)
    }
}

/// In-memory agent for tests and dry runs: returns a scripted output (or a
/// queue of outputs, one per call, for multi-round analyzer tests).
pub struct MockAgent {
    name: String,
    capabilities: Capabilities,
    responses: Mutex<Vec<ExecuteResult>>,
    fail_after: Option<usize>,
    calls: Mutex<u32>,
}

impl MockAgent {
    pub fn new(name: impl Into<String>, output: impl Into<String>) -> Self {
        Self::with_responses(
            name,
            vec![ExecuteResult {
                output: output.into(),
                model: "mock-model".into(),
                tokens_in: 10,
                tokens_out: 10,
                cost_usd: 0.0,
                duration: Duration::from_millis(1),
                tool_calls: Vec::new(),
            }],
        )
    }

    pub fn with_responses(name: impl Into<String>, responses: Vec<ExecuteResult>) -> Self {
        Self {
            name: name.into(),
            capabilities: Capabilities {
                supports_json: true,
                supports_streaming: false,
                supports_tools: true,
                supports_images: false,
                max_context_tokens: 128_000,
                max_output_tokens: 8_000,
            },
            responses: Mutex::new(responses),
            fail_after: None,
            calls: Mutex::new(0),
        }
    }

    pub fn failing(name: impl Into<String>, message: impl Into<String>) -> FailingAgent {
        FailingAgent {
            name: name.into(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl Agent for MockAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities.clone()
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn execute(&self, _params: ExecuteParams) -> Result<ExecuteResult> {
        let mut calls = self.calls.lock().unwrap();
        *calls += 1;
        if let Some(limit) = self.fail_after {
            if *calls as usize > limit {
                return Err(DomainError::PermanentAgent {
                    agent: self.name.clone(),
                    message: "mock agent exhausted".into(),
                });
            }
        }
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            return Err(DomainError::PermanentAgent {
                agent: self.name.clone(),
                message: "mock agent has no more scripted responses".into(),
            });
        }
        let result = if responses.len() > 1 {
            responses.remove(0)
        } else {
            responses[0].clone()
        };
        Ok(result)
    }
}

/// An agent that always fails with a transient error, for retry-path tests.
pub struct FailingAgent {
    name: String,
    message: String,
}

#[async_trait]
impl Agent for FailingAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn execute(&self, _params: ExecuteParams) -> Result<ExecuteResult> {
        Err(DomainError::Transient {
            message: self.message.clone(),
            retryable: true,
        })
    }
}

pub struct MockAgentRegistry {
    agents: HashMap<String, std::sync::Arc<dyn Agent>>,
    default_agent: String,
}

impl MockAgentRegistry {
    pub fn new(default_agent: impl Into<String>) -> Self {
        Self {
            agents: HashMap::new(),
            default_agent: default_agent.into(),
        }
    }

    pub fn with_agent(mut self, agent: std::sync::Arc<dyn Agent>) -> Self {
        self.agents.insert(agent.name().to_string(), agent);
        self
    }
}

#[async_trait]
impl AgentRegistry for MockAgentRegistry {
    fn get(&self, name: &str) -> Option<std::sync::Arc<dyn Agent>> {
        self.agents.get(name).cloned()
    }

    fn list(&self) -> Vec<String> {
        self.agents.keys().cloned().collect()
    }

    async fn available(&self) -> Vec<String> {
        self.list()
    }

    async fn available_for_phase(&self, _phase: Phase) -> Vec<String> {
        self.list()
    }

    fn default_agent_name(&self) -> &str {
        &self.default_agent
    }
}
