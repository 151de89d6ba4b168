use crate::budget::TokenUsage;
use crate::types::{Step, ToolContext};
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What an agent sees about the run it is working in
#[derive(Debug, Clone, Serialize)]
pub struct AgentContext {
    #[serde(flatten)]
    pub call: ToolContext,
    pub workflow_input: Value,
    /// Completed steps of this run, in execution order
    pub previous_steps: Vec<Step>,
}

/// A tool call an agent made while producing its answer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentToolCall {
    pub tool_id: String,
    pub input: Value,
    #[serde(default)]
    pub output: Option<Value>,
}

/// Provider-reported usage for one completion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmUsage {
    pub provider: String,
    pub model: String,
    #[serde(flatten)]
    pub tokens: TokenUsage,
}

/// Result of one agent step
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentResult {
    pub text: String,
    #[serde(default)]
    pub tool_calls: Vec<AgentToolCall>,
    #[serde(default)]
    pub finish_reason: Option<String>,
    #[serde(default)]
    pub usage: Option<LlmUsage>,
}

/// External agent runtime.
///
/// Implementations execute tool calls through the same `ToolRuntime` the
/// orchestrator uses, passing `context.call` along so policies and audit
/// events stay attached to the run.
#[async_trait::async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn run_agent_step(
        &self,
        agent_id: &str,
        context: &AgentContext,
        input: Value,
    ) -> Result<AgentResult>;
}

/// Invoker for deployments without an agent runtime; every agent step fails
pub struct UnavailableAgentInvoker;

#[async_trait::async_trait]
impl AgentInvoker for UnavailableAgentInvoker {
    async fn run_agent_step(
        &self,
        agent_id: &str,
        _context: &AgentContext,
        _input: Value,
    ) -> Result<AgentResult> {
        bail!("no agent runtime configured (agent '{}')", agent_id)
    }
}
