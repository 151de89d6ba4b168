// Policy engine for governance of tool calls, agent calls and run starts

pub mod engine;
pub mod rules;

pub use engine::RulePolicyEngine;

use crate::error::Result;
use crate::types::{PolicyId, RiskLevel, RunId, RunMode, ToolContext, WorkflowId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// What the caller is trying to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    ToolCall,
    RunStart,
    MemoryAccess,
    WorkflowExecution,
}

/// Everything a policy condition can refer to
#[derive(Debug, Clone, Serialize)]
pub struct PolicyEvaluationContext {
    pub action: PolicyAction,
    pub tenant_id: String,
    pub user_id: Option<String>,
    pub role: Option<String>,
    pub app_id: Option<String>,
    pub tool_id: Option<String>,
    pub workflow_id: Option<String>,
    pub agent_id: Option<String>,
    pub memory_id: Option<String>,
    pub run_id: Option<RunId>,
    pub mode: Option<RunMode>,
    pub risk_level: Option<RiskLevel>,
    /// Arbitrary extension fields, addressable by dot-path
    pub attributes: Map<String, Value>,
}

impl PolicyEvaluationContext {
    pub fn new(action: PolicyAction, tenant_id: impl Into<String>) -> Self {
        Self {
            action,
            tenant_id: tenant_id.into(),
            user_id: None,
            role: None,
            app_id: None,
            tool_id: None,
            workflow_id: None,
            agent_id: None,
            memory_id: None,
            run_id: None,
            mode: None,
            risk_level: None,
            attributes: Map::new(),
        }
    }

    /// JSON view that conditions resolve against.
    ///
    /// Flat fields (`tool_id`, `mode`, ...) sit at the top level next to
    /// nested views (`tool.id`, `tool.risk_level`, `run.mode`, `user.role`).
    /// Extension attributes are merged first and never override known fields.
    pub fn to_document(&self) -> Value {
        let mut doc = self.attributes.clone();

        let flat = [
            ("action", json!(self.action)),
            ("tenant_id", json!(self.tenant_id)),
            ("user_id", json!(self.user_id)),
            ("role", json!(self.role)),
            ("app_id", json!(self.app_id)),
            ("tool_id", json!(self.tool_id)),
            ("workflow_id", json!(self.workflow_id)),
            ("agent_id", json!(self.agent_id)),
            ("memory_id", json!(self.memory_id)),
            ("run_id", json!(self.run_id)),
            ("mode", json!(self.mode)),
            ("risk_level", json!(self.risk_level)),
        ];
        for (key, value) in flat {
            doc.insert(key.to_string(), value);
        }

        let nested = [
            ("tenant", json!({"id": self.tenant_id})),
            ("user", json!({"id": self.user_id, "role": self.role})),
            ("app", json!({"id": self.app_id})),
            ("tool", json!({"id": self.tool_id, "risk_level": self.risk_level})),
            ("workflow", json!({"id": self.workflow_id})),
            ("agent", json!({"id": self.agent_id})),
            ("memory", json!({"id": self.memory_id})),
            ("run", json!({"id": self.run_id, "mode": self.mode})),
        ];
        for (key, value) in nested {
            doc.insert(key.to_string(), value);
        }

        Value::Object(doc)
    }
}

/// Outcome of a policy evaluation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub reason: Option<String>,
    pub requires_approval: bool,
    /// Advisory control-field changes from a `modify` policy; not enforced here
    pub modified_context: Option<Map<String, Value>>,
    /// The matched policy, or `None` for the default allow
    pub policy_id: Option<PolicyId>,
}

impl PolicyDecision {
    pub fn default_allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            requires_approval: false,
            modified_context: None,
            policy_id: None,
        }
    }
}

/// Request details available before a run exists
#[derive(Debug, Clone)]
pub struct RunStartContext {
    pub tenant_id: String,
    pub user_id: Option<String>,
    pub app_id: Option<String>,
    pub mode: RunMode,
    pub input: Value,
}

/// Policy engine trait
#[async_trait::async_trait]
pub trait PolicyEngine: Send + Sync {
    /// Evaluate enabled, in-scope policies in priority order; first match wins
    async fn evaluate_policies(&self, context: &PolicyEvaluationContext) -> Result<PolicyDecision>;

    /// Check a tool call, loading the tool's risk level and the run's mode
    async fn check_tool_call(&self, tool_id: &str, context: &ToolContext) -> Result<PolicyDecision>;

    /// Check an agent invocation within a run
    async fn check_agent_call(&self, agent_id: &str, context: &ToolContext) -> Result<PolicyDecision>;

    /// Check whether a workflow may be started
    async fn check_run_start(
        &self,
        workflow_id: &WorkflowId,
        request: &RunStartContext,
    ) -> Result<PolicyDecision>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::rules::resolve_field;

    #[test]
    fn test_document_exposes_flat_and_nested_fields() {
        let mut ctx = PolicyEvaluationContext::new(PolicyAction::ToolCall, "tenant-a");
        ctx.tool_id = Some("crm.update".to_string());
        ctx.risk_level = Some(RiskLevel::High);
        ctx.mode = Some(RunMode::Auto);
        ctx.attributes
            .insert("region".to_string(), json!({"code": "eu-west"}));
        // Attributes cannot shadow known fields
        ctx.attributes.insert("tenant_id".to_string(), json!("spoofed"));

        let doc = ctx.to_document();
        assert_eq!(resolve_field(&doc, "action"), Some(&json!("tool_call")));
        assert_eq!(resolve_field(&doc, "tool.risk_level"), Some(&json!("high")));
        assert_eq!(resolve_field(&doc, "risk_level"), Some(&json!("high")));
        assert_eq!(resolve_field(&doc, "run.mode"), Some(&json!("auto")));
        assert_eq!(resolve_field(&doc, "region.code"), Some(&json!("eu-west")));
        assert_eq!(resolve_field(&doc, "tenant_id"), Some(&json!("tenant-a")));
        assert!(resolve_field(&doc, "user.id").is_none());
    }
}
