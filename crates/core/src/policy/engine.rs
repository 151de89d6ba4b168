use super::rules::{evaluate_rule, modified_context};
use super::{
    PolicyAction, PolicyDecision, PolicyEngine, PolicyEvaluationContext, RunStartContext,
};
use crate::error::{EngineError, Result};
use crate::events::{Event, EventKind, EventLog};
use crate::storage::IndexStore;
use crate::types::{Policy, PolicyEffect, PolicyScope, ToolContext, WorkflowId};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

/// Rule-based policy engine backed by the index store
pub struct RulePolicyEngine {
    index_store: Arc<dyn IndexStore>,
    event_log: Arc<dyn EventLog>,
}

impl RulePolicyEngine {
    pub fn new(index_store: Arc<dyn IndexStore>, event_log: Arc<dyn EventLog>) -> Self {
        Self {
            index_store,
            event_log,
        }
    }

    /// Enabled policies in scope for this context, ascending by priority
    fn applicable_policies(&self, context: &PolicyEvaluationContext) -> Result<Vec<Policy>> {
        let mut policies: Vec<Policy> = self
            .index_store
            .list_policies()?
            .into_iter()
            .filter(|p| p.enabled && in_scope(p, context))
            .collect();

        // Stable: equal priorities keep id order
        policies.sort_by_key(|p| p.priority);
        Ok(policies)
    }

    async fn log_decision(
        &self,
        context: &PolicyEvaluationContext,
        policy: Option<&Policy>,
        decision: &PolicyDecision,
    ) {
        let Some(run_id) = context.run_id else {
            return;
        };

        let payload = json!({
            "policy_id": policy.map(|p| p.id.0.as_str()),
            "policy_name": policy.map(|p| p.name.as_str()),
            "effect": policy.map(|p| p.effect.as_str()).unwrap_or("default_allow"),
            "allowed": decision.allowed,
            "requires_approval": decision.requires_approval,
            "reason": decision.reason,
            "action": context.action,
            "tool_id": context.tool_id,
            "workflow_id": context.workflow_id,
            "agent_id": context.agent_id,
            "app_id": context.app_id,
            "user_id": context.user_id,
            "tenant_id": context.tenant_id,
        });

        // Losing the audit record must not turn a deny into an allow
        if let Err(e) = self
            .event_log
            .append(Event::new(run_id, EventKind::PolicyEval, payload))
            .await
        {
            warn!(run_id = %run_id, error = %e, "Failed to record policy decision");
        }
    }
}

fn in_scope(policy: &Policy, context: &PolicyEvaluationContext) -> bool {
    let target = match policy.scope {
        PolicyScope::Global => return true,
        PolicyScope::Tenant => Some(context.tenant_id.as_str()),
        PolicyScope::App => context.app_id.as_deref(),
        PolicyScope::Tool => context.tool_id.as_deref(),
        PolicyScope::Workflow => context.workflow_id.as_deref(),
        PolicyScope::Agent => context.agent_id.as_deref(),
    };

    target.is_some_and(|id| policy.scope_id.as_deref() == Some(id))
}

fn decision_for(policy: &Policy) -> PolicyDecision {
    let base = PolicyDecision {
        policy_id: Some(policy.id.clone()),
        ..PolicyDecision::default_allow()
    };

    match policy.effect {
        PolicyEffect::Allow => PolicyDecision {
            reason: Some(format!("Allowed by policy: {}", policy.name)),
            ..base
        },
        PolicyEffect::Deny => PolicyDecision {
            allowed: false,
            reason: Some(format!("Denied by policy: {}", policy.name)),
            ..base
        },
        PolicyEffect::RequireApproval => PolicyDecision {
            allowed: false,
            requires_approval: true,
            reason: Some(format!("Approval required by policy: {}", policy.name)),
            ..base
        },
        PolicyEffect::Modify => PolicyDecision {
            reason: Some(format!("Modified by policy: {}", policy.name)),
            modified_context: Some(modified_context(&policy.rule_expr)),
            ..base
        },
    }
}

#[async_trait::async_trait]
impl PolicyEngine for RulePolicyEngine {
    async fn evaluate_policies(&self, context: &PolicyEvaluationContext) -> Result<PolicyDecision> {
        let policies = self.applicable_policies(context)?;
        let document = context.to_document();

        for policy in &policies {
            if !evaluate_rule(&policy.rule_expr, &document) {
                continue;
            }

            let decision = decision_for(policy);
            debug!(
                policy_id = %policy.id,
                effect = policy.effect.as_str(),
                action = ?context.action,
                "Policy matched"
            );
            self.log_decision(context, Some(policy), &decision).await;
            return Ok(decision);
        }

        let decision = PolicyDecision::default_allow();
        self.log_decision(context, None, &decision).await;
        Ok(decision)
    }

    async fn check_tool_call(&self, tool_id: &str, context: &ToolContext) -> Result<PolicyDecision> {
        let tool = self
            .index_store
            .get_tool(tool_id)?
            .ok_or_else(|| EngineError::not_found("tool", tool_id))?;
        let run = self
            .index_store
            .get_run(&context.run_id)?
            .ok_or_else(|| EngineError::not_found("run", context.run_id.to_string()))?;

        let mut eval = PolicyEvaluationContext::new(PolicyAction::ToolCall, &context.tenant_id);
        eval.user_id = context.user_id.clone();
        eval.app_id = context.app_id.clone();
        eval.tool_id = Some(tool.id);
        eval.workflow_id = Some(run.workflow_id.0);
        eval.run_id = Some(run.id);
        eval.mode = Some(run.mode);
        eval.risk_level = Some(tool.risk_level);

        self.evaluate_policies(&eval).await
    }

    async fn check_agent_call(&self, agent_id: &str, context: &ToolContext) -> Result<PolicyDecision> {
        let agent = self
            .index_store
            .get_agent(agent_id)?
            .ok_or_else(|| EngineError::not_found("agent", agent_id))?;
        let run = self
            .index_store
            .get_run(&context.run_id)?
            .ok_or_else(|| EngineError::not_found("run", context.run_id.to_string()))?;

        let mut eval =
            PolicyEvaluationContext::new(PolicyAction::WorkflowExecution, &context.tenant_id);
        eval.user_id = context.user_id.clone();
        eval.app_id = context.app_id.clone();
        eval.agent_id = Some(agent.id);
        eval.workflow_id = Some(run.workflow_id.0);
        eval.run_id = Some(run.id);
        eval.mode = Some(run.mode);
        eval.attributes
            .insert("model".to_string(), json!(agent.model_profile));

        self.evaluate_policies(&eval).await
    }

    async fn check_run_start(
        &self,
        workflow_id: &WorkflowId,
        request: &RunStartContext,
    ) -> Result<PolicyDecision> {
        let mut eval = PolicyEvaluationContext::new(PolicyAction::RunStart, &request.tenant_id);
        eval.user_id = request.user_id.clone();
        eval.app_id = request.app_id.clone();
        eval.workflow_id = Some(workflow_id.0.clone());
        eval.mode = Some(request.mode);
        eval.attributes
            .insert("input".to_string(), request.input.clone());

        self.evaluate_policies(&eval).await
    }
}
