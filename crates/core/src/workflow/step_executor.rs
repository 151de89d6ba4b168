use super::node::{AgentNodeConfig, NodeKind, StaticConfig, ToolNodeConfig};
use crate::agent::{AgentContext, AgentInvoker};
use crate::budget::{estimate_cost_cents, BudgetTracker};
use crate::error::{error_chain, EngineError, Result};
use crate::events::{Event, EventKind, EventLog};
use crate::metrics::{self, labels, MetricsCollector};
use crate::policy::PolicyEngine;
use crate::storage::IndexStore;
use crate::tools::ToolRuntime;
use crate::types::{Node, NodeType, Run, Step, StepStatus, ToolContext};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

/// Executes one workflow node as a persisted step
pub struct StepExecutor {
    index_store: Arc<dyn IndexStore>,
    event_log: Arc<dyn EventLog>,
    tool_runtime: Arc<ToolRuntime>,
    agent: Arc<dyn AgentInvoker>,
    budget: Arc<BudgetTracker>,
    policy_engine: Arc<dyn PolicyEngine>,
    metrics: Arc<MetricsCollector>,
}

impl StepExecutor {
    pub fn new(
        index_store: Arc<dyn IndexStore>,
        event_log: Arc<dyn EventLog>,
        tool_runtime: Arc<ToolRuntime>,
        agent: Arc<dyn AgentInvoker>,
        budget: Arc<BudgetTracker>,
        policy_engine: Arc<dyn PolicyEngine>,
    ) -> Self {
        let metrics = tool_runtime.metrics();
        Self {
            index_store,
            event_log,
            tool_runtime,
            agent,
            budget,
            policy_engine,
            metrics,
        }
    }

    /// Run a node through pending -> running -> completed/failed.
    ///
    /// The returned step is already persisted. On `Err` the step has been
    /// recorded as failed and the caller should abort the run.
    pub async fn execute(&self, run: &Run, node: &Node, previous_steps: &[Step]) -> Result<Step> {
        let mut step = Step::new(run.id, node);
        self.index_store.save_step(&step)?;
        self.record(
            &step,
            EventKind::StepStarted,
            json!({"node_id": node.id, "node_type": node.node_type.as_str()}),
        )
        .await?;

        step.transition(StepStatus::Running, None)?;
        self.index_store.save_step(&step)?;

        info!(run_id = %run.id, step_id = %step.id, node_id = %node.id, "Executing step");

        match self.dispatch(run, &step, node, previous_steps).await {
            Ok(output) => {
                step.transition(StepStatus::Completed, Some(output.clone()))?;
                self.index_store.save_step(&step)?;
                self.record(
                    &step,
                    EventKind::StepCompleted,
                    json!({"node_id": node.id, "output": output}),
                )
                .await?;
                Ok(step)
            }
            Err(err) => {
                warn!(run_id = %run.id, step_id = %step.id, node_id = %node.id, error = %err, "Step failed");
                self.record_failure(&mut step, node, &err).await;
                Err(err)
            }
        }
    }

    // Best effort: the step error is what the caller needs to see
    async fn record_failure(&self, step: &mut Step, node: &Node, err: &EngineError) {
        let output = json!({"error": err.to_string(), "code": err.code()});
        if let Err(e) = step.transition(StepStatus::Failed, Some(output)) {
            warn!(step_id = %step.id, error = %e, "Failed to mark step failed");
        }
        if let Err(e) = self.index_store.save_step(step) {
            warn!(step_id = %step.id, error = %e, "Failed to persist failed step");
        }

        let payload = json!({"node_id": node.id, "error": err.to_string(), "code": err.code()});
        if let Err(e) = self.record(step, EventKind::StepFailed, payload).await {
            warn!(step_id = %step.id, error = %e, "Failed to record step failure");
        }
    }

    async fn dispatch(&self, run: &Run, step: &Step, node: &Node, previous_steps: &[Step]) -> Result<Value> {
        match NodeKind::from_node(node)? {
            NodeKind::Static(config) => Ok(static_output(config, run)),
            NodeKind::Tool(config) => self.run_tool(run, step, config).await,
            NodeKind::Agent(config) => self.run_agent(run, step, config, previous_steps).await,
            NodeKind::Placeholder(node_type) => Ok(placeholder_output(node, &node_type)),
        }
    }

    async fn run_tool(&self, run: &Run, step: &Step, config: ToolNodeConfig) -> Result<Value> {
        let context = ToolContext::for_step(run, step.id);
        let input = config.input.unwrap_or_else(|| run.input.clone());
        self.tool_runtime
            .call_tool(&config.tool_id, input, &context)
            .await
    }

    async fn run_agent(
        &self,
        run: &Run,
        step: &Step,
        config: AgentNodeConfig,
        previous_steps: &[Step],
    ) -> Result<Value> {
        let agent_id = config.agent_id;

        let budget = self.budget.check_budget(run.id);
        if budget.exceeded {
            let reason = budget.reason.unwrap_or_default();
            warn!(run_id = %run.id, agent_id = %agent_id, reason = %reason, "Budget exceeded");
            return Err(EngineError::AgentExecution {
                agent_id,
                message: format!("Budget exceeded: {}", reason),
                chain: Vec::new(),
            });
        }

        let call = ToolContext::for_step(run, step.id);

        match self.policy_engine.check_agent_call(&agent_id, &call).await {
            Ok(decision) if !decision.allowed => {
                self.metrics.increment_counter(
                    metrics::POLICY_DENIALS_TOTAL,
                    labels([("tenant_id", run.tenant_id.as_str()), ("check", "agent_call")]),
                );
                return Err(EngineError::AgentExecution {
                    agent_id,
                    message: format!(
                        "Policy denied: {}",
                        decision.reason.unwrap_or_else(|| "agent call denied".to_string())
                    ),
                    chain: Vec::new(),
                });
            }
            Ok(_) => {}
            Err(e) => {
                warn!(run_id = %run.id, agent_id = %agent_id, error = %e, "Agent policy check failed, allowing");
            }
        }

        let context = AgentContext {
            call,
            workflow_input: run.input.clone(),
            previous_steps: previous_steps.to_vec(),
        };
        let input = config.input.unwrap_or_else(|| run.input.clone());

        let result = self
            .agent
            .run_agent_step(&agent_id, &context, input)
            .await
            .map_err(|e| EngineError::AgentExecution {
                agent_id: agent_id.clone(),
                message: format!("{:#}", e),
                chain: error_chain(&e),
            })?;

        self.budget.increment_llm_calls(run.id);
        let cost_cents = result
            .usage
            .as_ref()
            .map(|u| estimate_cost_cents(&u.provider, &u.model, &u.tokens))
            .unwrap_or(0);
        if cost_cents > 0 {
            self.budget.add_cost(run.id, cost_cents);
        }

        let model = result.usage.as_ref().map(|u| u.model.as_str()).unwrap_or("unknown");
        self.metrics.increment_counter(
            metrics::LLM_CALLS_TOTAL,
            labels([("tenant_id", run.tenant_id.as_str()), ("model", model)]),
        );
        if cost_cents > 0 {
            self.metrics.increment_counter_by(
                metrics::LLM_COST_CENTS_TOTAL,
                cost_cents,
                labels([("tenant_id", run.tenant_id.as_str())]),
            );
        }

        self.record(
            step,
            EventKind::LlmCall,
            json!({
                "agent_id": agent_id,
                "provider": result.usage.as_ref().map(|u| u.provider.as_str()),
                "model": result.usage.as_ref().map(|u| u.model.as_str()),
                "usage": result.usage.as_ref().map(|u| &u.tokens),
                "finish_reason": result.finish_reason,
                "estimated_cost_cents": cost_cents,
            }),
        )
        .await?;

        Ok(json!({
            "text": result.text,
            "tool_calls": result.tool_calls,
            "finish_reason": result.finish_reason,
        }))
    }

    async fn record(&self, step: &Step, kind: EventKind, payload: Value) -> Result<()> {
        let event = Event::new(step.run_id, kind, payload).with_step(Some(step.id));
        self.event_log.append(event).await?;
        Ok(())
    }
}

fn static_output(config: StaticConfig, run: &Run) -> Value {
    config
        .output
        .or(config.value)
        .unwrap_or_else(|| run.input.clone())
}

fn placeholder_output(node: &Node, node_type: &NodeType) -> Value {
    warn!(node_id = %node.id, node_type = %node_type, "Node type not implemented, completing as placeholder");
    json!({
        "message": format!("Node type '{}' is not implemented", node_type),
        "placeholder": true,
    })
}
