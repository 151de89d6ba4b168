use super::builtin::register_builtins;
use super::registry::{ToolHandler, ToolRegistry};
use super::schema;
use crate::apps::AppScopeChecker;
use crate::error::{error_chain, EngineError, Result};
use crate::events::{Event, EventKind, EventLog};
use crate::metrics::{self, labels, MetricsCollector};
use crate::policy::PolicyEngine;
use crate::retry::{retry_with_backoff, RetryConfig, RetryOutcome};
use crate::storage::IndexStore;
use crate::types::{Tool, ToolContext};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

/// Loads, authorizes, validates and executes tool calls
pub struct ToolRuntime {
    index_store: Arc<dyn IndexStore>,
    event_log: Arc<dyn EventLog>,
    policy_engine: Arc<dyn PolicyEngine>,
    app_scopes: Arc<dyn AppScopeChecker>,
    registry: ToolRegistry,
    retry: RetryConfig,
    metrics: Arc<MetricsCollector>,
}

impl ToolRuntime {
    /// Create a runtime with the built-in handlers registered
    pub fn new(
        index_store: Arc<dyn IndexStore>,
        event_log: Arc<dyn EventLog>,
        policy_engine: Arc<dyn PolicyEngine>,
        app_scopes: Arc<dyn AppScopeChecker>,
    ) -> Self {
        let registry = ToolRegistry::new();
        register_builtins(&registry);

        Self {
            index_store,
            event_log,
            policy_engine,
            app_scopes,
            registry,
            retry: RetryConfig::default(),
            metrics: Arc::new(MetricsCollector::new()),
        }
    }

    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Share a collector with the rest of the engine
    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> Arc<MetricsCollector> {
        self.metrics.clone()
    }

    /// Register (or replace) the handler for a tool id
    pub fn register_tool(&self, tool_id: impl Into<String>, handler: Arc<dyn ToolHandler>) {
        self.registry.register(tool_id, handler);
    }

    pub fn has_handler(&self, tool_id: &str) -> bool {
        self.registry.contains(tool_id)
    }

    pub fn get_tool(&self, tool_id: &str) -> Result<Option<Tool>> {
        Ok(self.index_store.get_tool(tool_id)?)
    }

    pub fn list_tools(&self) -> Result<Vec<Tool>> {
        Ok(self.index_store.list_tools()?)
    }

    /// Store definitions for every handler that ships one, overwriting stale rows
    pub fn seed_builtin_tools(&self) -> Result<usize> {
        let definitions = self.registry.definitions();
        for tool in &definitions {
            self.index_store.put_tool(tool)?;
        }
        Ok(definitions.len())
    }

    /// Run a tool call through every gate: lookup, policy, app scope,
    /// input schema, then the handler under bounded retry.
    pub async fn call_tool(&self, tool_id: &str, input: Value, context: &ToolContext) -> Result<Value> {
        let tool = self
            .index_store
            .get_tool(tool_id)?
            .ok_or_else(|| EngineError::not_found("tool", tool_id))?;

        self.check_policy(tool_id, context).await?;
        self.check_app_scope(tool_id, context).await?;

        let errors = schema::validate(&tool.input_schema, &input);
        if !errors.is_empty() {
            return Err(EngineError::Validation {
                tool_id: tool_id.to_string(),
                errors,
            });
        }

        let handler = self
            .registry
            .get(tool_id)
            .ok_or_else(|| EngineError::HandlerMissing {
                tool_id: tool_id.to_string(),
            })?;

        let outcome = retry_with_backoff(&self.retry, |_attempt| handler.execute(input.clone(), context)).await;

        match outcome {
            RetryOutcome::Success { value, attempts } => {
                info!(run_id = %context.run_id, tool_id, attempts, "Tool call succeeded");
                self.count_call(tool_id, context, "success", attempts);
                self.record(
                    context,
                    EventKind::ToolCall,
                    json!({
                        "tool_id": tool_id,
                        "input": input,
                        "output": value,
                        "attempts": attempts,
                        "context": context,
                    }),
                )
                .await?;
                Ok(value)
            }
            RetryOutcome::RetriesExhausted {
                last_error,
                attempts,
            } => {
                let chain = error_chain(&last_error);
                warn!(run_id = %context.run_id, tool_id, attempts, error = %last_error, "Tool call failed");
                self.count_call(tool_id, context, "error", attempts);
                self.record(
                    context,
                    EventKind::Error,
                    json!({
                        "tool_id": tool_id,
                        "input": input,
                        "error": last_error.to_string(),
                        "error_type": "TOOL_EXECUTION_ERROR",
                        "stack": chain,
                        "attempts": attempts,
                        "context": context,
                    }),
                )
                .await?;
                Err(EngineError::ToolExecution {
                    tool_id: tool_id.to_string(),
                    message: format!("{:#}", last_error),
                    attempts,
                    chain,
                })
            }
        }
    }

    async fn check_policy(&self, tool_id: &str, context: &ToolContext) -> Result<()> {
        match self.policy_engine.check_tool_call(tool_id, context).await {
            Ok(decision) if !decision.allowed => {
                warn!(
                    run_id = %context.run_id,
                    tool_id,
                    requires_approval = decision.requires_approval,
                    "Tool call denied by policy"
                );
                self.count_denial("tool_call", context);
                Err(EngineError::PolicyDenied {
                    reason: decision
                        .reason
                        .unwrap_or_else(|| format!("tool '{}' denied", tool_id)),
                    requires_approval: decision.requires_approval,
                })
            }
            Ok(_) => Ok(()),
            Err(e) => {
                // Fail open: an unavailable policy engine does not block tool calls
                warn!(run_id = %context.run_id, tool_id, error = %e, "Policy check failed, allowing");
                Ok(())
            }
        }
    }

    async fn check_app_scope(&self, tool_id: &str, context: &ToolContext) -> Result<()> {
        let Some(app_id) = context.app_id.as_deref() else {
            return Ok(());
        };

        if self.app_scopes.check_tool_scope(app_id, tool_id).await? {
            return Ok(());
        }

        warn!(run_id = %context.run_id, app_id, tool_id, "Tool not in app scope");
        self.count_denial("app_scope", context);
        self.record(
            context,
            EventKind::PolicyEval,
            json!({
                "check": "app_scope",
                "allowed": false,
                "app_id": app_id,
                "tool_id": tool_id,
                "tenant_id": context.tenant_id,
                "user_id": context.user_id,
            }),
        )
        .await?;

        Err(EngineError::ScopeDenied {
            app_id: app_id.to_string(),
            tool_id: tool_id.to_string(),
        })
    }

    fn count_call(&self, tool_id: &str, context: &ToolContext, outcome: &str, attempts: u32) {
        self.metrics.increment_counter(
            metrics::TOOL_CALLS_TOTAL,
            labels([
                ("tenant_id", context.tenant_id.as_str()),
                ("tool_id", tool_id),
                ("outcome", outcome),
            ]),
        );
        if attempts > 1 {
            self.metrics.increment_counter_by(
                metrics::TOOL_RETRIES_TOTAL,
                u64::from(attempts - 1),
                labels([("tenant_id", context.tenant_id.as_str()), ("tool_id", tool_id)]),
            );
        }
    }

    fn count_denial(&self, check: &str, context: &ToolContext) {
        self.metrics.increment_counter(
            metrics::POLICY_DENIALS_TOTAL,
            labels([("tenant_id", context.tenant_id.as_str()), ("check", check)]),
        );
    }

    async fn record(&self, context: &ToolContext, kind: EventKind, payload: Value) -> Result<()> {
        let event = Event::new(context.run_id, kind, payload).with_step(context.step_id);
        self.event_log.append(event).await?;
        Ok(())
    }
}
