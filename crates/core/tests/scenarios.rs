use logline_core::agent::{AgentContext, AgentInvoker, AgentResult, AgentToolCall, LlmUsage};
use logline_core::apps::{start_app_action, AppActionRequest, IndexAppScopes};
use logline_core::budget::{BudgetConfig, BudgetTracker, TokenUsage};
use logline_core::events::{Event, EventKind, EventLog};
use logline_core::metrics::{self, labels};
use logline_core::policy::{PolicyEngine, RulePolicyEngine};
use logline_core::retry::RetryConfig;
use logline_core::storage::{IndexStore, JsonlEventLog, RedbIndexStore};
use logline_core::tools::{handler_fn, ToolRuntime};
use logline_core::workflow::{Orchestrator, StartRun};
use logline_core::*;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;

struct Engine {
    _dir: TempDir,
    index: Arc<RedbIndexStore>,
    events: Arc<JsonlEventLog>,
    policy: Arc<RulePolicyEngine>,
    tools: Arc<ToolRuntime>,
    budget: Arc<BudgetTracker>,
    orchestrator: Orchestrator,
}

fn engine_with<F>(budget: BudgetConfig, make_agent: F) -> Engine
where
    F: FnOnce(Arc<ToolRuntime>) -> Arc<dyn AgentInvoker>,
{
    let dir = TempDir::new().unwrap();
    let index = Arc::new(RedbIndexStore::new(dir.path().join("index.redb")).unwrap());
    let events = Arc::new(JsonlEventLog::new(dir.path().join("events")).unwrap());
    let policy = Arc::new(RulePolicyEngine::new(index.clone(), events.clone()));

    let tools = Arc::new(
        ToolRuntime::new(
            index.clone(),
            events.clone(),
            policy.clone(),
            Arc::new(IndexAppScopes::new(index.clone())),
        )
        .with_retry_config(RetryConfig {
            max_attempts: 3,
            base_delay_ms: 1,
        }),
    );
    tools.seed_builtin_tools().unwrap();

    let budget = Arc::new(BudgetTracker::new(budget));
    let agent = make_agent(tools.clone());
    let orchestrator = Orchestrator::new(
        index.clone(),
        events.clone(),
        policy.clone(),
        tools.clone(),
        agent,
        budget.clone(),
    );

    Engine {
        _dir: dir,
        index,
        events,
        policy,
        tools,
        budget,
        orchestrator,
    }
}

impl Engine {
    /// Drop every store handle, keeping only the data directory
    fn into_dir(self) -> TempDir {
        self._dir
    }
}

fn engine() -> Engine {
    engine_with(BudgetConfig::default(), |_| Arc::new(CountingAgent::default()))
}

fn linear(id: &str, nodes: Value, edges: Value, entry: &str) -> Workflow {
    serde_json::from_value(json!({
        "id": id,
        "name": id,
        "version": "1.0.0",
        "type": "linear",
        "definition": {"nodes": nodes, "edges": edges, "entryNode": entry}
    }))
    .unwrap()
}

fn agent_row(id: &str) -> Agent {
    Agent {
        id: id.to_string(),
        name: id.to_string(),
        instructions: None,
        model_profile: ModelProfile {
            provider: "openai".to_string(),
            model: "gpt-4o".to_string(),
            temperature: None,
            max_tokens: None,
        },
        allowed_tools: vec!["core.echo".to_string()],
    }
}

fn kinds(events: &[Event]) -> Vec<EventKind> {
    events
        .iter()
        .map(|e| e.kind)
        .filter(|k| *k != EventKind::PolicyEval)
        .collect()
}

#[derive(Default)]
struct CountingAgent {
    calls: AtomicU32,
    usage: Option<LlmUsage>,
}

#[async_trait::async_trait]
impl AgentInvoker for CountingAgent {
    async fn run_agent_step(
        &self,
        agent_id: &str,
        _context: &AgentContext,
        _input: Value,
    ) -> anyhow::Result<AgentResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(AgentResult {
            text: format!("handled by {}", agent_id),
            tool_calls: vec![],
            finish_reason: Some("stop".to_string()),
            usage: self.usage.clone(),
        })
    }
}

/// Calls back into the tool runtime the way a real agent runtime would
struct EchoingAgent {
    tools: Arc<ToolRuntime>,
}

#[async_trait::async_trait]
impl AgentInvoker for EchoingAgent {
    async fn run_agent_step(
        &self,
        _agent_id: &str,
        context: &AgentContext,
        input: Value,
    ) -> anyhow::Result<AgentResult> {
        let tool_input = json!({"value": input});
        let output = self
            .tools
            .call_tool("core.echo", tool_input.clone(), &context.call)
            .await?;

        Ok(AgentResult {
            text: format!("saw {} previous step(s)", context.previous_steps.len()),
            tool_calls: vec![AgentToolCall {
                tool_id: "core.echo".to_string(),
                input: tool_input,
                output: Some(output),
            }],
            finish_reason: Some("stop".to_string()),
            usage: None,
        })
    }
}

async fn wait_for_terminal(orchestrator: &Orchestrator, run_id: RunId) -> Run {
    for _ in 0..500 {
        let run = orchestrator.get_run(run_id).unwrap().unwrap();
        if run.status.is_terminal() {
            return run;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run {} did not finish", run_id);
}

#[tokio::test]
async fn scenario_a_linear_static_then_tool() {
    let e = engine();
    e.index
        .put_workflow(&linear(
            "wf-linear-2",
            json!([
                {"id": "A", "type": "static", "config": {"output": {"greeting": "hello"}}},
                {"id": "B", "type": "tool", "config": {"tool_id": "ticketing.list_open"}}
            ]),
            json!([{"from": "A", "to": "B"}]),
            "A",
        ))
        .unwrap();

    let (run, handle) = e
        .orchestrator
        .start_run_supervised(
            StartRun::new(WorkflowId::new("wf-linear-2"), json!({"x": 1}))
                .mode(RunMode::Draft)
                .tenant("tenant-a"),
        )
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Pending);

    let outcome = handle.wait().await.unwrap();
    assert_eq!(outcome.status, RunStatus::Completed);

    let stored = e.orchestrator.get_run(run.id).unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Completed);
    assert_eq!(
        stored.result.as_ref().unwrap()["message"],
        "Workflow completed successfully"
    );

    let steps = e.orchestrator.list_steps(run.id).unwrap();
    assert_eq!(steps.len(), 2);
    assert!(steps
        .iter()
        .all(|s| s.status == StepStatus::Completed && s.finished_at.is_some()));
    assert_eq!(steps[0].node_id, "A");
    assert_eq!(steps[0].output.as_ref().unwrap()["greeting"], "hello");
    assert_eq!(steps[1].step_type, NodeType::Tool);

    let events = e.orchestrator.get_run_events(run.id).await.unwrap();
    assert_eq!(
        kinds(&events),
        vec![
            EventKind::RunStarted,
            EventKind::StepStarted,
            EventKind::StepCompleted,
            EventKind::StepStarted,
            EventKind::ToolCall,
            EventKind::StepCompleted,
            EventKind::RunCompleted,
        ]
    );
    assert_eq!(events.iter().filter(|e| e.kind == EventKind::RunStarted).count(), 1);

    let tool_call = events.iter().find(|e| e.kind == EventKind::ToolCall).unwrap();
    assert_eq!(tool_call.step_id, Some(steps[1].id));
    assert_eq!(tool_call.payload["input"], json!({"x": 1}));

    let collector = e.orchestrator.metrics();
    let tenant = labels([("tenant_id", "tenant-a")]);
    assert_eq!(
        collector.counter_total(metrics::RUNS_TOTAL, &labels([("status", "completed"), ("tenant_id", "tenant-a")])),
        1
    );
    assert_eq!(collector.counter_total(metrics::TOOL_CALLS_TOTAL, &tenant), 1);
    assert_eq!(collector.get_gauge(metrics::RUNS_ACTIVE, &tenant).unwrap().value, 0.0);
}

#[tokio::test]
async fn completed_run_trail_survives_restart() {
    let e = engine();
    e.index
        .put_workflow(&linear(
            "wf-one",
            json!([{"id": "only", "type": "static", "config": {"output": {"ok": true}}}]),
            json!([]),
            "only",
        ))
        .unwrap();

    let (run, handle) = e
        .orchestrator
        .start_run_supervised(StartRun::new(WorkflowId::new("wf-one"), json!({})))
        .await
        .unwrap();
    assert_eq!(handle.wait().await.unwrap().status, RunStatus::Completed);

    // Far below the buffer threshold, so only the terminal flush writes these out
    let dir = e.into_dir();
    let index = RedbIndexStore::new(dir.path().join("index.redb")).unwrap();
    let events = JsonlEventLog::new(dir.path().join("events")).unwrap();

    let stored = index.get_run(&run.id).unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Completed);

    let trail = events.get_run_events(run.id).await.unwrap();
    assert_eq!(trail.iter().filter(|e| e.kind == EventKind::RunStarted).count(), 1);
    assert_eq!(trail.iter().filter(|e| e.kind == EventKind::RunCompleted).count(), 1);
    assert_eq!(kinds(&trail).last(), Some(&EventKind::RunCompleted));
}

#[tokio::test]
async fn scenario_b_global_deny_applies_to_every_tenant() {
    let e = engine();
    e.index
        .put_policy(&Policy {
            id: PolicyId::new("deny-everything"),
            name: "Deny everything".to_string(),
            description: None,
            scope: PolicyScope::Global,
            scope_id: None,
            rule_expr: RuleExpr::default(),
            effect: PolicyEffect::Deny,
            priority: 0,
            enabled: true,
        })
        .unwrap();

    for tenant in ["tenant-a", "tenant-b", "default-tenant"] {
        let run = Run {
            id: RunId::new(),
            workflow_id: WorkflowId::new("wf"),
            workflow_version: "1".to_string(),
            tenant_id: tenant.to_string(),
            user_id: None,
            app_id: None,
            app_action_id: None,
            status: RunStatus::Running,
            mode: RunMode::Auto,
            input: json!({}),
            result: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        e.index.save_run(&run).unwrap();

        let context = ToolContext {
            run_id: run.id,
            step_id: None,
            tenant_id: tenant.to_string(),
            user_id: None,
            app_id: None,
        };
        let decision = e
            .policy
            .check_tool_call("ticketing.list_open", &context)
            .await
            .unwrap();
        assert!(!decision.allowed, "tenant {} was allowed", tenant);

        let err = e
            .tools
            .call_tool("ticketing.list_open", json!({}), &context)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::PolicyDenied { requires_approval: false, .. }));
    }

    // Run starts are governed by the same policy set
    e.index
        .put_workflow(&linear(
            "wf",
            json!([{"id": "A", "type": "static"}]),
            json!([]),
            "A",
        ))
        .unwrap();
    let err = e
        .orchestrator
        .start_run(StartRun::new(WorkflowId::new("wf"), json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::PolicyDenied { .. }));

    let collector = e.orchestrator.metrics();
    assert_eq!(
        collector.counter_total(metrics::POLICY_DENIALS_TOTAL, &labels([("check", "tool_call")])),
        3
    );
    assert_eq!(
        collector.counter_total(metrics::POLICY_DENIALS_TOTAL, &labels([("check", "run_start")])),
        1
    );
}

#[tokio::test]
async fn scenario_c_zero_call_budget_fails_agent_step_before_invocation() {
    let agent = Arc::new(CountingAgent::default());
    let invoker = agent.clone();
    let e = engine_with(
        BudgetConfig {
            max_llm_calls: 0,
            max_cost_cents: 500,
        },
        move |_| invoker,
    );
    e.index.put_agent(&agent_row("concierge")).unwrap();
    e.index
        .put_workflow(&linear(
            "wf-agent",
            json!([
                {"id": "greet", "type": "static"},
                {"id": "think", "type": "agent", "config": {"agent_id": "concierge"}},
                {"id": "after", "type": "static"}
            ]),
            json!([{"from": "greet", "to": "think"}, {"from": "think", "to": "after"}]),
            "greet",
        ))
        .unwrap();

    let (run, handle) = e
        .orchestrator
        .start_run_supervised(StartRun::new(WorkflowId::new("wf-agent"), json!({})))
        .await
        .unwrap();
    let outcome = handle.wait().await.unwrap();

    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(agent.calls.load(Ordering::SeqCst), 0);

    let steps = e.orchestrator.list_steps(run.id).unwrap();
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[1].status, StepStatus::Failed);
    assert!(steps[1].finished_at.is_some());
    let error = steps[1].output.as_ref().unwrap()["error"].as_str().unwrap();
    assert!(error.contains("Budget exceeded"));

    let events = e.orchestrator.get_run_events(run.id).await.unwrap();
    assert_eq!(
        kinds(&events),
        vec![
            EventKind::RunStarted,
            EventKind::StepStarted,
            EventKind::StepCompleted,
            EventKind::StepStarted,
            EventKind::StepFailed,
            EventKind::RunFailed,
        ]
    );

    let step_failed = events.iter().find(|e| e.kind == EventKind::StepFailed).unwrap();
    assert_eq!(step_failed.step_id, Some(steps[1].id));
    assert_eq!(step_failed.payload["node_id"], "think");
    assert_eq!(step_failed.payload["code"], "AGENT_EXECUTION_ERROR");
    assert!(step_failed.payload["error"]
        .as_str()
        .unwrap()
        .contains("Budget exceeded"));

    let run_failed = events.iter().find(|e| e.kind == EventKind::RunFailed).unwrap();
    assert_eq!(run_failed.payload["code"], "AGENT_EXECUTION_ERROR");
    assert!(run_failed.payload["error"].as_str().unwrap().contains("Budget exceeded"));
}

#[tokio::test]
async fn scenario_d_flaky_tool_succeeds_within_retry_cap() {
    let e = engine();
    e.index
        .put_tool(&Tool {
            id: "pms.sync".to_string(),
            name: "Sync PMS".to_string(),
            description: None,
            input_schema: json!({"type": "object"}),
            risk_level: RiskLevel::Medium,
            handler_type: Some("code".to_string()),
        })
        .unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    e.tools.register_tool(
        "pms.sync",
        handler_fn(move |_input, _ctx| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    anyhow::bail!("connection reset")
                }
                Ok(json!({"synced": true}))
            }
        }),
    );

    e.index
        .put_workflow(&linear(
            "wf-sync",
            json!([{"id": "sync", "type": "tool", "config": {"tool_id": "pms.sync"}}]),
            json!([]),
            "sync",
        ))
        .unwrap();

    let (run, handle) = e
        .orchestrator
        .start_run_supervised(StartRun::new(WorkflowId::new("wf-sync"), json!({})))
        .await
        .unwrap();
    assert_eq!(handle.wait().await.unwrap().status, RunStatus::Completed);

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let events = e.events.get_run_events(run.id).await.unwrap();
    assert_eq!(
        events.iter().filter(|e| e.kind == EventKind::ToolCall).count(),
        1
    );
    assert!(!events.iter().any(|e| e.kind == EventKind::Error));
}

#[tokio::test]
async fn exhausted_tool_retries_fail_the_run() {
    let e = engine();
    e.index
        .put_tool(&Tool {
            id: "pms.sync".to_string(),
            name: "Sync PMS".to_string(),
            description: None,
            input_schema: json!({"type": "object"}),
            risk_level: RiskLevel::Medium,
            handler_type: Some("code".to_string()),
        })
        .unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    e.tools.register_tool(
        "pms.sync",
        handler_fn(move |_input, _ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Err::<Value, _>(anyhow::anyhow!("gateway timeout")) }
        }),
    );

    e.index
        .put_workflow(&linear(
            "wf-sync",
            json!([
                {"id": "sync", "type": "tool", "config": {"tool_id": "pms.sync"}},
                {"id": "report", "type": "static"}
            ]),
            json!([{"from": "sync", "to": "report"}]),
            "sync",
        ))
        .unwrap();

    let (run, handle) = e
        .orchestrator
        .start_run_supervised(StartRun::new(WorkflowId::new("wf-sync"), json!({})))
        .await
        .unwrap();
    let outcome = handle.wait().await.unwrap();
    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(outcome.result.unwrap()["code"], "TOOL_EXECUTION_ERROR");
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let steps = e.orchestrator.list_steps(run.id).unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].status, StepStatus::Failed);

    let events = e.events.get_run_events(run.id).await.unwrap();
    assert_eq!(
        kinds(&events),
        vec![
            EventKind::RunStarted,
            EventKind::StepStarted,
            EventKind::Error,
            EventKind::StepFailed,
            EventKind::RunFailed,
        ]
    );

    let error = events.iter().find(|e| e.kind == EventKind::Error).unwrap();
    assert_eq!(error.step_id, Some(steps[0].id));
    assert_eq!(error.payload["attempts"], 3);
    assert_eq!(error.payload["error_type"], "TOOL_EXECUTION_ERROR");

    let step_failed = events.iter().find(|e| e.kind == EventKind::StepFailed).unwrap();
    assert_eq!(step_failed.payload["code"], "TOOL_EXECUTION_ERROR");

    let run_failed = events.iter().find(|e| e.kind == EventKind::RunFailed).unwrap();
    let stack = run_failed.payload["stack"].as_array().unwrap();
    assert!(stack.len() >= 2);
    assert!(stack.iter().any(|frame| frame == "gateway timeout"));

    let collector = e.orchestrator.metrics();
    assert_eq!(
        collector.counter_total(metrics::TOOL_CALLS_TOTAL, &labels([("outcome", "error")])),
        1
    );
    assert_eq!(collector.counter_total(metrics::TOOL_RETRIES_TOTAL, &metrics::Labels::new()), 2);
    assert_eq!(
        collector.counter_total(metrics::RUNS_TOTAL, &labels([("status", "failed")])),
        1
    );
}

#[tokio::test]
async fn agent_usage_is_accounted() {
    let agent = Arc::new(CountingAgent {
        calls: AtomicU32::new(0),
        usage: Some(LlmUsage {
            provider: "openai".to_string(),
            model: "gpt-4o".to_string(),
            tokens: TokenUsage {
                prompt_tokens: 1000,
                completion_tokens: 1000,
            },
        }),
    });
    let invoker = agent.clone();
    let e = engine_with(BudgetConfig::default(), move |_| invoker);
    e.index.put_agent(&agent_row("concierge")).unwrap();
    e.index
        .put_workflow(&linear(
            "wf-agent",
            json!([{"id": "think", "type": "agent", "config": {"agent_id": "concierge"}}]),
            json!([]),
            "think",
        ))
        .unwrap();

    let (run, handle) = e
        .orchestrator
        .start_run_supervised(StartRun::new(WorkflowId::new("wf-agent"), json!({"q": "?"})))
        .await
        .unwrap();
    assert_eq!(handle.wait().await.unwrap().status, RunStatus::Completed);

    // Per-run counters are released once the run settles
    assert_eq!(e.budget.tracked_runs(), 0);
    assert_eq!(e.budget.usage(run.id).llm_calls, 0);

    let collector = e.orchestrator.metrics();
    let model = labels([("model", "gpt-4o")]);
    assert_eq!(collector.counter_total(metrics::LLM_CALLS_TOTAL, &model), 1);
    assert_eq!(collector.counter_total(metrics::LLM_COST_CENTS_TOTAL, &metrics::Labels::new()), 13);

    let events = e.orchestrator.get_run_events(run.id).await.unwrap();
    let llm_call = events.iter().find(|e| e.kind == EventKind::LlmCall).unwrap();
    assert_eq!(llm_call.payload["agent_id"], "concierge");
    assert_eq!(llm_call.payload["model"], "gpt-4o");
    assert_eq!(llm_call.payload["estimated_cost_cents"], 13);

    let steps = e.orchestrator.list_steps(run.id).unwrap();
    assert_eq!(steps[0].output.as_ref().unwrap()["text"], "handled by concierge");
}

#[tokio::test]
async fn agent_tool_calls_go_through_the_tool_runtime() {
    let e = engine_with(BudgetConfig::default(), |tools| {
        Arc::new(EchoingAgent { tools })
    });
    e.index.put_agent(&agent_row("concierge")).unwrap();
    e.index
        .put_workflow(&linear(
            "wf-echo",
            json!([
                {"id": "prep", "type": "static", "config": {"value": "prepared"}},
                {"id": "think", "type": "agent", "config": {"agent_id": "concierge", "input": "ping"}}
            ]),
            json!([{"from": "prep", "to": "think"}]),
            "prep",
        ))
        .unwrap();

    let (run, handle) = e
        .orchestrator
        .start_run_supervised(StartRun::new(WorkflowId::new("wf-echo"), json!({})))
        .await
        .unwrap();
    assert_eq!(handle.wait().await.unwrap().status, RunStatus::Completed);

    let steps = e.orchestrator.list_steps(run.id).unwrap();
    let agent_step = &steps[1];
    let output = agent_step.output.as_ref().unwrap();
    assert_eq!(output["text"], "saw 1 previous step(s)");
    assert_eq!(output["tool_calls"][0]["output"]["value"], "ping");

    let events = e.orchestrator.get_run_events(run.id).await.unwrap();
    let tool_call = events.iter().find(|e| e.kind == EventKind::ToolCall).unwrap();
    assert_eq!(tool_call.step_id, Some(agent_step.id));
}

#[tokio::test]
async fn cancelled_run_stops_before_next_step() {
    let e = engine();
    e.index
        .put_tool(&Tool {
            id: "slow".to_string(),
            name: "Slow".to_string(),
            description: None,
            input_schema: Value::Null,
            risk_level: RiskLevel::Low,
            handler_type: None,
        })
        .unwrap();

    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let (entered_tx, release_rx) = (entered.clone(), release.clone());
    e.tools.register_tool(
        "slow",
        handler_fn(move |_input, _ctx| {
            let entered = entered_tx.clone();
            let release = release_rx.clone();
            async move {
                entered.notify_one();
                release.notified().await;
                Ok(json!({"done": true}))
            }
        }),
    );

    e.index
        .put_workflow(&linear(
            "wf-slow",
            json!([
                {"id": "wait", "type": "tool", "config": {"tool_id": "slow"}},
                {"id": "never", "type": "static"}
            ]),
            json!([{"from": "wait", "to": "never"}]),
            "wait",
        ))
        .unwrap();

    let (run, handle) = e
        .orchestrator
        .start_run_supervised(StartRun::new(WorkflowId::new("wf-slow"), json!({})))
        .await
        .unwrap();

    entered.notified().await;
    e.orchestrator.cancel_run(run.id).await.unwrap();
    release.notify_one();

    let outcome = handle.wait().await.unwrap();
    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(outcome.result.unwrap()["code"], "CANCELLED");

    let steps = e.orchestrator.list_steps(run.id).unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].status, StepStatus::Completed);

    // No longer active once finished
    assert!(e.orchestrator.cancel_run(run.id).await.is_err());
}

#[tokio::test]
async fn failures_are_broadcast_to_supervisors() {
    let e = engine();
    let mut failures = e.orchestrator.subscribe_failures();
    e.index
        .put_workflow(&linear(
            "wf-broken",
            json!([{"id": "t", "type": "tool", "config": {}}]),
            json!([]),
            "t",
        ))
        .unwrap();

    let run = e
        .orchestrator
        .start_run(StartRun::new(WorkflowId::new("wf-broken"), json!({})))
        .await
        .unwrap();

    let failure = tokio::time::timeout(Duration::from_secs(5), failures.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failure.run_id, run.id);
    assert!(failure.error.contains("tool_id"));

    let stored = wait_for_terminal(&e.orchestrator, run.id).await;
    assert_eq!(stored.status, RunStatus::Failed);

    let events = e.orchestrator.get_run_events(run.id).await.unwrap();
    let failed = events.iter().find(|e| e.kind == EventKind::RunFailed).unwrap();
    assert_eq!(failed.payload["code"], "INVALID_WORKFLOW");
    assert!(failed.payload["stack"].is_array());
}

#[tokio::test]
async fn unimplemented_node_types_complete_as_placeholders() {
    let e = engine();
    e.index
        .put_workflow(&linear(
            "wf-gates",
            json!([
                {"id": "route", "type": "router"},
                {"id": "gate", "type": "human_gate"},
                {"id": "fan", "type": "parallel"}
            ]),
            json!([{"from": "route", "to": "gate"}, {"from": "gate", "to": "fan"}]),
            "route",
        ))
        .unwrap();

    let (run, handle) = e
        .orchestrator
        .start_run_supervised(StartRun::new(WorkflowId::new("wf-gates"), json!({})))
        .await
        .unwrap();
    assert_eq!(handle.wait().await.unwrap().status, RunStatus::Completed);

    let steps = e.orchestrator.list_steps(run.id).unwrap();
    assert_eq!(steps.len(), 3);
    assert!(steps
        .iter()
        .all(|s| s.output.as_ref().unwrap()["placeholder"] == true));
    // Unrecognized tags are stored as static steps
    assert_eq!(steps[2].step_type, NodeType::Static);
}

#[tokio::test]
async fn missing_workflow_is_not_found() {
    let e = engine();
    let err = e
        .orchestrator
        .start_run(StartRun::new(WorkflowId::new("ghost"), json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound { kind: "workflow", .. }));
    assert!(e.index.list_runs().unwrap().is_empty());
}

#[tokio::test]
async fn app_action_maps_input_and_starts_run() {
    let e = engine();
    e.index
        .put_workflow(&linear(
            "wf-checkin",
            json!([{"id": "tickets", "type": "tool", "config": {"tool_id": "ticketing.list_open", "input": {}}}]),
            json!([]),
            "tickets",
        ))
        .unwrap();
    e.index
        .put_app(&App {
            id: "concierge".to_string(),
            name: "Concierge".to_string(),
            tool_scopes: vec!["ticketing.list_open".to_string()],
            actions: vec![AppAction {
                action_id: "guest_arrived".to_string(),
                workflow_id: WorkflowId::new("wf-checkin"),
                input_mapping: json!({
                    "guest": "$event.guest.name",
                    "locale": "$context.locale",
                    "source": "front-desk"
                })
                .as_object()
                .unwrap()
                .clone(),
                default_mode: RunMode::Auto,
            }],
        })
        .unwrap();

    let run = start_app_action(
        &e.orchestrator,
        e.index.as_ref(),
        AppActionRequest {
            app_id: "concierge".to_string(),
            action_id: "guest_arrived".to_string(),
            event: json!({"guest": {"name": "Ada"}}),
            context: json!({"locale": "en-GB"}),
            user_id: Some("staff-7".to_string()),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    assert_eq!(run.tenant_id, "default-tenant");
    assert_eq!(run.app_id.as_deref(), Some("concierge"));
    assert_eq!(run.app_action_id.as_deref(), Some("guest_arrived"));
    assert_eq!(run.mode, RunMode::Auto);
    assert_eq!(
        run.input,
        json!({"guest": "Ada", "locale": "en-GB", "source": "front-desk"})
    );

    let finished = wait_for_terminal(&e.orchestrator, run.id).await;
    assert_eq!(finished.status, RunStatus::Completed);

    let unknown = start_app_action(
        &e.orchestrator,
        e.index.as_ref(),
        AppActionRequest {
            app_id: "concierge".to_string(),
            action_id: "nope".to_string(),
            ..Default::default()
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(unknown, EngineError::NotFound { .. }));
}
