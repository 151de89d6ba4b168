use super::chain::execution_order;
use super::step_executor::StepExecutor;
use crate::agent::AgentInvoker;
use crate::budget::BudgetTracker;
use crate::error::{EngineError, Result};
use crate::events::{Event, EventKind, EventLog};
use crate::metrics::{self, labels, MetricsCollector};
use crate::policy::{PolicyEngine, RunStartContext};
use crate::storage::IndexStore;
use crate::tools::ToolRuntime;
use crate::types::{Run, RunId, RunMode, RunStatus, Step, Workflow, WorkflowId, DEFAULT_TENANT};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const FAILURE_CHANNEL_CAPACITY: usize = 64;

/// Parameters for starting a run
#[derive(Debug, Clone)]
pub struct StartRun {
    pub workflow_id: WorkflowId,
    pub input: Value,
    pub mode: RunMode,
    pub tenant_id: String,
    pub user_id: Option<String>,
    pub app_id: Option<String>,
    pub app_action_id: Option<String>,
}

impl StartRun {
    pub fn new(workflow_id: WorkflowId, input: Value) -> Self {
        Self {
            workflow_id,
            input,
            mode: RunMode::default(),
            tenant_id: DEFAULT_TENANT.to_string(),
            user_id: None,
            app_id: None,
            app_action_id: None,
        }
    }

    pub fn mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = tenant_id.into();
        self
    }

    pub fn user(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn app(mut self, app_id: impl Into<String>, action_id: impl Into<String>) -> Self {
        self.app_id = Some(app_id.into());
        self.app_action_id = Some(action_id.into());
        self
    }
}

/// Terminal state of a run as seen by its supervisor
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub run_id: RunId,
    pub status: RunStatus,
    pub result: Option<Value>,
}

/// Published on the failure channel whenever a run ends `failed`
#[derive(Debug, Clone, Serialize)]
pub struct RunFailure {
    pub run_id: RunId,
    pub workflow_id: WorkflowId,
    pub error: String,
}

/// Handle to a background run
pub struct RunHandle {
    run_id: RunId,
    cancel: CancellationToken,
    join: JoinHandle<RunOutcome>,
}

impl RunHandle {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Request cancellation; takes effect before the next step starts
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the run to reach a terminal state
    pub async fn wait(self) -> Result<RunOutcome> {
        self.join
            .await
            .map_err(|e| EngineError::TaskFailed(e.to_string()))
    }
}

/// Starts runs and drives them to completion in background tasks
#[derive(Clone)]
pub struct Orchestrator {
    index_store: Arc<dyn IndexStore>,
    event_log: Arc<dyn EventLog>,
    policy_engine: Arc<dyn PolicyEngine>,
    step_executor: Arc<StepExecutor>,
    budget: Arc<BudgetTracker>,
    metrics: Arc<MetricsCollector>,
    // Track active runs for cancellation
    active_runs: Arc<RwLock<HashMap<RunId, CancellationToken>>>,
    failures: broadcast::Sender<RunFailure>,
}

impl Orchestrator {
    pub fn new(
        index_store: Arc<dyn IndexStore>,
        event_log: Arc<dyn EventLog>,
        policy_engine: Arc<dyn PolicyEngine>,
        tool_runtime: Arc<ToolRuntime>,
        agent: Arc<dyn AgentInvoker>,
        budget: Arc<BudgetTracker>,
    ) -> Self {
        let metrics = tool_runtime.metrics();
        let step_executor = Arc::new(StepExecutor::new(
            index_store.clone(),
            event_log.clone(),
            tool_runtime,
            agent,
            budget.clone(),
            policy_engine.clone(),
        ));
        let (failures, _) = broadcast::channel(FAILURE_CHANNEL_CAPACITY);

        Self {
            index_store,
            event_log,
            policy_engine,
            step_executor,
            budget,
            metrics,
            active_runs: Arc::new(RwLock::new(HashMap::new())),
            failures,
        }
    }

    /// Create a pending run and execute it in the background.
    /// Returns immediately with the run still `pending`.
    pub async fn start_run(&self, request: StartRun) -> Result<Run> {
        let (run, _detached) = self.start_run_supervised(request).await?;
        Ok(run)
    }

    /// Like [`Orchestrator::start_run`], also returning a handle to await or cancel the run
    pub async fn start_run_supervised(&self, request: StartRun) -> Result<(Run, RunHandle)> {
        let workflow = self
            .index_store
            .get_workflow(&request.workflow_id)?
            .ok_or_else(|| EngineError::not_found("workflow", request.workflow_id.0.clone()))?;

        self.check_run_start(&request).await?;

        let now = Utc::now();
        let run = Run {
            id: RunId::new(),
            workflow_id: workflow.id.clone(),
            workflow_version: workflow.version.clone(),
            tenant_id: request.tenant_id,
            user_id: request.user_id,
            app_id: request.app_id,
            app_action_id: request.app_action_id,
            status: RunStatus::Pending,
            mode: request.mode,
            input: request.input,
            result: None,
            created_at: now,
            updated_at: now,
        };

        self.index_store.save_run(&run)?;
        self.event_log
            .append(Event::new(
                run.id,
                EventKind::RunStarted,
                json!({
                    "workflow_id": workflow.id,
                    "workflow_version": workflow.version,
                    "mode": run.mode,
                    "input": run.input,
                    "tenant_id": run.tenant_id,
                }),
            ))
            .await?;

        let cancel = CancellationToken::new();
        self.active_runs.write().await.insert(run.id, cancel.clone());
        self.metrics
            .increment_gauge(metrics::RUNS_ACTIVE, 1.0, labels([("tenant_id", run.tenant_id.as_str())]));

        let this = self.clone();
        let task_run = run.clone();
        let token = cancel.clone();
        let join = tokio::spawn(async move { this.execute_run(task_run, workflow, token).await });

        info!(run_id = %run.id, workflow_id = %run.workflow_id, "Run scheduled");

        Ok((
            run.clone(),
            RunHandle {
                run_id: run.id,
                cancel,
                join,
            },
        ))
    }

    async fn check_run_start(&self, request: &StartRun) -> Result<()> {
        let context = RunStartContext {
            tenant_id: request.tenant_id.clone(),
            user_id: request.user_id.clone(),
            app_id: request.app_id.clone(),
            mode: request.mode,
            input: request.input.clone(),
        };

        match self
            .policy_engine
            .check_run_start(&request.workflow_id, &context)
            .await
        {
            Ok(decision) if !decision.allowed => {
                self.metrics.increment_counter(
                    metrics::POLICY_DENIALS_TOTAL,
                    labels([("tenant_id", request.tenant_id.as_str()), ("check", "run_start")]),
                );
                Err(EngineError::PolicyDenied {
                    reason: decision
                        .reason
                        .unwrap_or_else(|| "run start denied".to_string()),
                    requires_approval: decision.requires_approval,
                })
            }
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(workflow_id = %request.workflow_id, error = %e, "Run start policy check failed, allowing");
                Ok(())
            }
        }
    }

    /// Request cancellation of an active run. The run fails with "cancelled"
    /// before its next step.
    pub async fn cancel_run(&self, run_id: RunId) -> Result<()> {
        let active_runs = self.active_runs.read().await;
        let token = active_runs
            .get(&run_id)
            .ok_or_else(|| EngineError::not_found("active run", run_id.to_string()))?;

        token.cancel();
        info!(run_id = %run_id, "Cancellation requested");
        Ok(())
    }

    pub fn metrics(&self) -> Arc<MetricsCollector> {
        self.metrics.clone()
    }

    /// Receive every run failure from now on
    pub fn subscribe_failures(&self) -> broadcast::Receiver<RunFailure> {
        self.failures.subscribe()
    }

    pub fn get_run(&self, run_id: RunId) -> Result<Option<Run>> {
        Ok(self.index_store.get_run(&run_id)?)
    }

    pub fn list_steps(&self, run_id: RunId) -> Result<Vec<Step>> {
        Ok(self.index_store.list_steps(&run_id)?)
    }

    pub async fn get_run_events(&self, run_id: RunId) -> Result<Vec<Event>> {
        Ok(self.event_log.get_run_events(run_id).await?)
    }

    async fn execute_run(self, mut run: Run, workflow: Workflow, cancel: CancellationToken) -> RunOutcome {
        let result = self.drive(&mut run, &workflow, &cancel).await;
        let outcome = self.finish(&mut run, result).await;
        self.budget.release(run.id);
        self.active_runs.write().await.remove(&run.id);
        outcome
    }

    async fn drive(&self, run: &mut Run, workflow: &Workflow, cancel: &CancellationToken) -> Result<Value> {
        run.transition(RunStatus::Running)?;
        self.index_store.save_run(run)?;
        info!(run_id = %run.id, workflow_id = %workflow.id, "Run executing");

        let order = execution_order(workflow)?;
        let mut completed: Vec<Step> = Vec::with_capacity(order.len());

        for node in order {
            if cancel.is_cancelled() {
                warn!(run_id = %run.id, "Run cancelled");
                return Err(EngineError::Cancelled);
            }

            let step = self.step_executor.execute(run, node, &completed).await?;
            completed.push(step);
        }

        let output = completed
            .last()
            .and_then(|s| s.output.clone())
            .unwrap_or(Value::Null);

        Ok(json!({
            "message": "Workflow completed successfully",
            "steps": completed.len(),
            "output": output,
        }))
    }

    async fn finish(&self, run: &mut Run, result: Result<Value>) -> RunOutcome {
        let (next, kind, payload) = match result {
            Ok(result) => {
                info!(run_id = %run.id, "Run completed");
                run.result = Some(result.clone());
                (RunStatus::Completed, EventKind::RunCompleted, json!({"result": result}))
            }
            Err(err) => {
                error!(run_id = %run.id, error = %err, "Run failed");
                run.result = Some(json!({"error": err.to_string(), "code": err.code()}));

                // Nobody listening is fine
                let _ = self.failures.send(RunFailure {
                    run_id: run.id,
                    workflow_id: run.workflow_id.clone(),
                    error: err.to_string(),
                });

                (
                    RunStatus::Failed,
                    EventKind::RunFailed,
                    json!({"error": err.to_string(), "code": err.code(), "stack": err.chain()}),
                )
            }
        };

        self.metrics
            .decrement_gauge(metrics::RUNS_ACTIVE, 1.0, labels([("tenant_id", run.tenant_id.as_str())]));

        // A rejected transition leaves the row as it was; no terminal event without a terminal row
        if let Err(e) = run.settle(next) {
            error!(run_id = %run.id, error = %e, "Invalid terminal transition");
            return RunOutcome {
                run_id: run.id,
                status: run.status,
                result: run.result.clone(),
            };
        }

        self.metrics.increment_counter(
            metrics::RUNS_TOTAL,
            labels([("tenant_id", run.tenant_id.as_str()), ("status", run.status.as_str())]),
        );
        let elapsed = (Utc::now() - run.created_at).num_milliseconds().max(0) as f64 / 1000.0;
        self.metrics.observe_histogram(
            metrics::RUN_DURATION_SECONDS,
            elapsed,
            labels([("tenant_id", run.tenant_id.as_str())]),
        );

        // Terminal event first: once the row reads terminal, the trail is complete
        if let Err(e) = self
            .event_log
            .append(Event::new(run.id, kind, payload))
            .await
        {
            error!(run_id = %run.id, error = %e, "Failed to record run outcome");
        }
        if let Err(e) = self.event_log.flush_run(run.id).await {
            error!(run_id = %run.id, error = %e, "Failed to flush run events");
        }
        if let Err(e) = self.index_store.save_run(run) {
            error!(run_id = %run.id, error = %e, "Failed to persist run state");
        }

        RunOutcome {
            run_id: run.id,
            status: run.status,
            result: run.result.clone(),
        }
    }
}
