use super::{ApiError, ApiResult};
use crate::config::AppState;
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use logline_core::{
    apps::{start_app_action, AppActionRequest},
    events::{Event, EventLog},
    storage::IndexStore,
    workflow::StartRun,
    Agent, App, EngineError, Policy, Run, RunId, RunMode, Step, Tool, Workflow, WorkflowId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

fn parse_run_id(raw: &str) -> Result<RunId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::bad_request(format!("Invalid run ID: {}", raw)))
}

fn ensure_path_matches(path_id: &str, body_id: &str) -> Result<(), ApiError> {
    if path_id != body_id {
        return Err(ApiError::bad_request(format!(
            "Path id '{}' does not match body id '{}'",
            path_id, body_id
        )));
    }
    Ok(())
}

// Runs

#[derive(Debug, Deserialize)]
pub struct StartRunRequest {
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub mode: Option<RunMode>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Create a run for a workflow; execution continues in the background
pub async fn start_run(
    State(state): State<Arc<AppState>>,
    Path(workflow_id): Path<String>,
    Json(req): Json<StartRunRequest>,
) -> ApiResult<(StatusCode, Json<Run>)> {
    let mut request = StartRun::new(WorkflowId::new(workflow_id), req.input)
        .mode(req.mode.unwrap_or_default())
        .user(req.user_id);
    if let Some(tenant_id) = req.tenant_id {
        request = request.tenant(tenant_id);
    }

    let run = state.orchestrator.start_run(request).await?;
    tracing::info!(run_id = %run.id, workflow_id = %run.workflow_id, "Run created");

    Ok((StatusCode::ACCEPTED, Json(run)))
}

#[derive(Debug, Deserialize)]
pub struct ExecuteAppActionRequest {
    #[serde(default)]
    pub event: Value,
    #[serde(default)]
    pub context: Value,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub mode: Option<RunMode>,
}

/// Resolve an app action to its workflow and start a run
pub async fn execute_app_action(
    State(state): State<Arc<AppState>>,
    Path((app_id, action_id)): Path<(String, String)>,
    Json(req): Json<ExecuteAppActionRequest>,
) -> ApiResult<(StatusCode, Json<Run>)> {
    let run = start_app_action(
        &state.orchestrator,
        state.index_store.as_ref(),
        AppActionRequest {
            app_id,
            action_id,
            event: req.event,
            context: req.context,
            tenant_id: req.tenant_id,
            user_id: req.user_id,
            mode: req.mode,
        },
    )
    .await?;

    Ok((StatusCode::ACCEPTED, Json(run)))
}

#[derive(Debug, Serialize)]
pub struct ListRunsResponse {
    pub runs: Vec<Run>,
}

/// List all runs, newest first
pub async fn list_runs(State(state): State<Arc<AppState>>) -> ApiResult<Json<ListRunsResponse>> {
    let runs = state.index_store.list_runs()?;
    Ok(Json(ListRunsResponse { runs }))
}

/// Get a specific run
pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<Run>> {
    let run_id = parse_run_id(&run_id)?;

    let run = state
        .orchestrator
        .get_run(run_id)?
        .ok_or_else(|| EngineError::not_found("run", run_id.to_string()))?;

    Ok(Json(run))
}

#[derive(Debug, Serialize)]
pub struct GetRunStepsResponse {
    pub steps: Vec<Step>,
}

pub async fn get_run_steps(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<GetRunStepsResponse>> {
    let run_id = parse_run_id(&run_id)?;
    if state.orchestrator.get_run(run_id)?.is_none() {
        return Err(EngineError::not_found("run", run_id.to_string()).into());
    }

    let steps = state.orchestrator.list_steps(run_id)?;
    Ok(Json(GetRunStepsResponse { steps }))
}

#[derive(Debug, Serialize)]
pub struct GetRunEventsResponse {
    pub events: Vec<Event>,
}

/// Get the audit trail for a run, oldest first
pub async fn get_run_events(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<GetRunEventsResponse>> {
    let run_id = parse_run_id(&run_id)?;

    let events = state.event_log.get_run_events(run_id).await?;

    Ok(Json(GetRunEventsResponse { events }))
}

#[derive(Debug, Serialize)]
pub struct CancelRunResponse {
    pub run_id: RunId,
    pub message: String,
}

pub async fn cancel_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<(StatusCode, Json<CancelRunResponse>)> {
    let run_id = parse_run_id(&run_id)?;

    state.orchestrator.cancel_run(run_id).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(CancelRunResponse {
            run_id,
            message: "Cancellation requested; the run stops before its next step".to_string(),
        }),
    ))
}

// Authoring

#[derive(Debug, Serialize)]
pub struct ListWorkflowsResponse {
    pub workflows: Vec<Workflow>,
}

pub async fn list_workflows(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<ListWorkflowsResponse>> {
    let workflows = state.index_store.list_workflows()?;
    Ok(Json(ListWorkflowsResponse { workflows }))
}

pub async fn get_workflow(
    State(state): State<Arc<AppState>>,
    Path(workflow_id): Path<String>,
) -> ApiResult<Json<Workflow>> {
    let workflow = state
        .index_store
        .get_workflow(&WorkflowId::new(workflow_id.clone()))?
        .ok_or_else(|| EngineError::not_found("workflow", workflow_id))?;
    Ok(Json(workflow))
}

pub async fn put_workflow(
    State(state): State<Arc<AppState>>,
    Path(workflow_id): Path<String>,
    Json(workflow): Json<Workflow>,
) -> ApiResult<Json<Workflow>> {
    ensure_path_matches(&workflow_id, &workflow.id.0)?;
    state.index_store.put_workflow(&workflow)?;
    tracing::info!(workflow_id = %workflow.id, version = %workflow.version, "Workflow saved");
    Ok(Json(workflow))
}

#[derive(Debug, Serialize)]
pub struct ListToolsResponse {
    pub tools: Vec<Tool>,
}

pub async fn list_tools(State(state): State<Arc<AppState>>) -> ApiResult<Json<ListToolsResponse>> {
    let tools = state.tool_runtime.list_tools()?;
    Ok(Json(ListToolsResponse { tools }))
}

pub async fn put_tool(
    State(state): State<Arc<AppState>>,
    Path(tool_id): Path<String>,
    Json(tool): Json<Tool>,
) -> ApiResult<Json<Tool>> {
    ensure_path_matches(&tool_id, &tool.id)?;
    state.index_store.put_tool(&tool)?;
    if !state.tool_runtime.has_handler(&tool.id) {
        tracing::warn!(tool_id = %tool.id, "Tool saved without a registered handler");
    }
    Ok(Json(tool))
}

pub async fn put_agent(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
    Json(agent): Json<Agent>,
) -> ApiResult<Json<Agent>> {
    ensure_path_matches(&agent_id, &agent.id)?;
    state.index_store.put_agent(&agent)?;
    Ok(Json(agent))
}

#[derive(Debug, Serialize)]
pub struct ListPoliciesResponse {
    pub policies: Vec<Policy>,
}

pub async fn list_policies(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<ListPoliciesResponse>> {
    let policies = state.index_store.list_policies()?;
    Ok(Json(ListPoliciesResponse { policies }))
}

pub async fn put_policy(
    State(state): State<Arc<AppState>>,
    Json(policy): Json<Policy>,
) -> ApiResult<Json<Policy>> {
    state.index_store.put_policy(&policy)?;
    tracing::info!(policy_id = %policy.id, effect = policy.effect.as_str(), "Policy saved");
    Ok(Json(policy))
}

pub async fn put_app(
    State(state): State<Arc<AppState>>,
    Path(app_id): Path<String>,
    Json(app): Json<App>,
) -> ApiResult<Json<App>> {
    ensure_path_matches(&app_id, &app.id)?;
    state.index_store.put_app(&app)?;
    Ok(Json(app))
}

// Metrics

#[derive(Debug, Default, Deserialize)]
pub struct MetricsQuery {
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
}

/// Engine counters as JSON, or Prometheus text with `format=prometheus`
pub async fn get_metrics(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MetricsQuery>,
) -> Response {
    let tenant_id = query.tenant_id.as_deref();

    match query.format.as_deref() {
        Some("prometheus") => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            state.metrics.render_prometheus(tenant_id),
        )
            .into_response(),
        _ => Json(state.metrics.snapshot(tenant_id)).into_response(),
    }
}
