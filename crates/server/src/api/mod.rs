use crate::config::{AppState, ServerConfig};
use anyhow::Result;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use logline_core::events::EventLog;
use logline_core::{EngineError, FieldError};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

mod handlers;

/// Start the API server
pub async fn serve(addr: &str, config: ServerConfig) -> Result<()> {
    let state = AppState::new(&config)?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("API server listening on {}", addr);

    run_until(listener, state, shutdown_signal()).await
}

/// Serve until `shutdown` resolves, then make every buffered event durable
async fn run_until<F>(listener: tokio::net::TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let event_log = state.event_log.clone();
    watch_failures(&state);

    let app = create_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    tracing::info!("API server shutting down");
    event_log.flush_all().await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}

/// Log every failed run reported by the orchestrator
fn watch_failures(state: &AppState) {
    let mut failures = state.orchestrator.subscribe_failures();
    tokio::spawn(async move {
        loop {
            match failures.recv().await {
                Ok(failure) => tracing::warn!(
                    run_id = %failure.run_id,
                    workflow_id = %failure.workflow_id,
                    error = %failure.error,
                    "Run failed"
                ),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Failure watcher lagged, skipped {} notifications", skipped)
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        // Runs
        .route("/api/workflows/{workflow_id}/runs", post(handlers::start_run))
        .route(
            "/api/apps/{app_id}/actions/{action_id}",
            post(handlers::execute_app_action),
        )
        .route("/api/runs", get(handlers::list_runs))
        .route("/api/runs/{run_id}", get(handlers::get_run))
        .route("/api/runs/{run_id}/steps", get(handlers::get_run_steps))
        .route("/api/runs/{run_id}/events", get(handlers::get_run_events))
        .route("/api/runs/{run_id}/cancel", post(handlers::cancel_run))
        // Authoring
        .route("/api/workflows", get(handlers::list_workflows))
        .route(
            "/api/workflows/{workflow_id}",
            get(handlers::get_workflow).put(handlers::put_workflow),
        )
        .route("/api/tools", get(handlers::list_tools))
        .route("/api/tools/{tool_id}", put(handlers::put_tool))
        .route("/api/agents/{agent_id}", put(handlers::put_agent))
        .route(
            "/api/policies",
            get(handlers::list_policies).post(handlers::put_policy),
        )
        .route("/api/apps/{app_id}", put(handlers::put_app))
        .route("/api/metrics", get(handlers::get_metrics))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "logline",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// API error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldError>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub requires_approval: bool,
}

/// Custom error type for API handlers
#[derive(Debug)]
pub struct ApiError(anyhow::Error);

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self(BadRequest(message.into()).into())
    }

    fn status(&self) -> StatusCode {
        if self.0.is::<BadRequest>() {
            return StatusCode::BAD_REQUEST;
        }
        match self.0.downcast_ref::<EngineError>() {
            Some(EngineError::NotFound { .. }) => StatusCode::NOT_FOUND,
            Some(EngineError::Validation { .. } | EngineError::InvalidWorkflow(_)) => {
                StatusCode::BAD_REQUEST
            }
            Some(EngineError::PolicyDenied { .. } | EngineError::ScopeDenied { .. }) => {
                StatusCode::FORBIDDEN
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct BadRequest(String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let details = self
            .0
            .chain()
            .skip(1)
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join(": ");

        let engine = self.0.downcast_ref::<EngineError>();
        let code = match engine {
            Some(err) => err.code(),
            None if status == StatusCode::BAD_REQUEST => "BAD_REQUEST",
            None => "INTERNAL_ERROR",
        };
        let fields = match engine {
            Some(EngineError::Validation { errors, .. }) => errors.clone(),
            _ => Vec::new(),
        };
        let requires_approval = matches!(
            engine,
            Some(EngineError::PolicyDenied { requires_approval: true, .. })
        );

        if status.is_server_error() {
            tracing::error!(error = %self.0, code, "Request failed");
        }

        let response = ErrorResponse {
            error: self.0.to_string(),
            code,
            details: (!details.is_empty()).then_some(details),
            fields,
            requires_approval,
        };

        (status, Json(response)).into_response()
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
