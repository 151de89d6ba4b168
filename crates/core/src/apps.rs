use crate::error::{EngineError, Result};
use crate::policy::rules::resolve_field;
use crate::storage::IndexStore;
use crate::types::{Run, RunMode, DEFAULT_TENANT};
use crate::workflow::{Orchestrator, StartRun};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Decides whether an app has been granted a tool
#[async_trait::async_trait]
pub trait AppScopeChecker: Send + Sync {
    async fn check_tool_scope(&self, app_id: &str, tool_id: &str) -> anyhow::Result<bool>;
}

/// Reads `tool_scopes` from the app row; unknown apps are granted nothing
pub struct IndexAppScopes {
    index_store: Arc<dyn IndexStore>,
}

impl IndexAppScopes {
    pub fn new(index_store: Arc<dyn IndexStore>) -> Self {
        Self { index_store }
    }
}

#[async_trait::async_trait]
impl AppScopeChecker for IndexAppScopes {
    async fn check_tool_scope(&self, app_id: &str, tool_id: &str) -> anyhow::Result<bool> {
        Ok(self
            .index_store
            .get_app(app_id)?
            .is_some_and(|app| app.tool_scopes.iter().any(|scope| scope == tool_id)))
    }
}

/// Build workflow input from an action's mapping.
///
/// String values of the form `$event.path` or `$context.path` are looked up in
/// the triggering event or caller context (missing paths become null); every
/// other value is copied as a literal.
pub fn resolve_action_input(mapping: &Map<String, Value>, event: &Value, context: &Value) -> Value {
    let resolved = mapping
        .iter()
        .map(|(key, value)| {
            let resolved = match value.as_str() {
                Some(reference) => resolve_reference(reference, event, context)
                    .unwrap_or_else(|| value.clone()),
                None => value.clone(),
            };
            (key.clone(), resolved)
        })
        .collect();
    Value::Object(resolved)
}

fn resolve_reference(reference: &str, event: &Value, context: &Value) -> Option<Value> {
    let (source, path) = if let Some(path) = reference.strip_prefix("$event.") {
        (event, path)
    } else if let Some(path) = reference.strip_prefix("$context.") {
        (context, path)
    } else {
        return None;
    };

    Some(resolve_field(source, path).cloned().unwrap_or(Value::Null))
}

/// An "execute app action" request
#[derive(Debug, Clone, Default)]
pub struct AppActionRequest {
    pub app_id: String,
    pub action_id: String,
    pub event: Value,
    pub context: Value,
    pub tenant_id: Option<String>,
    pub user_id: Option<String>,
    pub mode: Option<RunMode>,
}

/// Resolve an app action to its workflow and start a run for it
pub async fn start_app_action(
    orchestrator: &Orchestrator,
    index_store: &dyn IndexStore,
    request: AppActionRequest,
) -> Result<Run> {
    let app = index_store
        .get_app(&request.app_id)?
        .ok_or_else(|| EngineError::not_found("app", &request.app_id))?;
    let action = app
        .actions
        .iter()
        .find(|a| a.action_id == request.action_id)
        .ok_or_else(|| {
            EngineError::not_found("app action", format!("{}/{}", app.id, request.action_id))
        })?;

    let input = resolve_action_input(&action.input_mapping, &request.event, &request.context);

    tracing::info!(
        app_id = %app.id,
        action_id = %action.action_id,
        workflow_id = %action.workflow_id,
        "Executing app action"
    );

    orchestrator
        .start_run(
            StartRun::new(action.workflow_id.clone(), input)
                .mode(request.mode.unwrap_or(action.default_mode))
                .tenant(request.tenant_id.unwrap_or_else(|| DEFAULT_TENANT.to_string()))
                .user(request.user_id)
                .app(app.id.clone(), action.action_id.clone()),
        )
        .await
}
