use crate::types::{Tool, ToolContext};
use anyhow::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

/// Executes a tool call
#[async_trait::async_trait]
pub trait ToolHandler: Send + Sync {
    /// Execute the tool with validated input
    async fn execute(&self, input: Value, context: &ToolContext) -> Result<Value>;

    /// Definition to seed into the index store, for handlers that ship their own
    fn definition(&self) -> Option<Tool> {
        None
    }
}

struct FnHandler<F>(F);

#[async_trait::async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(Value, ToolContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    async fn execute(&self, input: Value, context: &ToolContext) -> Result<Value> {
        (self.0)(input, context.clone()).await
    }
}

/// Wrap an async closure as a handler
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ToolHandler>
where
    F: Fn(Value, ToolContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Tool id -> handler map, owned by one tool runtime
pub struct ToolRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn ToolHandler>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler, replacing any previous one for the same id
    pub fn register(&self, tool_id: impl Into<String>, handler: Arc<dyn ToolHandler>) {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        handlers.insert(tool_id.into(), handler);
    }

    /// Get a handler by tool id
    pub fn get(&self, tool_id: &str) -> Option<Arc<dyn ToolHandler>> {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        handlers.get(tool_id).cloned()
    }

    pub fn contains(&self, tool_id: &str) -> bool {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        handlers.contains_key(tool_id)
    }

    /// Definitions shipped by registered handlers, sorted by id
    pub fn definitions(&self) -> Vec<Tool> {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        let mut tools: Vec<Tool> = handlers.values().filter_map(|h| h.definition()).collect();
        tools.sort_by(|a, b| a.id.cmp(&b.id));
        tools
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// Helper functions for creating tool schemas

pub fn json_schema_object(properties: Value, required: Vec<&str>) -> Value {
    serde_json::json!({
        "type": "object",
        "properties": properties,
        "required": required
    })
}
