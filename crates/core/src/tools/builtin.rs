// Tools that ship with the engine

use super::registry::{json_schema_object, ToolHandler, ToolRegistry};
use crate::types::{RiskLevel, Tool, ToolContext};
use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

/// Lists open tickets. Returns fixed placeholder data until a ticketing backend exists.
pub struct TicketingListOpen;

impl TicketingListOpen {
    pub const ID: &'static str = "ticketing.list_open";
}

#[async_trait::async_trait]
impl ToolHandler for TicketingListOpen {
    async fn execute(&self, _input: Value, context: &ToolContext) -> Result<Value> {
        tracing::debug!(tenant_id = %context.tenant_id, "Listing open tickets");
        Ok(json!({
            "tickets": [
                {"id": "T-1", "title": "No hot water", "status": "open"},
                {"id": "T-2", "title": "Late check-in", "status": "open"}
            ]
        }))
    }

    fn definition(&self) -> Option<Tool> {
        Some(Tool {
            id: Self::ID.to_string(),
            name: "List open tickets".to_string(),
            description: Some("Return all open support tickets".to_string()),
            input_schema: json_schema_object(json!({}), vec![]),
            risk_level: RiskLevel::Low,
            handler_type: Some("builtin".to_string()),
        })
    }
}

/// Returns its `value` argument unchanged
pub struct Echo;

impl Echo {
    pub const ID: &'static str = "core.echo";
}

#[derive(Debug, Deserialize)]
struct EchoArgs {
    value: Value,
}

#[async_trait::async_trait]
impl ToolHandler for Echo {
    async fn execute(&self, input: Value, _context: &ToolContext) -> Result<Value> {
        let args: EchoArgs =
            serde_json::from_value(input).context("Invalid arguments for core.echo")?;
        Ok(json!({"value": args.value}))
    }

    fn definition(&self) -> Option<Tool> {
        Some(Tool {
            id: Self::ID.to_string(),
            name: "Echo".to_string(),
            description: Some("Return the given value".to_string()),
            input_schema: json_schema_object(json!({"value": {}}), vec!["value"]),
            risk_level: RiskLevel::Low,
            handler_type: Some("builtin".to_string()),
        })
    }
}

/// Register every built-in handler
pub fn register_builtins(registry: &ToolRegistry) {
    registry.register(TicketingListOpen::ID, Arc::new(TicketingListOpen));
    registry.register(Echo::ID, Arc::new(Echo));
}
