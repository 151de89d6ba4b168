use serde::Serialize;
use thiserror::Error;

/// A single schema violation, addressed by its path in the input document
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub path: String,
    pub message: String,
}

impl FieldError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Errors surfaced by the execution engine
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("invalid input for tool '{tool_id}': {}", summarize(.errors))]
    Validation {
        tool_id: String,
        errors: Vec<FieldError>,
    },

    #[error("policy denied: {reason}")]
    PolicyDenied {
        reason: String,
        requires_approval: bool,
    },

    #[error("app '{app_id}' is not granted tool '{tool_id}'")]
    ScopeDenied { app_id: String, tool_id: String },

    #[error("no handler registered for tool '{tool_id}'")]
    HandlerMissing { tool_id: String },

    #[error("tool '{tool_id}' failed after {attempts} attempt(s): {message}")]
    ToolExecution {
        tool_id: String,
        message: String,
        attempts: u32,
        chain: Vec<String>,
    },

    #[error("agent '{agent_id}' failed: {message}")]
    AgentExecution {
        agent_id: String,
        message: String,
        chain: Vec<String>,
    },

    #[error("invalid workflow: {0}")]
    InvalidWorkflow(String),

    #[error("invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("run cancelled")]
    Cancelled,

    #[error("execution task failed: {0}")]
    TaskFailed(String),

    #[error("storage error: {0}")]
    Storage(String),
}

fn summarize(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        EngineError::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Stable machine-readable error code, written into audit payloads and API bodies
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::NotFound { .. } => "NOT_FOUND",
            EngineError::Validation { .. } => "VALIDATION_ERROR",
            EngineError::PolicyDenied { .. } => "POLICY_DENIED",
            EngineError::ScopeDenied { .. } => "SCOPE_DENIED",
            EngineError::HandlerMissing { .. } => "HANDLER_MISSING",
            EngineError::ToolExecution { .. } => "TOOL_EXECUTION_ERROR",
            EngineError::AgentExecution { .. } => "AGENT_EXECUTION_ERROR",
            EngineError::InvalidWorkflow(_) => "INVALID_WORKFLOW",
            EngineError::InvalidTransition(_) => "INVALID_TRANSITION",
            EngineError::Cancelled => "CANCELLED",
            EngineError::TaskFailed(_) => "TASK_FAILED",
            EngineError::Storage(_) => "STORAGE_ERROR",
        }
    }

    /// Causal chain for diagnostics, outermost first
    pub fn chain(&self) -> Vec<String> {
        match self {
            EngineError::ToolExecution { chain, .. } | EngineError::AgentExecution { chain, .. }
                if !chain.is_empty() =>
            {
                let mut trace = vec![self.to_string()];
                trace.extend(chain.iter().cloned());
                trace
            }
            _ => vec![self.to_string()],
        }
    }
}

/// Render every cause of an `anyhow::Error`, outermost first
pub fn error_chain(err: &anyhow::Error) -> Vec<String> {
    err.chain().map(ToString::to_string).collect()
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Storage(format!("{:#}", err))
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_validation_message_lists_fields() {
        let err = EngineError::Validation {
            tool_id: "crm.update".to_string(),
            errors: vec![
                FieldError::new("$.email", "is required"),
                FieldError::new("$.age", "expected integer"),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("$.email: is required"));
        assert!(msg.contains("$.age: expected integer"));
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_anyhow_conversion_keeps_context() {
        let source: anyhow::Result<()> = Err(anyhow::anyhow!("disk full"));
        let err: EngineError = source.context("Failed to save run").unwrap_err().into();
        assert_eq!(err.code(), "STORAGE_ERROR");
        assert!(err.to_string().contains("Failed to save run: disk full"));
    }

    #[test]
    fn test_chain_includes_tool_causes() {
        let err = EngineError::ToolExecution {
            tool_id: "t".to_string(),
            message: "timeout".to_string(),
            attempts: 3,
            chain: vec!["request failed".to_string(), "timeout".to_string()],
        };
        let chain = err.chain();
        assert_eq!(chain.len(), 3);
        assert_eq!(chain[2], "timeout");
    }
}
