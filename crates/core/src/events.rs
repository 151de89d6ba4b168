use crate::types::{RunId, StepId};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An entry in the append-only audit log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub run_id: RunId,
    #[serde(default)]
    pub step_id: Option<StepId>,
    pub kind: EventKind,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    /// Assigned by the log on append; breaks timestamp ties
    #[serde(default)]
    pub sequence: u64,
}

impl Event {
    pub fn new(run_id: RunId, kind: EventKind, payload: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id,
            step_id: None,
            kind,
            payload,
            timestamp: Utc::now(),
            sequence: 0,
        }
    }

    pub fn with_step(mut self, step_id: Option<StepId>) -> Self {
        self.step_id = step_id;
        self
    }
}

/// Kinds of events written to the audit log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RunStarted,
    RunCompleted,
    RunFailed,
    StepStarted,
    StepCompleted,
    StepFailed,
    ToolCall,
    LlmCall,
    PolicyEval,
    Error,
}

/// Append-only event storage
#[async_trait::async_trait]
pub trait EventLog: Send + Sync {
    /// Append an event to the log
    async fn append(&self, event: Event) -> Result<()>;

    /// Make every event appended so far for this run durable
    async fn flush_run(&self, run_id: RunId) -> Result<()>;

    /// Make every buffered event durable; called on shutdown
    async fn flush_all(&self) -> Result<()>;

    /// All events for a run, ordered by timestamp then append sequence
    async fn get_run_events(&self, run_id: RunId) -> Result<Vec<Event>>;
}
