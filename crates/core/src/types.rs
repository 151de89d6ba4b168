use crate::error::EngineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use uuid::Uuid;

/// Tenant assigned to runs whose request carries none
pub const DEFAULT_TENANT: &str = "default-tenant";

/// Unique identifier for a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Unique identifier for an executed step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(pub Uuid);

impl StepId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for StepId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a workflow definition
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(pub String);

impl WorkflowId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a policy
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicyId(pub String);

impl PolicyId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for PolicyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

/// Status of a workflow step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Shared lifecycle for runs and steps: pending -> running -> {completed | failed}.
pub trait Lifecycle: Copy + std::fmt::Debug {
    fn rank(self) -> u8;

    fn is_terminal(self) -> bool {
        self.rank() == 2
    }

    /// Transitions only move forward one phase; terminal states are final.
    fn can_transition_to(self, next: Self) -> bool {
        next.rank() == self.rank() + 1
    }
}

impl Lifecycle for RunStatus {
    fn rank(self) -> u8 {
        match self {
            RunStatus::Pending => 0,
            RunStatus::Running => 1,
            RunStatus::Completed | RunStatus::Failed => 2,
        }
    }
}

impl Lifecycle for StepStatus {
    fn rank(self) -> u8 {
        match self {
            StepStatus::Pending => 0,
            StepStatus::Running => 1,
            StepStatus::Completed | StepStatus::Failed => 2,
        }
    }
}

/// Execution mode requested for a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    #[default]
    Draft,
    Auto,
}

/// Node type tag as written in workflow definitions.
///
/// Tags this engine does not know are kept verbatim in `Unrecognized` so the
/// definition round-trips and the fallback stays visible at dispatch time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NodeType {
    Static,
    Agent,
    Tool,
    Router,
    HumanGate,
    Unrecognized(String),
}

impl NodeType {
    pub fn as_str(&self) -> &str {
        match self {
            NodeType::Static => "static",
            NodeType::Agent => "agent",
            NodeType::Tool => "tool",
            NodeType::Router => "router",
            NodeType::HumanGate => "human_gate",
            NodeType::Unrecognized(tag) => tag,
        }
    }

    /// Step rows only carry the known kinds; anything else is stored as static.
    pub fn step_type(&self) -> NodeType {
        match self {
            NodeType::Unrecognized(_) => NodeType::Static,
            known => known.clone(),
        }
    }
}

impl From<String> for NodeType {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "static" => NodeType::Static,
            "agent" => NodeType::Agent,
            "tool" => NodeType::Tool,
            "router" => NodeType::Router,
            "human_gate" => NodeType::HumanGate,
            _ => NodeType::Unrecognized(tag),
        }
    }
}

impl From<NodeType> for String {
    fn from(node_type: NodeType) -> Self {
        node_type.as_str().to_string()
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Workflow execution model
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum WorkflowType {
    #[default]
    Linear,
    Unsupported(String),
}

impl From<String> for WorkflowType {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "linear" | "" => WorkflowType::Linear,
            _ => WorkflowType::Unsupported(tag),
        }
    }
}

impl From<WorkflowType> for String {
    fn from(workflow_type: WorkflowType) -> Self {
        match workflow_type {
            WorkflowType::Linear => "linear".to_string(),
            WorkflowType::Unsupported(tag) => tag,
        }
    }
}

/// A single node in a workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub config: Value,
}

/// Directed edge between two nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
}

/// Nodes, edges and entry point of a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(rename = "entryNode", alias = "entry_node")]
    pub entry_node: String,
}

/// Versioned, immutable workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub name: String,
    pub version: String,
    #[serde(rename = "type", default)]
    pub workflow_type: WorkflowType,
    pub definition: WorkflowDefinition,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

/// One execution of a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub workflow_id: WorkflowId,
    pub workflow_version: String,
    pub tenant_id: String,
    pub user_id: Option<String>,
    pub app_id: Option<String>,
    pub app_action_id: Option<String>,
    pub status: RunStatus,
    pub mode: RunMode,
    pub input: Value,
    pub result: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub fn transition(&mut self, next: RunStatus) -> Result<(), EngineError> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::InvalidTransition(format!(
                "run {}: {:?} -> {:?}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Move to a terminal status, passing through `running` when the run
    /// failed before it was ever marked running.
    pub fn settle(&mut self, terminal: RunStatus) -> Result<(), EngineError> {
        if !terminal.is_terminal() {
            return Err(EngineError::InvalidTransition(format!(
                "run {}: {:?} is not terminal",
                self.id, terminal
            )));
        }
        if self.status == RunStatus::Pending {
            self.transition(RunStatus::Running)?;
        }
        self.transition(terminal)
    }
}

/// One execution of a single node within a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub run_id: RunId,
    pub node_id: String,
    #[serde(rename = "type")]
    pub step_type: NodeType,
    pub status: StepStatus,
    pub input: Value,
    pub output: Option<Value>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Step {
    pub fn new(run_id: RunId, node: &Node) -> Self {
        Self {
            id: StepId::new(),
            run_id,
            node_id: node.id.clone(),
            step_type: node.node_type.step_type(),
            status: StepStatus::Pending,
            input: serde_json::json!({
                "node_id": node.id,
                "node_type": node.node_type.as_str(),
                "config": node.config,
            }),
            output: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Move the step forward. `finished_at` is stamped exactly when the
    /// status becomes terminal.
    pub fn transition(&mut self, next: StepStatus, output: Option<Value>) -> Result<(), EngineError> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::InvalidTransition(format!(
                "step {}: {:?} -> {:?}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        if output.is_some() {
            self.output = output;
        }
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        Ok(())
    }
}

/// Tool risk classification used by policies (`tool.risk_level`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

/// Registered tool definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// JSON Schema for tool inputs
    #[serde(default)]
    pub input_schema: Value,
    #[serde(default)]
    pub risk_level: RiskLevel,
    /// 'builtin', 'http', 'code'
    #[serde(default)]
    pub handler_type: Option<String>,
}

/// Model settings for an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelProfile {
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

/// Agent definition (prompting itself happens outside this crate)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub instructions: Option<String>,
    pub model_profile: ModelProfile,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
}

/// Applicability level of a policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyScope {
    Global,
    Tenant,
    App,
    Tool,
    Workflow,
    Agent,
}

/// Outcome a matching policy produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyEffect {
    Allow,
    Deny,
    RequireApproval,
    Modify,
}

impl PolicyEffect {
    pub fn as_str(self) -> &'static str {
        match self {
            PolicyEffect::Allow => "allow",
            PolicyEffect::Deny => "deny",
            PolicyEffect::RequireApproval => "require_approval",
            PolicyEffect::Modify => "modify",
        }
    }
}

/// How the conditions of a rule combine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Logic {
    #[default]
    #[serde(rename = "AND", alias = "and")]
    And,
    #[serde(rename = "OR", alias = "or")]
    Or,
}

/// Comparison applied by a policy condition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    In,
    NotIn,
    GreaterThan,
    LessThan,
    Contains,
    StartsWith,
    EndsWith,
    Exists,
    NotExists,
    /// Never matches; logged when evaluated
    Unsupported(String),
}

impl From<String> for ConditionOperator {
    fn from(op: String) -> Self {
        match op.as_str() {
            "equals" => ConditionOperator::Equals,
            "not_equals" => ConditionOperator::NotEquals,
            "in" => ConditionOperator::In,
            "not_in" => ConditionOperator::NotIn,
            "greater_than" => ConditionOperator::GreaterThan,
            "less_than" => ConditionOperator::LessThan,
            "contains" => ConditionOperator::Contains,
            "starts_with" => ConditionOperator::StartsWith,
            "ends_with" => ConditionOperator::EndsWith,
            "exists" => ConditionOperator::Exists,
            "not_exists" => ConditionOperator::NotExists,
            _ => ConditionOperator::Unsupported(op),
        }
    }
}

impl From<ConditionOperator> for String {
    fn from(op: ConditionOperator) -> Self {
        let tag = match op {
            ConditionOperator::Equals => "equals",
            ConditionOperator::NotEquals => "not_equals",
            ConditionOperator::In => "in",
            ConditionOperator::NotIn => "not_in",
            ConditionOperator::GreaterThan => "greater_than",
            ConditionOperator::LessThan => "less_than",
            ConditionOperator::Contains => "contains",
            ConditionOperator::StartsWith => "starts_with",
            ConditionOperator::EndsWith => "ends_with",
            ConditionOperator::Exists => "exists",
            ConditionOperator::NotExists => "not_exists",
            ConditionOperator::Unsupported(op) => return op,
        };
        tag.to_string()
    }
}

/// Single leaf comparison against a dot-path into the evaluation context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: Value,
}

/// Flat list of conditions joined by AND or OR
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleExpr {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub logic: Logic,
}

fn default_enabled() -> bool {
    true
}

/// Scoped governance rule, authored outside the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub id: PolicyId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub scope: PolicyScope,
    #[serde(default)]
    pub scope_id: Option<String>,
    #[serde(default)]
    pub rule_expr: RuleExpr,
    pub effect: PolicyEffect,
    /// Lower values are evaluated first
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// App-scoped action that maps onto a workflow run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppAction {
    pub action_id: String,
    pub workflow_id: WorkflowId,
    /// Output key -> literal or `$event.path` / `$context.path` reference
    #[serde(default)]
    pub input_mapping: serde_json::Map<String, Value>,
    #[serde(default)]
    pub default_mode: RunMode,
}

/// Installed app with its granted tools and exposed actions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct App {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub tool_scopes: Vec<String>,
    #[serde(default)]
    pub actions: Vec<AppAction>,
}

/// Identity of a tool or agent invocation, derived from the owning run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolContext {
    pub run_id: RunId,
    pub step_id: Option<StepId>,
    pub tenant_id: String,
    pub user_id: Option<String>,
    pub app_id: Option<String>,
}

impl ToolContext {
    pub fn for_step(run: &Run, step_id: StepId) -> Self {
        Self {
            run_id: run.id,
            step_id: Some(step_id),
            tenant_id: run.tenant_id.clone(),
            user_id: run.user_id.clone(),
            app_id: run.app_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions_only_move_forward() {
        assert!(RunStatus::Pending.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Completed));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Failed));
        assert!(!RunStatus::Pending.can_transition_to(RunStatus::Completed));
        assert!(!RunStatus::Completed.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::Failed.can_transition_to(RunStatus::Completed));
        assert!(!StepStatus::Running.can_transition_to(StepStatus::Pending));
    }

    fn pending_run() -> Run {
        Run {
            id: RunId::new(),
            workflow_id: WorkflowId::new("wf"),
            workflow_version: "1".to_string(),
            tenant_id: DEFAULT_TENANT.to_string(),
            user_id: None,
            app_id: None,
            app_action_id: None,
            status: RunStatus::Pending,
            mode: RunMode::Draft,
            input: Value::Null,
            result: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_settle_from_pending_reaches_terminal() {
        let mut run = pending_run();
        run.settle(RunStatus::Failed).unwrap();
        assert_eq!(run.status, RunStatus::Failed);

        let mut run = pending_run();
        run.transition(RunStatus::Running).unwrap();
        run.settle(RunStatus::Completed).unwrap();
        assert_eq!(run.status, RunStatus::Completed);
    }

    #[test]
    fn test_settle_rejects_already_terminal_and_non_terminal() {
        let mut run = pending_run();
        assert!(run.settle(RunStatus::Running).is_err());
        assert_eq!(run.status, RunStatus::Pending);

        run.settle(RunStatus::Completed).unwrap();
        assert!(run.settle(RunStatus::Failed).is_err());
        assert_eq!(run.status, RunStatus::Completed);
    }

    #[test]
    fn test_step_finished_at_set_only_when_terminal() {
        let node = Node {
            id: "a".to_string(),
            node_type: NodeType::Static,
            config: Value::Null,
        };
        let mut step = Step::new(RunId::new(), &node);
        assert!(step.finished_at.is_none());

        step.transition(StepStatus::Running, None).unwrap();
        assert!(step.finished_at.is_none());

        step.transition(StepStatus::Completed, Some(serde_json::json!({"ok": true})))
            .unwrap();
        assert!(step.finished_at.is_some());

        assert!(step.transition(StepStatus::Failed, None).is_err());
        assert_eq!(step.status, StepStatus::Completed);
    }

    #[test]
    fn test_node_type_keeps_unrecognized_tags() {
        let node: Node = serde_json::from_value(serde_json::json!({
            "id": "n1",
            "type": "fan_out",
        }))
        .unwrap();

        assert_eq!(node.node_type, NodeType::Unrecognized("fan_out".to_string()));
        assert_eq!(node.node_type.step_type(), NodeType::Static);
        assert_eq!(serde_json::to_value(&node.node_type).unwrap(), "fan_out");
    }

    #[test]
    fn test_workflow_definition_parses_entry_node() {
        let workflow: Workflow = serde_json::from_value(serde_json::json!({
            "id": "wf-1",
            "name": "Triage",
            "version": "1.0.0",
            "type": "linear",
            "definition": {
                "nodes": [{"id": "a", "type": "static", "config": {"output": 1}}],
                "edges": [],
                "entryNode": "a"
            }
        }))
        .unwrap();

        assert_eq!(workflow.workflow_type, WorkflowType::Linear);
        assert_eq!(workflow.definition.entry_node, "a");
        assert_eq!(workflow.definition.nodes[0].node_type, NodeType::Static);
    }

    #[test]
    fn test_policy_defaults() {
        let policy: Policy = serde_json::from_value(serde_json::json!({
            "id": "p1",
            "name": "deny all",
            "scope": "global",
            "effect": "deny",
            "rule_expr": {"conditions": []}
        }))
        .unwrap();

        assert!(policy.enabled);
        assert_eq!(policy.priority, 0);
        assert_eq!(policy.rule_expr.logic, Logic::And);
    }
}
