use crate::error::{EngineError, Result};
use crate::types::{Node, NodeType};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StaticConfig {
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub value: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolNodeConfig {
    pub tool_id: String,
    /// Defaults to the run input
    #[serde(default)]
    pub input: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentNodeConfig {
    pub agent_id: String,
    /// Defaults to the run input
    #[serde(default)]
    pub input: Option<Value>,
}

/// A node with its configuration parsed for dispatch
#[derive(Debug, Clone)]
pub enum NodeKind {
    Static(StaticConfig),
    Tool(ToolNodeConfig),
    Agent(AgentNodeConfig),
    /// Router, human gate and unrecognized tags. Completes successfully with
    /// placeholder output; nothing is executed.
    Placeholder(NodeType),
}

impl NodeKind {
    pub fn from_node(node: &Node) -> Result<Self> {
        Ok(match &node.node_type {
            NodeType::Static => NodeKind::Static(parse_config(node)?),
            NodeType::Tool => NodeKind::Tool(parse_config(node)?),
            NodeType::Agent => NodeKind::Agent(parse_config(node)?),
            other @ (NodeType::Router | NodeType::HumanGate | NodeType::Unrecognized(_)) => {
                NodeKind::Placeholder(other.clone())
            }
        })
    }
}

fn parse_config<T: DeserializeOwned>(node: &Node) -> Result<T> {
    let config = match &node.config {
        Value::Null => Value::Object(Default::default()),
        config => config.clone(),
    };

    serde_json::from_value(config).map_err(|e| {
        EngineError::InvalidWorkflow(format!(
            "{} node '{}' has invalid config: {}",
            node.node_type, node.id, e
        ))
    })
}
