use crate::error::{EngineError, Result};
use crate::types::{Node, Workflow, WorkflowType};
use std::collections::{HashMap, HashSet};
use tracing::warn;

/// Resolve the execution order of a linear workflow.
///
/// Starts at the entry node and follows the first outgoing edge whose target
/// exists until a node has no successor. Revisiting a node ends the chain.
pub fn execution_order(workflow: &Workflow) -> Result<Vec<&Node>> {
    if let WorkflowType::Unsupported(kind) = &workflow.workflow_type {
        return Err(EngineError::InvalidWorkflow(format!(
            "workflow '{}' has unsupported type '{}'",
            workflow.id, kind
        )));
    }

    let definition = &workflow.definition;
    let nodes: HashMap<&str, &Node> = definition
        .nodes
        .iter()
        .map(|n| (n.id.as_str(), n))
        .collect();

    let entry = nodes
        .get(definition.entry_node.as_str())
        .copied()
        .ok_or_else(|| {
            EngineError::InvalidWorkflow(format!(
                "entry node '{}' not found in workflow '{}'",
                definition.entry_node, workflow.id
            ))
        })?;

    let mut order = vec![entry];
    let mut visited: HashSet<&str> = HashSet::from([entry.id.as_str()]);
    let mut current = entry;

    loop {
        let mut outgoing = definition.edges.iter().filter(|e| e.from == current.id);
        let next = outgoing.find_map(|edge| {
            let target = nodes.get(edge.to.as_str()).copied();
            if target.is_none() {
                warn!(workflow_id = %workflow.id, from = %edge.from, to = %edge.to, "Skipping edge to missing node");
            }
            target
        });

        let Some(next) = next else { break };

        if !visited.insert(next.id.as_str()) {
            warn!(workflow_id = %workflow.id, node_id = %next.id, "Cycle detected, ending chain");
            break;
        }

        order.push(next);
        current = next;
    }

    Ok(order)
}
