/// Workflow graph validation
///
/// Checks a job's node and connection lists once, when the workflow is loaded,
/// and produces a `ValidatedWorkflow` with parsed ports and id lookups. The
/// scheduler only ever works on validated graphs, so it can index nodes by id
/// without re-checking.

use crate::error::{EngineError, EngineResult};
use crate::workflow::types::{ExecutionJob, Port, WorkflowConnection, WorkflowNode};
use std::collections::HashMap;

/// A connection with both endpoints checked and its target port parsed
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConnection {
    pub id: String,
    pub source: String,
    pub source_output: String,
    pub target: String,
    pub target_port: Port,
}

/// Workflow graph that passed validation
#[derive(Debug, Clone)]
pub struct ValidatedWorkflow {
    nodes: Vec<WorkflowNode>,
    index: HashMap<String, usize>,
    connections: Vec<ResolvedConnection>,
}

impl ValidatedWorkflow {
    /// Validate the graph carried by a queue job
    pub fn from_job(job: &ExecutionJob) -> EngineResult<Self> {
        Self::new(job.nodes.clone(), &job.connections)
    }

    /// Validate nodes and connections
    ///
    /// Rejects empty or duplicate node ids, empty node types, empty port names
    /// and connections whose endpoints are not in the node list.
    pub fn new(nodes: Vec<WorkflowNode>, connections: &[WorkflowConnection]) -> EngineResult<Self> {
        let mut index = HashMap::with_capacity(nodes.len());

        for (position, node) in nodes.iter().enumerate() {
            if node.id.trim().is_empty() {
                return Err(EngineError::InvalidWorkflow(format!(
                    "node at position {} has an empty id",
                    position
                )));
            }
            if node.node_type.trim().is_empty() {
                return Err(EngineError::InvalidWorkflow(format!(
                    "node '{}' has an empty type",
                    node.id
                )));
            }
            if index.insert(node.id.clone(), position).is_some() {
                return Err(EngineError::InvalidWorkflow(format!(
                    "duplicate node id '{}'",
                    node.id
                )));
            }
        }

        let mut resolved = Vec::with_capacity(connections.len());
        for connection in connections {
            for endpoint in [&connection.source_node_id, &connection.target_node_id] {
                if !index.contains_key(endpoint) {
                    return Err(EngineError::InvalidWorkflow(format!(
                        "connection '{}' references unknown node '{}'",
                        connection.id, endpoint
                    )));
                }
            }
            if connection.source_output.is_empty() || connection.target_input.is_empty() {
                return Err(EngineError::InvalidWorkflow(format!(
                    "connection '{}' ({} -> {}) has an empty port name",
                    connection.id, connection.source_node_id, connection.target_node_id
                )));
            }

            resolved.push(ResolvedConnection {
                id: connection.id.clone(),
                source: connection.source_node_id.clone(),
                source_output: connection.source_output.clone(),
                target: connection.target_node_id.clone(),
                target_port: Port::parse(&connection.target_input),
            });
        }

        tracing::debug!(
            "✅ Validated workflow graph: {} nodes, {} connections",
            nodes.len(),
            resolved.len()
        );

        Ok(Self {
            nodes,
            index,
            connections: resolved,
        })
    }

    /// Nodes in declaration order
    pub fn nodes(&self) -> &[WorkflowNode] {
        &self.nodes
    }

    pub fn node(&self, id: &str) -> Option<&WorkflowNode> {
        self.index.get(id).map(|&position| &self.nodes[position])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Connections in declaration order
    pub fn connections(&self) -> &[ResolvedConnection] {
        &self.connections
    }

    /// Connections feeding `node_id`, in declaration order
    pub fn incoming<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a ResolvedConnection> + 'a {
        self.connections.iter().filter(move |c| c.target == node_id)
    }

    /// Connections leaving `node_id`, in declaration order
    pub fn outgoing<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a ResolvedConnection> + 'a {
        self.connections.iter().filter(move |c| c.source == node_id)
    }
}
