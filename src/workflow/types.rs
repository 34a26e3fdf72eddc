/// Core workflow type definitions
///
/// Defines the nodes, connections and queue job payload that flow from the
/// trigger layer into the execution worker. All shapes use camelCase JSON so
/// jobs produced by other services deserialize without translation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Default port name for data flowing between nodes
pub const MAIN_PORT: &str = "main";

/// Port name used by loop-style nodes to signal their final batch
pub const DONE_PORT: &str = "done";

fn default_port() -> String {
    MAIN_PORT.to_string()
}

fn default_parameters() -> Value {
    Value::Object(serde_json::Map::new())
}

fn default_true() -> bool {
    true
}

/// A single node in the workflow graph
///
/// Nodes are opaque to the engine apart from their id, their type (used to look
/// up the node-type description) and the `disabled` flag. Parameters and
/// settings are forwarded verbatim to the node executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowNode {
    /// Unique node identifier within the workflow (e.g., "http-1")
    pub id: String,
    /// Human-readable node name, used for `$node["Name"]` style lookups
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Registered node type (e.g., "httpRequest", "agent")
    #[serde(rename = "type")]
    pub node_type: String,
    /// Node-specific configuration parameters as flexible JSON
    #[serde(default = "default_parameters")]
    pub parameters: Value,
    /// Declarative credential references
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<CredentialRefs>,
    /// Per-node execution settings (retry-on-fail, notes, ...)
    #[serde(default = "default_parameters")]
    pub settings: Value,
    /// Disabled nodes stay in the graph but are never executed
    #[serde(default)]
    pub disabled: bool,
}

impl WorkflowNode {
    /// Display name of the node, falling back to its id
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Credential references declared on a node
///
/// Older workflows store a flat list of credential ids; newer ones store a map
/// keyed by credential slot. Both shapes are accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CredentialRefs {
    /// Legacy flat array of credential ids
    Ids(Vec<String>),
    /// Credential slot name -> reference payload
    Named(BTreeMap<String, Value>),
}

impl CredentialRefs {
    /// Credential ids from the legacy flat-array form
    pub fn legacy_ids(&self) -> &[String] {
        match self {
            CredentialRefs::Ids(ids) => ids,
            CredentialRefs::Named(_) => &[],
        }
    }
}

/// Directed connection between an output port and an input port
///
/// The engine builds its dependency graph from these. Port names default to
/// "main" when omitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowConnection {
    /// Connection identifier (may be empty for generated connections)
    #[serde(default)]
    pub id: String,
    /// Upstream node id
    pub source_node_id: String,
    /// Output branch on the upstream node (e.g., "main", "true", "false")
    #[serde(default = "default_port")]
    pub source_output: String,
    /// Downstream node id
    pub target_node_id: String,
    /// Input port on the downstream node
    #[serde(default = "default_port")]
    pub target_input: String,
}

/// Input port kind, parsed from a connection's `targetInput`
///
/// `main` and `done` carry data batches. Every other port name wires a
/// capability (a tool, a model, a memory) into the target node by reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Port {
    Main,
    Done,
    Service(String),
}

impl Port {
    pub fn parse(name: &str) -> Self {
        match name {
            MAIN_PORT => Port::Main,
            DONE_PORT => Port::Done,
            other => Port::Service(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Port::Main => MAIN_PORT,
            Port::Done => DONE_PORT,
            Port::Service(name) => name,
        }
    }

    /// Whether this port carries data rather than capability references
    pub fn is_data(&self) -> bool {
        matches!(self, Port::Main | Port::Done)
    }
}

/// Per-job execution options set by the trigger layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOptions {
    /// Execute only the trigger node instead of its whole downstream graph
    #[serde(default)]
    pub single_node_mode: bool,
    /// Hand the finished execution to durable history
    #[serde(default = "default_true")]
    pub save_to_database: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            single_node_mode: false,
            save_to_database: true,
        }
    }
}

/// Queue payload describing one execution of a workflow
///
/// Created once by the trigger layer. The node and connection lists are
/// immutable across retries, which keeps the computed order deterministic.
/// `last_completed_node_id` is only set on resume attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionJob {
    pub execution_id: String,
    pub workflow_id: String,
    pub user_id: String,
    /// Node the execution was triggered from
    #[serde(default)]
    pub trigger_node_id: String,
    pub nodes: Vec<WorkflowNode>,
    #[serde(default)]
    pub connections: Vec<WorkflowConnection>,
    /// Initial payload handed to nodes without incoming connections
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_data: Option<Value>,
    #[serde(default)]
    pub options: JobOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_completed_node_id: Option<String>,
}

impl ExecutionJob {
    /// Map of node id -> display name, forwarded to every node execution
    pub fn node_id_to_name(&self) -> HashMap<String, String> {
        self.nodes
            .iter()
            .map(|node| (node.id.clone(), node.display_name().to_string()))
            .collect()
    }
}
