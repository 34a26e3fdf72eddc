/// Node input assembly
///
/// Builds the per-port input a node receives from the outputs of its
/// upstream nodes:
/// - `main` and `done` ports get data, one batch per incoming connection in
///   declaration order, taken from the connection's source branch
/// - any other port gets references to the upstream service nodes, which the
///   target node invokes itself
/// - a node with no incoming data connections gets the trigger payload

use crate::workflow::registry::NodeTypeRegistry;
use crate::workflow::types::{Port, MAIN_PORT};
use crate::workflow::validation::ValidatedWorkflow;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};

/// Reference to a service node wired into a capability port
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceReference {
    /// Connection id, or the service node id for unnamed connections
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    pub node_id: String,
    pub parameters: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Value>,
}

/// Input for one port
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PortInput {
    Data(Vec<Value>),
    Services(Vec<ServiceReference>),
}

/// Per-port input handed to a node executor, serialized as a plain map
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct NodeInputs {
    ports: BTreeMap<String, PortInput>,
}

impl NodeInputs {
    /// Data batches on `main`
    pub fn main(&self) -> &[Value] {
        self.data(MAIN_PORT)
    }

    /// Data batches on a data port; empty for unknown or service ports
    pub fn data(&self, port: &str) -> &[Value] {
        match self.ports.get(port) {
            Some(PortInput::Data(items)) => items,
            _ => &[],
        }
    }

    /// Service references on a capability port
    pub fn services(&self, port: &str) -> &[ServiceReference] {
        match self.ports.get(port) {
            Some(PortInput::Services(refs)) => refs,
            _ => &[],
        }
    }

    pub fn port_names(&self) -> impl Iterator<Item = &str> {
        self.ports.keys().map(String::as_str)
    }

    fn push_data(&mut self, port: &str, batch: Value) {
        match self
            .ports
            .entry(port.to_string())
            .or_insert_with(|| PortInput::Data(Vec::new()))
        {
            PortInput::Data(items) => items.push(batch),
            PortInput::Services(_) => {}
        }
    }

    fn push_service(&mut self, port: &str, reference: ServiceReference) {
        match self
            .ports
            .entry(port.to_string())
            .or_insert_with(|| PortInput::Services(Vec::new()))
        {
            PortInput::Services(refs) => refs.push(reference),
            PortInput::Data(_) => {}
        }
    }
}

/// Portion of an upstream output that travels over one source branch
///
/// An object output keyed by branch name yields that key's value. Otherwise
/// the `main` branch carries the whole output and any other branch nothing.
pub fn branch_data(output: &Value, source_output: &str) -> Value {
    if let Some(branch) = output.as_object().and_then(|map| map.get(source_output)) {
        return branch.clone();
    }
    if source_output == MAIN_PORT {
        return output.clone();
    }
    Value::Null
}

/// Whether a branch slice carries data
pub fn has_data(branch: &Value) -> bool {
    match branch {
        Value::Null => false,
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        _ => true,
    }
}

/// Outgoing connections of `node_id` whose source branch carries data
///
/// Reported with the `node-completed` event so observers can highlight the
/// paths a routing node actually took.
pub fn active_connections(workflow: &ValidatedWorkflow, node_id: &str, output: &Value) -> Vec<Value> {
    workflow
        .outgoing(node_id)
        .filter(|connection| has_data(&branch_data(output, &connection.source_output)))
        .map(|connection| {
            json!({
                "id": connection.id,
                "sourceNodeId": connection.source,
                "sourceOutput": connection.source_output,
                "targetNodeId": connection.target,
                "targetInput": connection.target_port.name(),
            })
        })
        .collect()
}

/// Whether `node_id` is a service node in this workflow
pub fn is_service(workflow: &ValidatedWorkflow, node_id: &str, registry: &NodeTypeRegistry) -> bool {
    workflow
        .node(node_id)
        .is_some_and(|node| registry.is_service_node(&node.node_type))
}

/// Whether every upstream dependency of `node_id` has produced output
///
/// Service nodes never run on their own, so they count as ready.
pub fn dependencies_ready(
    workflow: &ValidatedWorkflow,
    node_id: &str,
    node_outputs: &HashMap<String, Value>,
    registry: &NodeTypeRegistry,
) -> bool {
    workflow.incoming(node_id).all(|connection| {
        node_outputs.contains_key(&connection.source) || is_service(workflow, &connection.source, registry)
    })
}

/// Assemble the inputs for `node_id`
pub fn build_inputs(
    workflow: &ValidatedWorkflow,
    node_id: &str,
    node_outputs: &HashMap<String, Value>,
    trigger_data: Option<&Value>,
) -> NodeInputs {
    let mut inputs = NodeInputs::default();
    let mut has_data_connection = false;

    for connection in workflow.incoming(node_id) {
        match &connection.target_port {
            Port::Service(port) => {
                let Some(source) = workflow.node(&connection.source) else {
                    continue;
                };
                let id = if connection.id.is_empty() {
                    source.id.clone()
                } else {
                    connection.id.clone()
                };
                inputs.push_service(
                    port,
                    ServiceReference {
                        id,
                        node_type: source.node_type.clone(),
                        node_id: source.id.clone(),
                        parameters: source.parameters.clone(),
                        credentials: source
                            .credentials
                            .as_ref()
                            .and_then(|refs| serde_json::to_value(refs).ok()),
                    },
                );
            }
            data_port => {
                has_data_connection = true;
                if let Some(output) = node_outputs.get(&connection.source) {
                    inputs.push_data(
                        data_port.name(),
                        branch_data(output, &connection.source_output),
                    );
                }
            }
        }
    }

    if !has_data_connection {
        let seed = trigger_data.cloned().unwrap_or_else(|| json!([]));
        inputs.push_data(MAIN_PORT, seed);
    }

    inputs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::registry::NodeTypeDescription;
    use crate::workflow::types::{WorkflowConnection, WorkflowNode};

    fn node(id: &str, node_type: &str) -> WorkflowNode {
        serde_json::from_value(json!({"id": id, "type": node_type, "parameters": {"k": id}})).unwrap()
    }

    fn connection(id: &str, from: &str, output: &str, to: &str, input: &str) -> WorkflowConnection {
        serde_json::from_value(json!({
            "id": id,
            "sourceNodeId": from,
            "sourceOutput": output,
            "targetNodeId": to,
            "targetInput": input,
        }))
        .unwrap()
    }

    fn registry() -> NodeTypeRegistry {
        NodeTypeRegistry::from_descriptions(vec![
            serde_json::from_value::<NodeTypeDescription>(json!({"name": "calculatorTool", "inputs": []}))
                .unwrap(),
            serde_json::from_value::<NodeTypeDescription>(json!({"name": "set"})).unwrap(),
        ])
    }

    #[test]
    fn test_fan_in_concatenates_per_connection() {
        let wf = ValidatedWorkflow::new(
            vec![node("a", "set"), node("b", "set"), node("d", "set")],
            &[
                connection("c1", "a", "main", "d", "main"),
                connection("c2", "b", "main", "d", "main"),
            ],
        )
        .unwrap();
        let outputs = HashMap::from([
            ("a".to_string(), json!([{"from": "a"}])),
            ("b".to_string(), json!([{"from": "b"}])),
        ]);

        let inputs = build_inputs(&wf, "d", &outputs, None);
        assert_eq!(inputs.main(), &[json!([{"from": "a"}]), json!([{"from": "b"}])]);
        assert_eq!(serde_json::to_value(&inputs).unwrap(), json!({"main": [[{"from": "a"}], [{"from": "b"}]]}));
    }

    #[test]
    fn test_branch_selection() {
        let output = json!({"true": [{"x": 1}], "false": []});
        assert_eq!(branch_data(&output, "true"), json!([{"x": 1}]));
        assert_eq!(branch_data(&output, "false"), json!([]));
        assert_eq!(branch_data(&output, "other"), Value::Null);
        assert_eq!(branch_data(&json!([1, 2]), "main"), json!([1, 2]));
        assert_eq!(branch_data(&json!([1, 2]), "true"), Value::Null);
    }

    #[test]
    fn test_active_connections_follow_non_empty_branches() {
        let wf = ValidatedWorkflow::new(
            vec![node("if", "set"), node("yes", "set"), node("no", "set")],
            &[
                connection("c-yes", "if", "true", "yes", "main"),
                connection("c-no", "if", "false", "no", "main"),
            ],
        )
        .unwrap();

        let active = active_connections(&wf, "if", &json!({"true": [{"x": 1}], "false": []}));
        assert_eq!(active.len(), 1);
        assert_eq!(active[0]["id"], "c-yes");
        assert_eq!(active[0]["targetNodeId"], "yes");
    }

    #[test]
    fn test_root_node_receives_trigger_data() {
        let wf = ValidatedWorkflow::new(vec![node("t", "set")], &[]).unwrap();
        let outputs = HashMap::new();

        let seeded = build_inputs(&wf, "t", &outputs, Some(&json!({"body": 1})));
        assert_eq!(seeded.main(), &[json!({"body": 1})]);

        let empty = build_inputs(&wf, "t", &outputs, None);
        assert_eq!(empty.main(), &[json!([])]);
    }

    #[test]
    fn test_service_ports_carry_references() {
        let wf = ValidatedWorkflow::new(
            vec![node("t", "set"), node("agent", "set"), node("calc", "calculatorTool")],
            &[
                connection("c1", "t", "main", "agent", "main"),
                connection("c2", "calc", "main", "agent", "ai_tool"),
            ],
        )
        .unwrap();
        let outputs = HashMap::from([("t".to_string(), json!([{"q": "2+2"}]))]);

        let inputs = build_inputs(&wf, "agent", &outputs, None);
        let tools = inputs.services("ai_tool");
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].id, "c2");
        assert_eq!(tools[0].node_id, "calc");
        assert_eq!(tools[0].node_type, "calculatorTool");
        assert_eq!(tools[0].parameters, json!({"k": "calc"}));
        assert_eq!(inputs.main(), &[json!([{"q": "2+2"}])]);

        let registry = registry();
        assert!(dependencies_ready(&wf, "agent", &outputs, &registry));
        assert!(!dependencies_ready(&wf, "agent", &HashMap::new(), &registry));
    }
}
