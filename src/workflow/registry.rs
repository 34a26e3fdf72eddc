/// Hot-reload node type registry using ArcSwap
///
/// Holds the node-type descriptions the engine needs while scheduling: which
/// inputs a type declares, whether it can start a workflow, and which of its
/// properties select credentials. Updates swap the whole map atomically, so
/// running executions never block on a reload.

use anyhow::Result;
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::Path, sync::Arc};

fn default_inputs() -> Vec<String> {
    vec![crate::workflow::types::MAIN_PORT.to_string()]
}

/// Static description of a node type
///
/// Only the parts the engine reasons about are modeled here. Everything else
/// about a node type belongs to the node executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeTypeDescription {
    /// Registered type name (e.g., "httpRequest")
    pub name: String,
    /// Declared input ports. Service nodes (tools, models) declare none.
    #[serde(default = "default_inputs")]
    pub inputs: Vec<String>,
    /// Whether this type can start a workflow (webhook, schedule, manual)
    #[serde(default)]
    pub trigger: bool,
    /// Parameter properties; credential selectors are picked out of these
    #[serde(default)]
    pub properties: Vec<NodeProperty>,
}

impl NodeTypeDescription {
    /// Number of declared inputs that carry data
    pub fn data_input_count(&self) -> usize {
        self.inputs
            .iter()
            .filter(|name| crate::workflow::types::Port::parse(name).is_data())
            .count()
    }

    /// A service node is consumed by reference (a tool attached to an agent)
    /// rather than through data flow. Trigger-capable types never are.
    pub fn is_service(&self) -> bool {
        !self.trigger && self.data_input_count() == 0
    }

    /// Properties that select a credential of one of the allowed types
    pub fn credential_properties(&self) -> impl Iterator<Item = &NodeProperty> {
        self.properties.iter().filter(|p| p.is_credential_field())
    }
}

/// A single parameter property on a node type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeProperty {
    /// Parameter name the value is read from
    pub name: String,
    /// Property kind ("string", "options", "credentials", ...)
    #[serde(rename = "type")]
    pub kind: String,
    /// Credential types accepted by a credential selector
    #[serde(default)]
    pub credential_types: Vec<String>,
}

impl NodeProperty {
    pub fn is_credential_field(&self) -> bool {
        matches!(self.kind.as_str(), "credentials" | "credentialsSelect")
            && !self.credential_types.is_empty()
    }
}

/// Lock-free node type registry for hot-reload capabilities
#[derive(Debug)]
pub struct NodeTypeRegistry {
    /// Key: node type name, Value: description
    types: ArcSwap<HashMap<String, Arc<NodeTypeDescription>>>,
}

impl Default for NodeTypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeTypeRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            types: ArcSwap::new(Arc::new(HashMap::new())),
        }
    }

    /// Create a registry from a list of descriptions
    pub fn from_descriptions(descriptions: impl IntoIterator<Item = NodeTypeDescription>) -> Self {
        let registry = Self::new();
        registry.replace_all(descriptions);
        registry
    }

    /// Load descriptions from a JSON file containing an array of node types
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let registry = Self::new();
        registry.reload_from_file(path)?;
        Ok(registry)
    }

    /// Hot-reload the whole registry from a JSON file
    ///
    /// The previous map stays active if the file cannot be read or parsed.
    pub fn reload_from_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read node types from '{}': {}", path.display(), e))?;
        let descriptions: Vec<NodeTypeDescription> = serde_json::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("Invalid node type file '{}': {}", path.display(), e))?;

        let count = descriptions.len();
        self.replace_all(descriptions);
        tracing::info!("📚 Loaded {} node types from {}", count, path.display());
        Ok(())
    }

    /// Atomically replace every registered description
    pub fn replace_all(&self, descriptions: impl IntoIterator<Item = NodeTypeDescription>) {
        let map = descriptions
            .into_iter()
            .map(|desc| (desc.name.clone(), Arc::new(desc)))
            .collect();
        self.types.store(Arc::new(map));
    }

    /// Add or update a single description
    pub fn register(&self, description: NodeTypeDescription) {
        let current = self.types.load();
        let mut next = (**current).clone();
        tracing::debug!("➕ Registered node type: {}", description.name);
        next.insert(description.name.clone(), Arc::new(description));
        self.types.store(Arc::new(next));
    }

    /// Look up a description by type name (lock-free read)
    pub fn get(&self, node_type: &str) -> Option<Arc<NodeTypeDescription>> {
        self.types.load().get(node_type).cloned()
    }

    /// Whether nodes of this type are service nodes
    ///
    /// Unknown types are treated as regular data nodes.
    pub fn is_service_node(&self, node_type: &str) -> bool {
        self.get(node_type).map(|desc| desc.is_service()).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.types.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn desc(value: serde_json::Value) -> NodeTypeDescription {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_service_node_detection() {
        let registry = NodeTypeRegistry::from_descriptions(vec![
            desc(json!({"name": "calculatorTool", "inputs": []})),
            desc(json!({"name": "webhook", "inputs": [], "trigger": true})),
            desc(json!({"name": "agent", "inputs": ["main", "ai_tool", "ai_languageModel"]})),
            desc(json!({"name": "set"})),
            desc(json!({"name": "chatModel", "inputs": ["ai_memory"]})),
        ]);

        assert!(registry.is_service_node("calculatorTool"));
        assert!(registry.is_service_node("chatModel"));
        assert!(!registry.is_service_node("webhook"));
        assert!(!registry.is_service_node("agent"));
        assert!(!registry.is_service_node("set"));
        assert!(!registry.is_service_node("unknownType"));
    }

    #[test]
    fn test_credential_properties_require_allowed_types() {
        let description = desc(json!({
            "name": "httpRequest",
            "properties": [
                {"name": "url", "type": "string"},
                {"name": "authentication", "type": "credentials", "credentialTypes": ["httpBasicAuth"]},
                {"name": "legacy", "type": "credentials"}
            ]
        }));

        let names: Vec<&str> = description
            .credential_properties()
            .map(|p| p.name.as_str())
            .collect();
        assert_eq!(names, vec!["authentication"]);
    }

    #[test]
    fn test_register_swaps_single_entry() {
        let registry = NodeTypeRegistry::new();
        assert!(registry.is_empty());

        registry.register(desc(json!({"name": "set"})));
        registry.register(desc(json!({"name": "set", "inputs": []})));

        assert_eq!(registry.len(), 1);
        assert!(registry.is_service_node("set"));
    }

    #[test]
    fn test_reload_from_missing_file_keeps_previous_map() {
        let registry = NodeTypeRegistry::from_descriptions(vec![desc(json!({"name": "set"}))]);
        let result = registry.reload_from_file("/nonexistent/node-types.json");

        assert!(result.is_err());
        assert!(registry.get("set").is_some());
    }
}
