/// Credential resolution
///
/// Maps the credential references on a node to a `credential type -> id`
/// table for the node executor. Secrets never pass through the engine; only
/// ids and types do.
///
/// Resolution order:
/// 1. Typed path: every credential selector property declared by the node
///    type is read from the node's parameters
/// 2. Legacy path: when the typed path yields nothing, the ids listed on the
///    node itself are resolved
///
/// A credential owned by another user is skipped with a warning and never
/// fails the execution.

// SQLite-backed lookup
pub mod sqlite;

pub use sqlite::SqliteCredentialLookup;

use crate::error::{EngineError, EngineResult};
use crate::workflow::registry::NodeTypeDescription;
use crate::workflow::types::{CredentialRefs, WorkflowNode};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

/// What the engine needs to know about a stored credential
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRecord {
    pub credential_type: String,
    pub owner_user_id: String,
}

/// Read access to credential metadata
#[async_trait]
pub trait CredentialLookup: Send + Sync + 'static {
    /// `Ok(None)` when the credential does not exist
    async fn lookup(&self, credential_id: &str) -> anyhow::Result<Option<CredentialRecord>>;
}

/// Lookup over a fixed in-memory table, for tests and single-tenant setups
#[derive(Debug, Default)]
pub struct StaticCredentialLookup {
    records: HashMap<String, CredentialRecord>,
}

impl StaticCredentialLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, id: &str, credential_type: &str, owner_user_id: &str) -> Self {
        self.records.insert(
            id.to_string(),
            CredentialRecord {
                credential_type: credential_type.to_string(),
                owner_user_id: owner_user_id.to_string(),
            },
        );
        self
    }
}

#[async_trait]
impl CredentialLookup for StaticCredentialLookup {
    async fn lookup(&self, credential_id: &str) -> anyhow::Result<Option<CredentialRecord>> {
        Ok(self.records.get(credential_id).cloned())
    }
}

/// Credential id from a parameter value: a bare id or `{ "id": ... }`
fn credential_id(value: &Value) -> Option<&str> {
    match value {
        Value::String(id) if !id.is_empty() => Some(id),
        Value::Object(map) => map.get("id").and_then(Value::as_str).filter(|id| !id.is_empty()),
        _ => None,
    }
}

/// Ids listed directly on the node
fn node_credential_ids(refs: &CredentialRefs) -> Vec<&str> {
    match refs {
        CredentialRefs::Ids(ids) => ids.iter().map(String::as_str).collect(),
        CredentialRefs::Named(named) => named.values().filter_map(credential_id).collect(),
    }
}

/// Look up one credential, applying the ownership check
async fn owned_record(
    lookup: &dyn CredentialLookup,
    credential_id: &str,
    node: &WorkflowNode,
    user_id: &str,
) -> EngineResult<Option<CredentialRecord>> {
    let record = lookup
        .lookup(credential_id)
        .await
        .map_err(|e| EngineError::Credential(format!("{}: {}", credential_id, e)))?;

    let Some(record) = record else {
        tracing::warn!(
            "⚠️ Credential '{}' referenced by node '{}' does not exist",
            credential_id,
            node.id
        );
        return Ok(None);
    };

    if record.owner_user_id != user_id {
        tracing::warn!(
            "⚠️ Skipping credential '{}' on node '{}': not owned by user '{}'",
            credential_id,
            node.id,
            user_id
        );
        return Ok(None);
    }

    Ok(Some(record))
}

/// Resolve a node's credentials into a `credential type -> id` table
///
/// Lookup failures are infrastructure errors and fail the attempt; missing or
/// foreign credentials are skipped.
pub async fn resolve_credentials(
    lookup: &dyn CredentialLookup,
    node: &WorkflowNode,
    description: Option<&NodeTypeDescription>,
    user_id: &str,
) -> EngineResult<HashMap<String, String>> {
    let mut resolved = HashMap::new();

    if let Some(description) = description {
        for property in description.credential_properties() {
            let Some(id) = node.parameters.get(&property.name).and_then(credential_id) else {
                continue;
            };
            let Some(record) = owned_record(lookup, id, node, user_id).await? else {
                continue;
            };
            if !property.credential_types.contains(&record.credential_type) {
                tracing::warn!(
                    "⚠️ Credential '{}' has type '{}', not accepted by '{}.{}'",
                    id,
                    record.credential_type,
                    node.node_type,
                    property.name
                );
                continue;
            }
            resolved.insert(record.credential_type, id.to_string());
        }
    }

    if resolved.is_empty() {
        if let Some(refs) = &node.credentials {
            for id in node_credential_ids(refs) {
                if let Some(record) = owned_record(lookup, id, node, user_id).await? {
                    resolved.insert(record.credential_type, id.to_string());
                }
            }
        }
    }

    if !resolved.is_empty() {
        tracing::debug!(
            "🔑 Resolved {} credential(s) for node '{}'",
            resolved.len(),
            node.id
        );
    }
    Ok(resolved)
}
