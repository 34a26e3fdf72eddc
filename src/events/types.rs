/// Execution event message definitions
///
/// One JSON message shape travels over the broadcast channel for every
/// lifecycle and per-node event. Inbound messages are validated here before
/// any handler sees them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Kind of execution event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionEventType {
    Started,
    NodeStarted,
    NodeCompleted,
    NodeFailed,
    Completed,
    Failed,
    Cancelled,
    NodeStatusUpdate,
    ExecutionProgress,
}

impl ExecutionEventType {
    pub const ALL: [ExecutionEventType; 9] = [
        ExecutionEventType::Started,
        ExecutionEventType::NodeStarted,
        ExecutionEventType::NodeCompleted,
        ExecutionEventType::NodeFailed,
        ExecutionEventType::Completed,
        ExecutionEventType::Failed,
        ExecutionEventType::Cancelled,
        ExecutionEventType::NodeStatusUpdate,
        ExecutionEventType::ExecutionProgress,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionEventType::Started => "started",
            ExecutionEventType::NodeStarted => "node-started",
            ExecutionEventType::NodeCompleted => "node-completed",
            ExecutionEventType::NodeFailed => "node-failed",
            ExecutionEventType::Completed => "completed",
            ExecutionEventType::Failed => "failed",
            ExecutionEventType::Cancelled => "cancelled",
            ExecutionEventType::NodeStatusUpdate => "node-status-update",
            ExecutionEventType::ExecutionProgress => "execution-progress",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == raw)
    }

    /// `node-*` events must name the node they refer to
    pub fn requires_node_id(self) -> bool {
        self.as_str().starts_with("node-")
    }

    /// No further events follow one of these for the same execution
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionEventType::Completed | ExecutionEventType::Failed | ExecutionEventType::Cancelled
        )
    }
}

/// A single execution event as published on the broadcast channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionEventMessage {
    #[serde(rename = "type")]
    pub event_type: ExecutionEventType,
    pub execution_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// Why an inbound message was dropped
#[derive(Error, Debug)]
pub enum MalformedEvent {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("event is not a JSON object")]
    NotAnObject,

    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("unknown event type '{0}'")]
    UnknownType(String),

    #[error("event type '{0}' requires a nodeId")]
    MissingNodeId(&'static str),

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

impl ExecutionEventMessage {
    /// Execution-level event stamped with the current time
    pub fn new(event_type: ExecutionEventType, execution_id: impl Into<String>) -> Self {
        Self {
            event_type,
            execution_id: execution_id.into(),
            node_id: None,
            timestamp: Utc::now(),
            payload: None,
        }
    }

    /// Node-level event stamped with the current time
    pub fn for_node(
        event_type: ExecutionEventType,
        execution_id: impl Into<String>,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            node_id: Some(node_id.into()),
            ..Self::new(event_type, execution_id)
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Parse and validate a raw channel message
    ///
    /// Accepts timestamps as RFC 3339 strings or epoch milliseconds.
    pub fn parse(raw: &str) -> Result<Self, MalformedEvent> {
        let value: Value = serde_json::from_str(raw)?;
        let object = value.as_object().ok_or(MalformedEvent::NotAnObject)?;

        let type_raw = object
            .get("type")
            .and_then(Value::as_str)
            .ok_or(MalformedEvent::MissingField("type"))?;
        let event_type = ExecutionEventType::parse(type_raw)
            .ok_or_else(|| MalformedEvent::UnknownType(type_raw.to_string()))?;

        let execution_id = object
            .get("executionId")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or(MalformedEvent::MissingField("executionId"))?;

        let timestamp = match object.get("timestamp") {
            None | Some(Value::Null) => return Err(MalformedEvent::MissingField("timestamp")),
            Some(Value::String(text)) => DateTime::parse_from_rfc3339(text)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| MalformedEvent::InvalidTimestamp(e.to_string()))?,
            Some(Value::Number(millis)) => millis
                .as_i64()
                .and_then(DateTime::from_timestamp_millis)
                .ok_or_else(|| MalformedEvent::InvalidTimestamp(millis.to_string()))?,
            Some(other) => return Err(MalformedEvent::InvalidTimestamp(other.to_string())),
        };

        let node_id = object
            .get("nodeId")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_string);
        if event_type.requires_node_id() && node_id.is_none() {
            return Err(MalformedEvent::MissingNodeId(event_type.as_str()));
        }

        Ok(Self {
            event_type,
            execution_id: execution_id.to_string(),
            node_id,
            timestamp,
            payload: object.get("payload").filter(|p| !p.is_null()).cloned(),
        })
    }
}
