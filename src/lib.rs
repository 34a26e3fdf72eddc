/// flowrunner: distributed workflow execution worker
///
/// This library provides the queue-driven execution engine for workflow
/// graphs: deterministic DAG scheduling, checkpointed resume across retries,
/// TTL-bounded live state and a broadcast channel of execution events.

// Core configuration and setup
pub mod config;

// Engine error types
pub mod error;

// Workflow definitions, validation and the node type registry
pub mod workflow;

// Live execution state stores
pub mod state;

// Execution events: publishing, subscribing, listener lifecycle
pub mod events;

// Credential resolution
pub mod credentials;

// Durable execution history
pub mod history;

// Job queue with retry and backoff
pub mod queue;

// Runtime execution engine - petgraph DAG execution and node orchestration
pub mod runtime;

// HTTP API layer - monitoring and job submission
pub mod api;

// Server setup and initialization
pub mod server;

// Re-export commonly used types for external consumers
pub use error::{EngineError, EngineResult, StateStoreError};
pub use runtime::{ExecutionEngine, ExecutionWorker, NodeExecutor};
pub use server::start_server;
pub use workflow::{ExecutionJob, WorkflowConnection, WorkflowNode};
