/// Workflow Model Layer
///
/// This module handles the workflow shapes the engine consumes:
/// - Type definitions (WorkflowNode, WorkflowConnection, ExecutionJob)
/// - Load-time graph validation with parsed ports
/// - Lock-free hot-reload node type registry using ArcSwap

// Core workflow type definitions
pub mod types;

// Load-time validation of nodes, connections and ports
pub mod validation;

// Hot-reload node type registry
pub mod registry;

// Re-export commonly used types
pub use registry::{NodeProperty, NodeTypeDescription, NodeTypeRegistry};
pub use types::{CredentialRefs, ExecutionJob, JobOptions, Port, WorkflowConnection, WorkflowNode};
pub use validation::{ResolvedConnection, ValidatedWorkflow};
