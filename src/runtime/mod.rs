/// Runtime Execution Engine
///
/// This module provides the queue-driven DAG execution engine for workflows.
/// It handles:
/// - Deterministic topological planning with petgraph
/// - Per-port input assembly and service references
/// - Checkpointed, resumable node-by-node execution
/// - The bounded worker pool that pulls jobs from the queue

// Execution planning over petgraph
pub mod graph;

// Input assembly from upstream outputs
pub mod inputs;

// Node executor contract and HTTP runtime client
pub mod executor;

// Core execution engine
pub mod engine;

// Worker pool bound to a job queue
pub mod worker;

// Re-export main types
pub use engine::{EngineServices, ExecutionEngine, ExecutionOutcome, JobAttempt, DEFAULT_NODE_TIMEOUT};
pub use executor::{HttpNodeExecutor, NodeExecutionOutcome, NodeExecutionRequest, NodeExecutor};
pub use graph::{plan_execution, WorkflowGraph};
pub use inputs::{NodeInputs, PortInput, ServiceReference};
pub use worker::{ExecutionWorker, WorkerStatus};
