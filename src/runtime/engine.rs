/// Queue-driven DAG execution engine
///
/// Processes one delivery of an `ExecutionJob`:
/// - Creates or reloads live state and marks the execution running
/// - Plans a deterministic topological order (petgraph, see `graph`)
/// - Skips everything up to the resume checkpoint
/// - Runs each remaining node through the `NodeExecutor` under a timeout,
///   recording output and checkpoint after every success
/// - Checks for cancellation or pause between node steps
///
/// A failing attempt is reported to the caller. Only the final attempt marks
/// the execution failed; earlier attempts leave it running so the next
/// delivery resumes from the checkpoint.

use crate::credentials::{resolve_credentials, CredentialLookup};
use crate::error::{EngineError, EngineResult, StateStoreError};
use crate::events::ExecutionEventPublisher;
use crate::history::{ExecutionHistory, ExecutionRecord};
use crate::runtime::executor::{NodeExecutionOutcome, NodeExecutionRequest, NodeExecutor};
use crate::runtime::graph::plan_execution;
use crate::runtime::inputs::{active_connections, build_inputs, dependencies_ready};
use crate::state::{ExecutionErrorInfo, ExecutionStateStore, ExecutionStatus, QueueExecutionContext};
use crate::workflow::registry::NodeTypeRegistry;
use crate::workflow::types::{ExecutionJob, WorkflowNode};
use crate::workflow::validation::ValidatedWorkflow;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default per-node budget (5 minutes)
pub const DEFAULT_NODE_TIMEOUT: Duration = Duration::from_secs(300);

/// Attempt numbering handed over by the queue, 1-based
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobAttempt {
    pub attempt: u32,
    pub max_attempts: u32,
}

impl JobAttempt {
    pub fn new(attempt: u32, max_attempts: u32) -> Self {
        Self {
            attempt: attempt.max(1),
            max_attempts: max_attempts.max(1),
        }
    }

    /// A single attempt with no retries left
    pub fn only() -> Self {
        Self::new(1, 1)
    }

    pub fn is_final(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// How an attempt ended when it did not fail
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Completed {
        executed_nodes: Vec<String>,
        duration_ms: u64,
    },
    Cancelled {
        stopped_before: Option<String>,
    },
    Paused {
        stopped_before: Option<String>,
    },
    /// The execution was already terminal; nothing ran
    AlreadyFinished(ExecutionStatus),
}

/// Collaborators shared by every engine instance of a worker
#[derive(Clone)]
pub struct EngineServices {
    pub state: Arc<dyn ExecutionStateStore>,
    pub publisher: ExecutionEventPublisher,
    pub node_types: Arc<NodeTypeRegistry>,
    pub credentials: Arc<dyn CredentialLookup>,
    /// Durable history; `None` disables persistence regardless of job options
    pub history: Option<Arc<dyn ExecutionHistory>>,
    pub node_timeout: Duration,
}

/// DAG execution engine driven by queue deliveries
pub struct ExecutionEngine {
    services: EngineServices,
    /// Node executor for handling individual node execution
    executor: Arc<dyn NodeExecutor>,
}

impl ExecutionEngine {
    pub fn new(services: EngineServices, executor: Arc<dyn NodeExecutor>) -> Self {
        Self { services, executor }
    }

    pub fn services(&self) -> &EngineServices {
        &self.services
    }

    /// Process one delivery of a job
    ///
    /// Returns the error that failed the attempt after applying failure
    /// handling, so the queue can decide whether to retry.
    pub async fn process_job(&self, job: &ExecutionJob, attempt: JobAttempt) -> EngineResult<ExecutionOutcome> {
        tracing::info!(
            "🚀 Processing execution {} (workflow {}, attempt {}/{})",
            job.execution_id,
            job.workflow_id,
            attempt.attempt,
            attempt.max_attempts
        );

        let mut order = Vec::new();
        match self.run(job, &mut order).await {
            Ok(outcome) => Ok(outcome),
            Err(error) => {
                self.handle_failure(job, &error, attempt, &order).await;
                Err(error)
            }
        }
    }

    async fn run(&self, job: &ExecutionJob, order: &mut Vec<String>) -> EngineResult<ExecutionOutcome> {
        let started = Instant::now();
        let execution_id = job.execution_id.as_str();
        let state = &self.services.state;

        let checkpoint = match state.get_state(execution_id).await? {
            Some(existing) if existing.status.is_terminal() => {
                tracing::info!(
                    "⏭️ Execution {} already {}, skipping delivery",
                    execution_id,
                    existing.status
                );
                // Cancelled while no attempt was running
                if existing.status == ExecutionStatus::Cancelled && !existing.finalized {
                    self.services.finalize_cancelled(execution_id, None, &[]).await?;
                }
                return Ok(ExecutionOutcome::AlreadyFinished(existing.status));
            }
            Some(existing) if existing.status == ExecutionStatus::Paused => {
                tracing::info!("⏸️ Execution {} is paused, releasing delivery", execution_id);
                return Ok(ExecutionOutcome::Paused { stopped_before: None });
            }
            Some(existing) => job
                .last_completed_node_id
                .clone()
                .or(existing.last_completed_node_id),
            None => {
                state
                    .create_state(execution_id, QueueExecutionContext::from_job(job))
                    .await?;
                job.last_completed_node_id.clone()
            }
        };

        if !state.update_status(execution_id, ExecutionStatus::Running).await? {
            if let Some(outcome) = self.check_interrupted(job, None, order).await? {
                return Ok(outcome);
            }
            return Err(StateStoreError::Corrupt(format!(
                "execution {} could not be marked running",
                execution_id
            ))
            .into());
        }

        self.services
            .publisher
            .execution_started(execution_id, &job.workflow_id, checkpoint.as_deref())
            .await;

        // Build and plan the DAG
        let workflow = ValidatedWorkflow::from_job(job)?;
        let plan = plan_execution(&workflow, &job.trigger_node_id, job.options.single_node_mode)?;
        tracing::debug!("📋 Execution order: {:?}", plan);
        order.clone_from(&plan);

        let start_index = match checkpoint.as_deref() {
            Some(checkpoint) => match plan.iter().position(|id| id == checkpoint) {
                Some(position) => position + 1,
                None => {
                    tracing::warn!(
                        "⚠️ Checkpoint '{}' is not part of the plan, starting from the beginning",
                        checkpoint
                    );
                    0
                }
            },
            None => 0,
        };
        if start_index > 0 {
            tracing::info!(
                "🔁 Resuming execution {} after '{}' ({}/{} nodes done)",
                execution_id,
                plan[start_index - 1],
                start_index,
                plan.len()
            );
            self.services
                .publisher
                .execution_progress(execution_id, start_index, plan.len())
                .await;
        }

        let mut node_outputs = state.get_all_node_outputs(execution_id).await?;
        let mut executed_nodes = Vec::new();

        for (offset, node_id) in plan[start_index..].iter().enumerate() {
            if let Some(outcome) = self.check_interrupted(job, Some(node_id), &plan).await? {
                return Ok(outcome);
            }

            let Some(node) = workflow.node(node_id) else {
                continue;
            };

            if node.disabled {
                tracing::debug!("⏭️ Skipping disabled node '{}'", node_id);
                self.services
                    .publisher
                    .node_status_update(execution_id, node_id, "disabled")
                    .await;
                continue;
            }

            if self.services.node_types.is_service_node(&node.node_type) {
                tracing::debug!("🧩 Skipping service node '{}', invoked by its consumer", node_id);
                continue;
            }

            if node_outputs.contains_key(node_id) {
                // Output recorded before the checkpoint moved
                tracing::debug!("⏭️ Node '{}' already has output, advancing checkpoint", node_id);
                state.update_last_completed_node(execution_id, node_id).await?;
                continue;
            }

            if !dependencies_ready(&workflow, node_id, &node_outputs, &self.services.node_types) {
                tracing::debug!("⏭️ Skipping node '{}': upstream produced no output", node_id);
                self.services
                    .publisher
                    .node_status_update(execution_id, node_id, "skipped")
                    .await;
                continue;
            }

            self.execute_node(job, &workflow, node, &mut node_outputs).await?;
            executed_nodes.push(node_id.clone());
            self.services
                .publisher
                .execution_progress(execution_id, start_index + offset + 1, plan.len())
                .await;
        }

        if !state.update_status(execution_id, ExecutionStatus::Completed).await? {
            if let Some(outcome) = self.check_interrupted(job, None, &plan).await? {
                return Ok(outcome);
            }
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        if state.claim_finalization(execution_id).await? {
            state.set_completion_ttl(execution_id).await?;
            self.services
                .publisher
                .execution_completed(execution_id, duration_ms, executed_nodes.len())
                .await;
            self.services.save_history(execution_id, &plan).await;
        }

        tracing::info!(
            "🎉 Execution {} completed: {} node(s) in {}ms",
            execution_id,
            executed_nodes.len(),
            duration_ms
        );

        Ok(ExecutionOutcome::Completed {
            executed_nodes,
            duration_ms,
        })
    }

    /// Run one node and record its output and the checkpoint
    async fn execute_node(
        &self,
        job: &ExecutionJob,
        workflow: &ValidatedWorkflow,
        node: &WorkflowNode,
        node_outputs: &mut HashMap<String, Value>,
    ) -> EngineResult<()> {
        let execution_id = job.execution_id.as_str();
        let services = &self.services;

        let description = services.node_types.get(&node.node_type);
        let credentials = resolve_credentials(
            services.credentials.as_ref(),
            node,
            description.as_deref(),
            &job.user_id,
        )
        .await?;
        let input_data = build_inputs(workflow, &node.id, node_outputs, job.trigger_data.as_ref());

        services.state.update_current_node(execution_id, &node.id).await?;
        services
            .publisher
            .node_started(execution_id, &node.id, &node.node_type)
            .await;
        tracing::info!(
            "📍 Executing node '{}' (type: {})",
            node.display_name(),
            node.node_type
        );

        let request = NodeExecutionRequest {
            node_id: node.id.clone(),
            node_type: node.node_type.clone(),
            parameters: node.parameters.clone(),
            input_data,
            credentials,
            execution_id: execution_id.to_string(),
            user_id: job.user_id.clone(),
            workflow_id: job.workflow_id.clone(),
            timeout_ms: services.node_timeout.as_millis() as u64,
            node_settings: node.settings.clone(),
            node_outputs: node_outputs.clone(),
            node_id_to_name: job.node_id_to_name(),
        };

        let node_start = Instant::now();
        let outcome = match tokio::time::timeout(services.node_timeout, self.executor.execute(request)).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => NodeExecutionOutcome::failure(e.to_string()),
            Err(_) => {
                let error = EngineError::NodeTimeout {
                    node_id: node.id.clone(),
                    timeout: services.node_timeout,
                };
                tracing::error!("❌ {}", error);
                services
                    .publisher
                    .node_failed(execution_id, &node.id, &error.to_string())
                    .await;
                return Err(error);
            }
        };

        if !outcome.success {
            let message = outcome
                .error
                .unwrap_or_else(|| "Node execution failed".to_string());
            tracing::error!("❌ Node '{}' failed: {}", node.id, message);
            services
                .publisher
                .node_failed(execution_id, &node.id, &message)
                .await;
            return Err(EngineError::NodeExecution {
                node_id: node.id.clone(),
                message,
            });
        }

        let output = outcome.data.unwrap_or_else(|| json!([]));
        if !services
            .state
            .set_node_output(execution_id, &node.id, &output)
            .await?
        {
            tracing::warn!(
                "⚠️ Output for node '{}' was already recorded, keeping the first one",
                node.id
            );
        }
        services
            .state
            .update_last_completed_node(execution_id, &node.id)
            .await?;

        let duration_ms = node_start.elapsed().as_millis() as u64;
        let active = active_connections(workflow, &node.id, &output);
        services
            .publisher
            .node_completed(execution_id, &node.id, &output, active, duration_ms)
            .await;
        tracing::info!("✅ Node '{}' completed in {}ms", node.id, duration_ms);

        node_outputs.insert(node.id.clone(), output);
        Ok(())
    }

    /// Stop cleanly if the execution was cancelled or paused from outside
    async fn check_interrupted(
        &self,
        job: &ExecutionJob,
        next_node: Option<&str>,
        order: &[String],
    ) -> EngineResult<Option<ExecutionOutcome>> {
        let execution_id = job.execution_id.as_str();
        let Some(current) = self.services.state.get_state(execution_id).await? else {
            return Err(StateStoreError::NotFound(execution_id.to_string()).into());
        };

        match current.status {
            ExecutionStatus::Cancelled => {
                tracing::info!(
                    "🛑 Execution {} cancelled before {}",
                    execution_id,
                    next_node.unwrap_or("completion")
                );
                self.services
                    .finalize_cancelled(execution_id, next_node, order)
                    .await?;
                Ok(Some(ExecutionOutcome::Cancelled {
                    stopped_before: next_node.map(str::to_string),
                }))
            }
            ExecutionStatus::Paused => {
                tracing::info!(
                    "⏸️ Execution {} paused before {}",
                    execution_id,
                    next_node.unwrap_or("completion")
                );
                Ok(Some(ExecutionOutcome::Paused {
                    stopped_before: next_node.map(str::to_string),
                }))
            }
            _ => Ok(None),
        }
    }

    /// Apply failure handling for an attempt that returned an error
    ///
    /// Store errors here are logged only; the original error is what the
    /// queue sees.
    async fn handle_failure(&self, job: &ExecutionJob, error: &EngineError, attempt: JobAttempt, order: &[String]) {
        let execution_id = job.execution_id.as_str();
        let state = &self.services.state;

        if !attempt.is_final() {
            tracing::warn!(
                "⚠️ Execution {} attempt {}/{} failed, will retry: {}",
                execution_id,
                attempt.attempt,
                attempt.max_attempts,
                error
            );
            return;
        }

        tracing::error!(
            "❌ Execution {} failed after {} attempt(s): {}",
            execution_id,
            attempt.attempt,
            error
        );

        match state.update_status(execution_id, ExecutionStatus::Failed).await {
            Ok(true) => {}
            Ok(false) => {
                self.finish_rejected_failure(execution_id, error, order).await;
                return;
            }
            Err(e) => tracing::warn!("⚠️ Could not mark {} failed: {}", execution_id, e),
        }
        match state.claim_finalization(execution_id).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!("⏭️ Execution {} already finalized", execution_id);
                return;
            }
            Err(e) => tracing::warn!("⚠️ Could not claim finalization of {}: {}", execution_id, e),
        }

        let info = ExecutionErrorInfo {
            message: error.to_string(),
            code: error.code().to_string(),
            node_id: error.node_id().map(str::to_string),
        };
        if let Err(e) = state.set_error(execution_id, &info).await {
            tracing::warn!("⚠️ Could not record error for {}: {}", execution_id, e);
        }
        if let Err(e) = state.set_completion_ttl(execution_id).await {
            tracing::warn!("⚠️ Could not shorten retention for {}: {}", execution_id, e);
        }

        self.services
            .publisher
            .execution_failed(execution_id, &info.message, info.node_id.as_deref())
            .await;
        self.services.save_history(execution_id, order).await;
    }

    /// The final attempt failed but the status could not move to `failed`
    ///
    /// A cancellation that landed while the last node ran wins: the execution
    /// is finalized as cancelled and no `failed` event is published.
    async fn finish_rejected_failure(&self, execution_id: &str, error: &EngineError, order: &[String]) {
        match self.services.state.get_state(execution_id).await {
            Ok(Some(current)) if current.status == ExecutionStatus::Cancelled => {
                tracing::info!(
                    "🛑 Execution {} was cancelled while its final attempt failed",
                    execution_id
                );
                if let Err(e) = self
                    .services
                    .finalize_cancelled(execution_id, error.node_id(), order)
                    .await
                {
                    tracing::warn!("⚠️ Could not finalize cancellation of {}: {}", execution_id, e);
                }
            }
            Ok(Some(current)) => {
                tracing::warn!("⚠️ Execution {} was already {}", execution_id, current.status)
            }
            Ok(None) => tracing::warn!("⚠️ No live state left for {}", execution_id),
            Err(e) => tracing::warn!("⚠️ Could not read state of {}: {}", execution_id, e),
        }
    }
}

impl EngineServices {
    /// Finalize a cancelled execution exactly once
    ///
    /// The first caller to claim finalization (the engine between nodes, a
    /// failing final attempt, an external cancel) shortens retention,
    /// publishes `cancelled` and writes history. Returns whether this call
    /// did so.
    pub async fn finalize_cancelled(
        &self,
        execution_id: &str,
        stopped_before: Option<&str>,
        order: &[String],
    ) -> EngineResult<bool> {
        if !self.state.claim_finalization(execution_id).await? {
            tracing::debug!("⏭️ Cancellation of {} already finalized", execution_id);
            return Ok(false);
        }

        self.state.set_completion_ttl(execution_id).await?;
        self.publisher
            .execution_cancelled(execution_id, stopped_before)
            .await;
        self.save_history(execution_id, order).await;
        Ok(true)
    }

    /// Hand a terminal execution to durable history when the job asked for it
    async fn save_history(&self, execution_id: &str, order: &[String]) {
        let Some(history) = &self.history else {
            return;
        };

        let snapshot = match self.state.get_state(execution_id).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                tracing::warn!("⚠️ No live state left to persist for {}", execution_id);
                return;
            }
            Err(e) => {
                tracing::warn!("⚠️ Could not read state of {} for history: {}", execution_id, e);
                return;
            }
        };
        if !snapshot.save_to_database {
            tracing::debug!("💾 Execution {} opted out of history", execution_id);
            return;
        }

        let record = ExecutionRecord::from_state(execution_id, &snapshot, order);
        if let Err(e) = history.save_execution(&record).await {
            tracing::warn!("⚠️ Failed to persist history for {}: {}", execution_id, e);
        }
    }
}
