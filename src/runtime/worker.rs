/// Execution worker
///
/// Runs a fixed number of concurrent job slots that pull deliveries from a
/// `JobQueue` and hand them to the `ExecutionEngine`. Lifecycle:
/// - `initialize` binds the node executor (required before `start`)
/// - `start` spawns the slots
/// - `stop` lets in-flight jobs finish, then joins every slot
///
/// Deliveries that stop on a paused execution are parked on the queue;
/// `resume` puts them back. `cancel` finalizes an execution even when no
/// attempt is running.

use crate::error::{EngineError, EngineResult, StateStoreError};
use crate::queue::{JobDelivery, JobQueue, RetryDecision};
use crate::runtime::engine::{EngineServices, ExecutionEngine, ExecutionOutcome};
use crate::runtime::executor::NodeExecutor;
use crate::state::ExecutionStatus;
use arc_swap::ArcSwapOption;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

/// Snapshot of worker activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
    pub is_running: bool,
    pub active_jobs: usize,
    /// Deliveries that finished without error
    pub processed_jobs: u64,
    /// Deliveries that returned an error (including retried ones)
    pub failed_jobs: u64,
    pub concurrency: usize,
}

#[derive(Default)]
struct Counters {
    active: AtomicUsize,
    processed: AtomicU64,
    failed: AtomicU64,
    /// Executions with an attempt currently inside the engine
    attempts: parking_lot::Mutex<HashSet<String>>,
}

/// Pool of job slots bound to one queue
pub struct ExecutionWorker {
    services: EngineServices,
    queue: Arc<dyn JobQueue>,
    concurrency: usize,
    engine: ArcSwapOption<ExecutionEngine>,
    running: AtomicBool,
    counters: Arc<Counters>,
    shutdown: watch::Sender<bool>,
    slots: Mutex<Vec<JoinHandle<()>>>,
}

impl ExecutionWorker {
    pub fn new(services: EngineServices, queue: Arc<dyn JobQueue>, concurrency: usize) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            services,
            queue,
            concurrency: concurrency.max(1),
            engine: ArcSwapOption::empty(),
            running: AtomicBool::new(false),
            counters: Arc::new(Counters::default()),
            shutdown,
            slots: Mutex::new(Vec::new()),
        }
    }

    /// Bind the node executor and prepare the state store
    pub async fn initialize(&self, executor: Arc<dyn NodeExecutor>) -> EngineResult<()> {
        self.services.state.initialize().await?;
        self.engine
            .store(Some(Arc::new(ExecutionEngine::new(self.services.clone(), executor))));
        tracing::info!("✅ Execution worker initialized ({} slots)", self.concurrency);
        Ok(())
    }

    /// Spawn the job slots
    ///
    /// Fails with `NotInitialized` when no node executor is bound. Calling it
    /// on a running worker is a no-op.
    pub async fn start(&self) -> EngineResult<()> {
        let engine = self.engine.load_full().ok_or(EngineError::NotInitialized)?;
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::warn!("⚠️ Execution worker already running");
            return Ok(());
        }

        self.shutdown.send_replace(false);
        let mut slots = self.slots.lock().await;
        for slot in 0..self.concurrency {
            slots.push(tokio::spawn(run_slot(
                slot,
                Arc::clone(&engine),
                Arc::clone(&self.queue),
                Arc::clone(&self.counters),
                self.shutdown.subscribe(),
            )));
        }

        tracing::info!("🚀 Execution worker started with {} slot(s)", self.concurrency);
        Ok(())
    }

    /// Stop taking jobs and wait for in-flight ones to finish
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        tracing::info!(
            "🛑 Stopping execution worker ({} job(s) in flight)",
            self.counters.active.load(Ordering::SeqCst)
        );
        self.shutdown.send_replace(true);

        let slots: Vec<JoinHandle<()>> = self.slots.lock().await.drain(..).collect();
        for slot in slots {
            if let Err(e) = slot.await {
                tracing::error!("❌ Worker slot ended abnormally: {}", e);
            }
        }
        tracing::info!("✅ Execution worker stopped");
    }

    pub fn status(&self) -> WorkerStatus {
        WorkerStatus {
            is_running: self.running.load(Ordering::SeqCst),
            active_jobs: self.counters.active.load(Ordering::SeqCst),
            processed_jobs: self.counters.processed.load(Ordering::SeqCst),
            failed_jobs: self.counters.failed.load(Ordering::SeqCst),
            concurrency: self.concurrency,
        }
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    /// Cancel an execution
    ///
    /// A running attempt stops before its next node. When no attempt is
    /// running (queued, in retry backoff, parked) the cancellation is
    /// finalized here. Returns `false` when the execution already finished.
    pub async fn cancel(&self, execution_id: &str) -> EngineResult<bool> {
        if !self
            .services
            .state
            .update_status(execution_id, ExecutionStatus::Cancelled)
            .await?
        {
            return Ok(false);
        }

        tracing::info!("🛑 Cancellation requested for execution {}", execution_id);
        self.queue.discard_parked(execution_id).await;

        // A running attempt finalizes itself before its next node
        if !self.counters.attempts.lock().contains(execution_id) {
            self.services
                .finalize_cancelled(execution_id, None, &[])
                .await?;
        }
        Ok(true)
    }

    /// Pause an execution before its next node
    pub async fn pause(&self, execution_id: &str) -> EngineResult<bool> {
        let paused = self
            .services
            .state
            .update_status(execution_id, ExecutionStatus::Paused)
            .await?;
        if paused {
            tracing::info!("⏸️ Pause requested for execution {}", execution_id);
        }
        Ok(paused)
    }

    /// Resume a paused execution from its checkpoint
    ///
    /// Returns `false` when the execution is not paused.
    pub async fn resume(&self, execution_id: &str) -> EngineResult<bool> {
        let Some(current) = self.services.state.get_state(execution_id).await? else {
            return Err(StateStoreError::NotFound(execution_id.to_string()).into());
        };
        if current.status != ExecutionStatus::Paused
            || !self
                .services
                .state
                .update_status(execution_id, ExecutionStatus::Running)
                .await?
        {
            return Ok(false);
        }

        // An attempt still finishing its node continues on its own
        if self.queue.unpark(execution_id).await {
            tracing::info!("▶️ Resumed execution {}", execution_id);
        }
        Ok(true)
    }
}

async fn run_slot(
    slot: usize,
    engine: Arc<ExecutionEngine>,
    queue: Arc<dyn JobQueue>,
    counters: Arc<Counters>,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::debug!("🧵 Worker slot {} waiting for jobs", slot);

    loop {
        if *shutdown.borrow() {
            break;
        }

        let delivery = tokio::select! {
            _ = shutdown.changed() => break,
            next = queue.next() => match next {
                Some(delivery) => delivery,
                None => break,
            },
        };

        counters.active.fetch_add(1, Ordering::SeqCst);
        counters.attempts.lock().insert(delivery.job.execution_id.clone());
        let result = engine.process_job(&delivery.job, delivery.attempt_info()).await;
        counters.attempts.lock().remove(&delivery.job.execution_id);
        counters.active.fetch_sub(1, Ordering::SeqCst);

        match result {
            Ok(outcome) => {
                counters.processed.fetch_add(1, Ordering::SeqCst);
                if let ExecutionOutcome::Paused { .. } = outcome {
                    park_paused(&engine, queue.as_ref(), delivery).await;
                } else {
                    queue.complete(&delivery).await;
                }
            }
            Err(error) => {
                counters.failed.fetch_add(1, Ordering::SeqCst);
                let execution_id = delivery.job.execution_id.clone();
                if let RetryDecision::Retry { next_attempt, delay } = queue.fail(delivery, &error).await {
                    tracing::debug!(
                        "🔁 Execution {} scheduled for attempt {} in {:?}",
                        execution_id,
                        next_attempt,
                        delay
                    );
                }
            }
        }
    }

    tracing::debug!("🧵 Worker slot {} exited", slot);
}

/// Park a paused delivery, unless the execution was resumed meanwhile
async fn park_paused(engine: &ExecutionEngine, queue: &dyn JobQueue, delivery: JobDelivery) {
    let execution_id = delivery.job.execution_id.clone();
    tracing::info!("⏸️ Execution {} parked while paused", execution_id);
    queue.park(delivery).await;

    match engine.services().state.get_state(&execution_id).await {
        Ok(Some(current)) if current.status == ExecutionStatus::Paused => {}
        Ok(Some(current)) if current.status.is_terminal() => {
            queue.discard_parked(&execution_id).await;
        }
        Ok(_) => {
            queue.unpark(&execution_id).await;
        }
        Err(e) => tracing::warn!("⚠️ Could not re-check paused execution {}: {}", execution_id, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticCredentialLookup;
    use crate::events::{
        EventBus, EventReceiver, ExecutionEventMessage, ExecutionEventPublisher, ExecutionEventType, NativeEventBus,
    };
    use crate::queue::{InMemoryJobQueue, RetryPolicy};
    use crate::runtime::executor::{NodeExecutionOutcome, NodeExecutionRequest};
    use crate::state::{ExecutionStateStore, ExecutionStatus, InMemoryStateStore};
    use crate::workflow::registry::NodeTypeRegistry;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    struct EchoExecutor;

    #[async_trait]
    impl NodeExecutor for EchoExecutor {
        async fn execute(&self, request: NodeExecutionRequest) -> anyhow::Result<NodeExecutionOutcome> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(NodeExecutionOutcome::success(json!([{ "node": request.node_id }])))
        }
    }

    fn services(state: Arc<InMemoryStateStore>) -> EngineServices {
        EngineServices {
            state,
            publisher: ExecutionEventPublisher::new(Arc::new(NativeEventBus::new())),
            node_types: Arc::new(NodeTypeRegistry::new()),
            credentials: Arc::new(StaticCredentialLookup::new()),
            history: None,
            node_timeout: Duration::from_secs(5),
        }
    }

    fn job(execution_id: &str) -> crate::workflow::types::ExecutionJob {
        serde_json::from_value(json!({
            "executionId": execution_id,
            "workflowId": "wf",
            "userId": "u1",
            "nodes": [{"id": "a", "type": "set"}]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_start_requires_initialize() {
        let worker = ExecutionWorker::new(
            services(Arc::new(InMemoryStateStore::default())),
            Arc::new(InMemoryJobQueue::default()),
            2,
        );
        assert!(matches!(worker.start().await, Err(EngineError::NotInitialized)));
        assert!(!worker.status().is_running);
    }

    #[tokio::test]
    async fn test_worker_processes_jobs_and_stops_gracefully() {
        let state = Arc::new(InMemoryStateStore::default());
        let queue = Arc::new(InMemoryJobQueue::new(RetryPolicy::default()));
        let worker = ExecutionWorker::new(services(Arc::clone(&state)), queue.clone(), 2);
        worker.initialize(Arc::new(EchoExecutor)).await.unwrap();
        worker.start().await.unwrap();
        assert!(worker.status().is_running);

        for id in ["e1", "e2", "e3"] {
            queue.enqueue(job(id)).await.unwrap();
        }

        for _ in 0..100 {
            if worker.status().processed_jobs == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        worker.stop().await;
        let status = worker.status();
        assert!(!status.is_running);
        assert_eq!(status.processed_jobs, 3);
        assert_eq!(status.active_jobs, 0);
        for id in ["e1", "e2", "e3"] {
            let live = state.get_state(id).await.unwrap().unwrap();
            assert_eq!(live.status, ExecutionStatus::Completed);
        }
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn paused_execution(state: &InMemoryStateStore, execution_id: &str) {
        let job = job(execution_id);
        state
            .create_state(execution_id, crate::state::QueueExecutionContext::from_job(&job))
            .await
            .unwrap();
        state.update_status(execution_id, ExecutionStatus::Paused).await.unwrap();
    }

    #[tokio::test]
    async fn test_paused_delivery_is_parked_until_resume() {
        let state = Arc::new(InMemoryStateStore::default());
        let queue = Arc::new(InMemoryJobQueue::new(RetryPolicy::default()));
        let worker = ExecutionWorker::new(services(Arc::clone(&state)), queue.clone(), 1);
        worker.initialize(Arc::new(EchoExecutor)).await.unwrap();
        worker.start().await.unwrap();

        paused_execution(&state, "e1").await;
        queue.enqueue(job("e1")).await.unwrap();
        wait_for(|| queue.stats().parked == 1).await;
        assert_eq!(queue.stats().parked, 1);
        assert_eq!(state.get_state("e1").await.unwrap().unwrap().status, ExecutionStatus::Paused);

        assert!(worker.resume("e1").await.unwrap());
        wait_for(|| worker.status().processed_jobs == 2).await;
        worker.stop().await;

        assert_eq!(queue.stats().parked, 0);
        assert_eq!(state.get_state("e1").await.unwrap().unwrap().status, ExecutionStatus::Completed);
        // Only paused executions resume
        assert!(!worker.resume("e1").await.unwrap());
        assert!(matches!(
            worker.resume("missing").await,
            Err(EngineError::StateStore(StateStoreError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_cancel_finalizes_parked_execution() {
        let state = Arc::new(InMemoryStateStore::default());
        let bus = Arc::new(NativeEventBus::new());
        let mut receiver = bus.subscribe();
        let mut services = services(Arc::clone(&state));
        services.publisher = ExecutionEventPublisher::new(bus.clone());
        let queue = Arc::new(InMemoryJobQueue::new(RetryPolicy::default()));
        let worker = ExecutionWorker::new(services, queue.clone(), 1);
        worker.initialize(Arc::new(EchoExecutor)).await.unwrap();
        worker.start().await.unwrap();

        paused_execution(&state, "e1").await;
        queue.enqueue(job("e1")).await.unwrap();
        wait_for(|| queue.stats().parked == 1).await;

        assert!(worker.cancel("e1").await.unwrap());
        // Repeating the request does not publish again
        assert!(worker.cancel("e1").await.unwrap());
        worker.stop().await;

        assert_eq!(queue.stats().parked, 0);
        let live = state.get_state("e1").await.unwrap().unwrap();
        assert_eq!(live.status, ExecutionStatus::Cancelled);
        assert!(live.finalized);

        let raw = receiver.recv().await.unwrap();
        let event = ExecutionEventMessage::parse(&raw).unwrap();
        assert_eq!(event.event_type, ExecutionEventType::Cancelled);
        assert!(tokio::time::timeout(Duration::from_millis(50), receiver.recv()).await.is_err());
    }
}
