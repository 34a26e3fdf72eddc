/// Per-execution listener lifecycle management
///
/// Long-lived observers attach transient listeners for the executions they
/// follow. Each registration is a batch tagged with its execution id, stored
/// in an arena keyed by batch id with a secondary index by execution id:
/// - `register` returns a `ListenerHandle` that removes the batch in O(1)
/// - `remove_execution` drops every batch of one execution
/// - a terminal event (`completed`, `failed`, `cancelled`) releases every
///   batch of its execution once delivered
/// - a background sweep drops batches older than `max_age` for callers that
///   never clean up

use crate::events::subscriber::{invoke_handler, ExecutionEventHandler};
use crate::events::types::ExecutionEventMessage;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

struct ListenerBatch {
    execution_id: String,
    registered_at: Instant,
    listeners: Vec<Arc<dyn ExecutionEventHandler>>,
}

#[derive(Default)]
struct Registry {
    batches: HashMap<u64, ListenerBatch>,
    by_execution: HashMap<String, HashSet<u64>>,
}

impl Registry {
    fn remove_batch(&mut self, batch_id: u64) -> Option<ListenerBatch> {
        let batch = self.batches.remove(&batch_id)?;
        if let Some(ids) = self.by_execution.get_mut(&batch.execution_id) {
            ids.remove(&batch_id);
            if ids.is_empty() {
                self.by_execution.remove(&batch.execution_id);
            }
        }
        Some(batch)
    }
}

struct Inner {
    registry: Mutex<Registry>,
    next_batch_id: AtomicU64,
    max_age: Duration,
}

/// Registry of per-execution listener batches
#[derive(Clone)]
pub struct ExecutionListenerLifecycleManager {
    inner: Arc<Inner>,
}

/// Cleanup handle for one registered batch
///
/// Dropping the handle does not unregister; the periodic sweep covers
/// forgotten handles.
pub struct ListenerHandle {
    batch_id: u64,
    execution_id: String,
    manager: Weak<Inner>,
}

impl ListenerHandle {
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Remove the batch, returning whether it was still registered
    pub fn cleanup(self) -> bool {
        let Some(inner) = self.manager.upgrade() else {
            return false;
        };
        let removed = inner.registry.lock().remove_batch(self.batch_id).is_some();
        if removed {
            tracing::debug!(
                "🧹 Removed listener batch {} for execution {}",
                self.batch_id,
                self.execution_id
            );
        }
        removed
    }
}

impl ExecutionListenerLifecycleManager {
    pub fn new(max_age: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: Mutex::new(Registry::default()),
                next_batch_id: AtomicU64::new(1),
                max_age,
            }),
        }
    }

    /// Register a batch of listeners for one execution
    pub fn register(
        &self,
        execution_id: impl Into<String>,
        listeners: Vec<Arc<dyn ExecutionEventHandler>>,
    ) -> ListenerHandle {
        let execution_id = execution_id.into();
        let batch_id = self.inner.next_batch_id.fetch_add(1, Ordering::Relaxed);

        let mut registry = self.inner.registry.lock();
        registry
            .by_execution
            .entry(execution_id.clone())
            .or_default()
            .insert(batch_id);
        registry.batches.insert(
            batch_id,
            ListenerBatch {
                execution_id: execution_id.clone(),
                registered_at: Instant::now(),
                listeners,
            },
        );

        ListenerHandle {
            batch_id,
            execution_id,
            manager: Arc::downgrade(&self.inner),
        }
    }

    /// Remove every batch registered for an execution
    pub fn remove_execution(&self, execution_id: &str) -> usize {
        let mut registry = self.inner.registry.lock();
        let Some(ids) = registry.by_execution.remove(execution_id) else {
            return 0;
        };
        for id in &ids {
            registry.batches.remove(id);
        }
        ids.len()
    }

    /// Deliver an event to the listeners of its execution
    ///
    /// Returns how many listeners accepted it.
    pub fn dispatch(&self, event: &ExecutionEventMessage) -> usize {
        let listeners: Vec<Arc<dyn ExecutionEventHandler>> = {
            let registry = self.inner.registry.lock();
            match registry.by_execution.get(&event.execution_id) {
                Some(ids) => ids
                    .iter()
                    .filter_map(|id| registry.batches.get(id))
                    .flat_map(|batch| batch.listeners.iter().cloned())
                    .collect(),
                None => return 0,
            }
        };

        listeners
            .iter()
            .filter(|listener| invoke_handler(listener.as_ref(), event))
            .count()
    }

    /// Remove batches older than `max_age`, returning how many were removed
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let max_age = self.inner.max_age;
        let mut registry = self.inner.registry.lock();

        let expired: Vec<u64> = registry
            .batches
            .iter()
            .filter(|(_, batch)| now.duration_since(batch.registered_at) > max_age)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            if let Some(batch) = registry.remove_batch(*id) {
                tracing::warn!(
                    "🧹 Swept stale listener batch {} for execution {} ({} listeners)",
                    id,
                    batch.execution_id,
                    batch.listeners.len()
                );
            }
        }
        expired.len()
    }

    pub fn batch_count(&self) -> usize {
        self.inner.registry.lock().batches.len()
    }

    pub fn listener_count(&self) -> usize {
        self.inner
            .registry
            .lock()
            .batches
            .values()
            .map(|batch| batch.listeners.len())
            .sum()
    }

    /// Start the periodic sweep
    pub fn spawn_sweeper(&self, interval: Duration) -> SweeperHandle {
        let manager = self.clone();
        tracing::debug!("🧹 Listener sweep running every {:?}", interval);

        SweeperHandle::spawn(interval, move || {
            let removed = manager.sweep_expired();
            if removed > 0 {
                tracing::info!("🧹 Listener sweep removed {} stale batch(es)", removed);
            }
            std::future::ready(())
        })
    }
}

impl ExecutionEventHandler for ExecutionListenerLifecycleManager {
    fn handle(&self, event: &ExecutionEventMessage) -> anyhow::Result<()> {
        self.dispatch(event);
        if event.event_type.is_terminal() {
            let removed = self.remove_execution(&event.execution_id);
            if removed > 0 {
                tracing::debug!(
                    "🧹 Released {} listener batch(es) of finished execution {}",
                    removed,
                    event.execution_id
                );
            }
        }
        Ok(())
    }
}

/// Running periodic task
pub struct SweeperHandle {
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl SweeperHandle {
    /// Run `tick` every `interval` until shut down
    pub(crate) fn spawn<F, Fut>(interval: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => tick().await,
                }
            }
        });

        Self {
            shutdown: Some(shutdown_tx),
            handle,
        }
    }

    /// Stop the task and wait for it to finish
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = self.handle.await {
            tracing::warn!("⚠️ Sweep task ended abnormally: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::types::ExecutionEventType;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, Arc<dyn ExecutionEventHandler>) {
        let count = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&count);
        let listener = move |_: &ExecutionEventMessage| -> anyhow::Result<()> {
            sink.fetch_add(1, Ordering::SeqCst);
            Ok(())
        };
        let listener: Arc<dyn ExecutionEventHandler> = Arc::new(listener);
        (count, listener)
    }

    #[tokio::test]
    async fn test_dispatch_reaches_only_matching_execution() {
        let manager = ExecutionListenerLifecycleManager::new(Duration::from_secs(60));
        let (first, listener_a) = counter();
        let (second, listener_b) = counter();
        let _a = manager.register("e1", vec![listener_a]);
        let _b = manager.register("e2", vec![listener_b]);

        let event = ExecutionEventMessage::new(ExecutionEventType::Started, "e1");
        assert_eq!(manager.dispatch(&event), 1);
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cleanup_removes_whole_batch() {
        let manager = ExecutionListenerLifecycleManager::new(Duration::from_secs(60));
        let (count, listener) = counter();
        let (_, other) = counter();
        let handle = manager.register("e1", vec![Arc::clone(&listener), other]);
        let _keep = manager.register("e1", vec![listener]);
        assert_eq!(manager.listener_count(), 3);

        assert_eq!(handle.execution_id(), "e1");
        assert!(handle.cleanup());
        assert_eq!(manager.batch_count(), 1);

        manager.dispatch(&ExecutionEventMessage::new(ExecutionEventType::Completed, "e1"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_remove_execution_drops_all_batches() {
        let manager = ExecutionListenerLifecycleManager::new(Duration::from_secs(60));
        let (_, listener) = counter();
        let first = manager.register("e1", vec![Arc::clone(&listener)]);
        manager.register("e1", vec![Arc::clone(&listener)]);
        manager.register("e2", vec![listener]);

        assert_eq!(manager.remove_execution("e1"), 2);
        assert_eq!(manager.remove_execution("e1"), 0);
        assert_eq!(manager.batch_count(), 1);
        assert!(!first.cleanup());
    }

    #[tokio::test]
    async fn test_terminal_event_releases_execution_batches() {
        let manager = ExecutionListenerLifecycleManager::new(Duration::from_secs(3600));
        let (count, listener) = counter();
        manager.register("e1", vec![Arc::clone(&listener)]);
        manager.register("e2", vec![listener]);

        let progress = ExecutionEventMessage::for_node(ExecutionEventType::NodeCompleted, "e1", "a");
        manager.handle(&progress).unwrap();
        assert_eq!(manager.batch_count(), 2);

        manager
            .handle(&ExecutionEventMessage::new(ExecutionEventType::Completed, "e1"))
            .unwrap();
        // The terminal event itself still reaches the listener
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(manager.batch_count(), 1);

        manager
            .handle(&ExecutionEventMessage::new(ExecutionEventType::Cancelled, "e2"))
            .unwrap();
        assert_eq!(manager.batch_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_only_stale_batches() {
        let manager = ExecutionListenerLifecycleManager::new(Duration::from_secs(30));
        let (_, listener) = counter();
        manager.register("old", vec![Arc::clone(&listener)]);
        tokio::time::advance(Duration::from_secs(20)).await;
        manager.register("new", vec![listener]);
        tokio::time::advance(Duration::from_secs(15)).await;

        assert_eq!(manager.sweep_expired(), 1);
        assert_eq!(manager.batch_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweeper_runs_on_interval() {
        let manager = ExecutionListenerLifecycleManager::new(Duration::from_secs(5));
        let (_, listener) = counter();
        manager.register("forgotten", vec![listener]);

        let sweeper = manager.spawn_sweeper(Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(11)).await;

        assert_eq!(manager.batch_count(), 0);
        sweeper.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_after_panicked_tick_returns() {
        let sweeper = SweeperHandle::spawn(Duration::from_millis(5), || async {
            panic!("tick exploded");
        });
        for _ in 0..100 {
            if sweeper.handle.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(sweeper.handle.is_finished());

        // The join error is logged, not propagated
        sweeper.shutdown().await;
    }
}
