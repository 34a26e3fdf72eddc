/// Execution event subscriber
///
/// Consumes raw messages from an `EventBus`, validates them and fans every
/// valid event out to the registered handlers. Malformed messages are logged
/// and dropped. A failing or panicking handler never stops delivery to the
/// others, and never ends the receive loop.

use crate::events::bus::{EventBus, EventBusError};
use crate::events::types::ExecutionEventMessage;
use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Pause before polling the same receiver again after a transport error
const RECEIVE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Something that reacts to execution events
///
/// Handlers run on the receive loop and must not block.
pub trait ExecutionEventHandler: Send + Sync {
    fn handle(&self, event: &ExecutionEventMessage) -> anyhow::Result<()>;
}

impl<F> ExecutionEventHandler for F
where
    F: Fn(&ExecutionEventMessage) -> anyhow::Result<()> + Send + Sync,
{
    fn handle(&self, event: &ExecutionEventMessage) -> anyhow::Result<()> {
        self(event)
    }
}

/// Invoke a handler, containing both errors and panics
///
/// Returns whether the handler succeeded.
pub(crate) fn invoke_handler(handler: &dyn ExecutionEventHandler, event: &ExecutionEventMessage) -> bool {
    match catch_unwind(AssertUnwindSafe(|| handler.handle(event))) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::warn!(
                "⚠️ Event handler failed for {} on execution {}: {}",
                event.event_type.as_str(),
                event.execution_id,
                e
            );
            false
        }
        Err(_) => {
            tracing::error!(
                "❌ Event handler panicked for {} on execution {}",
                event.event_type.as_str(),
                event.execution_id
            );
            false
        }
    }
}

/// Identifier returned when a handler is registered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Counters describing what the subscriber has seen
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriberStats {
    pub received: u64,
    pub dropped: u64,
}

/// Validating fan-out subscriber
#[derive(Default)]
pub struct ExecutionEventSubscriber {
    handlers: RwLock<Vec<(HandlerId, Arc<dyn ExecutionEventHandler>)>>,
    next_handler_id: AtomicU64,
    received: AtomicU64,
    dropped: AtomicU64,
}

impl ExecutionEventSubscriber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for every valid event
    pub fn add_handler(&self, handler: Arc<dyn ExecutionEventHandler>) -> HandlerId {
        let id = HandlerId(self.next_handler_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().push((id, handler));
        id
    }

    /// Remove a handler, returning whether it was registered
    pub fn remove_handler(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        handlers.len() != before
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn stats(&self) -> SubscriberStats {
        SubscriberStats {
            received: self.received.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Validate one raw message and dispatch it
    ///
    /// Returns the number of handlers that accepted the event; malformed
    /// messages reach no handler and return 0.
    pub fn handle_raw(&self, raw: &str) -> usize {
        self.received.fetch_add(1, Ordering::Relaxed);

        match ExecutionEventMessage::parse(raw) {
            Ok(event) => self.dispatch(&event),
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("🗑️ Dropping malformed execution event: {}", e);
                tracing::debug!("🗑️ Malformed payload: {}", raw);
                0
            }
        }
    }

    /// Deliver a validated event to every handler
    pub fn dispatch(&self, event: &ExecutionEventMessage) -> usize {
        // Snapshot so handlers may (un)register without deadlocking
        let handlers: Vec<Arc<dyn ExecutionEventHandler>> = self
            .handlers
            .read()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        handlers
            .iter()
            .filter(|handler| invoke_handler(handler.as_ref(), event))
            .count()
    }

    /// Start the receive loop on `bus`
    pub fn spawn(self: Arc<Self>, bus: Arc<dyn EventBus>) -> SubscriptionHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let mut receiver = bus.subscribe();

        let handle = tokio::spawn(async move {
            tracing::info!("👂 Execution event subscriber started");

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    next = receiver.recv() => match next {
                        Ok(raw) => {
                            self.handle_raw(&raw);
                        }
                        Err(EventBusError::Closed) => {
                            tracing::info!("📪 Event channel closed, subscriber exiting");
                            break;
                        }
                        Err(e) => {
                            tracing::warn!("⚠️ Event receive failed, retrying in {:?}: {}", RECEIVE_RETRY_DELAY, e);
                            tokio::time::sleep(RECEIVE_RETRY_DELAY).await;
                        }
                    },
                }
            }

            tracing::info!("🛑 Execution event subscriber stopped");
        });

        SubscriptionHandle {
            shutdown: Some(shutdown_tx),
            handle,
        }
    }
}

/// Running receive loop
pub struct SubscriptionHandle {
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl SubscriptionHandle {
    /// Stop the loop and wait for it to finish
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = self.handle.await {
            tracing::warn!("⚠️ Subscriber task ended abnormally: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::bus::NativeEventBus;
    use crate::events::types::ExecutionEventType;
    use parking_lot::Mutex;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, Arc<dyn ExecutionEventHandler>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler = move |event: &ExecutionEventMessage| -> anyhow::Result<()> {
            sink.lock().push(format!("{}:{}", event.event_type.as_str(), event.execution_id));
            Ok(())
        };
        let handler: Arc<dyn ExecutionEventHandler> = Arc::new(handler);
        (seen, handler)
    }

    fn raw(event: &ExecutionEventMessage) -> String {
        serde_json::to_string(event).unwrap()
    }

    #[test]
    fn test_malformed_message_twice_reaches_no_handler() {
        let subscriber = ExecutionEventSubscriber::new();
        let (seen, handler) = recorder();
        subscriber.add_handler(handler);

        let malformed = r#"{"type":"node-started","executionId":"e1","timestamp":1}"#;
        assert_eq!(subscriber.handle_raw(malformed), 0);
        assert_eq!(subscriber.handle_raw(malformed), 0);

        assert!(seen.lock().is_empty());
        assert_eq!(subscriber.stats(), SubscriberStats { received: 2, dropped: 2 });
    }

    #[test]
    fn test_failing_handlers_do_not_block_others() {
        let subscriber = ExecutionEventSubscriber::new();
        let failing = |_: &ExecutionEventMessage| -> anyhow::Result<()> { anyhow::bail!("nope") };
        let panicking = |_: &ExecutionEventMessage| -> anyhow::Result<()> { panic!("handler bug") };
        subscriber.add_handler(Arc::new(failing));
        subscriber.add_handler(Arc::new(panicking));
        let (seen, handler) = recorder();
        subscriber.add_handler(handler);

        let event = ExecutionEventMessage::new(ExecutionEventType::Started, "e1");
        assert_eq!(subscriber.handle_raw(&raw(&event)), 1);
        assert_eq!(seen.lock().as_slice(), ["started:e1"]);
    }

    #[test]
    fn test_removed_handler_stops_receiving() {
        let subscriber = ExecutionEventSubscriber::new();
        let (seen, handler) = recorder();
        let id = subscriber.add_handler(handler);

        assert!(subscriber.remove_handler(id));
        assert!(!subscriber.remove_handler(id));
        assert_eq!(subscriber.handler_count(), 0);

        let event = ExecutionEventMessage::new(ExecutionEventType::Completed, "e1");
        subscriber.dispatch(&event);
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_receive_loop_survives_bad_messages() {
        let bus: Arc<dyn EventBus> = Arc::new(NativeEventBus::new());
        let subscriber = Arc::new(ExecutionEventSubscriber::new());
        let (seen, handler) = recorder();
        subscriber.add_handler(handler);

        let running = Arc::clone(&subscriber).spawn(Arc::clone(&bus));

        bus.publish("garbage".to_string()).await.unwrap();
        let event = ExecutionEventMessage::new(ExecutionEventType::Completed, "e9");
        bus.publish(raw(&event)).await.unwrap();

        for _ in 0..50 {
            if !seen.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        running.shutdown().await;

        assert_eq!(seen.lock().as_slice(), ["completed:e9"]);
        assert_eq!(subscriber.stats().dropped, 1);
    }
}
