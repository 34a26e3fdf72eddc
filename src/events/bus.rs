/// Broadcast channel backends for execution events
///
/// Defines the `EventBus` and `EventReceiver` traits that carry raw JSON
/// messages from publishers to every subscriber. The default `NativeEventBus`
/// uses `tokio::sync::broadcast` inside one process; `RedisEventBus` (feature
/// `redis`) spans processes through Redis pub/sub.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

/// Broadcast channel capacity for the native bus
const NATIVE_CHANNEL_CAPACITY: usize = 4096;

/// Transport errors raised by an event bus
#[derive(Error, Debug)]
pub enum EventBusError {
    #[error("Event bus connection error: {0}")]
    Connection(String),

    #[error("Event publish failed: {0}")]
    Publish(String),

    #[error("Event subscription failed: {0}")]
    Subscription(String),

    #[error("Event channel closed")]
    Closed,
}

/// Pub/sub transport carrying serialized execution events
///
/// Delivery is at-most-once and best effort; nothing is persisted or replayed.
#[async_trait]
pub trait EventBus: Send + Sync + 'static {
    /// Publish a raw message to every current subscriber
    async fn publish(&self, payload: String) -> Result<(), EventBusError>;

    /// Create a receiver for messages published from now on
    fn subscribe(&self) -> Box<dyn EventReceiver>;
}

/// Receiving side of an `EventBus`
#[async_trait]
pub trait EventReceiver: Send {
    /// Wait for the next raw message
    ///
    /// `EventBusError::Closed` means no further message will ever arrive.
    async fn recv(&mut self) -> Result<String, EventBusError>;
}

/// In-process event bus using `tokio::sync::broadcast`
pub struct NativeEventBus {
    tx: broadcast::Sender<String>,
}

impl NativeEventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(NATIVE_CHANNEL_CAPACITY);
        tracing::debug!("📡 Native event bus created with capacity {}", NATIVE_CHANNEL_CAPACITY);
        Self { tx }
    }
}

impl Default for NativeEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for NativeEventBus {
    async fn publish(&self, payload: String) -> Result<(), EventBusError> {
        // No receivers is not an error for a broadcast channel
        match self.tx.send(payload) {
            Ok(count) => tracing::trace!("📤 Event delivered to {} receiver(s)", count),
            Err(_) => tracing::trace!("📤 Event published with no active receivers"),
        }
        Ok(())
    }

    fn subscribe(&self) -> Box<dyn EventReceiver> {
        Box::new(NativeEventReceiver {
            rx: self.tx.subscribe(),
        })
    }
}

struct NativeEventReceiver {
    rx: broadcast::Receiver<String>,
}

#[async_trait]
impl EventReceiver for NativeEventReceiver {
    async fn recv(&mut self) -> Result<String, EventBusError> {
        loop {
            match self.rx.recv().await {
                Ok(message) => return Ok(message),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!("⚠️ Event receiver lagged, {} message(s) dropped", missed);
                }
                Err(broadcast::error::RecvError::Closed) => return Err(EventBusError::Closed),
            }
        }
    }
}

#[cfg(feature = "redis")]
pub use redis_bus::RedisEventBus;

#[cfg(feature = "redis")]
mod redis_bus {
    use super::{EventBus, EventBusError, EventReceiver};
    use async_trait::async_trait;
    use redis::Client;
    use std::time::Duration;

    /// Redis connection timeout for subscribers
    const CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);

    /// Cross-process event bus using one Redis pub/sub channel
    pub struct RedisEventBus {
        client: Client,
        channel: String,
    }

    impl RedisEventBus {
        pub fn new(redis_url: &str, channel: impl Into<String>) -> Result<Self, EventBusError> {
            let client =
                Client::open(redis_url).map_err(|e| EventBusError::Connection(e.to_string()))?;
            let channel = channel.into();
            tracing::info!("📡 Redis event bus created (channel: {})", channel);
            Ok(Self { client, channel })
        }
    }

    #[async_trait]
    impl EventBus for RedisEventBus {
        async fn publish(&self, payload: String) -> Result<(), EventBusError> {
            use redis::AsyncCommands;

            let mut conn = self
                .client
                .get_multiplexed_async_connection()
                .await
                .map_err(|e| EventBusError::Connection(e.to_string()))?;

            conn.publish::<_, _, ()>(&self.channel, payload)
                .await
                .map_err(|e| EventBusError::Publish(e.to_string()))
        }

        fn subscribe(&self) -> Box<dyn EventReceiver> {
            Box::new(RedisEventReceiver {
                client: self.client.clone(),
                channel: self.channel.clone(),
                pubsub: None,
            })
        }
    }

    /// Lazily connects and subscribes on the first `recv`
    struct RedisEventReceiver {
        client: Client,
        channel: String,
        pubsub: Option<redis::aio::PubSub>,
    }

    #[async_trait]
    impl EventReceiver for RedisEventReceiver {
        async fn recv(&mut self) -> Result<String, EventBusError> {
            use futures_util::StreamExt;

            if self.pubsub.is_none() {
                let mut pubsub = tokio::time::timeout(CONNECTION_TIMEOUT, self.client.get_async_pubsub())
                    .await
                    .map_err(|_| EventBusError::Connection("Redis connection timeout".to_string()))?
                    .map_err(|e| EventBusError::Connection(e.to_string()))?;
                pubsub
                    .subscribe(&self.channel)
                    .await
                    .map_err(|e| EventBusError::Subscription(e.to_string()))?;
                tracing::info!("📡 Subscribed to Redis channel '{}'", self.channel);
                self.pubsub = Some(pubsub);
            }

            let Some(pubsub) = self.pubsub.as_mut() else {
                return Err(EventBusError::Closed);
            };
            let next = pubsub.on_message().next().await;
            match next {
                Some(message) => message
                    .get_payload::<String>()
                    .map_err(|e| EventBusError::Subscription(e.to_string())),
                None => {
                    // Stream ended; reconnect on the next call
                    self.pubsub = None;
                    Err(EventBusError::Connection("Redis pub/sub stream ended".to_string()))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_subscriber_receives_each_message() {
        let bus = NativeEventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.publish("hello".to_string()).await.unwrap();

        assert_eq!(first.recv().await.unwrap(), "hello");
        assert_eq!(second.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = NativeEventBus::new();
        assert!(bus.publish("nobody".to_string()).await.is_ok());
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_earlier_messages() {
        let bus = NativeEventBus::new();
        bus.publish("early".to_string()).await.unwrap();

        let mut late = bus.subscribe();
        bus.publish("late".to_string()).await.unwrap();
        assert_eq!(late.recv().await.unwrap(), "late");
    }
}
