/// Execution Event Layer
///
/// Decouples event production inside worker processes from event consumption
/// (gateways, dashboards) through one shared broadcast channel:
/// - Message types and inbound validation
/// - Broadcast transports (in-process, Redis pub/sub)
/// - Publisher, validating subscriber and late-subscriber backlog
/// - Per-execution listener lifecycle management

// Event message shape and validation
pub mod types;

// Broadcast transports
pub mod bus;

// Worker-side publishing
pub mod publisher;

// Consumer-side validation and fan-out
pub mod subscriber;

// Short backlog for late subscribers
pub mod buffer;

// Per-execution listener batches with sweep
pub mod listeners;

pub use buffer::RecentEventBuffer;
pub use bus::{EventBus, EventBusError, EventReceiver, NativeEventBus};
#[cfg(feature = "redis")]
pub use bus::RedisEventBus;
pub use listeners::{ExecutionListenerLifecycleManager, ListenerHandle, SweeperHandle};
pub use publisher::ExecutionEventPublisher;
pub use subscriber::{ExecutionEventHandler, ExecutionEventSubscriber, HandlerId, SubscriptionHandle};
pub use types::{ExecutionEventMessage, ExecutionEventType, MalformedEvent};
