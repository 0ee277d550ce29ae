//! Event system for agent state notifications
//!
//! This module provides an event bus for broadcasting stream and channel
//! events to the status reporter and other subscribers.

pub mod types;

pub use types::AgentEvent;

use tokio::sync::broadcast;

/// Event channel capacity (ring buffer size)
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Event bus for broadcasting agent events
///
/// Uses tokio's broadcast channel; events are delivered to all active
/// subscribers.
///
/// # Example
///
/// ```no_run
/// use kvs_agent::events::{AgentEvent, EventBus};
/// use kvs_agent::stream::StreamingState;
///
/// let bus = EventBus::new();
/// let mut rx = bus.subscribe();
///
/// bus.publish(AgentEvent::StreamStateChanged {
///     state: StreamingState::Running,
///     generation: 1,
///     error: None,
/// });
/// ```
pub struct EventBus {
    tx: broadcast::Sender<AgentEvent>,
}

impl EventBus {
    /// Create a new event bus
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event to all subscribers
    ///
    /// If there are no active subscribers, the event is dropped.
    pub fn publish(&self, event: AgentEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to events
    ///
    /// A subscriber that falls too far behind receives a `Lagged` error
    /// and misses some events.
    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
