//! Command channel boundary
//!
//! The agent only needs a small surface from the publish-subscribe
//! transport: connect, subscribe, publish, disconnect, and an ordered
//! stream of lifecycle notifications and messages.

pub mod mqtt;

pub use mqtt::MqttChannel;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::Result;

/// Delivery guarantee for subscriptions and publishes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl QoS {
    /// Map a numeric MQTT QoS level (0, 1, 2)
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }
}

/// Connection state of the command channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Connection lost; the client keeps reconnecting
    Interrupted,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Interrupted => "interrupted",
        };
        f.write_str(s)
    }
}

/// Notification delivered by a command channel, in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Connected,
    Interrupted { reason: String },
    Resumed,
    Disconnected,
    Message { topic: String, payload: Bytes },
}

/// Publish-subscribe transport used for remote control
#[async_trait]
pub trait CommandChannel: Send + Sync {
    /// Establish the connection; fails if the broker cannot be reached
    async fn connect(&self) -> Result<()>;

    /// Subscribe to a topic; messages arrive as [`ChannelEvent::Message`]
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<()>;

    async fn publish(&self, topic: &str, payload: Bytes, qos: QoS, retain: bool) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    /// Take the notification receiver (only the first call returns it)
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>>;

    fn connection_state(&self) -> ConnectionState;
}
