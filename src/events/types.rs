//! Agent event types
//!
//! Defines all event types that can be broadcast through the event bus.

use serde::Serialize;

use crate::channel::ConnectionState;
use crate::stream::StreamingState;

/// Agent event (broadcast through the event bus)
///
/// Serialized with an `event` tag and a `data` payload:
///
/// ```json
/// {"event": "stream.state_changed", "data": {"state": "running", "generation": 3, "error": null}}
/// ```
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum AgentEvent {
    /// Streaming state transition
    #[serde(rename = "stream.state_changed")]
    StreamStateChanged {
        state: StreamingState,
        /// Pipeline generation the transition belongs to
        generation: u64,
        /// Failure reason when the new state is `faulted`
        error: Option<String>,
    },

    /// Command channel connection state changed
    #[serde(rename = "channel.state_changed")]
    ChannelStateChanged { state: ConnectionState },

    /// A control command was received
    #[serde(rename = "channel.command")]
    CommandReceived {
        /// "start" or "stop"
        command: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
}

impl AgentEvent {
    /// Event name as used in the serialized `event` field
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::StreamStateChanged { .. } => "stream.state_changed",
            Self::ChannelStateChanged { .. } => "channel.state_changed",
            Self::CommandReceived { .. } => "channel.command",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_name() {
        let event = AgentEvent::StreamStateChanged {
            state: StreamingState::Running,
            generation: 1,
            error: None,
        };
        assert_eq!(event.event_name(), "stream.state_changed");

        let event = AgentEvent::ChannelStateChanged {
            state: ConnectionState::Interrupted,
        };
        assert_eq!(event.event_name(), "channel.state_changed");
    }

    #[test]
    fn test_serialization() {
        let event = AgentEvent::StreamStateChanged {
            state: StreamingState::Faulted,
            generation: 4,
            error: Some("device lost".to_string()),
        };

        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "stream.state_changed");
        assert_eq!(json["data"]["state"], "faulted");
        assert_eq!(json["data"]["generation"], 4);
        assert_eq!(json["data"]["error"], "device lost");

        let event = AgentEvent::CommandReceived {
            command: "start".to_string(),
            request_id: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("request_id"));
    }
}
