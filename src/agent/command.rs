//! Control commands and topic routing

use serde::Deserialize;
use std::collections::HashMap;

use crate::config::AgentConfig;
use crate::error::Result;

/// Remote control command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Start => "start",
            Command::Stop => "stop",
        }
    }
}

/// Optional JSON body of a control message
///
/// An empty payload is accepted; unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CommandPayload {
    /// Echoed in logs to correlate requests
    pub request_id: Option<String>,
}

/// Parse a control message body
pub fn parse_payload(payload: &[u8]) -> Result<CommandPayload> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Ok(CommandPayload::default());
    }
    Ok(serde_json::from_slice(payload)?)
}

/// Topic to command mapping, fixed after startup
#[derive(Debug, Clone)]
pub struct CommandTable {
    routes: HashMap<String, Command>,
}

impl CommandTable {
    pub fn from_config(config: &AgentConfig) -> Self {
        let mut routes = HashMap::new();
        routes.insert(config.start_topic(), Command::Start);
        routes.insert(config.stop_topic(), Command::Stop);
        Self { routes }
    }

    pub fn route(&self, topic: &str) -> Option<Command> {
        self.routes.get(topic).copied()
    }

    /// Subscribed topics, start first
    pub fn topics(&self) -> Vec<(&str, Command)> {
        let mut topics: Vec<_> = self
            .routes
            .iter()
            .map(|(topic, command)| (topic.as_str(), *command))
            .collect();
        topics.sort_by_key(|(_, command)| *command == Command::Stop);
        topics
    }
}
