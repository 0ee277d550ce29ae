//! Agent composition root
//!
//! Binds the command channel's control topics to the stream controller,
//! reports stream status, and owns the shutdown sequence:
//! stop streaming first, then disconnect the channel.

pub mod command;

pub use command::{parse_payload, Command, CommandPayload, CommandTable};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channel::{ChannelEvent, CommandChannel, ConnectionState, QoS};
use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::events::{AgentEvent, EventBus};
use crate::stream::{StartOutcome, StopOutcome, StreamController, StreamingState};

/// Retained status message published on the status topic
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub thing_name: String,
    pub state: StreamingState,
    pub generation: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl StatusReport {
    fn new(thing_name: &str, state: StreamingState, generation: u64, error: Option<String>) -> Self {
        Self {
            thing_name: thing_name.to_string(),
            state,
            generation,
            error,
            timestamp: Utc::now(),
        }
    }
}

async fn publish_status(channel: &dyn CommandChannel, topic: &str, qos: QoS, report: &StatusReport) {
    let payload = match serde_json::to_vec(report) {
        Ok(payload) => Bytes::from(payload),
        Err(e) => {
            error!("Failed to serialize status report: {}", e);
            return;
        }
    };
    if let Err(e) = channel.publish(topic, payload, qos, true).await {
        warn!("Failed to publish stream status: {}", e);
    }
}

/// Remote-controlled streaming agent
pub struct Agent {
    channel: Arc<dyn CommandChannel>,
    controller: Arc<StreamController>,
    commands: CommandTable,
    qos: QoS,
    thing_name: String,
    status_topic: Option<String>,
    events: Arc<EventBus>,
    reporter: Mutex<Option<JoinHandle<()>>>,
}

impl Agent {
    pub fn new(
        config: &AgentConfig,
        channel: Arc<dyn CommandChannel>,
        controller: Arc<StreamController>,
        events: Arc<EventBus>,
    ) -> Result<Self> {
        Ok(Self {
            channel,
            controller,
            commands: CommandTable::from_config(config),
            qos: config.mqtt.qos()?,
            thing_name: config.device.thing_name.clone(),
            status_topic: config.status_topic(),
            events,
            reporter: Mutex::new(None),
        })
    }

    pub fn controller(&self) -> &Arc<StreamController> {
        &self.controller
    }

    /// Connect the channel and subscribe to the control topics
    ///
    /// Returns the channel's notification queue for [`run`](Self::run).
    pub async fn connect(&self) -> Result<mpsc::UnboundedReceiver<ChannelEvent>> {
        let events = self
            .channel
            .take_events()
            .ok_or_else(|| AgentError::Internal("command channel events already taken".to_string()))?;

        self.channel.connect().await?;
        for (topic, command) in self.commands.topics() {
            self.channel.subscribe(topic, self.qos).await?;
            info!("Listening for {} commands on {}", command.as_str(), topic);
        }

        if let Some(topic) = self.status_topic.clone() {
            let status = self.controller.status().await;
            let report = StatusReport::new(
                &self.thing_name,
                status.state,
                status.generation,
                status.last_error,
            );
            publish_status(self.channel.as_ref(), &topic, self.qos, &report).await;
            *self.reporter.lock() = Some(self.spawn_status_reporter(topic));
        }
        Ok(events)
    }

    /// Dispatch channel notifications until shutdown or channel closure
    pub async fn run(
        &self,
        mut events: mpsc::UnboundedReceiver<ChannelEvent>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested");
                    break;
                }
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        warn!("Command channel closed");
                        break;
                    }
                }
            }
        }
    }

    pub async fn handle_event(&self, event: ChannelEvent) {
        let state = match event {
            ChannelEvent::Message { topic, payload } => {
                self.dispatch(&topic, &payload).await;
                return;
            }
            ChannelEvent::Connected => {
                info!("Command channel connected");
                ConnectionState::Connected
            }
            ChannelEvent::Interrupted { reason } => {
                warn!(
                    stream = %self.controller.state(),
                    "Command channel interrupted: {}", reason
                );
                ConnectionState::Interrupted
            }
            ChannelEvent::Resumed => {
                info!("Command channel resumed");
                ConnectionState::Connected
            }
            ChannelEvent::Disconnected => {
                info!("Command channel disconnected");
                ConnectionState::Disconnected
            }
        };
        self.events
            .publish(AgentEvent::ChannelStateChanged { state });
    }

    async fn dispatch(&self, topic: &str, payload: &[u8]) {
        let Some(command) = self.commands.route(topic) else {
            warn!("Ignoring message on unexpected topic {}", topic);
            return;
        };
        let request = match parse_payload(payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(
                    "Ignoring malformed {} command on {}: {}",
                    command.as_str(),
                    topic,
                    e
                );
                return;
            }
        };

        let request_id = request.request_id.as_deref().unwrap_or("-");
        info!(request_id, "Received {} command", command.as_str());
        self.events.publish(AgentEvent::CommandReceived {
            command: command.as_str().to_string(),
            request_id: request.request_id.clone(),
        });

        match command {
            Command::Start => match self.controller.request_start().await {
                StartOutcome::Started => info!(request_id, "Stream started"),
                StartOutcome::AlreadyActive => info!(request_id, "Stream already active"),
                StartOutcome::Failed(reason) => {
                    error!(request_id, "Stream start failed: {}", reason)
                }
            },
            Command::Stop => match self.controller.request_stop().await {
                StopOutcome::Stopped => info!(request_id, "Stream stopped"),
                StopOutcome::NotRunning => info!(request_id, "Stream not running"),
                StopOutcome::Deferred => {
                    info!(request_id, "Stream is starting, stop deferred")
                }
            },
        }
    }

    fn spawn_status_reporter(&self, topic: String) -> JoinHandle<()> {
        let mut rx = self.events.subscribe();
        let channel = self.channel.clone();
        let thing_name = self.thing_name.clone();
        let qos = self.qos;

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(AgentEvent::StreamStateChanged {
                        state,
                        generation,
                        error,
                    }) => {
                        let report = StatusReport::new(&thing_name, state, generation, error);
                        publish_status(channel.as_ref(), &topic, qos, &report).await;
                    }
                    Ok(event) => debug!("Status reporter skipping {}", event.event_name()),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Status reporter lagged by {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Stop streaming, publish the final status, then disconnect
    pub async fn shutdown(&self) {
        info!("Shutting down agent");
        self.controller.shutdown().await;

        let reporter = self.reporter.lock().take();
        if let Some(reporter) = reporter {
            reporter.abort();
        }
        if let Some(topic) = self.status_topic.as_deref() {
            let status = self.controller.status().await;
            let report = StatusReport::new(
                &self.thing_name,
                status.state,
                status.generation,
                status.last_error,
            );
            publish_status(self.channel.as_ref(), topic, self.qos, &report).await;
        }

        if let Err(e) = self.channel.disconnect().await {
            warn!("Failed to disconnect command channel: {}", e);
        }
        info!("Agent stopped");
    }
}
