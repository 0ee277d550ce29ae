use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::channel::QoS;
use crate::error::{AgentError, Result};

/// Placeholder substituted with `pipeline.stream_name` in the launch description
pub const STREAM_NAME_PLACEHOLDER: &str = "{stream_name}";

/// Main agent configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Device identity
    pub device: DeviceConfig,
    /// MQTT connection settings
    pub mqtt: MqttConfig,
    /// Control topic layout
    pub topics: TopicsConfig,
    /// Media pipeline settings
    pub pipeline: PipelineConfig,
    /// Stream controller tuning
    pub controller: ControllerConfig,
    /// Status reporting
    pub status: StatusConfig,
}

impl AgentConfig {
    /// Check cross-field constraints that serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.device.thing_name.trim().is_empty() {
            return Err(AgentError::Config("device.thing_name is empty".to_string()));
        }
        if self.mqtt.endpoint.trim().is_empty() {
            return Err(AgentError::Config("mqtt.endpoint is empty".to_string()));
        }
        if self.mqtt.cert_path.is_some() != self.mqtt.key_path.is_some() {
            return Err(AgentError::Config(
                "mqtt.cert_path and mqtt.key_path must be set together".to_string(),
            ));
        }
        if self.mqtt.proxy().is_some() && self.mqtt.proxy_port == 0 {
            return Err(AgentError::Config(
                "mqtt.proxy_port must be set when mqtt.proxy_host is".to_string(),
            ));
        }
        if !(1..=65535).contains(&self.mqtt.keep_alive_secs) {
            return Err(AgentError::Config(format!(
                "mqtt.keep_alive_secs out of range: {}",
                self.mqtt.keep_alive_secs
            )));
        }
        self.mqtt.qos()?;

        let start = self.start_topic();
        let stop = self.stop_topic();
        if start == stop {
            return Err(AgentError::Config(format!(
                "start and stop topics must differ (both are {})",
                start
            )));
        }

        if self.pipeline.launcher.trim().is_empty() {
            return Err(AgentError::Config("pipeline.launcher is empty".to_string()));
        }
        if self.pipeline.description.trim().is_empty() {
            return Err(AgentError::Config("pipeline.description is empty".to_string()));
        }
        Ok(())
    }

    /// Effective MQTT client id (configured, or derived from the thing name)
    pub fn client_id(&self) -> String {
        match self.mqtt.client_id {
            Some(ref id) if !id.is_empty() => id.clone(),
            _ => {
                let suffix = uuid::Uuid::new_v4().simple().to_string();
                format!("{}-{}", self.device.thing_name, &suffix[..8])
            }
        }
    }

    pub fn start_topic(&self) -> String {
        self.topics.resolve(&self.device.thing_name, &self.topics.start)
    }

    pub fn stop_topic(&self) -> String {
        self.topics.resolve(&self.device.thing_name, &self.topics.stop)
    }

    /// Status topic, if status reporting is enabled
    pub fn status_topic(&self) -> Option<String> {
        if self.status.enabled {
            Some(self.topics.resolve(&self.device.thing_name, &self.status.topic))
        } else {
            None
        }
    }
}

/// Device identity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// IoT thing name, used as the default topic prefix
    pub thing_name: String,
    /// Start streaming right after the command channel is up
    pub autostart: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            thing_name: "thingname".to_string(),
            autostart: false,
        }
    }
}

/// MQTT connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Broker host name
    pub endpoint: String,
    /// Broker port
    pub port: u16,
    /// Client id (None = `<thing_name>-<random>`)
    pub client_id: Option<String>,
    /// Start with a clean session
    pub clean_session: bool,
    /// Keep-alive interval in seconds
    pub keep_alive_secs: u64,
    /// Client certificate (PEM)
    pub cert_path: Option<PathBuf>,
    /// Client private key (PEM)
    pub key_path: Option<PathBuf>,
    /// Certificate authority (PEM); the system trust store when unset
    pub ca_path: Option<PathBuf>,
    /// HTTP proxy host
    pub proxy_host: Option<String>,
    pub proxy_port: u16,
    /// Give up on the initial connection after this many seconds
    pub connect_timeout_secs: u64,
    /// Delay between reconnection attempts
    pub reconnect_delay_ms: u64,
    /// QoS for control subscriptions (0, 1 or 2)
    pub qos: u8,
}

impl MqttConfig {
    pub fn qos(&self) -> Result<QoS> {
        QoS::from_level(self.qos)
            .ok_or_else(|| AgentError::Config(format!("mqtt.qos must be 0, 1 or 2, got {}", self.qos)))
    }

    /// TLS is used whenever a CA or a client certificate is configured
    pub fn uses_tls(&self) -> bool {
        self.ca_path.is_some() || self.cert_path.is_some()
    }

    /// Configured HTTP proxy host, if any
    pub fn proxy(&self) -> Option<&str> {
        self.proxy_host.as_deref().filter(|host| !host.trim().is_empty())
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            endpoint: "localhost".to_string(),
            port: 8883,
            client_id: None,
            clean_session: true,
            keep_alive_secs: 30,
            cert_path: None,
            key_path: None,
            ca_path: None,
            proxy_host: None,
            proxy_port: 8080,
            connect_timeout_secs: 10,
            reconnect_delay_ms: 1000,
            qos: 1,
        }
    }
}

/// Control topic layout
///
/// Topics are `<prefix>/<suffix>`; the prefix defaults to the thing name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicsConfig {
    pub prefix: Option<String>,
    pub start: String,
    pub stop: String,
}

impl TopicsConfig {
    fn resolve(&self, thing_name: &str, suffix: &str) -> String {
        let prefix = self
            .prefix
            .as_deref()
            .filter(|p| !p.is_empty())
            .unwrap_or(thing_name);
        format!(
            "{}/{}",
            prefix.trim_end_matches('/'),
            suffix.trim_start_matches('/')
        )
    }
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            prefix: None,
            start: "kvs/start".to_string(),
            stop: "kvs/stop".to_string(),
        }
    }
}

/// Media pipeline configuration
///
/// The description is handed to the launcher verbatim (after placeholder
/// substitution); its element graph is not interpreted by the agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Launcher binary
    pub launcher: String,
    /// Arguments placed before the description
    pub args: Vec<String>,
    /// Pipeline description
    pub description: String,
    /// Stream name substituted for `{stream_name}`
    pub stream_name: String,
}

impl PipelineConfig {
    /// Description with placeholders substituted
    pub fn render_description(&self) -> String {
        self.description
            .replace(STREAM_NAME_PLACEHOLDER, &self.stream_name)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            launcher: "gst-launch-1.0".to_string(),
            args: vec!["-e".to_string()],
            description: "v4l2src do-timestamp=TRUE device=/dev/video0 ! videoconvert ! \
                video/x-raw,format=I420,width=640,height=480,framerate=30/1 ! \
                x264enc bframes=0 key-int-max=45 bitrate=512 tune=zerolatency ! \
                video/x-h264,stream-format=avc,alignment=au,profile=baseline ! \
                kvssink stream-name={stream_name} storage-size=128"
                .to_string(),
            stream_name: "device-stream".to_string(),
        }
    }
}

/// Stream controller tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// How long a cooperative stop may take before the pipeline is killed
    pub stop_timeout_ms: u64,
    /// Automatic restart after runtime pipeline errors
    pub restart: RestartPolicy,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            stop_timeout_ms: 10_000,
            restart: RestartPolicy::default(),
        }
    }
}

/// Restart policy applied after the pipeline fails at runtime
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RestartPolicy {
    pub enabled: bool,
    /// Maximum automatic restarts since the last explicit start (0 = unlimited)
    pub max_attempts: u32,
    /// Delay before each attempt
    pub delay_ms: u64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts: 3,
            delay_ms: 2000,
        }
    }
}

/// Stream status reporting over the command channel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    pub enabled: bool,
    /// Topic suffix, resolved like the control topics
    pub topic: String,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            topic: "kvs/status".to_string(),
        }
    }
}
