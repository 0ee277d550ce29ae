//! MQTT command channel (rumqttc)
//!
//! The rumqttc event loop runs on its own task and feeds an unbounded queue
//! of [`ChannelEvent`]s. After the first ConnAck, connection errors are
//! reported as `Interrupted` and the loop keeps polling, which makes
//! rumqttc reconnect; the next ConnAck is reported as `Resumed` and the
//! stored subscriptions are renewed if the broker dropped the session.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rumqttc::tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rumqttc::tokio_rustls::rustls::{ClientConfig, RootCertStore};
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, Proxy, ProxyAuth, ProxyType,
    TlsConfiguration, Transport,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{ChannelEvent, CommandChannel, ConnectionState, QoS};
use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::utils::LogThrottler;
use crate::warn_throttled;

/// Capacity of the rumqttc request queue
const REQUEST_CHANNEL_CAPACITY: usize = 32;
/// How long `disconnect` waits for the event loop to wind down
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// ALPN protocol that lets AWS IoT accept MQTT with client certificates on port 443
const AWS_IOT_ALPN: &[u8] = b"x-amzn-mqtt-ca";

impl From<QoS> for rumqttc::QoS {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

/// PEM material for a TLS connection
#[derive(Debug, Clone)]
pub struct TlsMaterial {
    /// CA bundle; the system trust store is used when absent
    pub ca: Option<Vec<u8>>,
    /// Client certificate and private key
    pub client_auth: Option<(Vec<u8>, Vec<u8>)>,
}

impl TlsMaterial {
    /// Read the configured PEM files; `None` when TLS is not configured
    pub async fn load(config: &AgentConfig) -> Result<Option<Self>> {
        let mqtt = &config.mqtt;
        if !mqtt.uses_tls() {
            return Ok(None);
        }

        let ca = match mqtt.ca_path.as_deref() {
            Some(path) => Some(read_pem(path).await?),
            None => None,
        };
        let client_auth = match (mqtt.cert_path.as_deref(), mqtt.key_path.as_deref()) {
            (Some(cert), Some(key)) => Some((read_pem(cert).await?, read_pem(key).await?)),
            _ => None,
        };
        Ok(Some(Self { ca, client_auth }))
    }

    fn into_configuration(self, port: u16) -> Result<TlsConfiguration> {
        match self.ca {
            Some(ca) => Ok(TlsConfiguration::Simple {
                ca,
                alpn: alpn_for_port(port),
                client_auth: self.client_auth,
            }),
            None => system_roots_configuration(self.client_auth, port),
        }
    }
}

/// rustls configuration trusting the platform's root certificates
fn system_roots_configuration(
    client_auth: Option<(Vec<u8>, Vec<u8>)>,
    port: u16,
) -> Result<TlsConfiguration> {
    let identity = match client_auth {
        Some((cert, key)) => Some(parse_identity(&cert, &key)?),
        None => None,
    };

    let certs = rustls_native_certs::load_native_certs()
        .map_err(|e| AgentError::Config(format!("Failed to load system trust store: {}", e)))?;
    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(certs);
    debug!("Loaded {} system root certificates ({} ignored)", added, ignored);
    if roots.is_empty() {
        return Err(AgentError::Config(
            "System trust store has no usable certificates, set mqtt.ca_path".to_string(),
        ));
    }

    let builder = ClientConfig::builder().with_root_certificates(roots);
    let mut client = match identity {
        Some((chain, key)) => builder
            .with_client_auth_cert(chain, key)
            .map_err(|e| AgentError::Config(format!("Invalid client certificate: {}", e)))?,
        None => builder.with_no_client_auth(),
    };
    if let Some(alpn) = alpn_for_port(port) {
        client.alpn_protocols = alpn;
    }
    Ok(TlsConfiguration::Rustls(Arc::new(client)))
}

type Identity = (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>);

fn parse_identity(cert: &[u8], key: &[u8]) -> Result<Identity> {
    let chain = rustls_pemfile::certs(&mut &cert[..])
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| AgentError::Config(format!("Invalid client certificate PEM: {}", e)))?;
    if chain.is_empty() {
        return Err(AgentError::Config(
            "No certificate found in client certificate PEM".to_string(),
        ));
    }
    let key = rustls_pemfile::private_key(&mut &key[..])
        .map_err(|e| AgentError::Config(format!("Invalid private key PEM: {}", e)))?
        .ok_or_else(|| AgentError::Config("No private key found in key PEM".to_string()))?;
    Ok((chain, key))
}

async fn read_pem(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .map_err(|e| AgentError::Config(format!("Failed to read {}: {}", path.display(), e)))
}

fn alpn_for_port(port: u16) -> Option<Vec<Vec<u8>>> {
    (port == 443).then(|| vec![AWS_IOT_ALPN.to_vec()])
}

/// Build rumqttc options from the agent configuration
pub fn mqtt_options(config: &AgentConfig, tls: Option<TlsMaterial>) -> Result<MqttOptions> {
    let mqtt = &config.mqtt;
    let mut options = MqttOptions::new(config.client_id(), mqtt.endpoint.clone(), mqtt.port);
    options.set_keep_alive(Duration::from_secs(mqtt.keep_alive_secs));
    options.set_clean_session(mqtt.clean_session);

    if let Some(tls) = tls {
        options.set_transport(Transport::tls_with_config(tls.into_configuration(mqtt.port)?));
    }
    if let Some(host) = mqtt.proxy() {
        info!("Connecting through HTTP proxy {}:{}", host, mqtt.proxy_port);
        options.set_proxy(Proxy {
            ty: ProxyType::Http,
            auth: ProxyAuth::None,
            addr: host.to_string(),
            port: mqtt.proxy_port,
        });
    }
    Ok(options)
}

/// MQTT implementation of [`CommandChannel`]
pub struct MqttChannel {
    client: AsyncClient,
    eventloop: Mutex<Option<EventLoop>>,
    state: Arc<RwLock<ConnectionState>>,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
    /// Subscriptions to renew after a session loss
    subscriptions: Arc<Mutex<Vec<(String, QoS)>>>,
    connect_timeout: Duration,
    reconnect_delay: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttChannel {
    pub fn new(options: MqttOptions, connect_timeout: Duration, reconnect_delay: Duration) -> Self {
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            client,
            eventloop: Mutex::new(Some(eventloop)),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            subscriptions: Arc::new(Mutex::new(Vec::new())),
            connect_timeout,
            reconnect_delay,
            task: Mutex::new(None),
        }
    }

    /// Create a channel from configuration, reading TLS material from disk
    pub async fn from_config(config: &AgentConfig) -> Result<Self> {
        let tls = TlsMaterial::load(config).await?;
        if tls.is_none() {
            warn!("No TLS material configured, connecting to the MQTT broker without TLS");
        }
        let options = mqtt_options(config, tls)?;
        info!(
            "MQTT broker {}:{} (client id {})",
            config.mqtt.endpoint,
            config.mqtt.port,
            options.client_id()
        );
        Ok(Self::new(
            options,
            Duration::from_secs(config.mqtt.connect_timeout_secs),
            Duration::from_millis(config.mqtt.reconnect_delay_ms),
        ))
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }
}

#[async_trait]
impl CommandChannel for MqttChannel {
    async fn connect(&self) -> Result<()> {
        let Some(eventloop) = self.eventloop.lock().take() else {
            return Err(AgentError::Channel("MQTT channel already connected".to_string()));
        };

        info!("Connecting to MQTT broker...");
        self.set_state(ConnectionState::Connecting);

        let (ready_tx, ready_rx) = oneshot::channel();
        let event_loop = EventLoopTask {
            client: self.client.clone(),
            state: self.state.clone(),
            events: self.events_tx.clone(),
            subscriptions: self.subscriptions.clone(),
            reconnect_delay: self.reconnect_delay,
            throttler: LogThrottler::with_secs(30),
        };
        let task = tokio::spawn(event_loop.run(eventloop, ready_tx));

        let reason = match tokio::time::timeout(self.connect_timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => {
                *self.task.lock() = Some(task);
                return Ok(());
            }
            Ok(Ok(Err(reason))) => reason,
            Ok(Err(_)) => "event loop ended before the connection completed".to_string(),
            Err(_) => format!("timed out after {}s", self.connect_timeout.as_secs()),
        };

        task.abort();
        self.set_state(ConnectionState::Disconnected);
        Err(AgentError::ConnectionFailed(reason))
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<()> {
        self.client
            .subscribe(topic, qos.into())
            .await
            .map_err(|e| AgentError::Channel(format!("Subscribe to {} failed: {}", topic, e)))?;

        let mut subscriptions = self.subscriptions.lock();
        if !subscriptions.iter().any(|(t, _)| t == topic) {
            subscriptions.push((topic.to_string(), qos));
        }
        debug!("Subscribed to {} ({:?})", topic, qos);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes, qos: QoS, retain: bool) -> Result<()> {
        self.client
            .publish_bytes(topic, qos.into(), retain, payload)
            .await
            .map_err(|e| AgentError::Channel(format!("Publish to {} failed: {}", topic, e)))
    }

    async fn disconnect(&self) -> Result<()> {
        let task = self.task.lock().take();
        let Some(mut task) = task else {
            self.set_state(ConnectionState::Disconnected);
            return Ok(());
        };

        info!("Disconnecting from MQTT broker");
        let finished = tokio::time::timeout(DISCONNECT_TIMEOUT, async {
            if let Err(e) = self.client.disconnect().await {
                warn!("MQTT disconnect request failed: {}", e);
            }
            let _ = (&mut task).await;
        })
        .await;

        if finished.is_err() {
            warn!("MQTT event loop did not finish in time, aborting it");
            task.abort();
        }
        self.set_state(ConnectionState::Disconnected);
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.events_rx.lock().take()
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state.read()
    }
}

struct EventLoopTask {
    client: AsyncClient,
    state: Arc<RwLock<ConnectionState>>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    subscriptions: Arc<Mutex<Vec<(String, QoS)>>>,
    reconnect_delay: Duration,
    throttler: LogThrottler,
}

impl EventLoopTask {
    async fn run(
        self,
        mut eventloop: EventLoop,
        ready: oneshot::Sender<std::result::Result<(), String>>,
    ) {
        let mut ready = Some(ready);

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    *self.state.write() = ConnectionState::Connected;
                    if let Some(ready) = ready.take() {
                        info!("Connected to MQTT broker");
                        let _ = ready.send(Ok(()));
                        self.emit(ChannelEvent::Connected);
                    } else {
                        info!("MQTT connection resumed");
                        self.throttler.clear("mqtt_reconnect");
                        self.emit(ChannelEvent::Resumed);
                        if !ack.session_present {
                            self.resubscribe();
                        }
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    debug!("MQTT message on {} ({} bytes)", publish.topic, publish.payload.len());
                    self.emit(ChannelEvent::Message {
                        topic: publish.topic,
                        payload: publish.payload,
                    });
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    info!("MQTT connection closed");
                    *self.state.write() = ConnectionState::Disconnected;
                    self.emit(ChannelEvent::Disconnected);
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(Err(e.to_string()));
                        break;
                    }

                    let was_connected = {
                        let mut state = self.state.write();
                        let was = *state == ConnectionState::Connected;
                        *state = ConnectionState::Interrupted;
                        was
                    };
                    if was_connected {
                        warn!("MQTT connection interrupted: {}", e);
                        self.emit(ChannelEvent::Interrupted {
                            reason: e.to_string(),
                        });
                    } else {
                        warn_throttled!(
                            self.throttler,
                            "mqtt_reconnect",
                            "MQTT reconnect failed: {}",
                            e
                        );
                    }
                    tokio::time::sleep(self.reconnect_delay).await;
                }
            }
        }
        debug!("MQTT event loop finished");
    }

    fn emit(&self, event: ChannelEvent) {
        let _ = self.events.send(event);
    }

    fn resubscribe(&self) {
        let subscriptions = self.subscriptions.lock().clone();
        for (topic, qos) in subscriptions {
            match self.client.try_subscribe(topic.clone(), qos.into()) {
                Ok(()) => debug!("Renewed subscription to {}", topic),
                Err(e) => warn!("Failed to renew subscription to {}: {}", topic, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn config() -> AgentConfig {
        let mut config = AgentConfig::default();
        config.device.thing_name = "porch-cam".to_string();
        config.mqtt.endpoint = "broker.local".to_string();
        config.mqtt.port = 1883;
        config.mqtt.client_id = Some("porch-cam-1".to_string());
        config.mqtt.keep_alive_secs = 45;
        config
    }

    #[test]
    fn test_qos_conversion() {
        assert_eq!(rumqttc::QoS::from(QoS::AtMostOnce), rumqttc::QoS::AtMostOnce);
        assert_eq!(rumqttc::QoS::from(QoS::AtLeastOnce), rumqttc::QoS::AtLeastOnce);
        assert_eq!(rumqttc::QoS::from(QoS::ExactlyOnce), rumqttc::QoS::ExactlyOnce);
    }

    #[test]
    fn test_mqtt_options() {
        let options = mqtt_options(&config(), None).unwrap();
        assert_eq!(options.broker_address(), ("broker.local".to_string(), 1883));
        assert_eq!(options.client_id(), "porch-cam-1");
        assert_eq!(options.keep_alive(), Duration::from_secs(45));
        assert!(options.clean_session());
        assert!(options.proxy().is_none());
    }

    #[test]
    fn test_http_proxy() {
        let mut config = config();
        config.mqtt.proxy_host = Some("proxy.lan".to_string());
        config.mqtt.proxy_port = 3128;

        let proxy = mqtt_options(&config, None).unwrap().proxy().unwrap();
        assert_eq!(proxy.addr, "proxy.lan");
        assert_eq!(proxy.port, 3128);
        assert!(matches!(proxy.ty, ProxyType::Http));
        assert!(matches!(proxy.auth, ProxyAuth::None));
    }

    #[test]
    fn test_client_cert_without_ca_needs_valid_pem() {
        let tls = TlsMaterial {
            ca: None,
            client_auth: Some((b"CERT".to_vec(), b"KEY".to_vec())),
        };
        let err = mqtt_options(&config(), Some(tls)).unwrap_err();
        assert!(matches!(err, AgentError::Config(ref msg) if msg.contains("client certificate")));
    }

    #[test]
    fn test_explicit_ca_uses_simple_tls() {
        let tls = TlsMaterial {
            ca: Some(b"CA".to_vec()),
            client_auth: None,
        };
        assert!(matches!(
            tls.into_configuration(443).unwrap(),
            TlsConfiguration::Simple { alpn: Some(_), .. }
        ));
    }

    #[test]
    fn test_alpn_only_on_443() {
        assert_eq!(alpn_for_port(443), Some(vec![b"x-amzn-mqtt-ca".to_vec()]));
        assert_eq!(alpn_for_port(8883), None);
    }

    #[tokio::test]
    async fn test_tls_material() {
        let dir = tempfile::tempdir().unwrap();
        let write = |name: &str, content: &str| {
            let path = dir.path().join(name);
            std::fs::write(&path, content).unwrap();
            path
        };

        let mut config = config();
        assert!(TlsMaterial::load(&config).await.unwrap().is_none());

        config.mqtt.cert_path = Some(write("cert.pem", "CERT"));
        config.mqtt.key_path = Some(write("key.pem", "KEY"));
        let tls = TlsMaterial::load(&config).await.unwrap().unwrap();
        assert!(tls.ca.is_none());
        assert_eq!(tls.client_auth, Some((b"CERT".to_vec(), b"KEY".to_vec())));

        config.mqtt.ca_path = Some(write("ca.pem", "CA"));
        let tls = TlsMaterial::load(&config).await.unwrap().unwrap();
        assert_eq!(tls.ca.as_deref(), Some(&b"CA"[..]));
    }

    #[tokio::test]
    async fn test_missing_pem_is_config_error() {
        let mut config = config();
        config.mqtt.ca_path = Some(PathBuf::from("/nonexistent/ca.pem"));
        let err = TlsMaterial::load(&config).await.unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut config = config();
        config.mqtt.endpoint = "127.0.0.1".to_string();
        config.mqtt.port = port;
        let channel = MqttChannel::new(
            mqtt_options(&config, None).unwrap(),
            Duration::from_secs(5),
            Duration::from_millis(100),
        );

        let err = channel.connect().await.unwrap_err();
        assert!(matches!(err, AgentError::ConnectionFailed(_)));
        assert_eq!(channel.connection_state(), ConnectionState::Disconnected);
        assert!(channel.connect().await.is_err());
    }

    #[tokio::test]
    async fn test_take_events_once() {
        let channel = MqttChannel::new(
            mqtt_options(&config(), None).unwrap(),
            Duration::from_secs(1),
            Duration::from_millis(100),
        );
        assert!(channel.take_events().is_some());
        assert!(channel.take_events().is_none());
    }
}
