use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kvs_agent::agent::Agent;
use kvs_agent::channel::MqttChannel;
use kvs_agent::config::{load_config, AgentConfig};
use kvs_agent::events::EventBus;
use kvs_agent::pipeline::LaunchBackend;
use kvs_agent::stream::{StartOutcome, StreamController};

/// Invalid configuration or unreadable credentials
const EXIT_CONFIG: u8 = 1;
/// Pipeline could not be started at startup (autostart)
const EXIT_PIPELINE: u8 = 2;
/// Command channel could not be established
const EXIT_CHANNEL: u8 = 3;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogFormat {
    #[default]
    Text,
    Json,
}

/// kvs-agent command line arguments
#[derive(Parser, Debug)]
#[command(name = "kvs-agent")]
#[command(version, about = "Media streaming agent with remote start/stop over MQTT", long_about = None)]
struct CliArgs {
    /// Configuration file (default: /etc/kvs-agent/config.toml)
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// MQTT broker endpoint (overrides config file)
    #[arg(short = 'e', long, value_name = "HOST")]
    endpoint: Option<String>,

    /// MQTT broker port (overrides config file)
    #[arg(short = 'p', long, value_name = "PORT")]
    port: Option<u16>,

    /// Client certificate (PEM)
    #[arg(long, value_name = "FILE", requires = "key")]
    cert: Option<PathBuf>,

    /// Client private key (PEM)
    #[arg(long, value_name = "FILE", requires = "cert")]
    key: Option<PathBuf>,

    /// Certificate authority (PEM)
    #[arg(long, value_name = "FILE")]
    ca: Option<PathBuf>,

    /// HTTP proxy host for the broker connection
    #[arg(long, value_name = "HOST")]
    proxy_host: Option<String>,

    /// HTTP proxy port
    #[arg(long, value_name = "PORT")]
    proxy_port: Option<u16>,

    /// MQTT client id
    #[arg(long, value_name = "ID")]
    client_id: Option<String>,

    /// IoT thing name (default topic prefix)
    #[arg(short = 't', long, value_name = "NAME")]
    thing_name: Option<String>,

    /// Stream name passed to the pipeline
    #[arg(long, value_name = "NAME")]
    stream_name: Option<String>,

    /// Start streaming as soon as the command channel is up
    #[arg(long)]
    autostart: bool,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Log output format
    #[arg(long, value_name = "FORMAT", default_value = "text")]
    log_format: LogFormat,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl CliArgs {
    /// Apply command line overrides on top of the file configuration
    fn apply(&self, config: &mut AgentConfig) {
        if let Some(ref endpoint) = self.endpoint {
            config.mqtt.endpoint = endpoint.clone();
        }
        if let Some(port) = self.port {
            config.mqtt.port = port;
        }
        if let Some(ref cert) = self.cert {
            config.mqtt.cert_path = Some(cert.clone());
        }
        if let Some(ref key) = self.key {
            config.mqtt.key_path = Some(key.clone());
        }
        if let Some(ref ca) = self.ca {
            config.mqtt.ca_path = Some(ca.clone());
        }
        if let Some(ref proxy_host) = self.proxy_host {
            config.mqtt.proxy_host = Some(proxy_host.clone());
        }
        if let Some(proxy_port) = self.proxy_port {
            config.mqtt.proxy_port = proxy_port;
        }
        if let Some(ref client_id) = self.client_id {
            config.mqtt.client_id = Some(client_id.clone());
        }
        if let Some(ref thing_name) = self.thing_name {
            config.device.thing_name = thing_name.clone();
        }
        if let Some(ref stream_name) = self.stream_name {
            config.pipeline.stream_name = stream_name.clone();
        }
        if self.autostart {
            config.device.autostart = true;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose, args.log_format);

    tracing::info!("Starting kvs-agent v{}", env!("CARGO_PKG_VERSION"));

    let config_path = args.config.clone().unwrap_or_else(get_config_path);
    tracing::info!("Configuration file: {}", config_path.display());

    let mut config = match load_config(&config_path).await {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(code = e.code(), "Failed to load configuration: {}", e);
            return Ok(ExitCode::from(EXIT_CONFIG));
        }
    };
    args.apply(&mut config);
    if let Err(e) = config.validate() {
        tracing::error!(code = e.code(), "Invalid configuration: {}", e);
        return Ok(ExitCode::from(EXIT_CONFIG));
    }
    tracing::info!(
        "Thing {}: start on {}, stop on {}",
        config.device.thing_name,
        config.start_topic(),
        config.stop_topic()
    );

    let events = Arc::new(EventBus::new());
    let controller = StreamController::new(
        Arc::new(LaunchBackend::new()),
        config.pipeline.clone(),
        config.controller.clone(),
    );
    controller.set_event_bus(events.clone());

    let channel = match MqttChannel::from_config(&config).await {
        Ok(channel) => channel,
        Err(e) => {
            tracing::error!(code = e.code(), "Failed to configure MQTT client: {}", e);
            return Ok(ExitCode::from(EXIT_CONFIG));
        }
    };
    let agent = Agent::new(&config, Arc::new(channel), controller, events)
        .context("Failed to create agent")?;

    let channel_events = match agent.connect().await {
        Ok(events) => events,
        Err(e) => {
            tracing::error!(code = e.code(), "Failed to set up command channel: {}", e);
            return Ok(ExitCode::from(EXIT_CHANNEL));
        }
    };

    if config.device.autostart {
        tracing::info!("Autostart enabled, starting stream");
        if let StartOutcome::Failed(reason) = agent.controller().request_start().await {
            tracing::error!("Unable to start pipeline: {}", reason);
            agent.shutdown().await;
            return Ok(ExitCode::from(EXIT_PIPELINE));
        }
    }

    let shutdown = CancellationToken::new();
    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        tracing::error!("Failed to listen for CTRL+C: {}", e);
                    }
                }
                _ = terminate.recv() => {}
            }
            tracing::info!("Shutdown signal received");
            shutdown.cancel();
        }
    });

    agent.run(channel_events, shutdown).await;
    agent.shutdown().await;

    tracing::info!("Goodbye");
    Ok(ExitCode::SUCCESS)
}

/// Initialize logging with the given level, verbosity and format
fn init_logging(level: LogLevel, verbose_count: u8, format: LogFormat) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "kvs_agent=error,rumqttc=error",
        LogLevel::Warn => "kvs_agent=warn,rumqttc=warn",
        LogLevel::Info => "kvs_agent=info,rumqttc=warn",
        LogLevel::Verbose => "kvs_agent=debug,rumqttc=warn",
        LogLevel::Debug => "kvs_agent=debug,rumqttc=info",
        LogLevel::Trace => "kvs_agent=trace,rumqttc=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
    };
    if let Err(err) = result {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

/// Get the configuration file path
fn get_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("KVS_AGENT_CONFIG") {
        return PathBuf::from(path);
    }
    PathBuf::from("/etc/kvs-agent/config.toml")
}
