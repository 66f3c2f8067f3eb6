//! mqtt-ingest command line entry point
//!
//! Connects to the broker described by the configuration file and either
//! stays online, streams telemetry from wildcard subscriptions, or publishes
//! a single message.

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use mqtt_ingest::observability::{init_default_logging, init_logging, LogFormat};
use mqtt_ingest::{ClientConfig, ClientError, EventHandler, InboundMessage, MqttClient, QoS};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn, Level};

const DEFAULT_CONFIG_PATHS: [&str; 3] = ["mqtt-ingest.toml", "config/mqtt-ingest.toml", "config.json"];

const DEFAULT_FILTERS: [&str; 2] = ["factory/+/+/telemetry", "factory/+/+/state"];

/// Resilient MQTT telemetry ingestion client
#[derive(Parser)]
#[command(name = "mqtt-ingest")]
#[command(about = "MQTT telemetry client with mutual TLS, reconnect and backpressure handling")]
#[command(version)]
struct Cli {
    /// Configuration file path (TOML, or the JSON provisioning layout)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect, announce presence and stay online until interrupted
    Connect,
    /// Subscribe to topic filters and print every received payload
    Subscribe {
        /// Topic filter, may be repeated
        #[arg(short, long = "filter", value_name = "FILTER")]
        filters: Vec<String>,
        #[arg(long, default_value_t = 1, value_parser = parse_qos)]
        qos: u8,
    },
    /// Publish one message and wait for its acknowledgment
    Publish {
        #[arg(short, long)]
        topic: String,
        #[arg(short, long)]
        message: String,
        #[arg(long, default_value_t = 1, value_parser = parse_qos)]
        qos: u8,
        #[arg(long)]
        retain: bool,
    },
    /// Validate the configuration
    Config {
        /// Print the effective configuration
        #[arg(long)]
        show: bool,
    },
}

fn parse_qos(value: &str) -> Result<u8, String> {
    match value.parse::<u8>() {
        Ok(qos @ 0..=2) => Ok(qos),
        _ => Err(format!("QoS must be 0, 1 or 2, got '{value}'")),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.verbose {
        0 => init_default_logging(),
        verbose => {
            let level = if verbose == 1 { Level::DEBUG } else { Level::TRACE };
            let format = LogFormat::parse(&std::env::var("LOG_FORMAT").unwrap_or_default());
            init_logging(level, format, false)
        }
    };

    info!("Starting mqtt-ingest v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Connect => run_connect(config).await,
        Commands::Subscribe { filters, qos } => run_subscribe(config, filters, qos).await,
        Commands::Publish {
            topic,
            message,
            qos,
            retain,
        } => run_publish(config, topic, message, qos, retain).await,
        Commands::Config { show } => handle_config_command(config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<ClientConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(ClientConfig::load_from_file(path)?);
    }

    for path_str in DEFAULT_CONFIG_PATHS {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(ClientConfig::load_from_file(&path)?);
        }
    }

    Err(mqtt_ingest::ConfigError::NotFound(DEFAULT_CONFIG_PATHS.join(", ")).into())
}

/// Connect, tolerating transient failures: the session keeps retrying in the background
async fn start_client(client: &mut MqttClient) -> Result<(), ClientError> {
    match client.connect().await {
        Ok(()) => Ok(()),
        Err(e) if e.is_retryable() => {
            warn!(error = %e, "Initial connection failed, retrying in the background");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn print_connection_summary(config: &ClientConfig) {
    let endpoint = config
        .connection
        .endpoint()
        .map(|(host, port)| format!("{host}:{port}"))
        .unwrap_or_else(|_| config.connection.broker_url.clone());

    println!("Client ID: {}", config.connection.client_id);
    println!("Endpoint: {endpoint}");
    if let Some(factory) = &config.factory {
        println!("Assigned line: {}", factory.assigned_line);
        if !factory.machine_types.is_empty() {
            println!("Machine types: {}", factory.machine_types.join(", "));
        }
    }
}

async fn run_connect(config: ClientConfig) -> Result<(), Box<dyn std::error::Error>> {
    print_connection_summary(&config);
    let presence = config.presence.clone();

    let mut client = MqttClient::new(config)?;
    client.add_handler(Arc::new(LifecycleLogger));
    start_client(&mut client).await?;

    match presence {
        Some(presence) => info!(topic = %presence.topic, "Presence signal published on every connect"),
        None => info!("No presence topic configured"),
    }
    info!("Connected; press Ctrl+C to disconnect");

    wait_for_shutdown_signal().await?;
    client.disconnect().await?;
    Ok(())
}

async fn run_subscribe(
    config: ClientConfig,
    filters: Vec<String>,
    qos: u8,
) -> Result<(), Box<dyn std::error::Error>> {
    let qos = QoS::try_from(qos)?;
    let filters = if filters.is_empty() {
        DEFAULT_FILTERS.iter().map(|f| f.to_string()).collect()
    } else {
        filters
    };

    print_connection_summary(&config);
    let mut client = MqttClient::new(config)?;
    client.add_handler(Arc::new(LifecycleLogger));
    client.add_handler(Arc::new(PayloadPrinter));

    for filter in &filters {
        client.subscribe(filter, qos)?;
        println!("Subscribed to: {filter}");
    }
    start_client(&mut client).await?;

    wait_for_shutdown_signal().await?;
    client.disconnect().await?;
    Ok(())
}

async fn run_publish(
    config: ClientConfig,
    topic: String,
    message: String,
    qos: u8,
    retain: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let qos = QoS::try_from(qos)?;
    let ack_window = Duration::from_millis(config.queue.retry_interval_ms)
        * config.queue.max_retries.saturating_add(1);

    let mut client = MqttClient::new(config)?;
    client.add_handler(Arc::new(LifecycleLogger));
    client.connect().await?;

    let delivery = client.publish_tracked(&topic, message, qos, retain)?;
    let outcome = match tokio::time::timeout(ack_window, delivery.wait()).await {
        Ok(outcome) => outcome,
        Err(_) => {
            warn!(topic = %topic, "No acknowledgment within {}ms", ack_window.as_millis());
            Err(ClientError::timeout(format!(
                "no acknowledgment for '{topic}' within {}ms",
                ack_window.as_millis()
            )))
        }
    };
    client.disconnect().await?;

    outcome?;
    println!("Published to: {topic}");
    Ok(())
}

fn handle_config_command(
    config: ClientConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Effective configuration:");
        println!("{}", toml::to_string_pretty(&config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<(), std::io::Error> {
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully..."),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
    }
    Ok(())
}

/// Logs session lifecycle and errors
struct LifecycleLogger;

#[async_trait]
impl EventHandler for LifecycleLogger {
    async fn on_connect(&self, session_present: bool) {
        info!(session_present, "Connected to broker");
    }

    async fn on_disconnect(&self, reason: &str, will_reconnect: bool) {
        warn!(reason, will_reconnect, "Disconnected from broker");
    }

    async fn on_error(&self, error: &ClientError) {
        error!(error = %error, "Client error");
    }
}

/// Prints received payloads, pretty printing JSON
struct PayloadPrinter;

#[async_trait]
impl EventHandler for PayloadPrinter {
    async fn on_message(&self, filter: &str, message: &InboundMessage) {
        println!("Received message on {} (filter {filter}):", message.topic);
        match serde_json::from_slice::<serde_json::Value>(&message.payload) {
            Ok(value) => match serde_json::to_string_pretty(&value) {
                Ok(pretty) => println!("{pretty}"),
                Err(e) => println!("Failed to format message: {e}"),
            },
            Err(e) => println!("Failed to parse message: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_qos() {
        assert_eq!(parse_qos("0"), Ok(0));
        assert_eq!(parse_qos("2"), Ok(2));
        assert!(parse_qos("3").is_err());
        assert!(parse_qos("one").is_err());
    }

    #[test]
    fn test_cli_parses_subscribe_filters() {
        let cli = Cli::try_parse_from([
            "mqtt-ingest",
            "-c",
            "config.json",
            "subscribe",
            "-f",
            "factory/+/+/telemetry",
            "--filter",
            "factory/#",
            "--qos",
            "0",
        ])
        .unwrap();

        assert_eq!(cli.config, Some(PathBuf::from("config.json")));
        match cli.command {
            Commands::Subscribe { filters, qos } => {
                assert_eq!(filters, vec!["factory/+/+/telemetry", "factory/#"]);
                assert_eq!(qos, 0);
            }
            _ => panic!("expected subscribe"),
        }
    }

    #[test]
    fn test_cli_parses_publish() {
        let cli = Cli::try_parse_from([
            "mqtt-ingest",
            "-vv",
            "publish",
            "-t",
            "factory/B7/presence",
            "-m",
            "online",
            "--retain",
        ])
        .unwrap();

        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Publish {
                topic, qos, retain, ..
            } => {
                assert_eq!(topic, "factory/B7/presence");
                assert_eq!(qos, 1);
                assert!(retain);
            }
            _ => panic!("expected publish"),
        }
    }
}
