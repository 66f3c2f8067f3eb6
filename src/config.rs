//! Client configuration
//!
//! Loaded from TOML (`mqtt-ingest.toml`) or from the JSON layout used by the
//! factory provisioning bundle (`config.json`), selected by file extension.
//! Relative certificate paths resolve against the directory of the config file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::{Host, Url};
use uuid::Uuid;

use crate::protocol::{validate_topic_name, QoS};

/// Default TLS port for `mqtts://` URLs
pub const DEFAULT_MQTTS_PORT: u16 = 8883;
/// Longest client identifier we accept
pub const MAX_CLIENT_ID_LENGTH: usize = 128;

/// Environment variable overriding `connection.broker_url`
pub const ENV_BROKER_URL: &str = "MQTT_INGEST_BROKER_URL";
/// Environment variable overriding `connection.client_id`
pub const ENV_CLIENT_ID: &str = "MQTT_INGEST_CLIENT_ID";

/// Top-level client configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    pub connection: ConnectionSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub queue: QueueSection,
    #[serde(default)]
    pub dispatcher: DispatcherSection,
    /// Presence signal published on connect and registered as last will
    #[serde(default)]
    pub presence: Option<PresenceSection>,
    /// Factory assignment carried over from the provisioning bundle
    #[serde(default)]
    pub factory: Option<FactorySection>,
}

/// Broker endpoint, identity and TLS material
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionSection {
    /// Broker URL, `mqtts://host[:port]`
    pub broker_url: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// CA certificate bundle (PEM) used to verify the broker
    pub ca_path: PathBuf,
    /// Client certificate chain (PEM)
    pub cert_path: PathBuf,
    /// Client private key (PEM)
    pub key_path: PathBuf,
    /// Keepalive interval in seconds, 0 disables pings
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u16,
    #[serde(default = "default_true")]
    pub clean_session: bool,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Largest inbound packet accepted, in bytes
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
}

/// Reconnect and shutdown tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSection {
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Fraction of the delay that may be randomly subtracted (0.0 to 1.0)
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    /// Connected time after which the backoff resets
    #[serde(default = "default_stability_threshold_secs")]
    pub stability_threshold_secs: u64,
    /// Unlimited when absent
    #[serde(default)]
    pub max_reconnect_attempts: Option<u32>,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: default_jitter(),
            stability_threshold_secs: default_stability_threshold_secs(),
            max_reconnect_attempts: None,
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

/// Outbound queue sizing and QoS retry policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueSection {
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
    /// Unacknowledged QoS 1/2 publishes allowed on the wire
    #[serde(default = "default_max_inflight")]
    pub max_inflight: usize,
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    /// Retransmissions before a delivery fails
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            max_inflight: default_max_inflight(),
            retry_interval_ms: default_retry_interval_ms(),
            max_retries: default_max_retries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatcherSection {
    /// Number of dispatch lanes; events for one topic always share a lane
    #[serde(default = "default_lanes")]
    pub lanes: usize,
    /// Events buffered per lane; further events are dropped while a lane is full
    #[serde(default = "default_lane_capacity")]
    pub lane_capacity: usize,
}

impl Default for DispatcherSection {
    fn default() -> Self {
        Self {
            lanes: default_lanes(),
            lane_capacity: default_lane_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresenceSection {
    pub topic: String,
    #[serde(default = "default_online_payload")]
    pub online_payload: String,
    #[serde(default = "default_offline_payload")]
    pub offline_payload: String,
    #[serde(default = "default_presence_qos")]
    pub qos: QoS,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FactorySection {
    pub assigned_line: String,
    #[serde(default)]
    pub machine_types: Vec<String>,
}

fn default_client_id() -> String {
    format!("ingest-{}", Uuid::new_v4())
}

fn default_true() -> bool {
    true
}

fn default_keepalive_secs() -> u16 {
    60
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_max_packet_size() -> usize {
    256 * 1024
}

fn default_initial_backoff_ms() -> u64 {
    1_000
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.2
}

fn default_stability_threshold_secs() -> u64 {
    30
}

fn default_shutdown_timeout_ms() -> u64 {
    5_000
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_max_inflight() -> usize {
    32
}

fn default_retry_interval_ms() -> u64 {
    10_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_lanes() -> usize {
    4
}

fn default_lane_capacity() -> usize {
    1024
}

fn default_online_payload() -> String {
    "online".to_string()
}

fn default_offline_payload() -> String {
    "offline".to_string()
}

fn default_presence_qos() -> QoS {
    QoS::AtLeastOnce
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Invalid client ID: {0}")]
    InvalidClientId(String),
    #[error("Failed to load TLS material: {0}")]
    Tls(String),
    #[error("No configuration file found (searched: {0})")]
    NotFound(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// JSON layout of the provisioning bundle
#[derive(Debug, Deserialize)]
struct BundleConfig {
    mqtt: BundleMqtt,
    factory: Option<BundleFactory>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BundleMqtt {
    endpoint: String,
    #[serde(default = "default_bundle_port")]
    port: u16,
    #[serde(default = "default_bundle_protocol")]
    protocol: String,
    client_id: Option<String>,
    ca: PathBuf,
    cert: PathBuf,
    key: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BundleFactory {
    assigned_line: String,
    #[serde(default)]
    machine_types: Vec<String>,
}

fn default_bundle_port() -> u16 {
    DEFAULT_MQTTS_PORT
}

fn default_bundle_protocol() -> String {
    "mqtts".to_string()
}

impl From<BundleConfig> for ClientConfig {
    fn from(bundle: BundleConfig) -> Self {
        let mqtt = bundle.mqtt;
        // IPv6 literals need brackets inside a URL
        let host = if mqtt.endpoint.contains(':') && !mqtt.endpoint.starts_with('[') {
            format!("[{}]", mqtt.endpoint)
        } else {
            mqtt.endpoint
        };
        Self {
            connection: ConnectionSection {
                broker_url: format!("{}://{}:{}", mqtt.protocol, host, mqtt.port),
                client_id: mqtt.client_id.unwrap_or_else(default_client_id),
                ca_path: mqtt.ca,
                cert_path: mqtt.cert,
                key_path: mqtt.key,
                keepalive_secs: default_keepalive_secs(),
                clean_session: true,
                connect_timeout_ms: default_connect_timeout_ms(),
                max_packet_size: default_max_packet_size(),
            },
            session: SessionSection::default(),
            queue: QueueSection::default(),
            dispatcher: DispatcherSection::default(),
            presence: None,
            factory: bundle.factory.map(|factory| FactorySection {
                assigned_line: factory.assigned_line,
                machine_types: factory.machine_types,
            }),
        }
    }
}

impl ClientConfig {
    /// Load configuration from a TOML or JSON file, apply environment
    /// overrides and validate the result
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;

        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let mut config: ClientConfig = if is_json {
            serde_json::from_str::<BundleConfig>(&content)?.into()
        } else {
            toml::from_str(&content)?
        };

        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        config.apply_overrides(
            std::env::var(ENV_BROKER_URL).ok(),
            std::env::var(ENV_CLIENT_ID).ok(),
        );
        config.validate()?;

        Ok(config)
    }

    /// Parse and validate TOML content without touching the filesystem
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve relative certificate paths against `base`
    pub fn resolve_paths(&mut self, base: &Path) {
        for path in [
            &mut self.connection.ca_path,
            &mut self.connection.cert_path,
            &mut self.connection.key_path,
        ] {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }

    /// Replace the broker URL and client id when overrides are given
    pub fn apply_overrides(&mut self, broker_url: Option<String>, client_id: Option<String>) {
        if let Some(url) = broker_url.filter(|value| !value.trim().is_empty()) {
            self.connection.broker_url = url;
        }
        if let Some(id) = client_id.filter(|value| !value.trim().is_empty()) {
            self.connection.client_id = id;
        }
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.connection.endpoint()?;
        validate_client_id(&self.connection.client_id)?;

        if self.connection.connect_timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "connection.connect_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.connection.max_packet_size < 64 {
            return Err(ConfigError::InvalidConfig(
                "connection.max_packet_size must be at least 64 bytes".to_string(),
            ));
        }

        let session = &self.session;
        if session.initial_backoff_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "session.initial_backoff_ms must be greater than zero".to_string(),
            ));
        }
        if session.max_backoff_ms < session.initial_backoff_ms {
            return Err(ConfigError::InvalidConfig(format!(
                "session.max_backoff_ms ({}) is smaller than session.initial_backoff_ms ({})",
                session.max_backoff_ms, session.initial_backoff_ms
            )));
        }
        if !(session.backoff_multiplier >= 1.0 && session.backoff_multiplier.is_finite()) {
            return Err(ConfigError::InvalidConfig(
                "session.backoff_multiplier must be at least 1.0".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&session.jitter) {
            return Err(ConfigError::InvalidConfig(
                "session.jitter must be in [0.0, 1.0)".to_string(),
            ));
        }

        let queue = &self.queue;
        if queue.capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "queue.capacity must be greater than zero".to_string(),
            ));
        }
        if queue.max_inflight == 0 || queue.max_inflight > usize::from(u16::MAX) {
            return Err(ConfigError::InvalidConfig(
                "queue.max_inflight must be between 1 and 65535".to_string(),
            ));
        }
        if queue.retry_interval_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "queue.retry_interval_ms must be greater than zero".to_string(),
            ));
        }

        if self.dispatcher.lanes == 0 {
            return Err(ConfigError::InvalidConfig(
                "dispatcher.lanes must be at least 1".to_string(),
            ));
        }
        if self.dispatcher.lane_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "dispatcher.lane_capacity must be at least 1".to_string(),
            ));
        }

        if let Some(presence) = &self.presence {
            validate_topic_name(&presence.topic).map_err(|e| {
                ConfigError::InvalidConfig(format!("presence.topic: {e}"))
            })?;
        }

        Ok(())
    }
}

impl ConnectionSection {
    /// Host and port parsed from `broker_url`
    pub fn endpoint(&self) -> Result<(String, u16), ConfigError> {
        let url = Url::parse(&self.broker_url)
            .map_err(|e| ConfigError::InvalidBrokerUrl(format!("{}: {e}", self.broker_url)))?;

        if url.scheme() != "mqtts" {
            return Err(ConfigError::InvalidBrokerUrl(format!(
                "{}: scheme must be mqtts, TLS is mandatory",
                self.broker_url
            )));
        }
        // Unbracketed so it works for both the socket address and the TLS server name
        let host = match url.host() {
            Some(Host::Domain(domain)) if !domain.is_empty() => domain.to_string(),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            _ => {
                return Err(ConfigError::InvalidBrokerUrl(format!(
                    "{}: missing host",
                    self.broker_url
                )))
            }
        };

        Ok((host, url.port().unwrap_or(DEFAULT_MQTTS_PORT)))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(u64::from(self.keepalive_secs))
    }
}

impl SessionSection {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Client identifiers must match `[a-zA-Z0-9._:-]{1,128}`
pub fn validate_client_id(client_id: &str) -> Result<(), ConfigError> {
    if client_id.is_empty() || client_id.len() > MAX_CLIENT_ID_LENGTH {
        return Err(ConfigError::InvalidClientId(format!(
            "'{client_id}' must be 1 to {MAX_CLIENT_ID_LENGTH} characters"
        )));
    }
    if let Some(ch) = client_id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | ':')))
    {
        return Err(ConfigError::InvalidClientId(format!(
            "'{client_id}' contains invalid character '{ch}'"
        )));
    }
    Ok(())
}
