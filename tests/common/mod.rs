//! Shared fixtures for the engine-level tests
//!
//! Every test drives a real `MqttClient` against the in-memory broker from
//! `mqtt_ingest::testing`, with timings shrunk so retries and reconnects
//! happen within milliseconds.

#![allow(dead_code)]

use mqtt_ingest::testing::{MockBroker, MockConnector, RecordingHandler};
use mqtt_ingest::{ClientConfig, MqttClient};
use std::sync::Arc;
use std::time::Duration;

pub const SHORT_WAIT: Duration = Duration::from_millis(300);
pub const LONG_WAIT: Duration = Duration::from_secs(5);

/// Configuration with fast backoff and a short retry interval
pub fn test_config(client_id: &str) -> ClientConfig {
    let mut config = ClientConfig::from_toml_str(&format!(
        r#"
[connection]
broker_url = "mqtts://broker.test:8883"
client_id = "{client_id}"
ca_path = "ca.pem"
cert_path = "cert.pem"
key_path = "key.pem"
keepalive_secs = 60
connect_timeout_ms = 1000

[session]
initial_backoff_ms = 20
max_backoff_ms = 100
jitter = 0.0
shutdown_timeout_ms = 1000

[queue]
capacity = 16
max_inflight = 8
retry_interval_ms = 200
max_retries = 2

[dispatcher]
lanes = 2
"#
    ))
    .expect("test configuration should be valid");
    config.session.stability_threshold_secs = 1;
    config
}

/// Client wired to a mock broker, with a recording handler registered
pub fn client_with_broker(config: ClientConfig) -> (MqttClient, MockBroker, Arc<RecordingHandler>) {
    let (connector, broker) = MockConnector::pair();
    let client = MqttClient::with_connector(config, Arc::new(connector)).unwrap();
    let handler = Arc::new(RecordingHandler::new());
    client.add_handler(handler.clone());
    (client, broker, handler)
}

/// Run `connect` and the broker handshake side by side
pub async fn connect(client: &mut MqttClient, broker: &mut MockBroker) {
    let (result, connect) = tokio::join!(client.connect(), broker.handshake());
    result.expect("client should connect");
    assert!(connect.is_some(), "broker should see a CONNECT");
}
