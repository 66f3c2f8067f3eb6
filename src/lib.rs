//! mqtt-ingest - resilient MQTT telemetry ingestion client
//!
//! An MQTT 3.1.1 client engine for devices and services that report telemetry
//! to a cloud broker over mutually authenticated TLS. It keeps the session
//! alive across network failures and lets the application keep publishing
//! while the link is down.
//!
//! # Overview
//!
//! - Packet codec and topic matching (`protocol`)
//! - TLS transport with client certificates (`transport`)
//! - Session state machine, keepalive and reconnect backoff (`session`)
//! - Subscription set replayed after every reconnect (`subscriptions`)
//! - Bounded outbound queue with QoS 1/2 retry (`outbound`)
//! - Event dispatch to application handlers (`dispatcher`)
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use mqtt_ingest::{ClientConfig, MqttClient, QoS};
//! use std::path::Path;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ClientConfig::load_from_file(Path::new("mqtt-ingest.toml"))?;
//! let mut client = MqttClient::new(config)?;
//!
//! client.subscribe("factory/+/+/telemetry", QoS::AtLeastOnce)?;
//! client.connect().await?;
//! client.publish("factory/B7/line3/presence", "online", QoS::AtLeastOnce)?;
//!
//! client.disconnect().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod observability;
pub mod outbound;
pub mod protocol;
pub mod session;
pub mod subscriptions;
pub mod testing;
pub mod transport;

pub use client::MqttClient;
pub use config::*;
pub use dispatcher::{Event, EventHandler, InboundMessage};
pub use error::{ClientError, ClientResult};
pub use outbound::DeliveryToken;
pub use protocol::{matches, QoS};
pub use session::SessionState;
pub use subscriptions::{AckStatus, Subscription};
