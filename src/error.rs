//! Client error taxonomy
//!
//! Every failure the application can observe, either as a synchronous return
//! value or through `EventHandler::on_error`, is a `ClientError`. The
//! retry policy of the session supervisor is encoded in [`ClientError::is_retryable`].

use crate::config::ConfigError;
use crate::protocol::{CodecError, ConnectReturnCode, TopicError};
use crate::transport::TransportError;
use std::sync::Arc;
use thiserror::Error;

/// Main error type for client operations
///
/// Cloneable so one failure can be reported both to the caller of
/// `MqttClient::connect` and to every registered error handler.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// Certificate or trust failure during the TLS handshake
    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    /// QoS retry budget exhausted
    #[error("Delivery of packet {packet_id} to '{topic}' failed after {attempts} attempts")]
    Delivery {
        topic: String,
        packet_id: u16,
        attempts: u32,
    },

    /// QoS 2 publish accepted with PUBREC but the PUBREL was never confirmed
    #[error("Packet {packet_id} to '{topic}' was accepted but its release was never confirmed")]
    ReleaseUnconfirmed { topic: String, packet_id: u16 },

    #[error("Outbound queue is full (capacity {capacity})")]
    Backpressure { capacity: usize },

    #[error("Protocol error: {0}")]
    Protocol(#[from] CodecError),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Broker refused the connection: {0}")]
    Refused(ConnectReturnCode),

    #[error("Invalid topic: {0}")]
    InvalidTopic(#[from] TopicError),

    #[error("Broker rejected subscription to '{filter}'")]
    SubscriptionRejected { filter: String },

    #[error("Client is shutting down")]
    ShuttingDown,

    #[error("Configuration error: {0}")]
    Config(Arc<ConfigError>),
}

impl ClientError {
    /// Whether the supervisor should back off and reconnect after this error
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Timeout(_) | ClientError::Network(_) | ClientError::Protocol(_) => true,
            ClientError::Refused(code) => code.is_transient(),
            ClientError::Handshake(_)
            | ClientError::Delivery { .. }
            | ClientError::ReleaseUnconfirmed { .. }
            | ClientError::Backpressure { .. }
            | ClientError::InvalidTopic(_)
            | ClientError::SubscriptionRejected { .. }
            | ClientError::ShuttingDown
            | ClientError::Config(_) => false,
        }
    }

    /// Create network error
    pub fn network<S: Into<String>>(message: S) -> Self {
        Self::Network(message.into())
    }

    /// Create timeout error
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        Self::Timeout(message.into())
    }
}

impl From<ConfigError> for ClientError {
    fn from(err: ConfigError) -> Self {
        ClientError::Config(Arc::new(err))
    }
}

impl From<TransportError> for ClientError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Handshake(message) => ClientError::Handshake(message),
            TransportError::Timeout(message) => ClientError::Timeout(message),
            TransportError::Network(io) => ClientError::Network(io.to_string()),
            TransportError::Protocol(codec) => ClientError::Protocol(codec),
            TransportError::Refused(code) => ClientError::Refused(code),
            TransportError::Closed => ClientError::Network("connection closed by peer".to_string()),
        }
    }
}

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;
