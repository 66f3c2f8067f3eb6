//! Transport layer: byte streams to the broker and MQTT framing on top of them
//!
//! A [`Connector`] produces an encrypted byte stream; [`connect`] runs the
//! CONNECT/CONNACK exchange over it and hands back a framed [`Connection`].

use crate::protocol::{CodecError, ConnectReturnCode};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

pub mod connection;
pub mod tls;

pub use connection::{connect, ConnectOptions, Connection, PacketReader, PacketWriter};
pub use tls::TlsConnector;

/// Any bidirectional async byte stream
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Owned, type-erased stream handed out by connectors
pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens byte streams to the broker
///
/// Production uses [`TlsConnector`]; tests substitute an in-memory connector.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    /// Open a new stream, including any TLS handshake
    async fn connect(&self) -> Result<BoxedStream, TransportError>;

    /// Human readable endpoint for logs
    fn describe(&self) -> String;
}

/// Transport-level failures
#[derive(Debug, Error)]
pub enum TransportError {
    /// Certificate mismatch or trust failure
    #[error("TLS handshake failed: {0}")]
    Handshake(String),
    #[error("Timed out {0}")]
    Timeout(String),
    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),
    #[error("Protocol error: {0}")]
    Protocol(#[from] CodecError),
    #[error("Broker refused the connection: {0}")]
    Refused(ConnectReturnCode),
    #[error("Connection closed by peer")]
    Closed,
}
