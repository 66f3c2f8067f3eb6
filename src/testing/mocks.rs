//! In-memory broker doubles
//!
//! [`MockConnector`] hands the client one end of a `tokio::io::duplex` pipe per
//! connection attempt; [`MockBroker`] holds the other end and speaks the
//! crate's own codec, so tests drive the full engine without a network.

use crate::dispatcher::{EventHandler, InboundMessage};
use crate::error::ClientError;
use crate::protocol::{ConnAck, Connect, ConnectReturnCode, Packet};
use crate::transport::{BoxedStream, Connector, TransportError};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

const PIPE_CAPACITY: usize = 64 * 1024;
const MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Default wait used by [`MockBroker`] receive helpers
pub const DEFAULT_WAIT: Duration = Duration::from_secs(5);

/// Scripted outcome of one connection attempt
#[derive(Debug, Clone)]
pub enum MockFailure {
    /// TLS handshake rejected, e.g. an untrusted certificate
    Handshake(String),
    /// TCP connect refused
    Unreachable,
    /// Never completes; the client's connect timeout has to fire
    Hang,
}

#[derive(Debug, Default)]
struct ConnectorState {
    failures: VecDeque<MockFailure>,
    attempts: usize,
}

/// Connector whose streams end up at a [`MockBroker`]
#[derive(Clone)]
pub struct MockConnector {
    state: Arc<Mutex<ConnectorState>>,
    incoming: mpsc::UnboundedSender<DuplexStream>,
}

impl MockConnector {
    pub fn pair() -> (MockConnector, MockBroker) {
        let state = Arc::new(Mutex::new(ConnectorState::default()));
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        (
            MockConnector {
                state: state.clone(),
                incoming: incoming_tx,
            },
            MockBroker {
                incoming: incoming_rx,
                stream: None,
                buffer: BytesMut::new(),
                state,
            },
        )
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<BoxedStream, TransportError> {
        let failure = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.attempts += 1;
            state.failures.pop_front()
        };

        match failure {
            Some(MockFailure::Handshake(reason)) => Err(TransportError::Handshake(reason)),
            Some(MockFailure::Unreachable) => Err(TransportError::Network(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "broker unreachable",
            ))),
            Some(MockFailure::Hang) => loop {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            },
            None => {
                let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
                self.incoming.send(server).map_err(|_| {
                    TransportError::Network(io::Error::new(
                        io::ErrorKind::ConnectionRefused,
                        "mock broker dropped",
                    ))
                })?;
                Ok(Box::new(client))
            }
        }
    }

    fn describe(&self) -> String {
        "mock://broker".to_string()
    }
}

/// Broker side of a [`MockConnector`]
pub struct MockBroker {
    incoming: mpsc::UnboundedReceiver<DuplexStream>,
    stream: Option<DuplexStream>,
    buffer: BytesMut,
    state: Arc<Mutex<ConnectorState>>,
}

impl MockBroker {
    /// Script the outcome of the next connection attempt; failures queue up in order
    pub fn fail_next_connect(&self, failure: MockFailure) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .failures
            .push_back(failure);
    }

    pub fn connect_attempts(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .attempts
    }

    /// Take the next incoming connection and read its CONNECT
    pub async fn accept_connect(&mut self) -> Option<Connect> {
        let stream = tokio::time::timeout(DEFAULT_WAIT, self.incoming.recv())
            .await
            .ok()??;
        self.stream = Some(stream);
        self.buffer.clear();

        match self.recv().await? {
            Packet::Connect(connect) => Some(connect),
            _ => None,
        }
    }

    /// Accept the pending CONNECT
    pub async fn ack_connect(&mut self) {
        self.send(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Accepted,
        }))
        .await;
    }

    pub async fn refuse_connect(&mut self, code: ConnectReturnCode) {
        self.send(Packet::ConnAck(ConnAck {
            session_present: false,
            code,
        }))
        .await;
    }

    /// Accept the next connection and complete its CONNECT/CONNACK exchange
    pub async fn handshake(&mut self) -> Option<Connect> {
        let connect = self.accept_connect().await?;
        self.ack_connect().await;
        Some(connect)
    }

    pub async fn send(&mut self, packet: Packet) {
        let mut encoded = BytesMut::new();
        if packet.encode(&mut encoded).is_ok() {
            self.send_raw(&encoded).await;
        }
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.adopt_pending();
        if let Some(stream) = self.stream.as_mut() {
            let _ = stream.write_all(bytes).await;
        }
    }

    /// Next packet from the client, answering PINGREQ along the way
    pub async fn recv(&mut self) -> Option<Packet> {
        self.recv_timeout(DEFAULT_WAIT).await
    }

    /// `None` on timeout or when the client closed the connection
    pub async fn recv_timeout(&mut self, wait: Duration) -> Option<Packet> {
        let deadline = Instant::now() + wait;
        loop {
            match self.read_packet(deadline).await? {
                Packet::PingReq => self.send(Packet::PingResp).await,
                packet => return Some(packet),
            }
        }
    }

    /// Like [`recv_timeout`](Self::recv_timeout) but PINGREQ is returned, not answered
    pub async fn recv_raw_timeout(&mut self, wait: Duration) -> Option<Packet> {
        self.read_packet(Instant::now() + wait).await
    }

    /// Pick up a connection opened without [`accept_connect`](Self::accept_connect)
    fn adopt_pending(&mut self) {
        if self.stream.is_none() {
            if let Ok(stream) = self.incoming.try_recv() {
                self.stream = Some(stream);
                self.buffer.clear();
            }
        }
    }

    async fn read_packet(&mut self, deadline: Instant) -> Option<Packet> {
        self.adopt_pending();
        loop {
            if let Ok(Some(packet)) = Packet::decode(&mut self.buffer, MAX_PACKET_SIZE) {
                return Some(packet);
            }
            let stream = self.stream.as_mut()?;
            match tokio::time::timeout_at(deadline, stream.read_buf(&mut self.buffer)).await {
                Ok(Ok(0)) | Ok(Err(_)) | Err(_) => return None,
                Ok(Ok(_)) => {}
            }
        }
    }

    /// True once the client side has closed the current connection
    pub async fn wait_closed(&mut self, wait: Duration) -> bool {
        let deadline = Instant::now() + wait;
        let Some(stream) = self.stream.as_mut() else {
            return true;
        };
        let mut scratch = [0u8; 1024];
        loop {
            match tokio::time::timeout_at(deadline, stream.read(&mut scratch)).await {
                Ok(Ok(0)) | Ok(Err(_)) => return true,
                Ok(Ok(_)) => {}
                Err(_) => return false,
            }
        }
    }

    /// Simulate a network drop of the current connection
    pub fn drop_connection(&mut self) {
        self.stream = None;
        self.buffer.clear();
    }
}

/// What a [`RecordingHandler`] saw
#[derive(Debug, Clone)]
pub enum Recorded {
    Connected(bool),
    Disconnected { reason: String, will_reconnect: bool },
    Message { filter: String, topic: String, payload: Bytes },
    Error(ClientError),
}

/// Event handler that records every callback for later assertions
#[derive(Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<Recorded>>,
    notify: Notify,
    /// Delay applied inside `on_message`, to simulate slow consumers
    message_delay: Option<Duration>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_message_delay(delay: Duration) -> Self {
        Self {
            message_delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn events(&self) -> Vec<Recorded> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn messages(&self) -> Vec<(String, String, Bytes)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Recorded::Message {
                    filter,
                    topic,
                    payload,
                } => Some((filter, topic, payload)),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<ClientError> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Recorded::Error(error) => Some(error),
                _ => None,
            })
            .collect()
    }

    /// Wait until `predicate` holds for the recorded events
    pub async fn wait_for<F>(&self, wait: Duration, predicate: F) -> bool
    where
        F: Fn(&[Recorded]) -> bool,
    {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            if predicate(&self.events()) {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return predicate(&self.events());
            }
        }
    }

    fn record(&self, event: Recorded) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
        self.notify.notify_waiters();
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn on_connect(&self, session_present: bool) {
        self.record(Recorded::Connected(session_present));
    }

    async fn on_disconnect(&self, reason: &str, will_reconnect: bool) {
        self.record(Recorded::Disconnected {
            reason: reason.to_string(),
            will_reconnect,
        });
    }

    async fn on_message(&self, filter: &str, message: &InboundMessage) {
        if let Some(delay) = self.message_delay {
            tokio::time::sleep(delay).await;
        }
        self.record(Recorded::Message {
            filter: filter.to_string(),
            topic: message.topic.clone(),
            payload: message.payload.clone(),
        });
    }

    async fn on_error(&self, error: &ClientError) {
        self.record(Recorded::Error(error.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_failures_apply_in_order() {
        let (connector, broker) = MockConnector::pair();
        broker.fail_next_connect(MockFailure::Unreachable);
        broker.fail_next_connect(MockFailure::Handshake("unknown ca".to_string()));

        assert!(matches!(
            connector.connect().await,
            Err(TransportError::Network(_))
        ));
        assert!(matches!(
            connector.connect().await,
            Err(TransportError::Handshake(_))
        ));
        assert!(connector.connect().await.is_ok());
        assert_eq!(broker.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn test_broker_answers_pings() {
        // Arrange
        let (connector, mut broker) = MockConnector::pair();
        let mut client = connector.connect().await.unwrap();
        let mut encoded = BytesMut::new();
        Packet::Connect(Connect::new("pinger", 30))
            .encode(&mut encoded)
            .unwrap();
        Packet::PingReq.encode(&mut encoded).unwrap();

        // Act
        client.write_all(&encoded).await.unwrap();
        let connect = broker.accept_connect().await;
        let next = broker.recv_timeout(Duration::from_millis(50)).await;

        // Assert
        assert_eq!(connect.map(|c| c.client_id), Some("pinger".to_string()));
        assert_eq!(next, None, "PINGREQ is answered, not returned");
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0xD0, 0x00]);
    }

    #[tokio::test]
    async fn test_recording_handler_wait_for() {
        let handler = Arc::new(RecordingHandler::new());
        let background = handler.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            background.on_connect(true).await;
        });

        let seen = handler
            .wait_for(Duration::from_secs(1), |events| {
                matches!(events, [Recorded::Connected(true)])
            })
            .await;
        assert!(seen);
    }
}
