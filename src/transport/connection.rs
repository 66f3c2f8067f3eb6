//! Framed MQTT connection over a connector stream

use super::{BoxedStream, Connector, TransportError};
use crate::protocol::{CodecError, Connect, ConnectReturnCode, LastWill, Packet};
use bytes::BytesMut;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::{debug, trace};

const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Parameters of the CONNECT exchange
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub client_id: String,
    pub keep_alive_secs: u16,
    pub clean_session: bool,
    pub will: Option<LastWill>,
    /// Bounds the stream setup (TCP connect plus TLS handshake) and the CONNACK wait
    pub connect_timeout: Duration,
    pub max_packet_size: usize,
}

impl ConnectOptions {
    /// Longest a single packet write may stall before the link counts as dead:
    /// the keepalive interval, or the connect timeout when keepalive is off
    pub fn write_timeout(&self) -> Duration {
        match self.keep_alive_secs {
            0 => self.connect_timeout,
            secs => Duration::from_secs(u64::from(secs)),
        }
    }
}

/// Read half of a connection; decodes packets from the socket
pub struct PacketReader {
    stream: ReadHalf<BoxedStream>,
    buffer: BytesMut,
    max_packet_size: usize,
}

impl PacketReader {
    /// Read until one complete packet has been framed
    pub async fn next_packet(&mut self) -> Result<Packet, TransportError> {
        loop {
            if let Some(packet) = Packet::decode(&mut self.buffer, self.max_packet_size)? {
                trace!(target: "mqtt_transport", packet = packet.name(), "received");
                return Ok(packet);
            }
            // read_buf is cancel safe, a timed out read loses no bytes
            if self.stream.read_buf(&mut self.buffer).await? == 0 {
                return Err(TransportError::Closed);
            }
        }
    }

    /// Like [`next_packet`](Self::next_packet) but gives up after `timeout`,
    /// returning `Ok(None)` with any partial frame kept for the next call
    pub async fn receive(&mut self, timeout: Duration) -> Result<Option<Packet>, TransportError> {
        match tokio::time::timeout(timeout, self.next_packet()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }
}

/// Write half of a connection; encodes packets onto the socket
pub struct PacketWriter {
    stream: WriteHalf<BoxedStream>,
    buffer: BytesMut,
    write_timeout: Duration,
}

impl PacketWriter {
    /// Encode and write one packet; a peer that stops reading fails the
    /// write with [`TransportError::Timeout`] once `write_timeout` passes
    pub async fn send(&mut self, packet: &Packet) -> Result<(), TransportError> {
        self.buffer.clear();
        packet.encode(&mut self.buffer)?;

        let Self {
            stream,
            buffer,
            write_timeout,
        } = self;
        let write = async {
            stream.write_all(&buffer[..]).await?;
            stream.flush().await
        };
        tokio::time::timeout(*write_timeout, write)
            .await
            .map_err(|_| {
                TransportError::Timeout(format!(
                    "writing {} after {}ms",
                    packet.name(),
                    write_timeout.as_millis()
                ))
            })??;

        trace!(target: "mqtt_transport", packet = packet.name(), bytes = self.buffer.len(), "sent");
        Ok(())
    }

    /// Send DISCONNECT best effort and shut the socket down
    pub async fn close(mut self) {
        if let Err(e) = self.send(&Packet::Disconnect).await {
            debug!(target: "mqtt_transport", error = %e, "DISCONNECT not delivered");
            return;
        }
        match tokio::time::timeout(self.write_timeout, self.stream.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(target: "mqtt_transport", error = %e, "socket shutdown failed"),
            Err(_) => debug!(target: "mqtt_transport", "socket shutdown timed out"),
        }
    }
}

/// Live MQTT connection; the socket is released when both halves are dropped
pub struct Connection {
    reader: PacketReader,
    writer: PacketWriter,
    session_present: bool,
}

impl Connection {
    pub fn new(stream: BoxedStream, max_packet_size: usize) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: PacketReader {
                stream: read_half,
                buffer: BytesMut::with_capacity(4096),
                max_packet_size,
            },
            writer: PacketWriter {
                stream: write_half,
                buffer: BytesMut::with_capacity(4096),
                write_timeout: DEFAULT_WRITE_TIMEOUT,
            },
            session_present: false,
        }
    }

    /// Bound every later packet write by `timeout`
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.writer.write_timeout = timeout;
        self
    }

    /// Session-present flag from the CONNACK
    pub fn session_present(&self) -> bool {
        self.session_present
    }

    pub async fn send(&mut self, packet: &Packet) -> Result<(), TransportError> {
        self.writer.send(packet).await
    }

    pub async fn receive(&mut self, timeout: Duration) -> Result<Option<Packet>, TransportError> {
        self.reader.receive(timeout).await
    }

    /// Send DISCONNECT best effort and release the socket
    pub async fn close(self) {
        let Connection { reader, writer, .. } = self;
        writer.close().await;
        drop(reader);
    }

    /// Split so the read loop and the write path can each own one half
    pub fn into_split(self) -> (PacketReader, PacketWriter) {
        (self.reader, self.writer)
    }
}

/// Open a stream through `connector` and perform the CONNECT/CONNACK exchange
pub async fn connect(
    connector: &dyn Connector,
    options: &ConnectOptions,
) -> Result<Connection, TransportError> {
    let timeout_ms = options.connect_timeout.as_millis();

    let stream = tokio::time::timeout(options.connect_timeout, connector.connect())
        .await
        .map_err(|_| {
            TransportError::Timeout(format!(
                "opening {} after {timeout_ms}ms",
                connector.describe()
            ))
        })??;

    let mut connection = Connection::new(stream, options.max_packet_size)
        .with_write_timeout(options.write_timeout());
    let connect = Connect {
        client_id: options.client_id.clone(),
        keep_alive: options.keep_alive_secs,
        clean_session: options.clean_session,
        will: options.will.clone(),
        username: None,
        password: None,
    };
    connection.send(&Packet::Connect(connect)).await?;
    debug!(
        target: "mqtt_transport",
        client_id = %options.client_id,
        keep_alive = options.keep_alive_secs,
        "CONNECT sent"
    );

    match connection.receive(options.connect_timeout).await? {
        Some(Packet::ConnAck(ack)) if ack.code == ConnectReturnCode::Accepted => {
            connection.session_present = ack.session_present;
            Ok(connection)
        }
        Some(Packet::ConnAck(ack)) => Err(TransportError::Refused(ack.code)),
        Some(other) => Err(TransportError::Protocol(CodecError::Malformed(format!(
            "expected CONNACK, received {}",
            other.name()
        )))),
        None => Err(TransportError::Timeout(format!(
            "waiting for CONNACK after {timeout_ms}ms"
        ))),
    }
}
