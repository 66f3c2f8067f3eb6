//! MQTT 3.1.1 control packets and their wire codec
//!
//! Encoding and decoding are pure functions over `bytes` buffers, so the same
//! codec serves the client engine and the in-memory test broker.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Protocol name sent in CONNECT
pub const PROTOCOL_NAME: &str = "MQTT";
/// Protocol level for MQTT 3.1.1
pub const PROTOCOL_LEVEL: u8 = 4;
/// Largest remaining length representable by the variable byte integer
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Quality of service levels
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(try_from = "u8", into = "u8")]
pub enum QoS {
    /// At most once
    #[default]
    AtMostOnce = 0,
    /// At least once
    AtLeastOnce = 1,
    /// Exactly once
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(CodecError::InvalidQoS(other)),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        qos as u8
    }
}

impl fmt::Display for QoS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self as u8)
    }
}

/// Wire codec errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Invalid packet type: {0}")]
    InvalidPacketType(u8),
    #[error("Invalid flags {flags:#06b} for packet type {packet_type}")]
    InvalidFlags { packet_type: u8, flags: u8 },
    #[error("Invalid QoS level: {0}")]
    InvalidQoS(u8),
    #[error("Malformed remaining length")]
    MalformedRemainingLength,
    #[error("Packet of {size} bytes exceeds maximum of {max}")]
    PacketTooLarge { size: usize, max: usize },
    #[error("Malformed packet: {0}")]
    Malformed(String),
    #[error("String field is not valid UTF-8")]
    InvalidUtf8,
    #[error("Field of {0} bytes exceeds the 65535 byte limit")]
    FieldTooLong(usize),
    #[error("Unsupported protocol {name:?} level {level}")]
    UnsupportedProtocol { name: String, level: u8 },
    #[error("Packet identifier must be non-zero")]
    ZeroPacketId,
    #[error("QoS {0} publish requires a packet identifier")]
    MissingPacketId(QoS),
}

/// CONNACK return codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectReturnCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadUserNameOrPassword = 4,
    NotAuthorized = 5,
}

impl ConnectReturnCode {
    /// Only "server unavailable" can change on a later attempt
    pub fn is_transient(&self) -> bool {
        matches!(self, ConnectReturnCode::ServerUnavailable)
    }
}

impl TryFrom<u8> for ConnectReturnCode {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ConnectReturnCode::Accepted),
            1 => Ok(ConnectReturnCode::UnacceptableProtocolVersion),
            2 => Ok(ConnectReturnCode::IdentifierRejected),
            3 => Ok(ConnectReturnCode::ServerUnavailable),
            4 => Ok(ConnectReturnCode::BadUserNameOrPassword),
            5 => Ok(ConnectReturnCode::NotAuthorized),
            other => Err(CodecError::Malformed(format!(
                "unknown CONNACK return code {other}"
            ))),
        }
    }
}

impl fmt::Display for ConnectReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ConnectReturnCode::Accepted => "accepted",
            ConnectReturnCode::UnacceptableProtocolVersion => "unacceptable protocol version",
            ConnectReturnCode::IdentifierRejected => "identifier rejected",
            ConnectReturnCode::ServerUnavailable => "server unavailable",
            ConnectReturnCode::BadUserNameOrPassword => "bad user name or password",
            ConnectReturnCode::NotAuthorized => "not authorized",
        };
        f.write_str(text)
    }
}

/// Last will registered with the broker at connect time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub client_id: String,
    pub keep_alive: u16,
    pub clean_session: bool,
    pub will: Option<LastWill>,
    pub username: Option<String>,
    pub password: Option<Bytes>,
}

impl Connect {
    pub fn new(client_id: impl Into<String>, keep_alive: u16) -> Self {
        Self {
            client_id: client_id.into(),
            keep_alive,
            clean_session: true,
            will: None,
            username: None,
            password: None,
        }
    }

    fn write_body(&self, body: &mut BytesMut) -> Result<(), CodecError> {
        write_string(body, PROTOCOL_NAME)?;
        body.put_u8(PROTOCOL_LEVEL);

        let mut flags = 0u8;
        if self.clean_session {
            flags |= 0x02;
        }
        if let Some(will) = &self.will {
            flags |= 0x04 | ((will.qos as u8) << 3);
            if will.retain {
                flags |= 0x20;
            }
        }
        if self.password.is_some() {
            flags |= 0x40;
        }
        if self.username.is_some() {
            flags |= 0x80;
        }
        body.put_u8(flags);
        body.put_u16(self.keep_alive);

        write_string(body, &self.client_id)?;
        if let Some(will) = &self.will {
            write_string(body, &will.topic)?;
            write_bytes(body, &will.payload)?;
        }
        if let Some(username) = &self.username {
            write_string(body, username)?;
        }
        if let Some(password) = &self.password {
            write_bytes(body, password)?;
        }
        Ok(())
    }

    fn read(body: &mut Bytes) -> Result<Self, CodecError> {
        let name = read_string(body)?;
        let level = read_u8(body)?;
        if name != PROTOCOL_NAME || level != PROTOCOL_LEVEL {
            return Err(CodecError::UnsupportedProtocol { name, level });
        }

        let flags = read_u8(body)?;
        if flags & 0x01 != 0 {
            return Err(CodecError::Malformed(
                "reserved CONNECT flag is set".to_string(),
            ));
        }
        let keep_alive = read_u16(body)?;
        let client_id = read_string(body)?;

        let will = if flags & 0x04 != 0 {
            let topic = read_string(body)?;
            let payload = read_bytes(body)?;
            Some(LastWill {
                topic,
                payload,
                qos: QoS::try_from((flags >> 3) & 0x03)?,
                retain: flags & 0x20 != 0,
            })
        } else {
            None
        };
        let username = if flags & 0x80 != 0 {
            Some(read_string(body)?)
        } else {
            None
        };
        let password = if flags & 0x40 != 0 {
            Some(read_bytes(body)?)
        } else {
            None
        };
        finish(body, "CONNECT")?;

        Ok(Self {
            client_id,
            keep_alive,
            clean_session: flags & 0x02 != 0,
            will,
            username,
            password,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    pub session_present: bool,
    pub code: ConnectReturnCode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    pub packet_id: Option<u16>,
    pub payload: Bytes,
}

impl Publish {
    pub fn new(topic: impl Into<String>, qos: QoS, payload: impl Into<Bytes>) -> Self {
        Self {
            dup: false,
            qos,
            retain: false,
            topic: topic.into(),
            packet_id: None,
            payload: payload.into(),
        }
    }

    fn header_byte(&self) -> u8 {
        let mut byte = 0x30 | ((self.qos as u8) << 1);
        if self.dup {
            byte |= 0x08;
        }
        if self.retain {
            byte |= 0x01;
        }
        byte
    }

    fn write_body(&self, body: &mut BytesMut) -> Result<(), CodecError> {
        write_string(body, &self.topic)?;
        if self.qos != QoS::AtMostOnce {
            match self.packet_id {
                Some(0) => return Err(CodecError::ZeroPacketId),
                Some(id) => body.put_u16(id),
                None => return Err(CodecError::MissingPacketId(self.qos)),
            }
        }
        body.extend_from_slice(&self.payload);
        Ok(())
    }

    fn read(flags: u8, body: &mut Bytes) -> Result<Self, CodecError> {
        let qos = QoS::try_from((flags >> 1) & 0x03)?;
        let dup = flags & 0x08 != 0;
        if qos == QoS::AtMostOnce && dup {
            return Err(CodecError::Malformed(
                "DUP flag set on a QoS 0 publish".to_string(),
            ));
        }

        let topic = read_string(body)?;
        let packet_id = if qos == QoS::AtMostOnce {
            None
        } else {
            Some(read_packet_id(body)?)
        };
        let payload = body.split_to(body.len());

        Ok(Self {
            dup,
            qos,
            retain: flags & 0x01 != 0,
            topic,
            packet_id,
            payload,
        })
    }
}

/// A single topic filter inside SUBSCRIBE
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeFilter {
    pub filter: String,
    pub qos: QoS,
}

impl SubscribeFilter {
    pub fn new(filter: impl Into<String>, qos: QoS) -> Self {
        Self {
            filter: filter.into(),
            qos,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub filters: Vec<SubscribeFilter>,
}

impl Subscribe {
    fn write_body(&self, body: &mut BytesMut) -> Result<(), CodecError> {
        if self.filters.is_empty() {
            return Err(CodecError::Malformed(
                "SUBSCRIBE needs at least one filter".to_string(),
            ));
        }
        write_packet_id(body, self.packet_id)?;
        for entry in &self.filters {
            write_string(body, &entry.filter)?;
            body.put_u8(entry.qos as u8);
        }
        Ok(())
    }

    fn read(body: &mut Bytes) -> Result<Self, CodecError> {
        let packet_id = read_packet_id(body)?;
        let mut filters = Vec::new();
        while body.has_remaining() {
            let filter = read_string(body)?;
            let options = read_u8(body)?;
            if options & 0xFC != 0 {
                return Err(CodecError::Malformed(
                    "reserved SUBSCRIBE option bits are set".to_string(),
                ));
            }
            filters.push(SubscribeFilter {
                filter,
                qos: QoS::try_from(options)?,
            });
        }
        if filters.is_empty() {
            return Err(CodecError::Malformed(
                "SUBSCRIBE without filters".to_string(),
            ));
        }
        Ok(Self { packet_id, filters })
    }
}

/// Per-filter result carried by SUBACK
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeReturnCode {
    Success(QoS),
    Failure,
}

impl SubscribeReturnCode {
    fn to_byte(self) -> u8 {
        match self {
            SubscribeReturnCode::Success(qos) => qos as u8,
            SubscribeReturnCode::Failure => 0x80,
        }
    }

    fn from_byte(byte: u8) -> Result<Self, CodecError> {
        match byte {
            0x80 => Ok(SubscribeReturnCode::Failure),
            other => QoS::try_from(other).map(SubscribeReturnCode::Success),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub packet_id: u16,
    pub return_codes: Vec<SubscribeReturnCode>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub filters: Vec<String>,
}

impl Unsubscribe {
    fn write_body(&self, body: &mut BytesMut) -> Result<(), CodecError> {
        if self.filters.is_empty() {
            return Err(CodecError::Malformed(
                "UNSUBSCRIBE needs at least one filter".to_string(),
            ));
        }
        write_packet_id(body, self.packet_id)?;
        for filter in &self.filters {
            write_string(body, filter)?;
        }
        Ok(())
    }

    fn read(body: &mut Bytes) -> Result<Self, CodecError> {
        let packet_id = read_packet_id(body)?;
        let mut filters = Vec::new();
        while body.has_remaining() {
            filters.push(read_string(body)?);
        }
        if filters.is_empty() {
            return Err(CodecError::Malformed(
                "UNSUBSCRIBE without filters".to_string(),
            ));
        }
        Ok(Self { packet_id, filters })
    }
}

/// MQTT control packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(u16),
    PubRec(u16),
    PubRel(u16),
    PubComp(u16),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(u16),
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet {
    /// Packet name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Packet::Connect(_) => "CONNECT",
            Packet::ConnAck(_) => "CONNACK",
            Packet::Publish(_) => "PUBLISH",
            Packet::PubAck(_) => "PUBACK",
            Packet::PubRec(_) => "PUBREC",
            Packet::PubRel(_) => "PUBREL",
            Packet::PubComp(_) => "PUBCOMP",
            Packet::Subscribe(_) => "SUBSCRIBE",
            Packet::SubAck(_) => "SUBACK",
            Packet::Unsubscribe(_) => "UNSUBSCRIBE",
            Packet::UnsubAck(_) => "UNSUBACK",
            Packet::PingReq => "PINGREQ",
            Packet::PingResp => "PINGRESP",
            Packet::Disconnect => "DISCONNECT",
        }
    }

    /// Append the encoded packet to `buf`, returning the number of bytes written
    pub fn encode(&self, buf: &mut BytesMut) -> Result<usize, CodecError> {
        let mut body = BytesMut::new();
        let header = match self {
            Packet::Connect(connect) => {
                connect.write_body(&mut body)?;
                0x10
            }
            Packet::ConnAck(ack) => {
                body.put_u8(u8::from(ack.session_present));
                body.put_u8(ack.code as u8);
                0x20
            }
            Packet::Publish(publish) => {
                publish.write_body(&mut body)?;
                publish.header_byte()
            }
            Packet::PubAck(id) => {
                write_packet_id(&mut body, *id)?;
                0x40
            }
            Packet::PubRec(id) => {
                write_packet_id(&mut body, *id)?;
                0x50
            }
            Packet::PubRel(id) => {
                write_packet_id(&mut body, *id)?;
                0x62
            }
            Packet::PubComp(id) => {
                write_packet_id(&mut body, *id)?;
                0x70
            }
            Packet::Subscribe(subscribe) => {
                subscribe.write_body(&mut body)?;
                0x82
            }
            Packet::SubAck(ack) => {
                write_packet_id(&mut body, ack.packet_id)?;
                for code in &ack.return_codes {
                    body.put_u8(code.to_byte());
                }
                0x90
            }
            Packet::Unsubscribe(unsubscribe) => {
                unsubscribe.write_body(&mut body)?;
                0xA2
            }
            Packet::UnsubAck(id) => {
                write_packet_id(&mut body, *id)?;
                0xB0
            }
            Packet::PingReq => 0xC0,
            Packet::PingResp => 0xD0,
            Packet::Disconnect => 0xE0,
        };

        if body.len() > MAX_REMAINING_LENGTH {
            return Err(CodecError::PacketTooLarge {
                size: body.len(),
                max: MAX_REMAINING_LENGTH,
            });
        }

        let start = buf.len();
        buf.reserve(body.len() + 5);
        buf.put_u8(header);
        write_remaining_length(buf, body.len());
        buf.extend_from_slice(&body);
        Ok(buf.len() - start)
    }

    /// Decode one packet from the front of `buf`.
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a complete frame;
    /// the consumed bytes are removed from `buf` only on success.
    pub fn decode(buf: &mut BytesMut, max_packet_size: usize) -> Result<Option<Packet>, CodecError> {
        let Some((header_len, remaining)) = parse_fixed_header(&buf[..])? else {
            return Ok(None);
        };

        let total = header_len + remaining;
        if total > max_packet_size {
            return Err(CodecError::PacketTooLarge {
                size: total,
                max: max_packet_size,
            });
        }
        if buf.len() < total {
            buf.reserve(total - buf.len());
            return Ok(None);
        }

        let frame = buf.split_to(total).freeze();
        let first = frame[0];
        let mut body = frame.slice(header_len..);
        decode_body(first, &mut body).map(Some)
    }
}

fn decode_body(first: u8, body: &mut Bytes) -> Result<Packet, CodecError> {
    let packet_type = first >> 4;
    let flags = first & 0x0F;

    let packet = match packet_type {
        1 => {
            expect_flags(packet_type, flags, 0x00)?;
            Packet::Connect(Connect::read(body)?)
        }
        2 => {
            expect_flags(packet_type, flags, 0x00)?;
            let ack_flags = read_u8(body)?;
            if ack_flags & 0xFE != 0 {
                return Err(CodecError::Malformed(
                    "reserved CONNACK flags are set".to_string(),
                ));
            }
            let code = ConnectReturnCode::try_from(read_u8(body)?)?;
            finish(body, "CONNACK")?;
            Packet::ConnAck(ConnAck {
                session_present: ack_flags & 0x01 != 0,
                code,
            })
        }
        3 => Packet::Publish(Publish::read(flags, body)?),
        4 => Packet::PubAck(read_ack(packet_type, flags, 0x00, body)?),
        5 => Packet::PubRec(read_ack(packet_type, flags, 0x00, body)?),
        6 => Packet::PubRel(read_ack(packet_type, flags, 0x02, body)?),
        7 => Packet::PubComp(read_ack(packet_type, flags, 0x00, body)?),
        8 => {
            expect_flags(packet_type, flags, 0x02)?;
            Packet::Subscribe(Subscribe::read(body)?)
        }
        9 => {
            expect_flags(packet_type, flags, 0x00)?;
            let packet_id = read_packet_id(body)?;
            let mut return_codes = Vec::with_capacity(body.len());
            while body.has_remaining() {
                return_codes.push(SubscribeReturnCode::from_byte(body.get_u8())?);
            }
            Packet::SubAck(SubAck {
                packet_id,
                return_codes,
            })
        }
        10 => {
            expect_flags(packet_type, flags, 0x02)?;
            Packet::Unsubscribe(Unsubscribe::read(body)?)
        }
        11 => Packet::UnsubAck(read_ack(packet_type, flags, 0x00, body)?),
        12 | 13 | 14 => {
            expect_flags(packet_type, flags, 0x00)?;
            let packet = match packet_type {
                12 => Packet::PingReq,
                13 => Packet::PingResp,
                _ => Packet::Disconnect,
            };
            finish(body, packet.name())?;
            packet
        }
        other => return Err(CodecError::InvalidPacketType(other)),
    };

    Ok(packet)
}

/// Parse the fixed header, returning (header length, remaining length)
fn parse_fixed_header(src: &[u8]) -> Result<Option<(usize, usize)>, CodecError> {
    if src.len() < 2 {
        return Ok(None);
    }

    let mut value = 0usize;
    let mut multiplier = 1usize;
    for (index, byte) in src[1..].iter().enumerate() {
        if index == 4 {
            return Err(CodecError::MalformedRemainingLength);
        }
        value += usize::from(byte & 0x7F) * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some((index + 2, value)));
        }
        multiplier *= 128;
    }
    Ok(None)
}

fn write_remaining_length(buf: &mut BytesMut, mut len: usize) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if len == 0 {
            break;
        }
    }
}

fn expect_flags(packet_type: u8, flags: u8, expected: u8) -> Result<(), CodecError> {
    if flags == expected {
        Ok(())
    } else {
        Err(CodecError::InvalidFlags { packet_type, flags })
    }
}

fn read_ack(packet_type: u8, flags: u8, expected: u8, body: &mut Bytes) -> Result<u16, CodecError> {
    expect_flags(packet_type, flags, expected)?;
    let id = read_packet_id(body)?;
    finish(body, "acknowledgment")?;
    Ok(id)
}

fn finish(body: &Bytes, what: &str) -> Result<(), CodecError> {
    if body.has_remaining() {
        Err(CodecError::Malformed(format!(
            "{} trailing bytes after {what}",
            body.remaining()
        )))
    } else {
        Ok(())
    }
}

fn truncated() -> CodecError {
    CodecError::Malformed("packet body truncated".to_string())
}

fn read_u8(body: &mut Bytes) -> Result<u8, CodecError> {
    if body.remaining() < 1 {
        return Err(truncated());
    }
    Ok(body.get_u8())
}

fn read_u16(body: &mut Bytes) -> Result<u16, CodecError> {
    if body.remaining() < 2 {
        return Err(truncated());
    }
    Ok(body.get_u16())
}

fn read_packet_id(body: &mut Bytes) -> Result<u16, CodecError> {
    match read_u16(body)? {
        0 => Err(CodecError::ZeroPacketId),
        id => Ok(id),
    }
}

fn read_bytes(body: &mut Bytes) -> Result<Bytes, CodecError> {
    let len = usize::from(read_u16(body)?);
    if body.remaining() < len {
        return Err(truncated());
    }
    Ok(body.split_to(len))
}

fn read_string(body: &mut Bytes) -> Result<String, CodecError> {
    let raw = read_bytes(body)?;
    String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidUtf8)
}

fn write_packet_id(body: &mut BytesMut, id: u16) -> Result<(), CodecError> {
    if id == 0 {
        return Err(CodecError::ZeroPacketId);
    }
    body.put_u16(id);
    Ok(())
}

fn write_bytes(body: &mut BytesMut, data: &[u8]) -> Result<(), CodecError> {
    let len = u16::try_from(data.len()).map_err(|_| CodecError::FieldTooLong(data.len()))?;
    body.put_u16(len);
    body.extend_from_slice(data);
    Ok(())
}

fn write_string(body: &mut BytesMut, value: &str) -> Result<(), CodecError> {
    write_bytes(body, value.as_bytes())
}
