//! Outbound queue and in-flight delivery tracking
//!
//! Publishes enter a bounded channel and fail fast with backpressure when it
//! is full. The session supervisor drains the channel, assigns packet
//! identifiers and owns every [`PendingDelivery`] until it is acknowledged.

use crate::error::{ClientError, ClientResult};
use crate::protocol::{Packet, Publish, QoS, SubscribeFilter};
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

type DeliveryCompletion = oneshot::Sender<ClientResult<()>>;

/// A publish waiting in the outbound queue
#[derive(Debug)]
pub struct OutboundRequest {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    /// Connection epoch a QoS 0 request may be sent on; ignored for QoS 1/2
    pub epoch: u64,
    pub enqueued_at: Instant,
    /// Settled once the publish is written (QoS 0), acknowledged or failed
    pub completion: Option<DeliveryCompletion>,
}

impl OutboundRequest {
    /// Attach a completion channel and hand back its receiving end
    pub fn tracked(mut self) -> (Self, DeliveryToken) {
        let (sender, receiver) = oneshot::channel();
        self.completion = Some(sender);
        (self, DeliveryToken { receiver })
    }

    pub fn settle(&mut self, result: ClientResult<()>) {
        settle(&mut self.completion, result);
    }
}

fn settle(completion: &mut Option<DeliveryCompletion>, result: ClientResult<()>) {
    if let Some(sender) = completion.take() {
        // Receiver gone means nobody is waiting
        let _ = sender.send(result);
    }
}

/// Completion handle for a single publish
#[derive(Debug)]
pub struct DeliveryToken {
    receiver: oneshot::Receiver<ClientResult<()>>,
}

impl DeliveryToken {
    /// Wait for the publish to settle
    ///
    /// QoS 0 settles once written to the socket, QoS 1 on PUBACK and QoS 2
    /// once the broker accepted it with PUBREC. A publish abandoned at
    /// shutdown resolves to [`ClientError::ShuttingDown`].
    pub async fn wait(self) -> ClientResult<()> {
        self.receiver
            .await
            .unwrap_or(Err(ClientError::ShuttingDown))
    }
}

/// Subscription changes for the current connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Subscribe {
        filters: Vec<SubscribeFilter>,
        epoch: u64,
    },
    Unsubscribe {
        filters: Vec<String>,
        epoch: u64,
    },
}

impl ControlCommand {
    pub fn epoch(&self) -> u64 {
        match self {
            ControlCommand::Subscribe { epoch, .. } | ControlCommand::Unsubscribe { epoch, .. } => {
                *epoch
            }
        }
    }
}

/// Producer side of the bounded outbound queue
#[derive(Debug, Clone)]
pub struct OutboundQueue {
    sender: mpsc::Sender<OutboundRequest>,
    capacity: usize,
}

impl OutboundQueue {
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<OutboundRequest>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender, capacity }, receiver)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of requests currently waiting
    pub fn len(&self) -> usize {
        self.capacity - self.sender.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue without waiting
    pub fn try_enqueue(&self, request: OutboundRequest) -> Result<(), ClientError> {
        self.sender.try_send(request).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ClientError::Backpressure {
                capacity: self.capacity,
            },
            mpsc::error::TrySendError::Closed(_) => ClientError::ShuttingDown,
        })
    }
}

/// Where a QoS 1/2 delivery is in its acknowledgment flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPhase {
    AwaitingPubAck,
    AwaitingPubRec,
    AwaitingPubComp,
}

/// A QoS 1/2 publish that has not been fully acknowledged
#[derive(Debug)]
pub struct PendingDelivery {
    pub packet_id: u16,
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    /// Retransmissions so far
    pub retries: u32,
    pub enqueued_at: Instant,
    pub last_sent: Option<Instant>,
    pub phase: DeliveryPhase,
    completion: Option<DeliveryCompletion>,
}

impl PendingDelivery {
    pub fn new(packet_id: u16, request: OutboundRequest) -> Self {
        let phase = if request.qos == QoS::ExactlyOnce {
            DeliveryPhase::AwaitingPubRec
        } else {
            DeliveryPhase::AwaitingPubAck
        };
        Self {
            packet_id,
            topic: request.topic,
            payload: request.payload,
            qos: request.qos,
            retain: request.retain,
            retries: 0,
            enqueued_at: request.enqueued_at,
            last_sent: None,
            phase,
            completion: request.completion,
        }
    }

    /// Resolve the publisher's [`DeliveryToken`], if any; later calls are no-ops
    pub fn settle(&mut self, result: ClientResult<()>) {
        settle(&mut self.completion, result);
    }

    /// Packet to put on the wire for this delivery's current phase
    pub fn to_packet(&self, dup: bool) -> Packet {
        match self.phase {
            DeliveryPhase::AwaitingPubComp => Packet::PubRel(self.packet_id),
            DeliveryPhase::AwaitingPubAck | DeliveryPhase::AwaitingPubRec => {
                Packet::Publish(Publish {
                    dup,
                    qos: self.qos,
                    retain: self.retain,
                    topic: self.topic.clone(),
                    packet_id: Some(self.packet_id),
                    payload: self.payload.clone(),
                })
            }
        }
    }

    /// Unacknowledged for longer than `retry_interval` since the last send
    pub fn is_due(&self, now: Instant, retry_interval: Duration) -> bool {
        self.last_sent
            .is_some_and(|sent| now.saturating_duration_since(sent) >= retry_interval)
    }

    /// Total transmissions of the current phase
    pub fn attempts(&self) -> u32 {
        self.retries + 1
    }
}

/// Outcome of feeding an acknowledgment to [`Inflight`]
#[derive(Debug)]
pub enum AckOutcome {
    /// Delivery complete and removed
    Completed(PendingDelivery),
    /// PUBREC accepted; a PUBREL must be sent
    Release(u16),
    /// No matching delivery in the expected phase
    Unexpected,
}

/// In-flight QoS 1/2 deliveries, in first-send order
#[derive(Debug, Default)]
pub struct Inflight {
    entries: Vec<PendingDelivery>,
}

impl Inflight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, packet_id: u16) -> bool {
        self.entries.iter().any(|e| e.packet_id == packet_id)
    }

    pub fn insert(&mut self, delivery: PendingDelivery) {
        self.entries.push(delivery);
    }

    pub fn get_mut(&mut self, packet_id: u16) -> Option<&mut PendingDelivery> {
        self.entries.iter_mut().find(|e| e.packet_id == packet_id)
    }

    pub fn remove(&mut self, packet_id: u16) -> Option<PendingDelivery> {
        let index = self.entries.iter().position(|e| e.packet_id == packet_id)?;
        Some(self.entries.remove(index))
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingDelivery> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PendingDelivery> {
        self.entries.iter_mut()
    }

    /// Packet ids of deliveries due for retransmission
    pub fn due(&self, now: Instant, retry_interval: Duration) -> Vec<u16> {
        self.entries
            .iter()
            .filter(|e| e.is_due(now, retry_interval))
            .map(|e| e.packet_id)
            .collect()
    }

    /// Earliest instant at which some delivery becomes due
    pub fn next_due(&self, retry_interval: Duration) -> Option<Instant> {
        self.entries
            .iter()
            .filter_map(|e| e.last_sent.map(|sent| sent + retry_interval))
            .min()
    }

    pub fn on_puback(&mut self, packet_id: u16) -> AckOutcome {
        match self.get_mut(packet_id) {
            Some(entry) if entry.phase == DeliveryPhase::AwaitingPubAck => self
                .remove(packet_id)
                .map_or(AckOutcome::Unexpected, AckOutcome::Completed),
            _ => AckOutcome::Unexpected,
        }
    }

    pub fn on_pubrec(&mut self, packet_id: u16, now: Instant) -> AckOutcome {
        match self.get_mut(packet_id) {
            Some(entry) if entry.phase == DeliveryPhase::AwaitingPubRec => {
                entry.phase = DeliveryPhase::AwaitingPubComp;
                entry.retries = 0;
                entry.last_sent = Some(now);
                AckOutcome::Release(packet_id)
            }
            // Duplicate PUBREC, the PUBREL was lost
            Some(entry) if entry.phase == DeliveryPhase::AwaitingPubComp => {
                entry.last_sent = Some(now);
                AckOutcome::Release(packet_id)
            }
            _ => AckOutcome::Unexpected,
        }
    }

    pub fn on_pubcomp(&mut self, packet_id: u16) -> AckOutcome {
        match self.get_mut(packet_id) {
            Some(entry) if entry.phase == DeliveryPhase::AwaitingPubComp => self
                .remove(packet_id)
                .map_or(AckOutcome::Unexpected, AckOutcome::Completed),
            _ => AckOutcome::Unexpected,
        }
    }
}

/// Cycles through packet identifiers 1..=65535, skipping ids still in use
#[derive(Debug)]
pub struct PacketIdAllocator {
    next: u16,
}

impl Default for PacketIdAllocator {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl PacketIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next free identifier, or `None` when all 65535 are in use
    pub fn allocate(&mut self, in_use: impl Fn(u16) -> bool) -> Option<u16> {
        for _ in 0..u16::MAX {
            let id = self.next;
            self.next = if id == u16::MAX { 1 } else { id + 1 };
            if !in_use(id) {
                return Some(id);
            }
        }
        None
    }
}
