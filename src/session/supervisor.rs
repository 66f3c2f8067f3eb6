//! Session supervisor: the write path, the reconnect loop and the read loop
//!
//! [`Supervisor::run`] owns the socket's write half, every pending delivery
//! and the packet identifier allocator. Each connection gets its own
//! [`read_loop`] task that owns the read half and reports back over a channel.
//! State shared with the client handle lives in [`SessionCore`] behind one mutex.

use super::backoff::{Backoff, ReconnectPolicy, ReconnectionDecision};
use super::keepalive::{KeepAlive, KeepAliveAction};
use super::state::{log_state_transition, next_state, InvalidTransition, SessionEvent, SessionState};
use super::{interruptible_sleep, shutdown_signalled};
use crate::config::{ClientConfig, PresenceSection, QueueSection};
use crate::dispatcher::{Event, EventSender, InboundMessage};
use crate::error::{ClientError, ClientResult};
use crate::observability::ClientMetrics;
use crate::outbound::{
    AckOutcome, ControlCommand, DeliveryPhase, Inflight, OutboundRequest, PacketIdAllocator,
    PendingDelivery,
};
use crate::protocol::{
    validate_topic_name, CodecError, LastWill, Packet, Publish, QoS, Subscribe, SubscribeFilter,
    Unsubscribe,
};
use crate::subscriptions::SubscriptionManager;
use crate::transport::{self, ConnectOptions, Connection, Connector, PacketReader, PacketWriter};
use bytes::Bytes;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn, Instrument};

/// Upper bound on a single socket read before the shutdown flag is rechecked
const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Timer wake-up when nothing is scheduled
const IDLE_TICK: Duration = Duration::from_secs(60);

/// State shared between the client handle and the supervisor
#[derive(Debug)]
pub struct SessionCore {
    pub state: SessionState,
    pub subscriptions: SubscriptionManager,
    /// Incremented on every successful handshake
    pub epoch: u64,
    /// Cleared once shutdown begins or the session ends for good
    pub accepting: bool,
    pub last_error: Option<ClientError>,
}

impl SessionCore {
    /// Connection epoch a request enqueued now belongs to
    pub fn enqueue_epoch(&self) -> u64 {
        if self.state == SessionState::Connected {
            self.epoch
        } else {
            self.epoch + 1
        }
    }
}

pub struct SessionShared {
    core: Mutex<SessionCore>,
    state_tx: watch::Sender<SessionState>,
    pub metrics: Arc<ClientMetrics>,
}

impl SessionShared {
    pub fn new(metrics: Arc<ClientMetrics>) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        Self {
            core: Mutex::new(SessionCore {
                state: SessionState::Disconnected,
                subscriptions: SubscriptionManager::new(),
                epoch: 0,
                accepting: true,
                last_error: None,
            }),
            state_tx,
            metrics,
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, SessionCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Apply `event` to an already locked core and publish the new state
    pub fn apply(
        &self,
        core: &mut SessionCore,
        event: SessionEvent,
    ) -> Result<SessionState, InvalidTransition> {
        let from = core.state;
        let to = next_state(from, event).map_err(|e| {
            debug!(error = %e, "transition skipped");
            e
        })?;
        core.state = to;
        log_state_transition(from, to, event);
        self.state_tx.send_replace(to);
        Ok(to)
    }

    pub fn transition(&self, event: SessionEvent) -> Result<SessionState, InvalidTransition> {
        let mut core = self.lock();
        self.apply(&mut core, event)
    }
}

/// What the read loop hands to the write path
#[derive(Debug)]
pub enum ReadEvent {
    /// Acknowledgment or PINGRESP for something the write path sent
    Ack(Packet),
    /// Acknowledgment the write path must send for an inbound publish
    Reply(Packet),
    Failed(ClientError),
}

/// Own the read half of one connection until it fails or shutdown is signalled.
///
/// Inbound publishes are matched against the subscription set and dispatched
/// here; everything the write path needs to act on goes through `to_writer`.
pub async fn read_loop(
    mut reader: PacketReader,
    shared: Arc<SessionShared>,
    events: EventSender,
    to_writer: mpsc::UnboundedSender<ReadEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    // QoS 2 packet ids delivered but not yet released by PUBREL
    let mut awaiting_release: HashSet<u16> = HashSet::new();

    loop {
        let received = tokio::select! {
            _ = shutdown_signalled(&mut shutdown) => return,
            received = reader.receive(READ_TIMEOUT) => received,
        };

        let forward = match received {
            Ok(None) => continue,
            Err(e) => Err(ClientError::from(e)),
            Ok(Some(Packet::Publish(publish))) => {
                on_publish(publish, &shared, &events, &mut awaiting_release)
            }
            Ok(Some(Packet::PubRel(packet_id))) => {
                awaiting_release.remove(&packet_id);
                Ok(Some(ReadEvent::Reply(Packet::PubComp(packet_id))))
            }
            Ok(Some(
                ack @ (Packet::PubAck(_)
                | Packet::PubRec(_)
                | Packet::PubComp(_)
                | Packet::SubAck(_)
                | Packet::UnsubAck(_)
                | Packet::PingResp),
            )) => Ok(Some(ReadEvent::Ack(ack))),
            Ok(Some(other)) => Err(ClientError::Protocol(CodecError::Malformed(format!(
                "unexpected {} from broker",
                other.name()
            )))),
        };

        match forward {
            Ok(Some(event)) => {
                if to_writer.send(event).is_err() {
                    return;
                }
            }
            Ok(None) => {}
            Err(error) => {
                let _ = to_writer.send(ReadEvent::Failed(error));
                return;
            }
        }
    }
}

fn on_publish(
    publish: Publish,
    shared: &SessionShared,
    events: &EventSender,
    awaiting_release: &mut HashSet<u16>,
) -> ClientResult<Option<ReadEvent>> {
    validate_topic_name(&publish.topic).map_err(|e| {
        ClientError::Protocol(CodecError::Malformed(format!("inbound topic name: {e}")))
    })?;

    let reply = match (publish.qos, publish.packet_id) {
        (QoS::AtMostOnce, _) => None,
        (QoS::AtLeastOnce, Some(packet_id)) => Some(Packet::PubAck(packet_id)),
        (QoS::ExactlyOnce, Some(packet_id)) => {
            if !awaiting_release.insert(packet_id) {
                debug!(packet_id, topic = %publish.topic, "duplicate QoS 2 publish not redelivered");
                return Ok(Some(ReadEvent::Reply(Packet::PubRec(packet_id))));
            }
            Some(Packet::PubRec(packet_id))
        }
        (qos, None) => return Err(ClientError::Protocol(CodecError::MissingPacketId(qos))),
    };

    shared.metrics.message_received();
    let filters = shared.lock().subscriptions.matching_filters(&publish.topic);
    if filters.is_empty() {
        debug!(topic = %publish.topic, "publish matches no active subscription");
    } else {
        let message = Arc::new(InboundMessage {
            topic: publish.topic,
            payload: publish.payload,
            qos: publish.qos,
            retain: publish.retain,
            dup: publish.dup,
            received_at: Utc::now(),
        });
        for filter in filters {
            events.send(Event::Message {
                filter,
                message: message.clone(),
            });
        }
    }

    Ok(reply.map(ReadEvent::Reply))
}

/// Channels connecting the supervisor to the client handle
pub struct SupervisorChannels {
    pub publish_rx: mpsc::Receiver<OutboundRequest>,
    pub control_rx: mpsc::UnboundedReceiver<ControlCommand>,
    pub events: EventSender,
    pub shutdown: watch::Receiver<bool>,
    /// Receives the outcome of the first connection attempt
    pub first_attempt: oneshot::Sender<ClientResult<()>>,
}

enum ConnectionOutcome {
    Shutdown,
    Lost(ClientError),
}

enum RequestKind {
    Subscribe(Vec<SubscribeFilter>),
    Unsubscribe(Vec<String>),
}

struct PendingRequest {
    kind: RequestKind,
    sent_at: Instant,
}

/// Aborts the wrapped task when dropped
struct TaskGuard(JoinHandle<()>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct Supervisor {
    shared: Arc<SessionShared>,
    connector: Arc<dyn Connector>,
    options: ConnectOptions,
    queue: QueueSection,
    presence: Option<PresenceSection>,
    backoff: Backoff,
    publish_rx: mpsc::Receiver<OutboundRequest>,
    control_rx: mpsc::UnboundedReceiver<ControlCommand>,
    events: EventSender,
    shutdown: watch::Receiver<bool>,
    first_attempt: Option<oneshot::Sender<ClientResult<()>>>,
    inflight: Inflight,
    packet_ids: PacketIdAllocator,
    /// SUBSCRIBE/UNSUBSCRIBE awaiting their ack on the current connection
    requests: HashMap<u16, PendingRequest>,
    keepalive: KeepAlive,
}

impl Supervisor {
    pub fn new(
        shared: Arc<SessionShared>,
        connector: Arc<dyn Connector>,
        config: &ClientConfig,
        channels: SupervisorChannels,
    ) -> Self {
        let options = connect_options(config);
        let keepalive = KeepAlive::new(config.connection.keep_alive(), Instant::now());

        Self {
            shared,
            connector,
            options,
            queue: config.queue.clone(),
            presence: config.presence.clone(),
            backoff: Backoff::new(ReconnectPolicy::from(&config.session)),
            publish_rx: channels.publish_rx,
            control_rx: channels.control_rx,
            events: channels.events,
            shutdown: channels.shutdown,
            first_attempt: Some(channels.first_attempt),
            inflight: Inflight::new(),
            packet_ids: PacketIdAllocator::new(),
            requests: HashMap::new(),
            keepalive,
        }
    }

    /// Run until shutdown, a fatal error or an exhausted attempt limit
    pub async fn run(mut self) {
        let span = crate::session_span!(
            client_id = %self.options.client_id,
            endpoint = %self.connector.describe()
        );
        self.supervise().instrument(span).await
    }

    async fn supervise(&mut self) {
        loop {
            if *self.shutdown.borrow() {
                break;
            }

            self.shared.metrics.connection_attempt();
            info!(endpoint = %self.connector.describe(), "connecting to broker");

            match self.open_connection().await {
                Ok(connection) => {
                    self.backoff.record_success();
                    let started = Instant::now();
                    let outcome = self.run_connection(connection).await;
                    self.backoff.record_connected_for(started.elapsed());

                    match outcome {
                        ConnectionOutcome::Shutdown => break,
                        ConnectionOutcome::Lost(error) => {
                            self.shared.metrics.connection_lost();
                            let reason = error.to_string();
                            self.events.error(error.clone());
                            if !self.record_failure(error, SessionEvent::ConnectionLost) {
                                break;
                            }
                            self.events.send(Event::Disconnected {
                                reason,
                                will_reconnect: true,
                            });
                        }
                    }
                }
                Err(ClientError::ShuttingDown) => break,
                Err(error) if !error.is_retryable() => {
                    error!(error = %error, "connection attempt failed permanently");
                    self.finish_failed(error.to_string(), Some(error), SessionEvent::Fatal);
                    return;
                }
                Err(error) => {
                    warn!(error = %error, "connection attempt failed");
                    self.report_first_attempt(Err(error.clone()));
                    self.events.error(error.clone());
                    if !self.record_failure(error, SessionEvent::AttemptFailed) {
                        break;
                    }
                }
            }

            let shutdown_requested = *self.shutdown.borrow();
            match self.backoff.next_attempt(shutdown_requested) {
                ReconnectionDecision::Proceed { attempt, delay } => {
                    info!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "reconnecting after backoff"
                    );
                    if !interruptible_sleep(&mut self.shutdown, delay).await {
                        break;
                    }
                    if self.shared.transition(SessionEvent::BackoffElapsed).is_err() {
                        break;
                    }
                }
                ReconnectionDecision::AbortShutdownRequested => break,
                ReconnectionDecision::AbortMaxAttemptsExceeded => {
                    let attempts = self.backoff.policy().max_attempts.unwrap_or_default();
                    self.finish_failed(
                        format!("gave up after {attempts} reconnect attempts"),
                        None,
                        SessionEvent::RetriesExhausted,
                    );
                    return;
                }
            }
        }

        self.finish_shutdown();
    }

    async fn open_connection(&mut self) -> ClientResult<Connection> {
        tokio::select! {
            result = transport::connect(self.connector.as_ref(), &self.options) => {
                result.map_err(ClientError::from)
            }
            _ = shutdown_signalled(&mut self.shutdown) => Err(ClientError::ShuttingDown),
        }
    }

    /// Store the error and move to the next state; false when shutdown won the race
    fn record_failure(&self, error: ClientError, event: SessionEvent) -> bool {
        let mut core = self.shared.lock();
        core.last_error = Some(error);
        self.shared.apply(&mut core, event).is_ok()
    }

    fn report_first_attempt(&mut self, result: ClientResult<()>) {
        if let Some(tx) = self.first_attempt.take() {
            let _ = tx.send(result);
        }
    }

    /// Terminal failure: stop accepting work and tell everyone
    fn finish_failed(&mut self, reason: String, error: Option<ClientError>, event: SessionEvent) {
        {
            let mut core = self.shared.lock();
            core.accepting = false;
            if let Some(error) = &error {
                core.last_error = Some(error.clone());
            }
            let _ = self.shared.apply(&mut core, event);
        }
        self.shared.metrics.mark_disconnected();
        match error {
            Some(error) => {
                self.report_first_attempt(Err(error.clone()));
                self.events.error(error);
            }
            None => self.report_first_attempt(Err(ClientError::network(reason.clone()))),
        }
        self.abandon_pending();
        self.events.send(Event::Disconnected {
            reason,
            will_reconnect: false,
        });
    }

    fn finish_shutdown(&mut self) {
        self.report_first_attempt(Err(ClientError::ShuttingDown));
        {
            let mut core = self.shared.lock();
            core.accepting = false;
            if core.state != SessionState::ShuttingDown {
                let _ = self.shared.apply(&mut core, SessionEvent::ShutdownRequested);
            }
            let _ = self.shared.apply(&mut core, SessionEvent::ShutdownComplete);
        }
        self.shared.metrics.mark_disconnected();
        self.abandon_pending();
        self.events.send(Event::Disconnected {
            reason: "client disconnected".to_string(),
            will_reconnect: false,
        });
    }

    fn abandon_pending(&mut self) {
        if !self.inflight.is_empty() {
            warn!(
                count = self.inflight.len(),
                "unacknowledged deliveries abandoned with the session"
            );
        }
        for delivery in self.inflight.iter_mut() {
            delivery.settle(Err(ClientError::ShuttingDown));
        }
    }

    async fn run_connection(&mut self, connection: Connection) -> ConnectionOutcome {
        let session_present = connection.session_present();
        let (reader, mut writer) = connection.into_split();
        let (to_writer, mut from_reader) = mpsc::unbounded_channel();
        let _reader = TaskGuard(tokio::spawn(read_loop(
            reader,
            self.shared.clone(),
            self.events.clone(),
            to_writer,
            self.shutdown.clone(),
        )));

        let established = {
            let mut core = self.shared.lock();
            match self.shared.apply(&mut core, SessionEvent::HandshakeSucceeded) {
                Ok(_) => {
                    core.epoch += 1;
                    core.last_error = None;
                    core.subscriptions.mark_all_pending();
                    Some((core.epoch, core.subscriptions.replay_batch()))
                }
                Err(_) => None,
            }
        };
        let Some((epoch, replay)) = established else {
            writer.close().await;
            return ConnectionOutcome::Shutdown;
        };

        self.shared.metrics.connection_established();
        self.report_first_attempt(Ok(()));
        self.events.send(Event::Connected { session_present });
        self.requests.clear();
        self.keepalive = KeepAlive::new(self.options_keep_alive(), Instant::now());

        if let Err(error) = self.resume_session(&mut writer, replay, epoch).await {
            return ConnectionOutcome::Lost(error);
        }

        loop {
            let deadline = self.next_deadline();
            let can_publish = self.inflight.len() < self.queue.max_inflight;

            let result = tokio::select! {
                biased;
                _ = shutdown_signalled(&mut self.shutdown) => {
                    self.close_gracefully(writer, epoch).await;
                    return ConnectionOutcome::Shutdown;
                }
                event = from_reader.recv() => match event {
                    Some(ReadEvent::Ack(packet)) => self.handle_ack(&mut writer, packet).await,
                    Some(ReadEvent::Reply(packet)) => self.write(&mut writer, &packet).await,
                    Some(ReadEvent::Failed(error)) => Err(error),
                    None => Err(ClientError::network("read loop stopped")),
                },
                Some(command) = self.control_rx.recv() => {
                    self.handle_command(&mut writer, command, epoch).await
                }
                Some(request) = self.publish_rx.recv(), if can_publish => {
                    self.send_request(&mut writer, request, epoch).await
                }
                _ = tokio::time::sleep_until(deadline) => self.on_tick(&mut writer).await,
            };

            if let Err(error) = result {
                return ConnectionOutcome::Lost(error);
            }
        }
    }

    fn options_keep_alive(&self) -> Duration {
        Duration::from_secs(u64::from(self.options.keep_alive_secs))
    }

    fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.queue.retry_interval_ms)
    }

    /// SUBACK/UNSUBACK must arrive within the time a publish is given to be acknowledged
    fn ack_timeout(&self) -> Duration {
        self.retry_interval() * self.queue.max_retries.saturating_add(1)
    }

    fn next_deadline(&self) -> Instant {
        let ack_timeout = self.ack_timeout();
        [
            self.keepalive.next_deadline(),
            self.inflight.next_due(self.retry_interval()),
            self.requests.values().map(|r| r.sent_at + ack_timeout).min(),
        ]
        .into_iter()
        .flatten()
        .min()
        .unwrap_or_else(|| Instant::now() + IDLE_TICK)
    }

    /// Replay subscriptions, resend unacknowledged deliveries, announce presence
    async fn resume_session(
        &mut self,
        writer: &mut PacketWriter,
        replay: Vec<SubscribeFilter>,
        epoch: u64,
    ) -> ClientResult<()> {
        if !replay.is_empty() {
            let count = replay.len();
            self.send_subscribe(writer, replay).await?;
            self.shared.metrics.subscriptions_replayed(count);
            info!(count, "replayed subscriptions");
        }

        let now = Instant::now();
        let mut resent = Vec::with_capacity(self.inflight.len());
        for delivery in self.inflight.iter_mut() {
            delivery.last_sent = Some(now);
            resent.push(delivery.to_packet(true));
        }
        for packet in &resent {
            self.write(writer, packet).await?;
            self.shared.metrics.message_retransmitted();
        }
        if !resent.is_empty() {
            info!(count = resent.len(), "resent unacknowledged deliveries");
        }

        if let Some(presence) = self.presence.clone() {
            let request = OutboundRequest {
                topic: presence.topic,
                payload: Bytes::from(presence.online_payload),
                qos: presence.qos,
                retain: true,
                epoch,
                enqueued_at: now,
                completion: None,
            };
            self.send_request(writer, request, epoch).await?;
            debug!("presence announced");
        }
        Ok(())
    }

    async fn write(&mut self, writer: &mut PacketWriter, packet: &Packet) -> ClientResult<()> {
        writer.send(packet).await?;
        self.keepalive.record_sent(Instant::now());
        Ok(())
    }

    fn allocate_packet_id(&mut self) -> Option<u16> {
        let Self {
            packet_ids,
            inflight,
            requests,
            ..
        } = self;
        packet_ids.allocate(|id| inflight.contains(id) || requests.contains_key(&id))
    }

    async fn send_request(
        &mut self,
        writer: &mut PacketWriter,
        mut request: OutboundRequest,
        epoch: u64,
    ) -> ClientResult<()> {
        if request.qos == QoS::AtMostOnce {
            if request.epoch != epoch {
                self.shared.metrics.message_dropped();
                debug!(topic = %request.topic, "QoS 0 publish dropped, its connection is gone");
                let error = ClientError::Delivery {
                    topic: request.topic.clone(),
                    packet_id: 0,
                    attempts: 0,
                };
                request.settle(Err(error));
                return Ok(());
            }
            let packet = Packet::Publish(Publish {
                dup: false,
                qos: QoS::AtMostOnce,
                retain: request.retain,
                topic: request.topic.clone(),
                packet_id: None,
                payload: request.payload.clone(),
            });
            self.write(writer, &packet).await?;
            self.shared.metrics.message_published();
            request.settle(Ok(()));
            return Ok(());
        }

        let Some(packet_id) = self.allocate_packet_id() else {
            error!(topic = %request.topic, "no free packet identifier");
            self.shared.metrics.message_failed();
            let error = ClientError::Delivery {
                topic: request.topic.clone(),
                packet_id: 0,
                attempts: 0,
            };
            request.settle(Err(error.clone()));
            self.events.error(error);
            return Ok(());
        };

        let mut delivery = PendingDelivery::new(packet_id, request);
        delivery.last_sent = Some(Instant::now());
        let packet = delivery.to_packet(false);
        // Tracked before the write so a failed send is resent on the next connection
        self.inflight.insert(delivery);
        self.write(writer, &packet).await?;
        self.shared.metrics.message_published();
        Ok(())
    }

    async fn send_subscribe(
        &mut self,
        writer: &mut PacketWriter,
        filters: Vec<SubscribeFilter>,
    ) -> ClientResult<()> {
        let Some(packet_id) = self.allocate_packet_id() else {
            warn!(count = filters.len(), "no free packet identifier, subscribe deferred to next connection");
            return Ok(());
        };
        let packet = Packet::Subscribe(Subscribe {
            packet_id,
            filters: filters.clone(),
        });
        self.write(writer, &packet).await?;
        self.requests.insert(
            packet_id,
            PendingRequest {
                kind: RequestKind::Subscribe(filters),
                sent_at: Instant::now(),
            },
        );
        Ok(())
    }

    async fn handle_command(
        &mut self,
        writer: &mut PacketWriter,
        command: ControlCommand,
        epoch: u64,
    ) -> ClientResult<()> {
        if command.epoch() != epoch {
            debug!("subscription change from an earlier connection skipped");
            return Ok(());
        }

        match command {
            ControlCommand::Subscribe { filters, .. } => self.send_subscribe(writer, filters).await,
            ControlCommand::Unsubscribe { filters, .. } => {
                let Some(packet_id) = self.allocate_packet_id() else {
                    warn!("no free packet identifier, unsubscribe skipped");
                    return Ok(());
                };
                let packet = Packet::Unsubscribe(Unsubscribe {
                    packet_id,
                    filters: filters.clone(),
                });
                self.write(writer, &packet).await?;
                self.requests.insert(
                    packet_id,
                    PendingRequest {
                        kind: RequestKind::Unsubscribe(filters),
                        sent_at: Instant::now(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn handle_ack(&mut self, writer: &mut PacketWriter, packet: Packet) -> ClientResult<()> {
        match packet {
            Packet::PubAck(packet_id) => {
                let outcome = self.inflight.on_puback(packet_id);
                self.complete(packet_id, outcome)
            }
            Packet::PubComp(packet_id) => {
                let outcome = self.inflight.on_pubcomp(packet_id);
                self.complete(packet_id, outcome)
            }
            Packet::PubRec(packet_id) => {
                match self.inflight.on_pubrec(packet_id, Instant::now()) {
                    AckOutcome::Release(_) => {
                        // The broker owns the message from here on
                        if let Some(delivery) = self.inflight.get_mut(packet_id) {
                            delivery.settle(Ok(()));
                        }
                    }
                    _ => debug!(packet_id, "PUBREC for unknown packet, releasing anyway"),
                }
                self.write(writer, &Packet::PubRel(packet_id)).await?;
            }
            Packet::SubAck(ack) => match self.requests.remove(&ack.packet_id) {
                Some(PendingRequest {
                    kind: RequestKind::Subscribe(filters),
                    ..
                }) => {
                    let rejected = self
                        .shared
                        .lock()
                        .subscriptions
                        .apply_suback(&filters, &ack.return_codes);
                    debug!(packet_id = ack.packet_id, filters = filters.len(), "SUBACK received");
                    for filter in rejected {
                        warn!(filter = %filter, "broker rejected subscription");
                        self.events
                            .error(ClientError::SubscriptionRejected { filter });
                    }
                }
                _ => debug!(packet_id = ack.packet_id, "SUBACK for unknown request"),
            },
            Packet::UnsubAck(packet_id) => match self.requests.remove(&packet_id) {
                Some(PendingRequest {
                    kind: RequestKind::Unsubscribe(filters),
                    ..
                }) => debug!(packet_id, ?filters, "UNSUBACK received"),
                _ => debug!(packet_id, "UNSUBACK for unknown request"),
            },
            Packet::PingResp => {
                trace!(target: "mqtt_transport", "PINGRESP");
                self.keepalive.record_pong();
            }
            other => debug!(packet = other.name(), "ignored acknowledgment"),
        }
        Ok(())
    }

    fn complete(&mut self, packet_id: u16, outcome: AckOutcome) {
        match outcome {
            AckOutcome::Completed(mut delivery) => {
                delivery.settle(Ok(()));
                self.shared.metrics.message_acknowledged();
                debug!(
                    packet_id,
                    topic = %delivery.topic,
                    latency_ms = delivery.enqueued_at.elapsed().as_millis() as u64,
                    "delivery acknowledged"
                );
            }
            _ => debug!(packet_id, "acknowledgment for unknown delivery"),
        }
    }

    async fn on_tick(&mut self, writer: &mut PacketWriter) -> ClientResult<()> {
        let now = Instant::now();

        match self.keepalive.poll(now) {
            KeepAliveAction::SendPing => {
                writer.send(&Packet::PingReq).await?;
                self.keepalive.record_ping_sent(now);
                trace!(target: "mqtt_transport", "PINGREQ");
            }
            KeepAliveAction::Expired => {
                return Err(ClientError::timeout(format!(
                    "no PINGRESP within {}s keepalive window",
                    self.options.keep_alive_secs
                )));
            }
            KeepAliveAction::Idle => {}
        }

        let max_retries = self.queue.max_retries;
        for packet_id in self.inflight.due(now, self.retry_interval()) {
            let retransmit = match self.inflight.get_mut(packet_id) {
                Some(delivery) if delivery.retries >= max_retries => None,
                Some(delivery) => {
                    delivery.retries += 1;
                    delivery.last_sent = Some(now);
                    Some((delivery.retries, delivery.to_packet(true)))
                }
                None => continue,
            };

            match retransmit {
                Some((retry, packet)) => {
                    warn!(packet_id, retry, max_retries, "retransmitting unacknowledged delivery");
                    self.write(writer, &packet).await?;
                    self.shared.metrics.message_retransmitted();
                }
                None => {
                    if let Some(delivery) = self.inflight.remove(packet_id) {
                        self.exhausted(delivery);
                    }
                }
            }
        }

        let ack_timeout = self.ack_timeout();
        if let Some((packet_id, _)) = self
            .requests
            .iter()
            .find(|(_, request)| now.saturating_duration_since(request.sent_at) >= ack_timeout)
        {
            return Err(ClientError::timeout(format!(
                "no acknowledgment for subscription request {packet_id}"
            )));
        }

        Ok(())
    }

    /// Retry budget spent on `delivery`
    ///
    /// Before PUBREC the message may never have reached the broker, so the
    /// delivery fails. Once PUBREC arrived the broker owns the message and only
    /// the release handshake is incomplete; that is reported separately.
    fn exhausted(&mut self, mut delivery: PendingDelivery) {
        let packet_id = delivery.packet_id;
        if delivery.phase == DeliveryPhase::AwaitingPubComp {
            let error = ClientError::ReleaseUnconfirmed {
                topic: delivery.topic.clone(),
                packet_id,
            };
            warn!(error = %error, attempts = delivery.attempts(), "giving up on PUBCOMP");
            self.shared.metrics.message_acknowledged();
            delivery.settle(Ok(()));
            self.events.error(error);
            return;
        }

        let error = ClientError::Delivery {
            topic: delivery.topic.clone(),
            packet_id,
            attempts: delivery.attempts(),
        };
        error!(error = %error, "delivery failed");
        self.shared.metrics.message_failed();
        delivery.settle(Err(error.clone()));
        self.events.error(error);
    }

    /// Flush queued QoS 0 publishes best effort, then DISCONNECT and close
    async fn close_gracefully(&mut self, mut writer: PacketWriter, epoch: u64) {
        let mut flushed = 0usize;
        let mut abandoned = 0usize;
        while let Ok(mut request) = self.publish_rx.try_recv() {
            if request.qos != QoS::AtMostOnce || request.epoch != epoch {
                abandoned += 1;
                continue;
            }
            let packet = Packet::Publish(Publish {
                dup: false,
                qos: QoS::AtMostOnce,
                retain: request.retain,
                topic: request.topic.clone(),
                packet_id: None,
                payload: request.payload.clone(),
            });
            if writer.send(&packet).await.is_err() {
                break;
            }
            request.settle(Ok(()));
            flushed += 1;
        }
        if flushed > 0 || abandoned > 0 {
            debug!(flushed, abandoned, "outbound queue flushed at shutdown");
        }
        writer.close().await;
        info!("disconnected from broker");
    }
}

/// CONNECT parameters for a configuration; presence registers the offline last will
pub fn connect_options(config: &ClientConfig) -> ConnectOptions {
    let will = config.presence.as_ref().map(|presence| LastWill {
        topic: presence.topic.clone(),
        payload: Bytes::from(presence.offline_payload.clone()),
        qos: presence.qos,
        retain: true,
    });

    ConnectOptions {
        client_id: config.connection.client_id.clone(),
        keep_alive_secs: config.connection.keepalive_secs,
        clean_session: config.connection.clean_session,
        will,
        connect_timeout: config.connection.connect_timeout(),
        max_packet_size: config.connection.max_packet_size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Dispatcher;
    use crate::protocol::SubAck;
    use crate::testing::MockConnector;

    fn shared() -> Arc<SessionShared> {
        Arc::new(SessionShared::new(Arc::new(ClientMetrics::new())))
    }

    #[test]
    fn test_enqueue_epoch_targets_next_connection_while_offline() {
        let shared = shared();
        let mut core = shared.lock();
        assert_eq!(core.enqueue_epoch(), 1);

        shared.apply(&mut core, SessionEvent::ConnectRequested).unwrap();
        shared.apply(&mut core, SessionEvent::HandshakeSucceeded).unwrap();
        core.epoch = 1;
        assert_eq!(core.enqueue_epoch(), 1);

        shared.apply(&mut core, SessionEvent::ConnectionLost).unwrap();
        assert_eq!(core.enqueue_epoch(), 2);
    }

    #[test]
    fn test_transitions_are_published() {
        let shared = shared();
        let watcher = shared.watch_state();

        shared.transition(SessionEvent::ConnectRequested).unwrap();

        assert_eq!(*watcher.borrow(), SessionState::Connecting);
        assert_eq!(shared.state(), SessionState::Connecting);
        assert!(shared.transition(SessionEvent::BackoffElapsed).is_err());
        assert_eq!(shared.state(), SessionState::Connecting);
    }

    #[test]
    fn test_connect_options_register_offline_will() {
        let config = ClientConfig::from_toml_str(
            r#"
            [connection]
            broker_url = "mqtts://broker.example.com"
            client_id = "line-3"
            ca_path = "ca.pem"
            cert_path = "cert.pem"
            key_path = "key.pem"

            [presence]
            topic = "factory/B7/line3/presence"
            "#,
        )
        .unwrap();

        let options = connect_options(&config);
        let will = options.will.unwrap();
        assert_eq!(will.topic, "factory/B7/line3/presence");
        assert_eq!(will.payload, Bytes::from_static(b"offline"));
        assert!(will.retain);
        assert_eq!(options.client_id, "line-3");
    }

    async fn reader_fixture() -> (
        crate::testing::MockBroker,
        PacketReader,
        PacketWriter,
    ) {
        let (connector, broker) = MockConnector::pair();
        let stream = connector.connect().await.unwrap();
        let (reader, writer) = Connection::new(stream, 4096).into_split();
        (broker, reader, writer)
    }

    #[tokio::test]
    async fn test_read_loop_acknowledges_and_dedups_qos2() {
        // Arrange
        let shared = shared();
        shared
            .lock()
            .subscriptions
            .subscribe("factory/#", QoS::ExactlyOnce)
            .unwrap();
        let dispatcher = Dispatcher::start(1, shared.metrics.clone());
        let (mut broker, reader, _writer) = reader_fixture().await;
        let (to_writer, mut from_reader) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(read_loop(
            reader,
            shared.clone(),
            dispatcher.sender().unwrap(),
            to_writer,
            shutdown_rx,
        ));

        // Act
        let mut publish = Publish::new("factory/B7/state", QoS::ExactlyOnce, &b"running"[..]);
        publish.packet_id = Some(12);
        broker.send(Packet::Publish(publish.clone())).await;
        publish.dup = true;
        broker.send(Packet::Publish(publish)).await;
        broker.send(Packet::PubRel(12)).await;
        broker
            .send(Packet::SubAck(SubAck {
                packet_id: 3,
                return_codes: vec![],
            }))
            .await;

        // Assert
        let mut replies = Vec::new();
        for _ in 0..4 {
            match from_reader.recv().await.unwrap() {
                ReadEvent::Reply(packet) | ReadEvent::Ack(packet) => replies.push(packet),
                ReadEvent::Failed(e) => panic!("unexpected failure: {e}"),
            }
        }
        assert_eq!(
            replies,
            vec![
                Packet::PubRec(12),
                Packet::PubRec(12),
                Packet::PubComp(12),
                Packet::SubAck(SubAck {
                    packet_id: 3,
                    return_codes: vec![]
                }),
            ]
        );
        assert_eq!(shared.metrics.snapshot().inbound.received, 1);
        task.abort();
    }

    #[tokio::test]
    async fn test_read_loop_reports_unexpected_packets() {
        let shared = shared();
        let dispatcher = Dispatcher::start(1, shared.metrics.clone());
        let (mut broker, reader, _writer) = reader_fixture().await;
        let (to_writer, mut from_reader) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(read_loop(
            reader,
            shared,
            dispatcher.sender().unwrap(),
            to_writer,
            shutdown_rx,
        ));

        broker.send(Packet::PingReq).await;

        assert!(matches!(
            from_reader.recv().await,
            Some(ReadEvent::Failed(ClientError::Protocol(_)))
        ));
    }
}
