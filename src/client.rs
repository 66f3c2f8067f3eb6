//! Application-facing MQTT client
//!
//! `MqttClient` owns the session supervisor task and the event dispatcher.
//! Publish and subscribe calls never wait on the network: they update the
//! shared session core and hand work to the supervisor over channels.

use crate::config::ClientConfig;
use crate::dispatcher::{Dispatcher, EventHandler};
use crate::error::{ClientError, ClientResult};
use crate::observability::{ClientMetrics, MetricsSnapshot};
use crate::outbound::{ControlCommand, DeliveryToken, OutboundQueue, OutboundRequest};
use crate::protocol::{validate_topic_filter, validate_topic_name, QoS, SubscribeFilter};
use crate::session::{SessionEvent, SessionShared, SessionState, Supervisor};
use crate::session::supervisor::SupervisorChannels;
use crate::subscriptions::Subscription;
use crate::transport::{Connector, TlsConnector};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Work handed to the supervisor when `connect` is first called
struct PendingStart {
    connector: Arc<dyn Connector>,
    publish_rx: mpsc::Receiver<OutboundRequest>,
    control_rx: mpsc::UnboundedReceiver<ControlCommand>,
}

pub struct MqttClient {
    config: ClientConfig,
    shared: Arc<SessionShared>,
    queue: OutboundQueue,
    control_tx: mpsc::UnboundedSender<ControlCommand>,
    dispatcher: Option<Dispatcher>,
    shutdown_tx: watch::Sender<bool>,
    pending: Option<PendingStart>,
    supervisor: Option<JoinHandle<()>>,
}

impl MqttClient {
    /// Client using mutual TLS as configured in `[connection]`.
    ///
    /// Must be called inside a Tokio runtime; the dispatcher lanes start immediately.
    pub fn new(config: ClientConfig) -> ClientResult<Self> {
        let connector = TlsConnector::from_config(&config.connection)?;
        Self::with_connector(config, Arc::new(connector))
    }

    /// Client over an arbitrary connector
    pub fn with_connector(config: ClientConfig, connector: Arc<dyn Connector>) -> ClientResult<Self> {
        config.validate()?;

        let metrics = Arc::new(ClientMetrics::new());
        let shared = Arc::new(SessionShared::new(metrics.clone()));
        let (queue, publish_rx) = OutboundQueue::bounded(config.queue.capacity);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        let dispatcher = Dispatcher::with_capacity(
            config.dispatcher.lanes,
            config.dispatcher.lane_capacity,
            metrics,
        );

        Ok(Self {
            config,
            shared,
            queue,
            control_tx,
            dispatcher: Some(dispatcher),
            shutdown_tx,
            pending: Some(PendingStart {
                connector,
                publish_rx,
                control_rx,
            }),
            supervisor: None,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn client_id(&self) -> &str {
        &self.config.connection.client_id
    }

    /// Start the session and wait for the first connection attempt.
    ///
    /// A transient failure is returned to the caller while reconnecting
    /// continues in the background; a fatal one ends the session.
    pub async fn connect(&mut self) -> ClientResult<()> {
        let wait = self.config.connection.connect_timeout() * 2 + Duration::from_secs(1);

        let Some(start) = self.pending.take() else {
            return self.wait_connected(wait).await;
        };
        self.shared
            .transition(SessionEvent::ConnectRequested)
            .map_err(|_| ClientError::ShuttingDown)?;

        let events = self
            .dispatcher
            .as_ref()
            .and_then(Dispatcher::sender)
            .ok_or(ClientError::ShuttingDown)?;
        let (first_attempt, first_result) = oneshot::channel();
        let supervisor = Supervisor::new(
            self.shared.clone(),
            start.connector,
            &self.config,
            SupervisorChannels {
                publish_rx: start.publish_rx,
                control_rx: start.control_rx,
                events,
                shutdown: self.shutdown_tx.subscribe(),
                first_attempt,
            },
        );
        self.supervisor = Some(tokio::spawn(supervisor.run()));

        match tokio::time::timeout(wait, first_result).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::ShuttingDown),
            Err(_) => Err(ClientError::timeout(format!(
                "no connection within {}ms",
                wait.as_millis()
            ))),
        }
    }

    async fn wait_connected(&self, wait: Duration) -> ClientResult<()> {
        let mut state_rx = self.shared.watch_state();
        let outcome = tokio::time::timeout(wait, async {
            loop {
                let state = *state_rx.borrow_and_update();
                match state {
                    SessionState::Connected => return Ok(()),
                    SessionState::Disconnected | SessionState::ShuttingDown => {
                        return Err(self
                            .shared
                            .lock()
                            .last_error
                            .clone()
                            .unwrap_or(ClientError::ShuttingDown));
                    }
                    SessionState::Connecting | SessionState::Reconnecting => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(ClientError::ShuttingDown);
                }
            }
        })
        .await;

        outcome.unwrap_or_else(|_| {
            Err(ClientError::timeout(format!(
                "not connected after {}ms",
                wait.as_millis()
            )))
        })
    }

    /// Wait until the session reaches `target`; false on timeout
    pub async fn wait_for_state(&self, target: SessionState, wait: Duration) -> bool {
        let mut state_rx = self.shared.watch_state();
        tokio::time::timeout(wait, state_rx.wait_for(|state| *state == target))
            .await
            .map(|result| result.is_ok())
            .unwrap_or(false)
    }

    /// Queue a publish; returns as soon as it is queued
    pub fn publish(&self, topic: &str, payload: impl Into<Bytes>, qos: QoS) -> ClientResult<()> {
        self.enqueue(topic, payload.into(), qos, false, false).map(|_| ())
    }

    /// Queue a publish the broker keeps as the topic's last known value
    pub fn publish_retained(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
    ) -> ClientResult<()> {
        self.enqueue(topic, payload.into(), qos, true, false).map(|_| ())
    }

    /// Queue a publish and get a [`DeliveryToken`] that resolves when this
    /// particular message is settled
    pub fn publish_tracked(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> ClientResult<DeliveryToken> {
        self.enqueue(topic, payload.into(), qos, retain, true)?
            .ok_or(ClientError::ShuttingDown)
    }

    fn enqueue(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        track: bool,
    ) -> ClientResult<Option<DeliveryToken>> {
        validate_topic_name(topic)?;

        // The epoch tag and the enqueue happen under the session lock
        let core = self.shared.lock();
        if !core.accepting {
            return Err(ClientError::ShuttingDown);
        }
        let request = OutboundRequest {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
            epoch: core.enqueue_epoch(),
            enqueued_at: Instant::now(),
            completion: None,
        };
        let (request, token) = if track {
            let (request, token) = request.tracked();
            (request, Some(token))
        } else {
            (request, None)
        };
        let result = self.queue.try_enqueue(request);
        drop(core);

        if let Err(ClientError::Backpressure { capacity }) = &result {
            self.shared.metrics.backpressure_rejection();
            warn!(topic, capacity, "outbound queue full, publish rejected");
        }
        result.map(|()| token)
    }

    /// Add or update a subscription; sent now if connected, replayed on every reconnect
    pub fn subscribe(&self, filter: &str, qos: QoS) -> ClientResult<()> {
        let mut core = self.shared.lock();
        if !core.accepting {
            return Err(ClientError::ShuttingDown);
        }
        let outcome = core.subscriptions.subscribe(filter, qos)?;
        debug!(filter, %qos, ?outcome, "subscription updated");

        if outcome.needs_subscribe() && core.state == SessionState::Connected {
            let _ = self.control_tx.send(ControlCommand::Subscribe {
                filters: vec![SubscribeFilter::new(filter, qos)],
                epoch: core.epoch,
            });
        }
        Ok(())
    }

    pub fn unsubscribe(&self, filter: &str) -> ClientResult<()> {
        validate_topic_filter(filter)?;

        let mut core = self.shared.lock();
        if !core.accepting {
            return Err(ClientError::ShuttingDown);
        }
        let removed = core.subscriptions.unsubscribe(filter);
        debug!(filter, removed, "subscription removed");

        if removed && core.state == SessionState::Connected {
            let _ = self.control_tx.send(ControlCommand::Unsubscribe {
                filters: vec![filter.to_string()],
                epoch: core.epoch,
            });
        }
        Ok(())
    }

    /// Graceful shutdown bounded by `session.shutdown_timeout_ms`.
    ///
    /// Queued QoS 0 publishes are flushed best effort and DISCONNECT is sent if
    /// the connection is up. Tasks still running at the deadline are aborted.
    pub async fn disconnect(&mut self) -> ClientResult<()> {
        let timeout = self.config.session.shutdown_timeout();
        let deadline = Instant::now() + timeout;

        {
            let mut core = self.shared.lock();
            core.accepting = false;
            if core.state.is_live() {
                let _ = self.shared.apply(&mut core, SessionEvent::ShutdownRequested);
            }
        }
        let _ = self.shutdown_tx.send(true);

        match self.supervisor.take() {
            Some(mut handle) => match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => debug!("session supervisor stopped"),
                Ok(Err(e)) => warn!(error = %e, "session supervisor ended abnormally"),
                Err(_) => {
                    warn!(
                        timeout_ms = timeout.as_millis() as u64,
                        "session supervisor did not stop in time, aborting"
                    );
                    handle.abort();
                    self.finish_aborted();
                }
            },
            None => {
                // Never connected: release the queue receivers
                self.pending = None;
                self.finish_aborted();
            }
        }

        if let Some(dispatcher) = self.dispatcher.take() {
            let grace = deadline.saturating_duration_since(Instant::now());
            dispatcher.shutdown(grace).await;
        }

        info!(client_id = %self.config.connection.client_id, "MQTT client disconnected");
        Ok(())
    }

    fn finish_aborted(&self) {
        let mut core = self.shared.lock();
        if core.state == SessionState::ShuttingDown {
            let _ = self.shared.apply(&mut core, SessionEvent::ShutdownComplete);
        }
        self.shared.metrics.mark_disconnected();
    }

    /// Register an application handler; may be called before or after `connect`
    pub fn add_handler(&self, handler: Arc<dyn EventHandler>) {
        match &self.dispatcher {
            Some(dispatcher) => dispatcher.add_handler(handler),
            None => warn!("handler registered after disconnect, ignored"),
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.shared.watch_state()
    }

    /// Active subscriptions in insertion order
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.shared.lock().subscriptions.snapshot()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Publishes waiting in the outbound queue
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Most recent connection failure, cleared on every successful handshake
    pub fn last_error(&self) -> Option<ClientError> {
        self.shared.lock().last_error.clone()
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.supervisor.take() {
            handle.abort();
        }
    }
}
