//! Event dispatch to application handlers
//!
//! Events are pushed onto bounded per-lane channels by the network tasks and
//! consumed by dedicated lane tasks, so a slow handler never stalls the read
//! loop. A lane that is full drops new events and counts them. Messages are
//! assigned to a lane by topic hash, which keeps delivery ordered per topic.
//! Lifecycle and error events always use lane 0.

use crate::error::ClientError;
use crate::observability::ClientMetrics;
use crate::protocol::QoS;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A publish received from the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    /// Payload as UTF-8 text, if it is valid
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

#[derive(Debug, Clone)]
pub enum Event {
    Connected {
        session_present: bool,
    },
    Disconnected {
        reason: String,
        will_reconnect: bool,
    },
    /// One event per matching subscription filter
    Message {
        filter: String,
        message: Arc<InboundMessage>,
    },
    Error(Arc<ClientError>),
}

impl Event {
    fn kind(&self) -> &'static str {
        match self {
            Event::Connected { .. } => "connected",
            Event::Disconnected { .. } => "disconnected",
            Event::Message { .. } => "message",
            Event::Error(_) => "error",
        }
    }
}

/// Application callbacks; every method defaults to a no-op
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_connect(&self, _session_present: bool) {}

    async fn on_disconnect(&self, _reason: &str, _will_reconnect: bool) {}

    async fn on_message(&self, _filter: &str, _message: &InboundMessage) {}

    async fn on_error(&self, _error: &ClientError) {}
}

type HandlerList = Arc<RwLock<Vec<Arc<dyn EventHandler>>>>;

/// Events buffered per lane unless configured otherwise
pub const DEFAULT_LANE_CAPACITY: usize = 1024;

/// Cloneable producer side used by the session tasks
#[derive(Clone)]
pub struct EventSender {
    lanes: Arc<[mpsc::Sender<Event>]>,
    metrics: Arc<ClientMetrics>,
}

impl EventSender {
    /// Queue an event without waiting; dropped and counted when its lane is full
    pub fn send(&self, event: Event) {
        let lane = match &event {
            Event::Message { message, .. } => lane_for(&message.topic, self.lanes.len()),
            _ => 0,
        };
        let Some(sender) = self.lanes.get(lane) else {
            return;
        };
        match sender.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.metrics.event_dropped();
                warn!(lane, event = event.kind(), "dispatch lane full, event dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(lane, "dispatcher stopped, event dropped");
            }
        }
    }

    pub fn error(&self, error: ClientError) {
        self.send(Event::Error(Arc::new(error)));
    }
}

/// Lane index for a topic
pub fn lane_for(topic: &str, lanes: usize) -> usize {
    if lanes <= 1 {
        return 0;
    }
    let mut hasher = DefaultHasher::new();
    topic.hash(&mut hasher);
    (hasher.finish() % lanes as u64) as usize
}

pub struct Dispatcher {
    sender: Option<EventSender>,
    handlers: HandlerList,
    cancel: watch::Sender<bool>,
    tasks: Vec<JoinHandle<usize>>,
    metrics: Arc<ClientMetrics>,
}

impl Dispatcher {
    /// Spawn `lanes` dispatch tasks on the current runtime
    pub fn start(lanes: usize, metrics: Arc<ClientMetrics>) -> Self {
        Self::with_capacity(lanes, DEFAULT_LANE_CAPACITY, metrics)
    }

    /// Like [`start`](Self::start) with `lane_capacity` events buffered per lane
    pub fn with_capacity(lanes: usize, lane_capacity: usize, metrics: Arc<ClientMetrics>) -> Self {
        let lanes = lanes.max(1);
        let handlers: HandlerList = Arc::default();
        let (cancel, cancel_rx) = watch::channel(false);

        let mut senders = Vec::with_capacity(lanes);
        let mut tasks = Vec::with_capacity(lanes);
        for index in 0..lanes {
            let (tx, rx) = mpsc::channel(lane_capacity.max(1));
            senders.push(tx);
            tasks.push(tokio::spawn(run_lane(
                index,
                rx,
                handlers.clone(),
                cancel_rx.clone(),
            )));
        }

        Self {
            sender: Some(EventSender {
                lanes: senders.into(),
                metrics: metrics.clone(),
            }),
            handlers,
            cancel,
            tasks,
            metrics,
        }
    }

    pub fn add_handler(&self, handler: Arc<dyn EventHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    pub fn handler_count(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Producer handle; `None` once shutdown has begun
    pub fn sender(&self) -> Option<EventSender> {
        self.sender.clone()
    }

    /// Deliver what is already queued for up to `grace`, then cancel.
    ///
    /// Cancellation interrupts running handlers at their next await point;
    /// events still queued are discarded and counted. Returns the discarded count.
    pub async fn shutdown(mut self, grace: Duration) -> usize {
        // Lanes finish on their own once every sender is gone
        self.sender = None;
        let mut pending: VecDeque<JoinHandle<usize>> = std::mem::take(&mut self.tasks).into();
        let deadline = Instant::now() + grace;
        let mut discarded = 0;

        while let Some(task) = pending.front_mut() {
            match tokio::time::timeout_at(deadline, task).await {
                Ok(result) => {
                    discarded += lane_result(result);
                    pending.pop_front();
                }
                Err(_) => break,
            }
        }

        if !pending.is_empty() {
            warn!(
                grace_ms = grace.as_millis() as u64,
                lanes = pending.len(),
                "dispatcher did not drain in time, cancelling handlers"
            );
            let _ = self.cancel.send(true);
            for task in pending {
                match tokio::time::timeout(Duration::from_secs(1), task).await {
                    Ok(result) => discarded += lane_result(result),
                    Err(_) => warn!("dispatch lane ignored cancellation"),
                }
            }
        }

        if discarded > 0 {
            info!(discarded, "discarded undelivered events");
            self.metrics.events_discarded(discarded);
        }
        discarded
    }
}

fn lane_result(result: Result<usize, JoinError>) -> usize {
    match result {
        Ok(discarded) => discarded,
        Err(e) => {
            if e.is_panic() {
                warn!(error = %e, "dispatch lane panicked");
            }
            0
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        let _ = self.cancel.send(true);
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    while !*cancel.borrow_and_update() {
        if cancel.changed().await.is_err() {
            return;
        }
    }
}

async fn run_lane(
    index: usize,
    mut events: mpsc::Receiver<Event>,
    handlers: HandlerList,
    mut cancel: watch::Receiver<bool>,
) -> usize {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => return 0,
            },
        };

        let snapshot: Vec<Arc<dyn EventHandler>> = handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let kind = event.kind();

        tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => {
                debug!(lane = index, event = kind, "handler interrupted");
                break;
            }
            _ = deliver(&snapshot, &event) => {}
        }
    }

    events.close();
    let mut discarded = 0;
    while events.try_recv().is_ok() {
        discarded += 1;
    }
    discarded
}

async fn deliver(handlers: &[Arc<dyn EventHandler>], event: &Event) {
    for handler in handlers {
        match event {
            Event::Connected { session_present } => handler.on_connect(*session_present).await,
            Event::Disconnected {
                reason,
                will_reconnect,
            } => handler.on_disconnect(reason, *will_reconnect).await,
            Event::Message { filter, message } => handler.on_message(filter, message).await,
            Event::Error(error) => handler.on_error(error).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        async fn on_connect(&self, session_present: bool) {
            self.seen
                .lock()
                .unwrap()
                .push(format!("connect:{session_present}"));
        }

        async fn on_message(&self, filter: &str, message: &InboundMessage) {
            self.seen
                .lock()
                .unwrap()
                .push(format!("{filter}|{}", message.payload_str().unwrap_or("")));
        }
    }

    struct Stalled;

    #[async_trait]
    impl EventHandler for Stalled {
        async fn on_message(&self, _filter: &str, _message: &InboundMessage) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
    }

    fn message(topic: &str, payload: &'static str) -> Event {
        Event::Message {
            filter: "factory/#".to_string(),
            message: Arc::new(InboundMessage {
                topic: topic.to_string(),
                payload: Bytes::from_static(payload.as_bytes()),
                qos: QoS::AtLeastOnce,
                retain: false,
                dup: false,
                received_at: Utc::now(),
            }),
        }
    }

    #[test]
    fn test_lane_assignment_is_stable() {
        let lane = lane_for("factory/B7/line3/telemetry", 4);
        assert!(lane < 4);
        assert_eq!(lane_for("factory/B7/line3/telemetry", 4), lane);
        assert_eq!(lane_for("anything", 1), 0);
    }

    #[tokio::test]
    async fn test_events_delivered_in_order_per_topic() {
        // Arrange
        let dispatcher = Dispatcher::start(4, Arc::new(ClientMetrics::new()));
        let recorder = Arc::new(Recorder::default());
        dispatcher.add_handler(recorder.clone());
        let sender = dispatcher.sender().unwrap();

        // Act
        sender.send(Event::Connected {
            session_present: false,
        });
        for payload in ["1", "2", "3"] {
            sender.send(message("factory/B7/line3/telemetry", payload));
        }
        drop(sender);
        let discarded = dispatcher.shutdown(Duration::from_secs(1)).await;

        // Assert
        assert_eq!(discarded, 0);
        let seen = recorder.seen.lock().unwrap().clone();
        assert!(seen.contains(&"connect:false".to_string()));
        let messages: Vec<_> = seen.iter().filter(|s| s.starts_with("factory")).collect();
        assert_eq!(
            messages,
            vec!["factory/#|1", "factory/#|2", "factory/#|3"]
        );
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_stalled_handler_and_discards_backlog() {
        let metrics = Arc::new(ClientMetrics::new());
        let dispatcher = Dispatcher::start(1, metrics.clone());
        dispatcher.add_handler(Arc::new(Stalled));
        let sender = dispatcher.sender().unwrap();

        sender.send(message("factory/a", "stuck"));
        sender.send(message("factory/a", "queued-1"));
        sender.send(message("factory/a", "queued-2"));
        drop(sender);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = std::time::Instant::now();
        let discarded = dispatcher.shutdown(Duration::from_millis(100)).await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(discarded, 2);
        assert_eq!(metrics.snapshot().inbound.events_discarded, 2);
    }

    #[tokio::test]
    async fn test_full_lane_drops_and_counts_events() {
        // Arrange
        let metrics = Arc::new(ClientMetrics::new());
        let dispatcher = Dispatcher::with_capacity(1, 2, metrics.clone());
        dispatcher.add_handler(Arc::new(Stalled));
        let sender = dispatcher.sender().unwrap();
        sender.send(message("factory/a", "stuck"));
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Act
        for payload in ["queued-1", "queued-2", "overflow-1", "overflow-2"] {
            sender.send(message("factory/a", payload));
        }
        drop(sender);

        // Assert
        assert_eq!(metrics.snapshot().inbound.events_dropped, 2);
        let discarded = dispatcher.shutdown(Duration::from_millis(50)).await;
        assert_eq!(discarded, 2);
    }

    #[tokio::test]
    async fn test_handlers_added_later_receive_events() {
        let dispatcher = Dispatcher::start(2, Arc::new(ClientMetrics::new()));
        let sender = dispatcher.sender().unwrap();
        let recorder = Arc::new(Recorder::default());

        dispatcher.add_handler(recorder.clone());
        sender.send(Event::Connected {
            session_present: true,
        });
        drop(sender);
        dispatcher.shutdown(Duration::from_secs(1)).await;

        assert_eq!(
            recorder.seen.lock().unwrap().as_slice(),
            ["connect:true".to_string()]
        );
    }
}
