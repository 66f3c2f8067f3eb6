//! Per-client metrics
//!
//! Atomic counters shared between the client handle, the session supervisor,
//! the read loop and the dispatcher. Reads go through [`ClientMetrics::snapshot`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

/// Thread-safe client counters
#[derive(Debug, Default)]
pub struct ClientMetrics {
    connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_losses: AtomicU64,
    messages_published: AtomicU64,
    messages_acknowledged: AtomicU64,
    messages_retransmitted: AtomicU64,
    messages_failed: AtomicU64,
    messages_dropped: AtomicU64,
    messages_received: AtomicU64,
    backpressure_rejections: AtomicU64,
    subscriptions_replayed: AtomicU64,
    events_discarded: AtomicU64,
    events_dropped: AtomicU64,
    connected_since: Mutex<Option<DateTime<Utc>>>,
}

impl ClientMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    // Connection lifecycle
    pub fn connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.connected.store(true, Ordering::Relaxed);
        if let Ok(mut since) = self.connected_since.lock() {
            *since = Some(Utc::now());
        }
    }

    pub fn connection_lost(&self) {
        self.connection_losses.fetch_add(1, Ordering::Relaxed);
        self.mark_disconnected();
    }

    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Relaxed);
        if let Ok(mut since) = self.connected_since.lock() {
            *since = None;
        }
    }

    // Outbound traffic
    pub fn message_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_acknowledged(&self) {
        self.messages_acknowledged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_retransmitted(&self) {
        self.messages_retransmitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_failed(&self) {
        self.messages_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// QoS 0 publish discarded because the connection it was queued for is gone
    pub fn message_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn backpressure_rejection(&self) {
        self.backpressure_rejections.fetch_add(1, Ordering::Relaxed);
    }

    // Inbound traffic
    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subscriptions_replayed(&self, count: usize) {
        self.subscriptions_replayed
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn events_discarded(&self, count: usize) {
        self.events_discarded
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Event refused because its dispatch lane was full
    pub fn event_dropped(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let connected_since = self
            .connected_since
            .lock()
            .ok()
            .and_then(|since| *since);

        MetricsSnapshot {
            timestamp: Utc::now(),
            connected: self.connected.load(Ordering::Relaxed),
            connected_since,
            connection: ConnectionMetrics {
                attempts: self.connection_attempts.load(Ordering::Relaxed),
                established: self.connections_established.load(Ordering::Relaxed),
                losses: self.connection_losses.load(Ordering::Relaxed),
            },
            outbound: OutboundMetrics {
                published: self.messages_published.load(Ordering::Relaxed),
                acknowledged: self.messages_acknowledged.load(Ordering::Relaxed),
                retransmitted: self.messages_retransmitted.load(Ordering::Relaxed),
                failed: self.messages_failed.load(Ordering::Relaxed),
                dropped: self.messages_dropped.load(Ordering::Relaxed),
                backpressure_rejections: self.backpressure_rejections.load(Ordering::Relaxed),
            },
            inbound: InboundMetrics {
                received: self.messages_received.load(Ordering::Relaxed),
                subscriptions_replayed: self.subscriptions_replayed.load(Ordering::Relaxed),
                events_discarded: self.events_discarded.load(Ordering::Relaxed),
                events_dropped: self.events_dropped.load(Ordering::Relaxed),
            },
        }
    }
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub connected: bool,
    pub connected_since: Option<DateTime<Utc>>,
    pub connection: ConnectionMetrics,
    pub outbound: OutboundMetrics,
    pub inbound: InboundMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionMetrics {
    pub attempts: u64,
    pub established: u64,
    pub losses: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutboundMetrics {
    pub published: u64,
    pub acknowledged: u64,
    pub retransmitted: u64,
    pub failed: u64,
    pub dropped: u64,
    pub backpressure_rejections: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct InboundMetrics {
    pub received: u64,
    pub subscriptions_replayed: u64,
    pub events_discarded: u64,
    pub events_dropped: u64,
}
