//! Active subscription set
//!
//! Filters are kept in insertion order; re-subscribing an existing filter
//! updates its QoS in place. The whole set is replayed as one SUBSCRIBE batch
//! whenever the session (re)connects.

use crate::protocol::{
    matches, validate_topic_filter, QoS, SubscribeFilter, SubscribeReturnCode, TopicError,
};
use serde::Serialize;
use tracing::warn;

/// Broker acknowledgment status of a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AckStatus {
    /// SUBSCRIBE sent or queued, no SUBACK yet
    Pending,
    /// Granted at the given maximum QoS
    Granted(QoS),
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subscription {
    pub filter: String,
    pub qos: QoS,
    pub status: AckStatus,
}

/// Result of [`SubscriptionManager::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Added,
    /// Existing filter, new QoS or a retry after rejection
    Updated,
    Unchanged,
}

impl SubscribeOutcome {
    /// Whether the broker needs to hear about this change
    pub fn needs_subscribe(&self) -> bool {
        !matches!(self, SubscribeOutcome::Unchanged)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SubscriptionManager {
    entries: Vec<Subscription>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, filter: &str, qos: QoS) -> Result<SubscribeOutcome, TopicError> {
        validate_topic_filter(filter)?;

        if let Some(entry) = self.entries.iter_mut().find(|e| e.filter == filter) {
            if entry.qos == qos && entry.status != AckStatus::Rejected {
                return Ok(SubscribeOutcome::Unchanged);
            }
            entry.qos = qos;
            entry.status = AckStatus::Pending;
            return Ok(SubscribeOutcome::Updated);
        }

        self.entries.push(Subscription {
            filter: filter.to_string(),
            qos,
            status: AckStatus::Pending,
        });
        Ok(SubscribeOutcome::Added)
    }

    /// Remove a filter, returning whether it was active
    pub fn unsubscribe(&mut self, filter: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.filter != filter);
        self.entries.len() != before
    }

    pub fn get(&self, filter: &str) -> Option<&Subscription> {
        self.entries.iter().find(|e| e.filter == filter)
    }

    pub fn contains(&self, filter: &str) -> bool {
        self.get(filter).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subscription> {
        self.entries.iter()
    }

    /// Copy of the active set, in insertion order
    pub fn snapshot(&self) -> Vec<Subscription> {
        self.entries.clone()
    }

    /// Every active filter, in insertion order, for a single SUBSCRIBE
    pub fn replay_batch(&self) -> Vec<SubscribeFilter> {
        self.entries
            .iter()
            .map(|e| SubscribeFilter::new(e.filter.clone(), e.qos))
            .collect()
    }

    /// Forget broker acknowledgments; called when a new connection starts
    pub fn mark_all_pending(&mut self) {
        for entry in &mut self.entries {
            entry.status = AckStatus::Pending;
        }
    }

    /// Record a SUBACK for the filters of one SUBSCRIBE, returning the rejected filters
    pub fn apply_suback(
        &mut self,
        filters: &[SubscribeFilter],
        return_codes: &[SubscribeReturnCode],
    ) -> Vec<String> {
        if filters.len() != return_codes.len() {
            warn!(
                filters = filters.len(),
                return_codes = return_codes.len(),
                "SUBACK return code count does not match SUBSCRIBE"
            );
        }

        let mut rejected = Vec::new();
        for (sent, code) in filters.iter().zip(return_codes) {
            // Skip filters unsubscribed or re-subscribed at another QoS meanwhile
            let Some(entry) = self
                .entries
                .iter_mut()
                .find(|e| e.filter == sent.filter && e.qos == sent.qos)
            else {
                continue;
            };
            entry.status = match code {
                SubscribeReturnCode::Success(granted) => AckStatus::Granted(*granted),
                SubscribeReturnCode::Failure => {
                    rejected.push(entry.filter.clone());
                    AckStatus::Rejected
                }
            };
        }
        rejected
    }

    /// Active filters matching `topic`, in insertion order; rejected filters never match
    pub fn matching_filters(&self, topic: &str) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.status != AckStatus::Rejected && matches(&e.filter, topic))
            .map(|e| e.filter.clone())
            .collect()
    }
}
