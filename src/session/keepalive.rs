//! Keepalive ping scheduling
//!
//! A PINGREQ goes out when nothing else was sent for one interval. If the
//! PINGRESP has not arrived 1.5 intervals after the ping, the link is dead.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveAction {
    Idle,
    SendPing,
    /// No PINGRESP within the deadline
    Expired,
}

#[derive(Debug, Clone)]
pub struct KeepAlive {
    interval: Option<Duration>,
    last_sent: Instant,
    ping_sent_at: Option<Instant>,
}

impl KeepAlive {
    /// A zero interval disables keepalive entirely
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval: (!interval.is_zero()).then_some(interval),
            last_sent: now,
            ping_sent_at: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.interval.is_some()
    }

    /// Any packet written to the socket counts as activity
    pub fn record_sent(&mut self, now: Instant) {
        self.last_sent = now;
    }

    pub fn record_ping_sent(&mut self, now: Instant) {
        self.last_sent = now;
        self.ping_sent_at = Some(now);
    }

    pub fn record_pong(&mut self) {
        self.ping_sent_at = None;
    }

    pub fn awaiting_pong(&self) -> bool {
        self.ping_sent_at.is_some()
    }

    pub fn poll(&self, now: Instant) -> KeepAliveAction {
        let Some(interval) = self.interval else {
            return KeepAliveAction::Idle;
        };

        match self.ping_sent_at {
            Some(sent) if now.saturating_duration_since(sent) >= pong_deadline(interval) => {
                KeepAliveAction::Expired
            }
            Some(_) => KeepAliveAction::Idle,
            None if now.saturating_duration_since(self.last_sent) >= interval => {
                KeepAliveAction::SendPing
            }
            None => KeepAliveAction::Idle,
        }
    }

    /// Next instant at which [`poll`](Self::poll) may change its answer
    pub fn next_deadline(&self) -> Option<Instant> {
        let interval = self.interval?;
        Some(match self.ping_sent_at {
            Some(sent) => sent + pong_deadline(interval),
            None => self.last_sent + interval,
        })
    }
}

fn pong_deadline(interval: Duration) -> Duration {
    interval + interval / 2
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn test_ping_after_idle_interval() {
        let start = Instant::now();
        let keepalive = KeepAlive::new(secs(60), start);

        assert_eq!(keepalive.poll(start + secs(59)), KeepAliveAction::Idle);
        assert_eq!(keepalive.poll(start + secs(60)), KeepAliveAction::SendPing);
        assert_eq!(keepalive.next_deadline(), Some(start + secs(60)));
    }

    #[test]
    fn test_traffic_postpones_ping() {
        let start = Instant::now();
        let mut keepalive = KeepAlive::new(secs(60), start);

        keepalive.record_sent(start + secs(40));
        assert_eq!(keepalive.poll(start + secs(60)), KeepAliveAction::Idle);
        assert_eq!(keepalive.poll(start + secs(100)), KeepAliveAction::SendPing);
    }

    #[test]
    fn test_missing_pong_expires_after_one_and_a_half_intervals() {
        let start = Instant::now();
        let mut keepalive = KeepAlive::new(secs(60), start);
        let ping_at = start + secs(60);
        keepalive.record_ping_sent(ping_at);

        assert!(keepalive.awaiting_pong());
        assert_eq!(keepalive.poll(ping_at + secs(89)), KeepAliveAction::Idle);
        assert_eq!(keepalive.poll(ping_at + secs(90)), KeepAliveAction::Expired);
        assert_eq!(keepalive.next_deadline(), Some(ping_at + secs(90)));
    }

    #[test]
    fn test_pong_clears_deadline() {
        let start = Instant::now();
        let mut keepalive = KeepAlive::new(secs(10), start);
        keepalive.record_ping_sent(start + secs(10));
        keepalive.record_pong();

        assert!(!keepalive.awaiting_pong());
        assert_eq!(keepalive.poll(start + secs(19)), KeepAliveAction::Idle);
        assert_eq!(keepalive.poll(start + secs(20)), KeepAliveAction::SendPing);
    }

    #[test]
    fn test_zero_interval_disables_pings() {
        let start = Instant::now();
        let keepalive = KeepAlive::new(Duration::ZERO, start);

        assert!(!keepalive.is_enabled());
        assert_eq!(keepalive.poll(start + secs(3600)), KeepAliveAction::Idle);
        assert_eq!(keepalive.next_deadline(), None);
    }
}
