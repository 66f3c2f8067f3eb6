//! Reconnect backoff: exponential, capped, with subtractive jitter

use crate::config::SessionSection;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

/// Reconnect tuning
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of the delay that may be randomly removed
    pub jitter: f64,
    /// Connected time after which the delay resets to `initial_delay`
    pub stability_threshold: Duration,
    /// Consecutive failed attempts allowed; `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&SessionSection::default())
    }
}

impl From<&SessionSection> for ReconnectPolicy {
    fn from(section: &SessionSection) -> Self {
        Self {
            initial_delay: Duration::from_millis(section.initial_backoff_ms),
            max_delay: Duration::from_millis(section.max_backoff_ms),
            multiplier: section.backoff_multiplier,
            jitter: section.jitter,
            stability_threshold: Duration::from_secs(section.stability_threshold_secs),
            max_attempts: section.max_reconnect_attempts,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given attempt (1-based), before jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let initial_ms = self.initial_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let delay_ms = (initial_ms * self.multiplier.powi(exponent)).min(max_ms);
        Duration::from_millis(delay_ms as u64)
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, Clone, PartialEq)]
pub enum ReconnectionDecision {
    /// Wait `delay`, then make attempt number `attempt`
    Proceed { attempt: u32, delay: Duration },
    AbortShutdownRequested,
    AbortMaxAttemptsExceeded,
}

/// Backoff tracker owned by the session supervisor
#[derive(Debug)]
pub struct Backoff {
    policy: ReconnectPolicy,
    /// Position on the exponential curve; reset only after a stable connection
    level: u32,
    /// Attempts since the last successful handshake
    failures: u32,
    rng: StdRng,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self::with_rng(policy, StdRng::from_entropy())
    }

    /// Deterministic jitter for tests
    pub fn with_seed(policy: ReconnectPolicy, seed: u64) -> Self {
        Self::with_rng(policy, StdRng::seed_from_u64(seed))
    }

    fn with_rng(policy: ReconnectPolicy, rng: StdRng) -> Self {
        Self {
            policy,
            level: 0,
            failures: 0,
            rng,
        }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Decide whether and when to make the next connection attempt
    pub fn next_attempt(&mut self, shutdown_requested: bool) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }
        if let Some(max_attempts) = self.policy.max_attempts {
            if self.failures >= max_attempts {
                return ReconnectionDecision::AbortMaxAttemptsExceeded;
            }
        }

        self.failures += 1;
        self.level = self.level.saturating_add(1);
        let base = self.policy.base_delay(self.level);

        ReconnectionDecision::Proceed {
            attempt: self.failures,
            delay: self.apply_jitter(base),
        }
    }

    /// Record a successful handshake
    pub fn record_success(&mut self) {
        self.failures = 0;
    }

    /// Record how long the last connection stayed up; long enough resets the curve
    pub fn record_connected_for(&mut self, uptime: Duration) {
        if uptime >= self.policy.stability_threshold {
            self.level = 0;
        }
    }

    pub fn reset(&mut self) {
        self.level = 0;
        self.failures = 0;
    }

    fn apply_jitter(&mut self, base: Duration) -> Duration {
        if self.policy.jitter <= 0.0 {
            return base;
        }
        let fraction: f64 = self.rng.gen_range(0.0..self.policy.jitter);
        base.mul_f64(1.0 - fraction)
    }
}
