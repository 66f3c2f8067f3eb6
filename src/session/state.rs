//! Session lifecycle state machine
//!
//! Transitions are computed by the pure [`next_state`] function; the
//! supervisor is the only writer and publishes every new state.

use serde::Serialize;
use std::fmt;
use thiserror::Error;
use tracing::{error, info, warn};

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    ShuttingDown,
}

impl SessionState {
    /// States from which a shutdown can be requested
    pub fn is_live(&self) -> bool {
        !matches!(self, SessionState::Disconnected | SessionState::ShuttingDown)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Reconnecting => "reconnecting",
            SessionState::ShuttingDown => "shutting_down",
        };
        f.write_str(name)
    }
}

/// Events that drive state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    ConnectRequested,
    HandshakeSucceeded,
    /// Transient failure while connecting
    AttemptFailed,
    ConnectionLost,
    BackoffElapsed,
    /// Non-retryable failure (handshake or CONNACK refusal)
    Fatal,
    RetriesExhausted,
    ShutdownRequested,
    ShutdownComplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Invalid session transition: {event:?} in state {from}")]
pub struct InvalidTransition {
    pub from: SessionState,
    pub event: SessionEvent,
}

/// Compute the state that follows `event` in state `from`
pub fn next_state(from: SessionState, event: SessionEvent) -> Result<SessionState, InvalidTransition> {
    use SessionEvent as E;
    use SessionState as S;

    let next = match (from, event) {
        (S::Disconnected, E::ConnectRequested) => S::Connecting,
        (S::Connecting, E::HandshakeSucceeded) => S::Connected,
        (S::Connecting, E::AttemptFailed) => S::Reconnecting,
        (S::Connecting, E::Fatal) => S::Disconnected,
        (S::Connected, E::ConnectionLost) => S::Reconnecting,
        (S::Reconnecting, E::BackoffElapsed) => S::Connecting,
        (S::Reconnecting, E::RetriesExhausted) => S::Disconnected,
        (state, E::ShutdownRequested) if state.is_live() => S::ShuttingDown,
        (S::ShuttingDown, E::ShutdownComplete) => S::Disconnected,
        _ => return Err(InvalidTransition { from, event }),
    };
    Ok(next)
}

/// Log a state transition at a level matching its severity
pub fn log_state_transition(from: SessionState, to: SessionState, event: SessionEvent) {
    match (from, to, event) {
        (SessionState::Connecting, SessionState::Connected, _) => {
            info!(from = %from, to = %to, "MQTT session established");
        }
        (SessionState::Connected, SessionState::Reconnecting, _) => {
            warn!(from = %from, to = %to, "MQTT connection lost");
        }
        (_, SessionState::Disconnected, SessionEvent::Fatal) => {
            error!(from = %from, to = %to, "MQTT session failed permanently");
        }
        (_, SessionState::Disconnected, SessionEvent::RetriesExhausted) => {
            error!(from = %from, to = %to, "MQTT reconnect attempts exhausted");
        }
        _ => {
            info!(from = %from, to = %to, event = ?event, "MQTT session state changed");
        }
    }
}
