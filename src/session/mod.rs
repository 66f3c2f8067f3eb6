//! Session lifecycle: state machine, keepalive, reconnect backoff and the
//! supervisor task that drives them.

pub mod backoff;
pub mod keepalive;
pub mod state;
pub mod supervisor;

pub use backoff::{Backoff, ReconnectPolicy, ReconnectionDecision};
pub use keepalive::{KeepAlive, KeepAliveAction};
pub use state::{log_state_transition, next_state, InvalidTransition, SessionEvent, SessionState};
pub use supervisor::{read_loop, SessionCore, SessionShared, Supervisor};

use tokio::sync::watch;

/// Resolves once the shutdown flag is set or its sender is gone
pub async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Sleep that ends early on shutdown; returns false when interrupted
pub async fn interruptible_sleep(
    shutdown: &mut watch::Receiver<bool>,
    delay: std::time::Duration,
) -> bool {
    tokio::select! {
        _ = shutdown_signalled(shutdown) => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
