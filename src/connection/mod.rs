//! Persistent control channel
//!
//! [`ConnectionManager`] keeps one [`ControlSession`] alive: it connects,
//! retries failed connects at a fixed interval up to a maximum, runs a
//! heartbeat while the session is established and reconnects when the
//! session reports that it closed.
//!
//! ```text
//! Idle -> Connecting -> Established
//!            ^  |            |
//!            +--+ retry      | session closed
//!            ^               |
//!            +---------------+
//!
//! Connecting (retries exhausted) -> Closed
//! any state (stop)               -> Closed
//! ```

mod heartbeat;
mod manager;
mod session;
mod websocket;

#[cfg(test)]
mod tests;

pub use heartbeat::{HeartbeatMessage, HeartbeatStatus};
pub use manager::ConnectionManager;
pub use session::{ControlSession, EventHook, MessageHook, SessionFactory};
pub use websocket::{WebSocketFactory, WebSocketSession};

use serde::Serialize;

/// Lifecycle state of the control channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not started, or started without a server address
    Idle,
    /// Connect attempt in progress or backing off between attempts
    Connecting,
    /// Session open, heartbeat running
    Established,
    /// Stopped, or retries exhausted; needs an explicit start
    Closed,
}

impl ConnectionState {
    /// Whether the manager is no longer trying to connect
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed)
    }
}
