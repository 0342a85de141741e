//! Connection state machine and identifiers.
//!
//! # State Transitions
//! ```text
//! Disconnected → Connecting: connect() or a scheduled reconnect
//! Connecting → Connected: transport open and handshake accepted
//! any → Disconnected: transport close, error, missed heartbeat, reset
//! Disconnected → Reconnecting: after every loss while the driver runs
//! Reconnecting → Connecting: attempts remain and backoff elapsed
//! Reconnecting → Failed: attempts exhausted
//! ```
//! With no attempts left the driver still enters `Reconnecting`, then moves
//! straight to `Failed`; no retry is scheduled. `Failed` is left only
//! through an explicit reset.

use std::sync::atomic::{AtomicU64, Ordering};

static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for one transport lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Realtime connection state.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Reconnecting = 3,
    Failed = 4,
}

impl ConnectionState {
    /// Whether the state graph allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (a, b) if a == b => false,
            (_, Disconnected) => true,
            (Disconnected, Connecting) | (Disconnected, Reconnecting) => true,
            (Connecting, Connected) => true,
            (Reconnecting, Connecting) | (Reconnecting, Failed) => true,
            _ => false,
        }
    }

    /// Outbound messages are buffered in these states instead of rejected.
    pub fn buffers_outbound(self) -> bool {
        !matches!(self, ConnectionState::Failed)
    }
}

impl From<u8> for ConnectionState {
    fn from(val: u8) -> Self {
        match val {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Reconnecting,
            4 => ConnectionState::Failed,
            _ => ConnectionState::Disconnected,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
            ConnectionState::Failed => write!(f, "failed"),
        }
    }
}
