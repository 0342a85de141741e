//! Realtime connection subsystem.
//!
//! # Data Flow
//! ```text
//! Application send
//!     → manager.rs (accept into buffer.rs unless Failed)
//!     → driver task (flush in FIFO order while Connected)
//!     → transport.rs (RealtimeSink)
//!
//! Inbound frame
//!     → transport.rs (RealtimeStream)
//!     → message.rs (parse envelope; malformed frames dropped)
//!     → auth.rs (rate limit + scope check; failures dropped)
//!     → message subscribers
//! ```

pub mod auth;
pub mod buffer;
pub mod manager;
pub mod message;
pub mod state;
pub mod transport;

pub use auth::{AuthProvider, Credential, StaticAuth};
pub use manager::{ConnectionManager, Degraded, StateChange};
pub use message::RealtimeMessage;
pub use state::{ConnectionId, ConnectionState};
pub use transport::{RealtimeLink, RealtimeSink, RealtimeStream, RealtimeTransport, WsTransport};
