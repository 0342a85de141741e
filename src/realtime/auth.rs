//! Authentication collaborator for the realtime connection.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use crate::config::schema::{AuthConfig, RateLimitConfig};
use crate::error::{ResilienceError, ResilienceResult};
use crate::realtime::message::{self, RealtimeMessage};
use crate::realtime::state::ConnectionId;
use crate::resilience::RateLimiter;

/// Credential presented during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    pub identity: String,
}

/// Supplies credentials and vets inbound traffic.
pub trait AuthProvider: Send + Sync + 'static {
    /// Current credential. Called once per connection attempt.
    fn credential(&self) -> BoxFuture<'_, ResilienceResult<Credential>>;

    /// Whether `message` is within the authenticated scope of `connection`.
    fn validate_inbound(&self, message: &RealtimeMessage, connection: ConnectionId) -> bool;

    /// Take one slot of `connection`'s inbound allowance.
    fn check_rate_limit(&self, connection: ConnectionId) -> bool;

    /// Release per-connection state.
    fn connection_closed(&self, _connection: ConnectionId) {}
}

/// Token and identity from configuration, fixed-window inbound limit.
#[derive(Debug)]
pub struct StaticAuth {
    credential: Credential,
    inbound_limit: RateLimitConfig,
    limiter: RateLimiter,
}

impl StaticAuth {
    pub fn new(credential: Credential, inbound_limit: RateLimitConfig) -> Self {
        Self {
            credential,
            inbound_limit,
            limiter: RateLimiter::new(),
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(
            Credential {
                token: config.token.clone(),
                identity: config.identity.clone(),
            },
            RateLimitConfig {
                max_per_window: config.inbound_max_per_window,
                window_secs: config.inbound_window_secs,
            },
        )
    }
}

impl AuthProvider for StaticAuth {
    fn credential(&self) -> BoxFuture<'_, ResilienceResult<Credential>> {
        let result = if self.credential.token.is_empty() {
            Err(ResilienceError::Authentication("no token configured".to_string()))
        } else {
            Ok(self.credential.clone())
        };
        futures_util::future::ready(result).boxed()
    }

    /// Rejects empty kinds, client-only frames, and messages addressed to
    /// another identity via a `recipient` payload field.
    fn validate_inbound(&self, msg: &RealtimeMessage, _connection: ConnectionId) -> bool {
        if msg.kind.is_empty() || msg.kind == message::AUTH {
            return false;
        }
        match msg.payload.get("recipient").and_then(|r| r.as_str()) {
            Some(recipient) => recipient == self.credential.identity,
            None => true,
        }
    }

    fn check_rate_limit(&self, connection: ConnectionId) -> bool {
        self.limiter.try_acquire(&connection.to_string(), &self.inbound_limit)
    }

    fn connection_closed(&self, connection: ConnectionId) {
        self.limiter.forget(&connection.to_string());
    }
}
