//! Realtime wire envelope: `{"type": "...", "payload": ...}` JSON text frames.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::realtime::auth::Credential;

pub const AUTH: &str = "auth";
pub const AUTH_OK: &str = "auth_ok";
pub const AUTH_ERROR: &str = "auth_error";
pub const PING: &str = "ping";
pub const PONG: &str = "pong";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

impl RealtimeMessage {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    pub fn auth(credential: &Credential) -> Self {
        Self::new(
            AUTH,
            serde_json::json!({ "token": credential.token, "identity": credential.identity }),
        )
    }

    pub fn ping() -> Self {
        Self::new(PING, Value::Null)
    }

    pub fn pong() -> Self {
        Self::new(PONG, Value::Null)
    }

    /// Connection-management frames, never dispatched to subscribers.
    pub fn is_control(&self) -> bool {
        matches!(self.kind.as_str(), AUTH | AUTH_OK | AUTH_ERROR | PING | PONG)
    }

    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> String {
        // Serializing a String key and a Value cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}
