//! Upstream call interface.
//!
//! # Data Flow
//! ```text
//! RequestCoordinator / replay handler
//!     → UpstreamTransport::call(UpstreamRequest)
//!     → concrete transport (http.rs: reqwest)
//!     → UpstreamResponse (any status) or typed transport/timeout error
//! ```
//!
//! # Design Decisions
//! - Transports report every status as a response; mapping non-2xx to
//!   `ResilienceError::Upstream` happens in one place (`UpstreamResponse::into_result`)
//! - Trait methods return boxed futures so transports can be used as trait objects

pub mod http;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{ResilienceError, ResilienceResult};

pub use http::HttpTransport;

/// Opaque response payload handed back to application code.
pub type Payload = serde_json::Value;

/// A request to a remote dependency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: Option<Vec<u8>>,
    /// Per-request deadline; the caller's policy timeout applies when unset.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl UpstreamRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into().to_ascii_uppercase(),
            url: url.into(),
            headers: Vec::new(),
            body: None,
            timeout_ms: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new("GET", url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new("POST", url)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn json_body(mut self, body: &serde_json::Value) -> Self {
        self.body = serde_json::to_vec(body).ok();
        if !self.headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("content-type")) {
            self.headers.push(("content-type".into(), "application/json".into()));
        }
        self
    }

    pub fn timeout(mut self, limit: Duration) -> Self {
        self.timeout_ms = Some(limit.as_millis() as u64);
        self
    }

    /// Returns true for methods that change remote state.
    pub fn is_mutating(&self) -> bool {
        !matches!(self.method.as_str(), "GET" | "HEAD" | "OPTIONS")
    }

    /// Path portion of the URL, used for cache busting.
    pub fn path(&self) -> String {
        url::Url::parse(&self.url)
            .map(|u| u.path().to_string())
            .unwrap_or_else(|_| self.url.clone())
    }
}

/// A response from a remote dependency.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl UpstreamResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Map non-2xx statuses to `Upstream` and decode the body.
    /// JSON bodies decode as-is, empty bodies as null, anything else as a string.
    pub fn into_result(self) -> ResilienceResult<Payload> {
        if !self.is_success() {
            return Err(ResilienceError::Upstream { status: self.status });
        }
        if self.body.is_empty() {
            return Ok(Payload::Null);
        }
        Ok(serde_json::from_slice(&self.body)
            .unwrap_or_else(|_| Payload::String(String::from_utf8_lossy(&self.body).into_owned())))
    }
}

/// "Perform network call" capability.
pub trait UpstreamTransport: Send + Sync + 'static {
    fn call(&self, request: UpstreamRequest) -> BoxFuture<'_, ResilienceResult<UpstreamResponse>>;
}
