//! HTTP transport on reqwest.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::time::Duration;

use crate::error::{ResilienceError, ResilienceResult};
use crate::upstream::{UpstreamRequest, UpstreamResponse, UpstreamTransport};

/// Upstream transport backed by a pooled `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    default_timeout: Duration,
}

impl HttpTransport {
    pub fn new(default_timeout: Duration) -> ResilienceResult<Self> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .build()
            .map_err(|e| ResilienceError::Transport(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self::with_client(client, default_timeout))
    }

    pub fn with_client(client: reqwest::Client, default_timeout: Duration) -> Self {
        Self {
            client,
            default_timeout,
        }
    }

    async fn send(&self, request: UpstreamRequest) -> ResilienceResult<UpstreamResponse> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| ResilienceError::Transport(format!("invalid method '{}'", request.method)))?;
        let timeout = request
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);

        let mut builder = self.client.request(method, &request.url).timeout(timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|e| map_error(e, timeout))?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();
        let body = response.bytes().await.map_err(|e| map_error(e, timeout))?;

        Ok(UpstreamResponse {
            status,
            headers,
            body: body.to_vec(),
        })
    }
}

fn map_error(err: reqwest::Error, timeout: Duration) -> ResilienceError {
    if err.is_timeout() {
        ResilienceError::Timeout(timeout)
    } else {
        ResilienceError::Transport(err.to_string())
    }
}

impl UpstreamTransport for HttpTransport {
    fn call(&self, request: UpstreamRequest) -> BoxFuture<'_, ResilienceResult<UpstreamResponse>> {
        tracing::trace!(method = %request.method, url = %request.url, "Upstream call");
        self.send(request).boxed()
    }
}
