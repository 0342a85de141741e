//! Realtime transport abstraction and its WebSocket implementation.

use futures_util::future::BoxFuture;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{FutureExt, SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::{ResilienceError, ResilienceResult};

/// Outbound half of an open connection.
pub trait RealtimeSink: Send + 'static {
    /// Write one text frame. Resolves once the frame is flushed.
    fn send(&mut self, text: String) -> BoxFuture<'_, ResilienceResult<()>>;

    fn close(&mut self) -> BoxFuture<'_, ()>;
}

/// Inbound half of an open connection.
pub trait RealtimeStream: Send + 'static {
    /// Next text frame; `None` once the peer closed.
    fn next(&mut self) -> BoxFuture<'_, Option<ResilienceResult<String>>>;
}

/// An open connection, split into halves.
pub struct RealtimeLink {
    pub sink: Box<dyn RealtimeSink>,
    pub stream: Box<dyn RealtimeStream>,
}

impl std::fmt::Debug for RealtimeLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeLink").finish_non_exhaustive()
    }
}

/// Opens realtime connections.
pub trait RealtimeTransport: Send + Sync + 'static {
    fn connect<'a>(&'a self, endpoint: &'a str) -> BoxFuture<'a, ResilienceResult<RealtimeLink>>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket transport over `tokio-tungstenite`.
#[derive(Debug, Clone)]
pub struct WsTransport {
    connect_timeout: Duration,
}

impl WsTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl RealtimeTransport for WsTransport {
    fn connect<'a>(&'a self, endpoint: &'a str) -> BoxFuture<'a, ResilienceResult<RealtimeLink>> {
        async move {
            let connecting = tokio_tungstenite::connect_async(endpoint);
            let (ws, _response) = tokio::time::timeout(self.connect_timeout, connecting)
                .await
                .map_err(|_| ResilienceError::Timeout(self.connect_timeout))?
                .map_err(|e| ResilienceError::Transport(e.to_string()))?;

            let (sink, stream) = ws.split();
            Ok(RealtimeLink {
                sink: Box::new(WsSink { inner: sink }),
                stream: Box::new(WsReader { inner: stream }),
            })
        }
        .boxed()
    }
}

struct WsSink {
    inner: SplitSink<WsStream, Message>,
}

impl RealtimeSink for WsSink {
    fn send(&mut self, text: String) -> BoxFuture<'_, ResilienceResult<()>> {
        async move {
            self.inner
                .send(Message::text(text))
                .await
                .map_err(|e| ResilienceError::Transport(e.to_string()))
        }
        .boxed()
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        async move {
            let _ = self.inner.close().await;
        }
        .boxed()
    }
}

struct WsReader {
    inner: SplitStream<WsStream>,
}

impl RealtimeStream for WsReader {
    fn next(&mut self) -> BoxFuture<'_, Option<ResilienceResult<String>>> {
        async move {
            loop {
                let frame = match self.inner.next().await {
                    Some(frame) => frame,
                    None => return None,
                };
                match frame {
                    Ok(Message::Text(text)) => return Some(Ok(text.as_str().to_owned())),
                    Ok(Message::Binary(bytes)) => {
                        return Some(
                            String::from_utf8(bytes.to_vec())
                                .map_err(|e| ResilienceError::Transport(e.to_string())),
                        )
                    }
                    Ok(Message::Close(_)) => return None,
                    // Protocol-level ping/pong is answered by tungstenite
                    Ok(_) => continue,
                    Err(e) => return Some(Err(ResilienceError::Transport(e.to_string()))),
                }
            }
        }
        .boxed()
    }
}
