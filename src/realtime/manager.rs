//! Realtime connection manager.
//!
//! # Responsibilities
//! - Open the transport to the primary endpoint, rotating through fallbacks on reconnect
//! - Authenticate each new connection before reporting it connected
//! - Probe liveness with ping/pong; a missed pong counts as a close
//! - Buffer outbound messages while not connected and flush them in order
//! - Vet inbound messages through the auth collaborator before dispatch
//!
//! # Design Decisions
//! - One driver task owns the open link; callers only touch the buffer
//! - State is mirrored in an atomic and a watch channel for lock-free reads
//! - A message leaves the buffer only after the sink reports it written
//! - Every loss passes through `Reconnecting`; once attempts are exhausted
//!   the next hop is `Failed` instead of `Connecting`

use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::config::schema::RealtimeConfig;
use crate::error::{ResilienceError, ResilienceResult};
use crate::events::{EventBus, Subscription};
use crate::observability::metrics;
use crate::realtime::auth::AuthProvider;
use crate::realtime::buffer::OutboundBuffer;
use crate::realtime::message::{self, RealtimeMessage};
use crate::realtime::state::{ConnectionId, ConnectionState};
use crate::realtime::transport::{RealtimeLink, RealtimeTransport};
use crate::resilience::backoff::reconnect_delay;
use crate::resilience::timeouts::with_timeout;

/// A connection state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

/// Emitted once reconnection gives up; consumers should switch to a
/// degraded mode (e.g. polling) until `reset`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Degraded {
    pub attempts: u32,
    pub last_error: String,
}

/// Why a served connection ended.
enum LinkEnd {
    Stopped,
    Lost(String),
}

struct Driver {
    handle: JoinHandle<()>,
    stop: watch::Sender<bool>,
}

struct Inner {
    transport: Arc<dyn RealtimeTransport>,
    auth: Arc<dyn AuthProvider>,
    config: ArcSwap<RealtimeConfig>,
    state: AtomicU8,
    transition_lock: Mutex<()>,
    state_tx: watch::Sender<ConnectionState>,
    buffer: Mutex<OutboundBuffer>,
    outbound: Notify,
    driver: Mutex<Option<Driver>>,
    messages: EventBus<RealtimeMessage>,
    state_changes: EventBus<StateChange>,
    degraded: EventBus<Degraded>,
}

/// Persistent realtime connection with reconnection and buffering.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        config: RealtimeConfig,
        transport: Arc<dyn RealtimeTransport>,
        auth: Arc<dyn AuthProvider>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let buffer = OutboundBuffer::new(config.max_buffered_messages);
        Self {
            inner: Arc::new(Inner {
                transport,
                auth,
                config: ArcSwap::from_pointee(config),
                state: AtomicU8::new(ConnectionState::Disconnected as u8),
                transition_lock: Mutex::new(()),
                state_tx,
                buffer: Mutex::new(buffer),
                outbound: Notify::new(),
                driver: Mutex::new(None),
                messages: EventBus::new(),
                state_changes: EventBus::new(),
                degraded: EventBus::new(),
            }),
        }
    }

    /// Start connecting in the background. No-op while a connection is
    /// already being driven; rejected in `Failed` until `reset`.
    pub fn connect(&self) -> ResilienceResult<()> {
        let mut driver = self.inner.driver.lock().expect("driver mutex poisoned");
        if driver.as_ref().is_some_and(|d| !d.handle.is_finished()) {
            return Ok(());
        }

        match self.state() {
            ConnectionState::Failed => {
                return Err(ResilienceError::Transport(
                    "realtime connection failed; reset required".to_string(),
                ))
            }
            ConnectionState::Disconnected => {
                self.inner.transition(ConnectionState::Connecting);
            }
            _ => {}
        }

        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&self.inner).drive(stop_rx));
        *driver = Some(Driver { handle, stop });
        Ok(())
    }

    /// Queue `message` for delivery. Accepted messages are delivered in
    /// order once connected. Fails when the buffer is full or the manager
    /// is in `Failed`.
    pub fn send(&self, message: &RealtimeMessage) -> ResilienceResult<()> {
        let state = self.state();
        if !state.buffers_outbound() {
            return Err(ResilienceError::Transport(format!(
                "cannot send while {}",
                state
            )));
        }

        self.inner
            .buffer
            .lock()
            .expect("outbound buffer mutex poisoned")
            .push(message.to_text())
            .map_err(|_| {
                metrics::record_realtime_dropped("buffer_full");
                ResilienceError::Transport("outbound buffer full".to_string())
            })?;
        self.inner.outbound.notify_one();
        Ok(())
    }

    /// Stop the driver, close the link and move to `Disconnected`.
    /// Buffered messages are kept for the next connection.
    pub async fn disconnect(&self) {
        let driver = self.inner.driver.lock().expect("driver mutex poisoned").take();
        if let Some(driver) = driver {
            let _ = driver.stop.send(true);
            let _ = driver.handle.await;
        }
        if self.state() != ConnectionState::Failed {
            self.inner.transition(ConnectionState::Disconnected);
        }
    }

    /// Leave `Failed` so `connect` may be called again.
    pub fn reset(&self) -> bool {
        if self.state() != ConnectionState::Failed {
            return false;
        }
        tracing::info!("Realtime connection reset");
        self.inner.transition(ConnectionState::Disconnected)
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from(self.inner.state.load(Ordering::Acquire))
    }

    /// Watch channel of the current state.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Wait until the state equals `target`. Returns false on timeout.
    pub async fn wait_for(&self, target: ConnectionState, limit: Duration) -> bool {
        let mut rx = self.subscribe_state();
        let reached = time::timeout(limit, rx.wait_for(|s| *s == target)).await;
        matches!(reached, Ok(Ok(_)))
    }

    pub fn on_message<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&RealtimeMessage) + Send + Sync + 'static,
    {
        self.inner.messages.subscribe(handler)
    }

    pub fn on_state_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        self.inner.state_changes.subscribe(handler)
    }

    pub fn on_degraded<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Degraded) + Send + Sync + 'static,
    {
        self.inner.degraded.subscribe(handler)
    }

    pub fn buffered(&self) -> usize {
        self.inner.buffer.lock().expect("outbound buffer mutex poisoned").len()
    }

    /// Applies to the next connection attempt.
    pub fn set_config(&self, config: RealtimeConfig) {
        self.inner
            .buffer
            .lock()
            .expect("outbound buffer mutex poisoned")
            .set_capacity(config.max_buffered_messages);
        self.inner.config.store(Arc::new(config));
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .field("buffered", &self.buffered())
            .finish()
    }
}

impl Inner {
    fn state(&self) -> ConnectionState {
        ConnectionState::from(self.state.load(Ordering::Acquire))
    }

    /// Apply a transition if the state graph allows it.
    fn transition(&self, to: ConnectionState) -> bool {
        let from = {
            let _guard = self.transition_lock.lock().expect("transition mutex poisoned");
            let from = self.state();
            if !from.can_transition_to(to) {
                tracing::trace!(from = %from, to = %to, "Ignoring connection transition");
                return false;
            }
            self.state.store(to as u8, Ordering::Release);
            self.state_tx.send_replace(to);
            from
        };

        tracing::info!(from = %from, to = %to, "Realtime connection state changed");
        metrics::record_connection_state(to);
        self.state_changes.emit(&StateChange { from, to });
        true
    }

    async fn drive(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut attempt: u32 = 0;
        loop {
            let config = self.config.load_full();
            let endpoints = config.endpoints();
            let endpoint = endpoints
                .get(attempt as usize % endpoints.len().max(1))
                .cloned()
                .unwrap_or_default();

            let opened = tokio::select! {
                opened = self.open(&endpoint, &config) => opened,
                _ = stop.changed() => return,
            };

            let last_error = match opened {
                Ok((mut link, connection)) => {
                    attempt = 0;
                    self.transition(ConnectionState::Connected);
                    tracing::info!(endpoint = %endpoint, connection = %connection, "Realtime connected");

                    let ended = tokio::select! {
                        ended = self.serve(&mut link, connection, &config) => ended,
                        _ = stop.changed() => LinkEnd::Stopped,
                    };
                    link.sink.close().await;
                    self.auth.connection_closed(connection);

                    match ended {
                        LinkEnd::Stopped => return,
                        LinkEnd::Lost(reason) => {
                            tracing::warn!(connection = %connection, reason = %reason, "Realtime connection lost");
                            reason
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(endpoint = %endpoint, error = %e, "Realtime connection attempt failed");
                    e.to_string()
                }
            };

            self.transition(ConnectionState::Disconnected);
            attempt += 1;
            let exhausted = attempt > config.reconnect_attempts;

            // Failed is only reachable from Reconnecting, so an exhausted
            // driver passes through it without scheduling another attempt
            self.transition(ConnectionState::Reconnecting);
            if exhausted {
                self.transition(ConnectionState::Failed);
                tracing::error!(
                    attempts = config.reconnect_attempts,
                    error = %last_error,
                    "Realtime reconnection exhausted, entering degraded mode"
                );
                self.degraded.emit(&Degraded {
                    attempts: config.reconnect_attempts,
                    last_error,
                });
                return;
            }

            let delay = reconnect_delay(attempt, config.reconnect_base_ms, config.reconnect_max_ms);
            tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "Scheduling realtime reconnect");
            tokio::select! {
                _ = time::sleep(delay) => {}
                _ = stop.changed() => return,
            }
            self.transition(ConnectionState::Connecting);
        }
    }

    /// Open the transport and complete the auth handshake.
    async fn open(
        &self,
        endpoint: &str,
        config: &RealtimeConfig,
    ) -> ResilienceResult<(RealtimeLink, ConnectionId)> {
        let response_timeout = Duration::from_millis(config.response_timeout_ms);
        let mut link = with_timeout(response_timeout, self.transport.connect(endpoint)).await?;
        let connection = ConnectionId::new();

        match with_timeout(response_timeout, self.handshake(&mut link, connection)).await {
            Ok(()) => Ok((link, connection)),
            Err(e) => {
                link.sink.close().await;
                self.auth.connection_closed(connection);
                Err(e)
            }
        }
    }

    async fn handshake(&self, link: &mut RealtimeLink, connection: ConnectionId) -> ResilienceResult<()> {
        let credential = self.auth.credential().await?;
        link.sink.send(RealtimeMessage::auth(&credential).to_text()).await?;

        loop {
            let text = match link.stream.next().await {
                Some(frame) => frame?,
                None => return Err(ResilienceError::Transport("closed during handshake".to_string())),
            };
            match RealtimeMessage::parse(&text) {
                Ok(msg) if msg.kind == message::AUTH_OK => {
                    tracing::debug!(connection = %connection, identity = %credential.identity, "Handshake accepted");
                    return Ok(());
                }
                Ok(msg) if msg.kind == message::AUTH_ERROR => {
                    let reason = msg
                        .payload
                        .get("reason")
                        .and_then(|r| r.as_str())
                        .unwrap_or("rejected")
                        .to_string();
                    return Err(ResilienceError::Authentication(reason));
                }
                _ => {
                    tracing::debug!(connection = %connection, "Dropping frame received before authentication");
                    metrics::record_realtime_dropped("unauthenticated");
                }
            }
        }
    }

    /// Run an authenticated link until it is lost.
    async fn serve(&self, link: &mut RealtimeLink, connection: ConnectionId, config: &RealtimeConfig) -> LinkEnd {
        let heartbeat_interval = Duration::from_millis(config.heartbeat_interval_ms.max(1));
        let response_timeout = Duration::from_millis(config.response_timeout_ms);

        // Drain what accumulated while offline before anything new
        if let Err(e) = self.flush(link).await {
            return LinkEnd::Lost(e.to_string());
        }

        let mut heartbeat = time::interval_at(Instant::now() + heartbeat_interval, heartbeat_interval);
        let mut pong_deadline: Option<Instant> = None;

        loop {
            let deadline = pong_deadline;
            let missed_pong = async move {
                match deadline {
                    Some(at) => time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                frame = link.stream.next() => match frame {
                    None => return LinkEnd::Lost("closed by peer".to_string()),
                    Some(Err(e)) => return LinkEnd::Lost(e.to_string()),
                    Some(Ok(text)) => {
                        if let Err(e) = self.handle_inbound(&text, connection, link, &mut pong_deadline).await {
                            return LinkEnd::Lost(e.to_string());
                        }
                    }
                },
                _ = heartbeat.tick() => {
                    if pong_deadline.is_none() {
                        if let Err(e) = link.sink.send(RealtimeMessage::ping().to_text()).await {
                            return LinkEnd::Lost(e.to_string());
                        }
                        pong_deadline = Some(Instant::now() + response_timeout);
                    }
                }
                _ = missed_pong => {
                    return LinkEnd::Lost("heartbeat response timed out".to_string());
                }
                _ = self.outbound.notified() => {
                    if let Err(e) = self.flush(link).await {
                        return LinkEnd::Lost(e.to_string());
                    }
                }
            }
        }
    }

    async fn handle_inbound(
        &self,
        text: &str,
        connection: ConnectionId,
        link: &mut RealtimeLink,
        pong_deadline: &mut Option<Instant>,
    ) -> ResilienceResult<()> {
        let msg = match RealtimeMessage::parse(text) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(connection = %connection, error = %e, "Dropping malformed realtime message");
                metrics::record_realtime_dropped("malformed");
                return Ok(());
            }
        };

        match msg.kind.as_str() {
            message::PONG => *pong_deadline = None,
            message::PING => link.sink.send(RealtimeMessage::pong().to_text()).await?,
            _ if msg.is_control() => {
                tracing::debug!(connection = %connection, kind = %msg.kind, "Ignoring control frame");
            }
            _ if !self.auth.check_rate_limit(connection) => {
                tracing::warn!(connection = %connection, kind = %msg.kind, "Dropping rate-limited realtime message");
                metrics::record_realtime_dropped("rate_limited");
            }
            _ if !self.auth.validate_inbound(&msg, connection) => {
                tracing::warn!(connection = %connection, kind = %msg.kind, "Dropping unauthorized realtime message");
                metrics::record_realtime_dropped("unauthorized");
            }
            _ => self.messages.emit(&msg),
        }
        Ok(())
    }

    /// Send buffered messages in order. A failed send leaves the message at
    /// the front of the buffer.
    async fn flush(&self, link: &mut RealtimeLink) -> ResilienceResult<()> {
        let mut sent = 0usize;
        loop {
            let next = self
                .buffer
                .lock()
                .expect("outbound buffer mutex poisoned")
                .front()
                .cloned();
            let Some(text) = next else { break };

            link.sink.send(text).await?;
            self.buffer
                .lock()
                .expect("outbound buffer mutex poisoned")
                .confirm_front();
            sent += 1;
        }
        if sent > 0 {
            tracing::debug!(sent, "Flushed outbound buffer");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::auth::{Credential, StaticAuth};
    use crate::realtime::transport::{RealtimeSink, RealtimeStream};
    use crate::config::schema::RateLimitConfig;
    use futures_util::future::BoxFuture;
    use futures_util::FutureExt;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    /// Server end of an in-memory connection.
    struct ServerSide {
        endpoint: String,
        to_client: mpsc::UnboundedSender<String>,
        from_client: mpsc::UnboundedReceiver<String>,
    }

    impl ServerSide {
        async fn recv(&mut self) -> RealtimeMessage {
            let text = time::timeout(Duration::from_secs(2), self.from_client.recv())
                .await
                .expect("client frame")
                .expect("client open");
            RealtimeMessage::parse(&text).unwrap()
        }

        async fn accept_auth(&mut self) {
            let auth = self.recv().await;
            assert_eq!(auth.kind, message::AUTH);
            assert_eq!(auth.payload["token"], "secret");
            self.push(&RealtimeMessage::new(message::AUTH_OK, json!(null)));
        }

        fn push(&self, msg: &RealtimeMessage) {
            let _ = self.to_client.send(msg.to_text());
        }
    }

    struct ChannelSink(mpsc::UnboundedSender<String>);

    impl RealtimeSink for ChannelSink {
        fn send(&mut self, text: String) -> BoxFuture<'_, ResilienceResult<()>> {
            let result = self
                .0
                .send(text)
                .map_err(|_| ResilienceError::Transport("peer gone".to_string()));
            futures_util::future::ready(result).boxed()
        }

        fn close(&mut self) -> BoxFuture<'_, ()> {
            futures_util::future::ready(()).boxed()
        }
    }

    struct ChannelStream(mpsc::UnboundedReceiver<String>);

    impl RealtimeStream for ChannelStream {
        fn next(&mut self) -> BoxFuture<'_, Option<ResilienceResult<String>>> {
            async move { self.0.recv().await.map(Ok) }.boxed()
        }
    }

    /// Transport handing each connection's server side to the test.
    /// The first `refuse` attempts fail.
    struct ChannelTransport {
        accepted: mpsc::UnboundedSender<ServerSide>,
        refuse: AtomicUsize,
        attempts: AtomicUsize,
    }

    impl RealtimeTransport for ChannelTransport {
        fn connect<'a>(&'a self, endpoint: &'a str) -> BoxFuture<'a, ResilienceResult<RealtimeLink>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let refused = self
                .refuse
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            let result = if refused {
                Err(ResilienceError::Transport("connection refused".to_string()))
            } else {
                let (to_client, client_rx) = mpsc::unbounded_channel();
                let (client_tx, from_client) = mpsc::unbounded_channel();
                let _ = self.accepted.send(ServerSide {
                    endpoint: endpoint.to_string(),
                    to_client,
                    from_client,
                });
                Ok(RealtimeLink {
                    sink: Box::new(ChannelSink(client_tx)),
                    stream: Box::new(ChannelStream(client_rx)),
                })
            };
            futures_util::future::ready(result).boxed()
        }
    }

    fn config() -> RealtimeConfig {
        RealtimeConfig {
            enabled: true,
            primary_url: "ws://primary".to_string(),
            fallback_urls: vec!["ws://fallback".to_string()],
            heartbeat_interval_ms: 60_000,
            response_timeout_ms: 500,
            reconnect_attempts: 3,
            reconnect_base_ms: 10,
            reconnect_max_ms: 50,
            max_buffered_messages: 10,
        }
    }

    fn manager(
        config: RealtimeConfig,
        refuse: usize,
    ) -> (ConnectionManager, mpsc::UnboundedReceiver<ServerSide>, Arc<ChannelTransport>) {
        let (accepted, servers) = mpsc::unbounded_channel();
        let transport = Arc::new(ChannelTransport {
            accepted,
            refuse: AtomicUsize::new(refuse),
            attempts: AtomicUsize::new(0),
        });
        let auth = Arc::new(StaticAuth::new(
            Credential {
                token: "secret".to_string(),
                identity: "alice".to_string(),
            },
            RateLimitConfig {
                max_per_window: 100,
                window_secs: 1,
            },
        ));
        (ConnectionManager::new(config, transport.clone(), auth), servers, transport)
    }

    async fn next_server(servers: &mut mpsc::UnboundedReceiver<ServerSide>) -> ServerSide {
        time::timeout(Duration::from_secs(2), servers.recv())
            .await
            .expect("connection attempt")
            .expect("transport alive")
    }

    #[tokio::test]
    async fn test_connects_after_handshake_and_flushes_buffer() {
        let (manager, mut servers, _) = manager(config(), 0);
        manager.send(&RealtimeMessage::new("chat", json!(1))).unwrap();
        manager.send(&RealtimeMessage::new("chat", json!(2))).unwrap();
        assert_eq!(manager.buffered(), 2);

        manager.connect().unwrap();
        let mut server = next_server(&mut servers).await;
        assert_eq!(server.endpoint, "ws://primary");
        assert_eq!(manager.state(), ConnectionState::Connecting);

        server.accept_auth().await;
        assert!(manager.wait_for(ConnectionState::Connected, Duration::from_secs(2)).await);

        assert_eq!(server.recv().await.payload, json!(1));
        assert_eq!(server.recv().await.payload, json!(2));

        manager.send(&RealtimeMessage::new("chat", json!(3))).unwrap();
        assert_eq!(server.recv().await.payload, json!(3));
        assert_eq!(manager.buffered(), 0);

        manager.disconnect().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_rejected_handshake_is_not_connected() {
        let mut cfg = config();
        cfg.reconnect_attempts = 0;
        let (manager, mut servers, _) = manager(cfg, 0);

        let degraded = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&degraded);
        let _sub = manager.on_degraded(move |d| *sink.lock().unwrap() = Some(d.clone()));

        manager.connect().unwrap();
        let mut server = next_server(&mut servers).await;
        server.recv().await;
        server.push(&RealtimeMessage::new(message::AUTH_ERROR, json!({"reason": "bad token"})));

        assert!(manager.wait_for(ConnectionState::Failed, Duration::from_secs(2)).await);
        let degraded = degraded.lock().unwrap().clone().unwrap();
        assert!(degraded.last_error.contains("bad token"));

        // Failed rejects traffic and needs an explicit reset
        assert!(manager.send(&RealtimeMessage::new("chat", json!(null))).is_err());
        assert!(manager.connect().is_err());
        assert!(manager.reset());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_reconnects_to_fallback_and_redelivers_buffer() {
        let (manager, mut servers, transport) = manager(config(), 1);

        let changes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&changes);
        let _sub = manager.on_state_change(move |c| sink.lock().unwrap().push(c.to));

        manager.connect().unwrap();
        // First attempt refused, the retry goes to the fallback endpoint
        let mut server = next_server(&mut servers).await;
        assert_eq!(server.endpoint, "ws://fallback");
        server.accept_auth().await;
        assert!(manager.wait_for(ConnectionState::Connected, Duration::from_secs(2)).await);
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 2);

        // Peer goes away
        drop(server);
        manager.send(&RealtimeMessage::new("chat", json!("during gap"))).unwrap();

        let mut server = next_server(&mut servers).await;
        server.accept_auth().await;
        assert_eq!(server.recv().await.payload, json!("during gap"));

        let seen = changes.lock().unwrap().clone();
        let tail = &seen[seen.len() - 4..];
        assert_eq!(
            tail,
            &[
                ConnectionState::Disconnected,
                ConnectionState::Reconnecting,
                ConnectionState::Connecting,
                ConnectionState::Connected
            ]
        );
        manager.disconnect().await;
    }

    #[tokio::test]
    async fn test_exhausted_reconnects_end_in_failed() {
        let mut cfg = config();
        cfg.reconnect_attempts = 1;
        let (manager, _servers, transport) = manager(cfg, usize::MAX);

        let changes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&changes);
        let _sub = manager.on_state_change(move |c| sink.lock().unwrap().push(c.to));
        let degraded = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&degraded);
        let _degraded = manager.on_degraded(move |d| *slot.lock().unwrap() = Some(d.attempts));

        manager.connect().unwrap();
        assert!(manager.wait_for(ConnectionState::Failed, Duration::from_secs(2)).await);

        use ConnectionState::*;
        assert_eq!(
            *changes.lock().unwrap(),
            vec![Connecting, Disconnected, Reconnecting, Connecting, Disconnected, Reconnecting, Failed]
        );
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(*degraded.lock().unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_inbound_validation() {
        let (manager, mut servers, _) = manager(config(), 0);
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let _sub = manager.on_message(move |m| sink.lock().unwrap().push(m.kind.clone()));

        manager.connect().unwrap();
        let mut server = next_server(&mut servers).await;
        server.accept_auth().await;
        assert!(manager.wait_for(ConnectionState::Connected, Duration::from_secs(2)).await);

        let _ = server.to_client.send("{broken".to_string());
        server.push(&RealtimeMessage::new("secret", json!({"recipient": "mallory"})));
        server.push(&RealtimeMessage::new("post_created", json!({"id": 1})));

        // Server pings are answered
        server.push(&RealtimeMessage::ping());
        assert_eq!(server.recv().await.kind, message::PONG);

        assert_eq!(*received.lock().unwrap(), vec!["post_created".to_string()]);
        manager.disconnect().await;
    }

    #[tokio::test]
    async fn test_missed_pong_forces_reconnect() {
        let mut cfg = config();
        cfg.heartbeat_interval_ms = 20;
        cfg.response_timeout_ms = 50;
        let (manager, mut servers, _) = manager(cfg, 0);

        manager.connect().unwrap();
        let mut silent = next_server(&mut servers).await;
        silent.accept_auth().await;
        assert_eq!(silent.recv().await.kind, message::PING);

        // No pong: the manager gives up on this link and dials again
        let mut next = next_server(&mut servers).await;
        next.accept_auth().await;
        assert!(manager.wait_for(ConnectionState::Connected, Duration::from_secs(2)).await);
        manager.disconnect().await;
    }

    #[tokio::test]
    async fn test_buffer_limit() {
        let mut cfg = config();
        cfg.max_buffered_messages = 1;
        let (manager, _servers, _) = manager(cfg, 0);
        manager.send(&RealtimeMessage::new("a", json!(null))).unwrap();
        assert!(matches!(
            manager.send(&RealtimeMessage::new("b", json!(null))),
            Err(ResilienceError::Transport(_))
        ));
    }
}
