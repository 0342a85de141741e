//! Single entry point for application code.
//!
//! # Data Flow
//! ```text
//! Reads:      fetch / resilient_call → RequestCoordinator → CacheStore + breakers
//! Writes:     mutate → RequestCoordinator ──(connectivity failure)──→ ActionQueue
//! Realtime:   subscribe_realtime / send_realtime → ConnectionManager
//! Reconnect:  ConnectionManager Connected / notify_online → drain task → action handlers
//! ```
//!
//! # Design Decisions
//! - Constructed explicitly and shared through `Arc`; no process-wide instance
//! - Background tasks hold a weak reference and stop on shutdown
//! - Queued upstream requests replay through the built-in `upstream_request` handler

use arc_swap::ArcSwap;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::cache::{CacheStore, RequestKey, TtlPolicy};
use crate::config::schema::ResilienceConfig;
use crate::error::{Outcome, ResilienceError, ResilienceResult};
use crate::events::Subscription;
use crate::lifecycle::Shutdown;
use crate::queue::{
    ActionOutcome, ActionQueue, DrainReport, DurableStore, EnqueueOptions, FileStore, MemoryStore,
    Priority, QueuedAction,
};
use crate::realtime::{
    AuthProvider, ConnectionManager, ConnectionState, Degraded, RealtimeMessage, RealtimeTransport,
    StaticAuth, WsTransport,
};
use crate::request::{MetricsSnapshot, RequestCoordinator, RequestPolicy};
use crate::resilience::CircuitBreakerRegistry;
use crate::upstream::{HttpTransport, Payload, UpstreamRequest, UpstreamTransport};

/// Action type of queued upstream requests.
pub const UPSTREAM_REQUEST: &str = "upstream_request";

/// Replays one queued action.
pub type ActionHandler = Arc<dyn Fn(QueuedAction) -> BoxFuture<'static, ActionOutcome> + Send + Sync>;

/// Result of `mutate`.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
    /// The remote accepted the mutation.
    Completed(Payload),
    /// The remote was unreachable; the mutation was queued under this id.
    Queued(String),
}

/// How a mutation is handled when the remote is unreachable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutateOptions {
    /// Queue the mutation instead of failing on connectivity errors.
    pub queueable: bool,
    pub priority: Priority,
    pub resource_key: Option<String>,
    pub max_retries: Option<u32>,
}

impl Default for MutateOptions {
    fn default() -> Self {
        Self {
            queueable: true,
            priority: Priority::Medium,
            resource_key: None,
            max_retries: None,
        }
    }
}

impl MutateOptions {
    pub fn not_queueable() -> Self {
        Self {
            queueable: false,
            ..Default::default()
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn resource(mut self, key: impl Into<String>) -> Self {
        self.resource_key = Some(key.into());
        self
    }

    fn enqueue_options(&self) -> EnqueueOptions {
        EnqueueOptions {
            priority: self.priority,
            max_retries: self.max_retries,
            resource_key: self.resource_key.clone(),
        }
    }
}

/// Payload of an `upstream_request` action.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueuedRequest {
    endpoint: String,
    request: UpstreamRequest,
}

/// Builder for [`ResilienceFacade`]. Unset collaborators are created from
/// the configuration.
pub struct FacadeBuilder {
    config: ResilienceConfig,
    upstream: Option<Arc<dyn UpstreamTransport>>,
    store: Option<Arc<dyn DurableStore>>,
    realtime_transport: Option<Arc<dyn RealtimeTransport>>,
    auth: Option<Arc<dyn AuthProvider>>,
}

impl FacadeBuilder {
    pub fn upstream(mut self, upstream: Arc<dyn UpstreamTransport>) -> Self {
        self.upstream = Some(upstream);
        self
    }

    pub fn store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Realtime transport; enables realtime even when the config does not.
    pub fn realtime(mut self, transport: Arc<dyn RealtimeTransport>) -> Self {
        self.realtime_transport = Some(transport);
        self
    }

    pub fn auth(mut self, auth: Arc<dyn AuthProvider>) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Assemble the facade and start its background tasks. Must run inside a
    /// Tokio runtime. Does not connect the realtime channel; call
    /// [`ResilienceFacade::connect_realtime`].
    pub fn build(self) -> ResilienceResult<Arc<ResilienceFacade>> {
        let config = self.config;

        let upstream: Arc<dyn UpstreamTransport> = match self.upstream {
            Some(upstream) => upstream,
            None => Arc::new(HttpTransport::new(Duration::from_millis(config.requests.timeout_ms))?),
        };

        let store: Arc<dyn DurableStore> = match (self.store, &config.queue.store_path) {
            (Some(store), _) => store,
            (None, Some(path)) => Arc::new(FileStore::open(path)?),
            (None, None) => Arc::new(MemoryStore::new()),
        };
        let queue = Arc::new(ActionQueue::open(store, config.queue.clone())?);

        let realtime_transport: Option<Arc<dyn RealtimeTransport>> = match self.realtime_transport {
            Some(transport) => Some(transport),
            None if config.realtime.enabled => Some(Arc::new(WsTransport::new(Duration::from_millis(
                config.realtime.response_timeout_ms,
            )))),
            None => None,
        };
        let realtime = realtime_transport.map(|transport| {
            let auth = self
                .auth
                .unwrap_or_else(|| Arc::new(StaticAuth::from_config(&config.auth)));
            ConnectionManager::new(config.realtime.clone(), transport, auth)
        });

        let breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone()));
        let cache = Arc::new(CacheStore::new(TtlPolicy::from_config(&config.cache)));
        let coordinator = RequestCoordinator::new(Arc::clone(&breakers), Arc::clone(&cache));

        let facade = Arc::new(ResilienceFacade {
            config: ArcSwap::from_pointee(config),
            breakers,
            cache,
            coordinator,
            upstream,
            queue,
            realtime,
            handlers: DashMap::new(),
            online: Arc::new(Notify::new()),
            shutdown: Shutdown::new(),
            tasks: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
        });
        facade.register_upstream_handler();
        facade.start_background_tasks();
        Ok(facade)
    }
}

/// Composes the coordinator, cache, breakers, action queue and realtime
/// connection behind one API.
pub struct ResilienceFacade {
    config: ArcSwap<ResilienceConfig>,
    breakers: Arc<CircuitBreakerRegistry>,
    cache: Arc<CacheStore<Payload>>,
    coordinator: RequestCoordinator<Payload>,
    upstream: Arc<dyn UpstreamTransport>,
    queue: Arc<ActionQueue>,
    realtime: Option<ConnectionManager>,
    handlers: DashMap<String, ActionHandler>,
    online: Arc<Notify>,
    shutdown: Shutdown,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl ResilienceFacade {
    pub fn builder(config: ResilienceConfig) -> FacadeBuilder {
        FacadeBuilder {
            config,
            upstream: None,
            store: None,
            realtime_transport: None,
            auth: None,
        }
    }

    /// Run `operation` under `policy`, cached and deduplicated by `key`.
    pub async fn resilient_call<F, Fut>(
        &self,
        key: &str,
        policy: &RequestPolicy,
        operation: F,
    ) -> ResilienceResult<Outcome<Payload>>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ResilienceResult<Payload>> + Send + 'static,
    {
        self.coordinator.request(key, policy, operation).await
    }

    /// Run `operation` directly through `endpoint`'s circuit breaker,
    /// answering with `fallback` while the circuit is open.
    pub async fn protected_call<T, F, Fut>(
        &self,
        endpoint: &str,
        operation: F,
        fallback: Option<T>,
    ) -> ResilienceResult<Outcome<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ResilienceResult<T>>,
    {
        self.breakers.get(endpoint).execute(operation, fallback).await
    }

    /// Policy for `endpoint` from the live configuration.
    pub fn policy(&self, endpoint: &str) -> RequestPolicy {
        RequestPolicy::from_config(endpoint, &self.config.load().requests)
    }

    /// Resilient upstream read, keyed by the normalized request signature.
    pub async fn fetch(&self, endpoint: &str, request: UpstreamRequest) -> ResilienceResult<Outcome<Payload>> {
        let policy = self.policy(endpoint);
        self.fetch_with(request, &policy).await
    }

    pub async fn fetch_with(
        &self,
        request: UpstreamRequest,
        policy: &RequestPolicy,
    ) -> ResilienceResult<Outcome<Payload>> {
        let key = RequestKey::for_request(&request);
        self.coordinator
            .request(key.as_str(), policy, upstream_operation(&self.upstream, request))
            .await
    }

    /// Upstream write. On a connectivity failure a queueable mutation is
    /// persisted for replay and `Queued` is returned; client errors and
    /// persistence failures are returned as errors.
    pub async fn mutate(
        &self,
        endpoint: &str,
        request: UpstreamRequest,
        options: MutateOptions,
    ) -> ResilienceResult<MutationOutcome> {
        let policy = self.policy(endpoint).no_cache().no_dedup();
        let key = RequestKey::for_request(&request);
        let result = self
            .coordinator
            .request(key.as_str(), &policy, upstream_operation(&self.upstream, request.clone()))
            .await;

        match result {
            Ok(outcome) => {
                self.cache.invalidate(&request.path());
                Ok(MutationOutcome::Completed(outcome.value))
            }
            Err(err) if options.queueable && self.is_unreachable(endpoint, &err) => {
                let payload = serde_json::to_value(QueuedRequest {
                    endpoint: endpoint.to_string(),
                    request,
                })
                .map_err(|e| ResilienceError::QueuePersist(e.to_string()))?;
                let id = self.enqueue_action(UPSTREAM_REQUEST, payload, options.enqueue_options())?;
                tracing::info!(endpoint = %endpoint, id = %id, error = %err, "Mutation queued for replay");
                Ok(MutationOutcome::Queued(id))
            }
            Err(err) => Err(err),
        }
    }

    /// Persist an action for replay when connectivity returns.
    pub fn enqueue_action(
        &self,
        action_type: &str,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> ResilienceResult<String> {
        self.queue.enqueue(action_type, payload, options)
    }

    /// Register the replay handler for `action_type`, replacing any previous one.
    pub fn register_action_handler<F, Fut>(&self, action_type: &str, handler: F)
    where
        F: Fn(QueuedAction) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ActionOutcome> + Send + 'static,
    {
        let handler: ActionHandler = Arc::new(move |action| handler(action).boxed());
        self.handlers.insert(action_type.to_string(), handler);
    }

    /// Replay the queue now through the registered handlers.
    pub async fn drain_queue(&self) -> DrainReport {
        let handlers = &self.handlers;
        self.queue
            .drain(|action| {
                let handler = handlers.get(&action.action_type).map(|h| Arc::clone(h.value()));
                async move {
                    match handler {
                        Some(handler) => handler(action).await,
                        None => {
                            tracing::error!(action_type = %action.action_type, id = %action.id, "No handler for queued action");
                            ActionOutcome::PermanentFailure(format!(
                                "no handler registered for action type '{}'",
                                action.action_type
                            ))
                        }
                    }
                }
            })
            .await
    }

    /// Signal that connectivity is back; the queue drains in the background.
    pub fn notify_online(&self) {
        self.online.notify_one();
    }

    pub fn on_action_failed<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&QueuedAction) + Send + Sync + 'static,
    {
        self.queue.on_failed(handler)
    }

    /// Start the realtime connection.
    pub fn connect_realtime(&self) -> ResilienceResult<()> {
        self.realtime()?.connect()
    }

    pub fn subscribe_realtime<F>(&self, handler: F) -> ResilienceResult<Subscription>
    where
        F: Fn(&RealtimeMessage) + Send + Sync + 'static,
    {
        Ok(self.realtime()?.on_message(handler))
    }

    pub fn send_realtime(&self, message: &RealtimeMessage) -> ResilienceResult<()> {
        self.realtime()?.send(message)
    }

    pub fn on_degraded<F>(&self, handler: F) -> ResilienceResult<Subscription>
    where
        F: Fn(&Degraded) + Send + Sync + 'static,
    {
        Ok(self.realtime()?.on_degraded(handler))
    }

    /// Leave degraded mode and reconnect.
    pub fn reset_realtime(&self) -> ResilienceResult<()> {
        let realtime = self.realtime()?;
        realtime.reset();
        realtime.connect()
    }

    pub fn realtime_manager(&self) -> Option<&ConnectionManager> {
        self.realtime.as_ref()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.coordinator.metrics()
    }

    /// `Disconnected` when realtime is not configured.
    pub fn connection_state(&self) -> ConnectionState {
        self.realtime
            .as_ref()
            .map(ConnectionManager::state)
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn queue_size(&self) -> usize {
        self.queue.size()
    }

    pub fn queue(&self) -> &Arc<ActionQueue> {
        &self.queue
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Drop cached responses whose key contains `pattern`.
    pub fn invalidate(&self, pattern: &str) -> usize {
        self.cache.invalidate(pattern)
    }

    pub fn config(&self) -> Arc<ResilienceConfig> {
        self.config.load_full()
    }

    /// Swap in a new configuration. Breaker state, cache entries and queued
    /// actions are kept; new thresholds and TTLs apply from now on.
    pub fn apply_config(&self, config: ResilienceConfig) {
        self.cache.set_policy(TtlPolicy::from_config(&config.cache));
        self.breakers.reconfigure(config.circuit_breaker.clone());
        self.queue.set_config(config.queue.clone());
        if let Some(realtime) = &self.realtime {
            realtime.set_config(config.realtime.clone());
        }
        self.config.store(Arc::new(config));
        tracing::info!("Configuration applied");
    }

    /// Stop background tasks and close the realtime connection.
    pub async fn shutdown(&self) {
        self.shutdown.trigger();
        if let Some(realtime) = &self.realtime {
            realtime.disconnect().await;
        }
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().expect("task list mutex poisoned").drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        let subscriptions: Vec<Subscription> = self
            .subscriptions
            .lock()
            .expect("subscription list mutex poisoned")
            .drain(..)
            .collect();
        for subscription in subscriptions {
            subscription.unsubscribe();
        }
        tracing::info!("Resilience facade shut down");
    }

    fn realtime(&self) -> ResilienceResult<&ConnectionManager> {
        self.realtime
            .as_ref()
            .ok_or_else(|| ResilienceError::Transport("realtime is not configured".to_string()))
    }

    fn is_unreachable(&self, endpoint: &str, err: &ResilienceError) -> bool {
        err.is_connectivity_failure() || err.is_service_failure(&self.breakers.get(endpoint).classifier())
    }

    /// Built-in replay of queued upstream requests. Queue-level retries
    /// replace coordinator retries here.
    fn register_upstream_handler(self: &Arc<Self>) {
        let facade = Arc::downgrade(self);
        self.register_action_handler(UPSTREAM_REQUEST, move |action| {
            let facade = facade.clone();
            async move {
                let Some(facade) = facade.upgrade() else {
                    return ActionOutcome::RetryableFailure("facade shut down".to_string());
                };
                let queued: QueuedRequest = match serde_json::from_value(action.payload) {
                    Ok(queued) => queued,
                    Err(e) => return ActionOutcome::PermanentFailure(format!("malformed queued request: {}", e)),
                };

                let policy = facade
                    .policy(&queued.endpoint)
                    .no_cache()
                    .without_rate_limit()
                    .max_retries(0);
                let path = queued.request.path();
                let key = format!("replay {}", action.id);
                let operation = upstream_operation(&facade.upstream, queued.request);

                match facade.coordinator.request(&key, &policy, operation).await {
                    Ok(_) => {
                        facade.cache.invalidate(&path);
                        ActionOutcome::Success
                    }
                    Err(err) if facade.is_unreachable(&queued.endpoint, &err) => {
                        ActionOutcome::RetryableFailure(err.to_string())
                    }
                    Err(err) => ActionOutcome::PermanentFailure(err.to_string()),
                }
            }
        });
    }

    fn start_background_tasks(self: &Arc<Self>) {
        let config = self.config.load();
        let mut tasks = self.tasks.lock().expect("task list mutex poisoned");

        tasks.push(self.cache.spawn_cleanup(
            Duration::from_secs(config.cache.cleanup_interval_secs.max(1)),
            self.shutdown.subscribe(),
        ));

        if let Some(realtime) = &self.realtime {
            let online = Arc::clone(&self.online);
            let subscription = realtime.on_state_change(move |change| {
                if change.to == ConnectionState::Connected {
                    online.notify_one();
                }
            });
            self.subscriptions
                .lock()
                .expect("subscription list mutex poisoned")
                .push(subscription);
        }

        tasks.push(tokio::spawn(auto_drain(
            Arc::downgrade(self),
            Arc::clone(&self.online),
            self.shutdown.subscribe(),
        )));
    }
}

impl std::fmt::Debug for ResilienceFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceFacade")
            .field("connection_state", &self.connection_state())
            .field("queue_size", &self.queue_size())
            .field("cached", &self.cache.len())
            .finish()
    }
}

/// Drain the queue each time connectivity is signalled.
async fn auto_drain(
    facade: Weak<ResilienceFacade>,
    online: Arc<Notify>,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = online.notified() => {
                let Some(facade) = facade.upgrade() else { break };
                if facade.queue.size() == 0 {
                    continue;
                }
                tracing::info!(pending = facade.queue.size(), "Connectivity restored, draining queue");
                tokio::select! {
                    _ = facade.drain_queue() => {}
                    _ = shutdown.recv() => break,
                }
            }
            _ = shutdown.recv() => {
                tracing::debug!("Auto-drain received shutdown signal, exiting loop");
                break;
            }
        }
    }
}

/// Coordinator operation performing `request` through `upstream`.
fn upstream_operation(
    upstream: &Arc<dyn UpstreamTransport>,
    request: UpstreamRequest,
) -> impl Fn() -> BoxFuture<'static, ResilienceResult<Payload>> + Send + Sync + 'static {
    let upstream = Arc::clone(upstream);
    move || {
        let upstream = Arc::clone(&upstream);
        let request = request.clone();
        async move { upstream.call(request).await?.into_result() }.boxed()
    }
}
