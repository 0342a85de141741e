//! Request coordinator: caching, rate limiting, deduplication and retries
//! around arbitrary asynchronous calls.

use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::cache::CacheStore;
use crate::config::schema::{RateLimitConfig, RequestConfig};
use crate::error::{Outcome, ResilienceError, ResilienceResult};
use crate::observability::metrics;
use crate::request::metrics::{MetricsSnapshot, RequestMetrics};
use crate::resilience::backoff::calculate_backoff;
use crate::resilience::timeouts::with_timeout;
use crate::resilience::{CircuitBreakerRegistry, RateLimiter};

type SharedCall<V> = Shared<BoxFuture<'static, ResilienceResult<V>>>;

/// How a single call is coordinated.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestPolicy {
    /// Logical endpoint: selects the circuit breaker and rate window.
    pub endpoint: String,
    /// Cache TTL. The route's TTL applies when unset.
    pub ttl: Option<Duration>,
    /// Read from and write to the cache.
    pub cacheable: bool,
    /// Serve an expired cache entry when the live call fails.
    pub allow_stale: bool,
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub rate_limit: Option<RateLimitConfig>,
    /// Hard deadline per attempt.
    pub timeout: Duration,
    /// Share one execution between concurrent callers with the same key.
    pub deduplicate: bool,
}

impl RequestPolicy {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::from_config(endpoint, &RequestConfig::default())
    }

    /// Defaults for `endpoint` from the request configuration.
    pub fn from_config(endpoint: impl Into<String>, config: &RequestConfig) -> Self {
        let endpoint = endpoint.into();
        Self {
            rate_limit: config.rate_limits.get(&endpoint).copied(),
            endpoint,
            ttl: None,
            cacheable: true,
            allow_stale: true,
            max_retries: config.max_retries,
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
            timeout: Duration::from_millis(config.timeout_ms),
            deduplicate: true,
        }
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Bypass the cache entirely (mutations, replays).
    pub fn no_cache(mut self) -> Self {
        self.cacheable = false;
        self.allow_stale = false;
        self
    }

    /// Every caller gets its own execution. Writes use this so that each
    /// submitted mutation is sent or queued exactly once.
    pub fn no_dedup(mut self) -> Self {
        self.deduplicate = false;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }

    pub fn rate_limit(mut self, max_per_window: u32, window: Duration) -> Self {
        self.rate_limit = Some(RateLimitConfig {
            max_per_window,
            window_secs: window.as_secs().max(1),
        });
        self
    }

    pub fn without_rate_limit(mut self) -> Self {
        self.rate_limit = None;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

struct Inner<V> {
    breakers: Arc<CircuitBreakerRegistry>,
    cache: Arc<CacheStore<V>>,
    limiter: RateLimiter,
    pending: Mutex<HashMap<String, SharedCall<V>>>,
    metrics: RequestMetrics,
}

/// Removes a key from the pending map however its call ends.
struct PendingGuard<V> {
    inner: Arc<Inner<V>>,
    key: String,
}

impl<V> Drop for PendingGuard<V> {
    fn drop(&mut self) {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

/// Wraps calls with caching, rate limiting, deduplication, circuit breaking
/// and retry/backoff. Cheap to clone.
pub struct RequestCoordinator<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for RequestCoordinator<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> RequestCoordinator<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(breakers: Arc<CircuitBreakerRegistry>, cache: Arc<CacheStore<V>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                breakers,
                cache,
                limiter: RateLimiter::new(),
                pending: Mutex::new(HashMap::new()),
                metrics: RequestMetrics::default(),
            }),
        }
    }

    /// Run `operation` for `key` under `policy`.
    ///
    /// `operation` is invoked once per attempt. Concurrent callers with the
    /// same key share one underlying execution unless `policy.deduplicate`
    /// is off.
    pub async fn request<F, Fut>(
        &self,
        key: &str,
        policy: &RequestPolicy,
        operation: F,
    ) -> ResilienceResult<Outcome<V>>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ResilienceResult<V>> + Send + 'static,
    {
        let start = Instant::now();
        let inner = &self.inner;
        inner.metrics.record_request();

        // 1. Cache
        if policy.cacheable {
            if let Some(hit) = inner.cache.get(key, false) {
                tracing::trace!(key = %key, "Cache hit");
                self.finish_success(policy, start);
                return Ok(Outcome::fresh(hit.value));
            }
        }

        // 2. Rate limit
        if let Some(limit) = &policy.rate_limit {
            if !inner.limiter.try_acquire(&policy.endpoint, limit) {
                let err = ResilienceError::RateLimited {
                    endpoint: policy.endpoint.clone(),
                };
                return self.fail(key, policy, start, err);
            }
        }

        // 3. Dedup, 4./5. execute
        let call = self.join_or_start(key, policy, operation);
        match call.await {
            Ok(value) => {
                self.finish_success(policy, start);
                Ok(Outcome::fresh(value))
            }
            Err(err) => self.fail(key, policy, start, err),
        }
    }

    /// Attach to the in-flight call for `key`, or start one.
    fn join_or_start<F, Fut>(&self, key: &str, policy: &RequestPolicy, operation: F) -> SharedCall<V>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ResilienceResult<V>> + Send + 'static,
    {
        if !policy.deduplicate {
            return self.spawn_call(key, policy, operation, false);
        }

        let mut pending = self.inner.pending.lock().expect("pending request mutex poisoned");
        if let Some(existing) = pending.get(key) {
            tracing::debug!(key = %key, "Joining in-flight request");
            return existing.clone();
        }

        // Lock held until the entry is in place, so the task cannot remove it first
        let call = self.spawn_call(key, policy, operation, true);
        pending.insert(key.to_string(), call.clone());
        call
    }

    fn spawn_call<F, Fut>(&self, key: &str, policy: &RequestPolicy, operation: F, tracked: bool) -> SharedCall<V>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ResilienceResult<V>> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let owned_key = key.to_string();
        let policy = policy.clone();
        let task = tokio::spawn(async move {
            // Dropped after the cache write, so late callers hit the cache.
            // Also dropped while unwinding when `operation` panics.
            let _pending = tracked.then(|| PendingGuard {
                inner: Arc::clone(&inner),
                key: owned_key.clone(),
            });
            let result = inner.execute(&policy, operation).await;
            if let (Ok(value), true) = (&result, policy.cacheable) {
                let ttl = policy.ttl.unwrap_or_else(|| inner.cache.ttl_for(&owned_key));
                inner.cache.set(&owned_key, value.clone(), ttl);
            }
            result
        });

        async move {
            task.await.unwrap_or_else(|e| {
                Err(ResilienceError::Transport(format!("request task failed: {}", e)))
            })
        }
        .boxed()
        .shared()
    }

    fn finish_success(&self, policy: &RequestPolicy, start: Instant) {
        self.inner.metrics.record_success(start.elapsed());
        metrics::record_request(&policy.endpoint, "success", start);
    }

    /// Exhausted failure: stale entry if allowed, else the error.
    fn fail(
        &self,
        key: &str,
        policy: &RequestPolicy,
        start: Instant,
        err: ResilienceError,
    ) -> ResilienceResult<Outcome<V>> {
        let stale = if policy.allow_stale {
            self.inner.cache.get(key, true)
        } else {
            None
        };

        self.inner.metrics.record_failure(start.elapsed(), stale.is_some());
        match stale {
            Some(hit) => {
                tracing::info!(key = %key, error = %err, "Serving stale response");
                metrics::record_request(&policy.endpoint, "stale", start);
                Ok(Outcome::stale(hit.value))
            }
            None => {
                metrics::record_request(&policy.endpoint, "failure", start);
                Err(err)
            }
        }
    }

    /// Telemetry snapshot.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn reset_metrics(&self) {
        self.inner.metrics.reset();
    }

    /// Number of keys with a call in flight.
    pub fn in_flight(&self) -> usize {
        self.inner.pending.lock().expect("pending request mutex poisoned").len()
    }

    pub fn cache(&self) -> &Arc<CacheStore<V>> {
        &self.inner.cache
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.inner.breakers
    }
}

impl<V> Inner<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Attempts through the endpoint's breaker with backoff between service failures.
    async fn execute<F, Fut>(&self, policy: &RequestPolicy, operation: F) -> ResilienceResult<V>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = ResilienceResult<V>>,
    {
        let breaker = self.breakers.get(&policy.endpoint);
        let mut attempt = 0u32;

        loop {
            let result = breaker
                .execute(|| with_timeout(policy.timeout, operation()), None)
                .await;

            let err = match result {
                Ok(outcome) => return Ok(outcome.value),
                Err(err) => err,
            };

            if !err.is_service_failure(&breaker.classifier()) || attempt >= policy.max_retries {
                if attempt > 0 {
                    tracing::warn!(
                        endpoint = %policy.endpoint,
                        attempts = attempt + 1,
                        error = %err,
                        "Request failed"
                    );
                }
                return Err(err);
            }

            attempt += 1;
            let delay = calculate_backoff(
                attempt,
                policy.backoff_base.as_millis() as u64,
                policy.backoff_max.as_millis() as u64,
            );
            tracing::info!(endpoint = %policy.endpoint, attempt, delay = ?delay, error = %err, "Retrying request");
            tokio::time::sleep(delay).await;
        }
    }
}
