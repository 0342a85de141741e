//! Circuit breaker for remote endpoint protection.
//!
//! # States
//! - Closed: normal operation, calls pass through
//! - Open: endpoint assumed down, calls fail fast (or fall back)
//! - Half-Open: a bounded number of trial calls test whether it recovered
//!
//! # State Transitions
//! ```text
//! Closed → Open: consecutive service failures >= failure_threshold
//! Open → Half-Open: first call after recovery_timeout since the last failure
//! Half-Open → Closed: success_threshold successful trials
//! Half-Open → Open: any service failure (recovery timer restarts)
//! ```
//!
//! # Design Decisions
//! - One breaker per endpoint, created lazily by the registry
//! - Client errors neither trip nor heal the circuit
//! - State is mirrored in an atomic so readers never take the lock

use arc_swap::ArcSwap;
use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::config::schema::{BreakerSettings, CircuitBreakerConfig};
use crate::error::{Outcome, ResilienceError, ResilienceResult};
use crate::observability::metrics;
use crate::resilience::retries::FailureClassifier;

/// Circuit state.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(val: u8) -> Self {
        match val {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    failures: u32,
    successes: u32,
    trials_in_flight: u32,
    last_failure: Option<Instant>,
}

/// Failure/success state machine guarding one endpoint.
#[derive(Debug)]
pub struct CircuitBreaker {
    endpoint: String,
    settings: ArcSwap<BreakerSettings>,
    classifier: ArcSwap<FailureClassifier>,
    state: AtomicU8,
    counters: Mutex<Counters>,
    fallbacks_served: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(endpoint: impl Into<String>, settings: BreakerSettings) -> Self {
        let classifier = FailureClassifier::from_settings(&settings);
        Self {
            endpoint: endpoint.into(),
            settings: ArcSwap::from_pointee(settings),
            classifier: ArcSwap::from_pointee(classifier),
            state: AtomicU8::new(CircuitState::Closed as u8),
            counters: Mutex::new(Counters::default()),
            fallbacks_served: AtomicU64::new(0),
        }
    }

    /// Endpoint this breaker guards.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Current state (lock-free snapshot).
    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    /// Consecutive service failures recorded while closed.
    pub fn failure_count(&self) -> u32 {
        self.counters.lock().expect("circuit breaker mutex poisoned").failures
    }

    /// Number of calls answered by a fallback so far.
    pub fn fallbacks_served(&self) -> u64 {
        self.fallbacks_served.load(Ordering::Relaxed)
    }

    /// Classifier deciding which failures count against this circuit.
    pub fn classifier(&self) -> Arc<FailureClassifier> {
        self.classifier.load_full()
    }

    /// Replace thresholds without losing the current state.
    pub fn update_settings(&self, settings: BreakerSettings) {
        self.classifier.store(Arc::new(FailureClassifier::from_settings(&settings)));
        self.settings.store(Arc::new(settings));
    }

    /// Force the circuit closed and clear all counters.
    pub fn reset(&self) {
        let mut counters = self.counters.lock().expect("circuit breaker mutex poisoned");
        *counters = Counters::default();
        self.transition(CircuitState::Closed);
    }

    /// Run `operation` through the circuit.
    ///
    /// While open, returns `fallback` if given, else `CircuitOpen`. A service
    /// failure that opens the circuit is also answered by `fallback`; any other
    /// failure is propagated unchanged.
    pub async fn execute<T, F, Fut>(
        &self,
        operation: F,
        fallback: Option<T>,
    ) -> ResilienceResult<Outcome<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ResilienceResult<T>>,
    {
        let mut permit = match self.try_acquire() {
            Ok(permit) => permit,
            Err(err) => return self.fall_back(fallback, err),
        };

        match operation().await {
            Ok(value) => {
                permit.settle();
                self.record_success();
                Ok(Outcome::fresh(value))
            }
            Err(err) if err.is_service_failure(&self.classifier()) => {
                permit.settle();
                if self.record_failure() {
                    return self.fall_back(fallback, err);
                }
                Err(err)
            }
            // Dropping the permit releases a half-open trial slot
            Err(err) => Err(err),
        }
    }

    /// Ask to let one call through.
    fn try_acquire(&self) -> ResilienceResult<Permit<'_>> {
        let settings = self.settings.load();
        let mut counters = self.counters.lock().expect("circuit breaker mutex poisoned");

        if self.state() == CircuitState::Open {
            let elapsed = counters
                .last_failure
                .map(|at| at.elapsed() >= settings.recovery_timeout())
                .unwrap_or(true);
            if !elapsed {
                return Err(self.open_error());
            }
            counters.successes = 0;
            counters.trials_in_flight = 0;
            self.transition(CircuitState::HalfOpen);
        }

        if self.state() == CircuitState::HalfOpen {
            if counters.trials_in_flight >= settings.half_open_max_calls.max(1) {
                return Err(self.open_error());
            }
            counters.trials_in_flight += 1;
            return Ok(Permit { breaker: self, trial: true });
        }

        Ok(Permit { breaker: self, trial: false })
    }

    fn record_success(&self) {
        let settings = self.settings.load();
        let mut counters = self.counters.lock().expect("circuit breaker mutex poisoned");

        match self.state() {
            CircuitState::HalfOpen => {
                counters.trials_in_flight = counters.trials_in_flight.saturating_sub(1);
                counters.successes += 1;
                if counters.successes >= settings.success_threshold {
                    *counters = Counters::default();
                    self.transition(CircuitState::Closed);
                }
            }
            _ => counters.failures = 0,
        }
    }

    /// Returns true if this failure opened the circuit.
    fn record_failure(&self) -> bool {
        let settings = self.settings.load();
        let mut counters = self.counters.lock().expect("circuit breaker mutex poisoned");
        counters.last_failure = Some(Instant::now());

        match self.state() {
            CircuitState::HalfOpen => {
                counters.trials_in_flight = 0;
                counters.successes = 0;
                self.transition(CircuitState::Open);
                true
            }
            CircuitState::Closed => {
                counters.failures += 1;
                if counters.failures >= settings.failure_threshold {
                    self.transition(CircuitState::Open);
                    true
                } else {
                    false
                }
            }
            // A call admitted before the circuit opened; the timer restarts
            CircuitState::Open => false,
        }
    }

    fn release_trial(&self) {
        let mut counters = self.counters.lock().expect("circuit breaker mutex poisoned");
        counters.trials_in_flight = counters.trials_in_flight.saturating_sub(1);
    }

    fn fall_back<T>(&self, fallback: Option<T>, err: ResilienceError) -> ResilienceResult<Outcome<T>> {
        match fallback {
            Some(value) => {
                self.fallbacks_served.fetch_add(1, Ordering::Relaxed);
                metrics::record_fallback(&self.endpoint);
                tracing::debug!(endpoint = %self.endpoint, error = %err, "Serving fallback");
                Ok(Outcome::fallback(value))
            }
            None => Err(err),
        }
    }

    fn open_error(&self) -> ResilienceError {
        ResilienceError::CircuitOpen {
            endpoint: self.endpoint.clone(),
        }
    }

    // Callers hold the counters lock.
    fn transition(&self, to: CircuitState) {
        let from = CircuitState::from(self.state.swap(to as u8, Ordering::AcqRel));
        if from != to {
            match to {
                CircuitState::Open => {
                    tracing::warn!(endpoint = %self.endpoint, from = %from, "Circuit opened")
                }
                _ => tracing::info!(endpoint = %self.endpoint, from = %from, to = %to, "Circuit state changed"),
            }
            metrics::record_circuit_state(&self.endpoint, to);
        }
    }
}

/// Admission to one call; releases a half-open trial slot if the call is abandoned.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
}

impl Permit<'_> {
    fn settle(&mut self) {
        self.trial = false;
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.trial {
            self.breaker.release_trial();
        }
    }
}

/// Lazily created breakers, one per endpoint.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    config: ArcSwap<CircuitBreakerConfig>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config: ArcSwap::from_pointee(config),
        }
    }

    /// Breaker for `endpoint`, created on first use.
    pub fn get(&self, endpoint: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(endpoint) {
            return breaker.clone();
        }
        self.breakers
            .entry(endpoint.to_string())
            .or_insert_with(|| {
                let settings = self.config.load().for_endpoint(endpoint);
                Arc::new(CircuitBreaker::new(endpoint, settings))
            })
            .clone()
    }

    /// Apply new thresholds to existing and future breakers.
    pub fn reconfigure(&self, config: CircuitBreakerConfig) {
        for entry in self.breakers.iter() {
            entry.value().update_settings(config.for_endpoint(entry.key()));
        }
        self.config.store(Arc::new(config));
    }

    /// State of every breaker created so far.
    pub fn states(&self) -> Vec<(String, CircuitState)> {
        let mut states: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    /// Close every circuit.
    pub fn reset_all(&self) {
        for entry in self.breakers.iter() {
            entry.value().reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn settings(failure_threshold: u32, success_threshold: u32, recovery_ms: u64) -> BreakerSettings {
        BreakerSettings {
            failure_threshold,
            success_threshold,
            recovery_timeout_ms: recovery_ms,
            half_open_max_calls: 1,
            failure_statuses: Vec::new(),
        }
    }

    async fn fail(breaker: &CircuitBreaker, status: u16) -> ResilienceResult<Outcome<u32>> {
        breaker
            .execute(|| async move { Err(ResilienceError::Upstream { status }) }, None)
            .await
    }

    async fn succeed(breaker: &CircuitBreaker) -> ResilienceResult<Outcome<u32>> {
        breaker.execute(|| async { Ok(1) }, None).await
    }

    #[tokio::test]
    async fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::new("api", settings(3, 1, 60_000));
        for _ in 0..2 {
            let _ = fail(&breaker, 500).await;
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 2);

        let err = fail(&breaker, 500).await.unwrap_err();
        assert_eq!(err, ResilienceError::Upstream { status: 500 });
        assert_eq!(breaker.state(), CircuitState::Open);

        let err = succeed(&breaker).await.unwrap_err();
        assert_eq!(err, ResilienceError::CircuitOpen { endpoint: "api".into() });
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let breaker = CircuitBreaker::new("api", settings(3, 1, 60_000));
        let _ = fail(&breaker, 502).await;
        let _ = fail(&breaker, 502).await;
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.failure_count(), 0);
        let _ = fail(&breaker, 502).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_client_errors_do_not_trip() {
        let breaker = CircuitBreaker::new("api", settings(2, 1, 60_000));
        for _ in 0..5 {
            let err = fail(&breaker, 404).await.unwrap_err();
            assert_eq!(err, ResilienceError::Upstream { status: 404 });
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_open_circuit_serves_fallback_without_calling() {
        let breaker = CircuitBreaker::new("api", settings(5, 2, 60_000));
        for _ in 0..5 {
            let _ = fail(&breaker, 503).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let calls = AtomicU32::new(0);
        let outcome = breaker
            .execute(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(1)
                },
                Some(42),
            )
            .await
            .unwrap();
        assert_eq!(outcome.value, 42);
        assert!(outcome.is_from_fallback);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(breaker.fallbacks_served(), 1);
    }

    #[tokio::test]
    async fn test_tripping_failure_uses_fallback() {
        let breaker = CircuitBreaker::new("api", settings(2, 1, 60_000));
        let first = breaker
            .execute(|| async { Err(ResilienceError::Timeout(Duration::from_secs(1))) }, Some(0u32))
            .await;
        assert!(first.is_err());

        let second = breaker
            .execute(|| async { Err(ResilienceError::Timeout(Duration::from_secs(1))) }, Some(9u32))
            .await
            .unwrap();
        assert!(second.is_from_fallback);
        assert_eq!(second.value, 9);
    }

    #[tokio::test]
    async fn test_half_open_recovery() {
        let breaker = CircuitBreaker::new("api", settings(2, 2, 50));
        let _ = fail(&breaker, 500).await;
        let _ = fail(&breaker, 500).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(80)).await;
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens_and_restarts_timer() {
        let breaker = CircuitBreaker::new("api", settings(1, 1, 60));
        let _ = fail(&breaker, 500).await;
        tokio::time::sleep(Duration::from_millis(90)).await;

        let err = fail(&breaker, 500).await.unwrap_err();
        assert_eq!(err, ResilienceError::Upstream { status: 500 });
        assert_eq!(breaker.state(), CircuitState::Open);

        // Timer restarted by the trial failure
        let err = succeed(&breaker).await.unwrap_err();
        assert!(matches!(err, ResilienceError::CircuitOpen { .. }));
    }

    #[tokio::test]
    async fn test_half_open_limits_trials() {
        let breaker = Arc::new(CircuitBreaker::new("api", settings(1, 1, 20)));
        let _ = fail(&breaker, 500).await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial = {
            let breaker = breaker.clone();
            tokio::spawn(async move {
                breaker
                    .execute(
                        || async move {
                            let _ = release_rx.await;
                            Ok(1u32)
                        },
                        None,
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let err = succeed(&breaker).await.unwrap_err();
        assert!(matches!(err, ResilienceError::CircuitOpen { .. }));

        release_tx.send(()).unwrap();
        trial.await.unwrap().unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_manual_reset() {
        let breaker = CircuitBreaker::new("api", settings(1, 1, 60_000));
        let _ = fail(&breaker, 500).await;
        assert_eq!(breaker.state(), CircuitState::Open);
        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        succeed(&breaker).await.unwrap();
    }

    #[tokio::test]
    async fn test_registry_per_endpoint_settings() {
        let mut config = CircuitBreakerConfig::default();
        config.default.failure_threshold = 10;
        config.endpoints.insert("realtime".into(), settings(1, 1, 60_000));
        let registry = CircuitBreakerRegistry::new(config);

        let api = registry.get("api");
        let realtime = registry.get("realtime");
        assert!(Arc::ptr_eq(&api, &registry.get("api")));

        let _ = fail(&realtime, 500).await;
        let _ = fail(&api, 500).await;
        assert_eq!(realtime.state(), CircuitState::Open);
        assert_eq!(api.state(), CircuitState::Closed);

        assert_eq!(
            registry.states(),
            vec![("api".to_string(), CircuitState::Closed), ("realtime".to_string(), CircuitState::Open)]
        );
    }

    #[tokio::test]
    async fn test_registry_reconfigure_keeps_state() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::default());
        let api = registry.get("api");
        let _ = fail(&api, 500).await;

        let mut config = CircuitBreakerConfig::default();
        config.default.failure_threshold = 2;
        registry.reconfigure(config);

        assert_eq!(api.failure_count(), 1);
        let _ = fail(&api, 500).await;
        assert_eq!(api.state(), CircuitState::Open);
    }
}
