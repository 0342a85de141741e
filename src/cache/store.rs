//! TTL-keyed response cache with stale reads.

use arc_swap::ArcSwap;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::time;

use crate::config::schema::CacheConfig;
use crate::observability::metrics;

/// A cached value and its lifetime.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub stored_at: Instant,
    pub expiry: Instant,
}

impl<V> CacheEntry<V> {
    pub fn is_fresh(&self, now: Instant) -> bool {
        now < self.expiry
    }
}

/// A cache hit.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedValue<V> {
    pub value: V,
    /// The entry is past its expiry and was returned because stale reads were allowed.
    pub is_stale: bool,
}

/// Route-specific TTLs with a default.
#[derive(Debug, Clone)]
pub struct TtlPolicy {
    pub default_ttl: Duration,
    /// How long past expiry an entry stays readable as stale.
    pub stale_grace: Duration,
    routes: Vec<(String, Duration)>,
}

impl TtlPolicy {
    pub fn new(default_ttl: Duration, stale_grace: Duration) -> Self {
        Self {
            default_ttl,
            stale_grace,
            routes: Vec::new(),
        }
    }

    pub fn with_route(mut self, pattern: impl Into<String>, ttl: Duration) -> Self {
        self.routes.push((pattern.into(), ttl));
        // Longest pattern wins
        self.routes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        self
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        config.route_ttls.iter().fold(
            Self::new(
                Duration::from_secs(config.default_ttl_secs),
                Duration::from_secs(config.stale_grace_secs),
            ),
            |policy, (pattern, secs)| policy.with_route(pattern.clone(), Duration::from_secs(*secs)),
        )
    }

    /// TTL for `key`: the longest route pattern contained in the key, else the default.
    pub fn ttl_for(&self, key: &str) -> Duration {
        self.routes
            .iter()
            .find(|(pattern, _)| key.contains(pattern.as_str()))
            .map(|(_, ttl)| *ttl)
            .unwrap_or(self.default_ttl)
    }
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}

/// Concurrent response cache.
#[derive(Debug)]
pub struct CacheStore<V> {
    entries: DashMap<String, CacheEntry<V>>,
    policy: ArcSwap<TtlPolicy>,
}

impl<V: Clone> CacheStore<V> {
    pub fn new(policy: TtlPolicy) -> Self {
        Self {
            entries: DashMap::new(),
            policy: ArcSwap::from_pointee(policy),
        }
    }

    /// Look up `key`. Expired entries are returned only when `allow_stale` is set,
    /// flagged as stale. Entries past the stale grace window are removed.
    pub fn get(&self, key: &str, allow_stale: bool) -> Option<CachedValue<V>> {
        let now = Instant::now();
        let grace = self.policy.load().stale_grace;

        let hit = match self.entries.get(key) {
            None => None,
            Some(entry) if entry.is_fresh(now) => Some(CachedValue {
                value: entry.value.clone(),
                is_stale: false,
            }),
            Some(entry) if now >= entry.expiry + grace => {
                drop(entry);
                self.entries
                    .remove_if(key, |_, e| now >= e.expiry + grace);
                None
            }
            Some(entry) if allow_stale => Some(CachedValue {
                value: entry.value.clone(),
                is_stale: true,
            }),
            Some(_) => None,
        };

        metrics::record_cache_lookup(match &hit {
            None => "miss",
            Some(v) if v.is_stale => "stale",
            Some(_) => "hit",
        });
        hit
    }

    /// Store `value` under `key` with a fresh timestamp.
    pub fn set(&self, key: &str, value: V, ttl: Duration) {
        let stored_at = Instant::now();
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                stored_at,
                expiry: stored_at + ttl,
            },
        );
    }

    /// Store `value` with the TTL of the route `key` belongs to.
    pub fn set_for_route(&self, key: &str, value: V) {
        let ttl = self.ttl_for(key);
        self.set(key, value, ttl);
    }

    pub fn ttl_for(&self, key: &str) -> Duration {
        self.policy.load().ttl_for(key)
    }

    /// Remove every key containing `pattern`. Returns the number removed.
    pub fn invalidate(&self, pattern: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.contains(pattern));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            tracing::debug!(pattern = %pattern, removed, "Cache entries invalidated");
        }
        removed
    }

    /// Purge entries past expiry plus the stale grace window.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let grace = self.policy.load().stale_grace;
        let before = self.entries.len();
        self.entries.retain(|_, entry| now < entry.expiry + grace);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Replace the TTL table. Existing entries keep their expiry.
    pub fn set_policy(&self, policy: TtlPolicy) {
        self.policy.store(Arc::new(policy));
    }
}

impl<V: Clone + Send + Sync + 'static> CacheStore<V> {
    /// Run `cleanup` every `interval` until shutdown.
    pub fn spawn_cleanup(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let purged = cache.cleanup();
                        if purged > 0 {
                            tracing::debug!(purged, remaining = cache.len(), "Cache cleanup");
                        }
                    }
                    _ = shutdown.recv() => {
                        tracing::debug!("Cache cleanup received shutdown signal, exiting loop");
                        break;
                    }
                }
            }
        })
    }
}
