//! Persisted replay queue for offline mutations.
//!
//! # Ordering
//! Actions replay by priority tier, then by sequence within the tier. A
//! retried action takes a fresh sequence (tail of its tier). Actions that
//! share a resource key additionally replay in enqueue order: an action is
//! never started while an older action on the same resource is still pending.
//!
//! # Persistence
//! Every state change is written to the durable store before it is visible
//! in memory, except drain bookkeeping. Those writes run on the blocking
//! pool after the in-memory change; failures are logged and retried on the
//! next change.

use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task;

use crate::config::schema::QueueConfig;
use crate::error::{ResilienceError, ResilienceResult};
use crate::events::{EventBus, Subscription};
use crate::observability::metrics;
use crate::queue::action::{now_millis, ActionOutcome, ActionStatus, EnqueueOptions, QueuedAction};
use crate::queue::store::DurableStore;
use crate::resilience::backoff::calculate_backoff;

/// Summary of one `drain` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub succeeded: usize,
    pub retried: usize,
    pub failed: usize,
    /// Another drain was already running; nothing was processed.
    pub skipped: bool,
}

struct QueueState {
    actions: HashMap<String, QueuedAction>,
    next_sequence: u64,
}

/// Durable priority queue of mutations awaiting connectivity.
pub struct ActionQueue {
    store: Arc<dyn DurableStore>,
    state: Mutex<QueueState>,
    config: ArcSwap<QueueConfig>,
    draining: AtomicBool,
    failed: EventBus<QueuedAction>,
}

/// Clears the draining flag when the drain ends, including on panic.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ActionQueue {
    /// Load every stored action. Actions persisted mid-replay (`inFlight`)
    /// are returned to `pending`; unreadable records are skipped.
    pub fn open(store: Arc<dyn DurableStore>, config: QueueConfig) -> ResilienceResult<Self> {
        let mut actions = HashMap::new();
        let mut next_sequence = 0;

        for (key, bytes) in store.get_all()? {
            let mut action: QueuedAction = match serde_json::from_slice(&bytes) {
                Ok(action) => action,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Skipping corrupt queued action");
                    continue;
                }
            };
            if action.status == ActionStatus::InFlight {
                action.status = ActionStatus::Pending;
                tracing::info!(id = %action.id, action_type = %action.action_type, "Recovered interrupted action");
                if let Err(e) = persist(store.as_ref(), &action) {
                    tracing::warn!(id = %action.id, error = %e, "Failed to persist recovered action");
                }
            }
            next_sequence = next_sequence.max(action.sequence + 1);
            actions.insert(action.id.clone(), action);
        }

        let queue = Self {
            store,
            state: Mutex::new(QueueState {
                actions,
                next_sequence,
            }),
            config: ArcSwap::from_pointee(config),
            draining: AtomicBool::new(false),
            failed: EventBus::new(),
        };

        let size = queue.size();
        tracing::info!(pending = size, total = queue.peek_all().len(), "Action queue loaded");
        metrics::record_queue_size(size);
        Ok(queue)
    }

    /// Persist a new action and return its id. Fails with `QueuePersist` if
    /// the record could not be durably written; nothing is queued in that case.
    pub fn enqueue(
        &self,
        action_type: &str,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> ResilienceResult<String> {
        let max_retries = options
            .max_retries
            .unwrap_or(self.config.load().default_max_retries);

        let mut state = self.state.lock().expect("action queue mutex poisoned");
        let action = QueuedAction::new(action_type, payload, &options, max_retries, state.next_sequence);

        persist(self.store.as_ref(), &action).map_err(|e| {
            tracing::error!(action_type = %action_type, error = %e, "Failed to persist queued action");
            match e {
                ResilienceError::QueuePersist(_) => e,
                other => ResilienceError::QueuePersist(other.to_string()),
            }
        })?;

        state.next_sequence += 1;
        let id = action.id.clone();
        tracing::debug!(
            id = %id,
            action_type = %action_type,
            priority = %action.priority,
            "Action queued"
        );
        state.actions.insert(id.clone(), action);
        metrics::record_queue_action("enqueued");
        metrics::record_queue_size(pending_count(&state));
        Ok(id)
    }

    /// Replay queued actions through `executor` until none are pending.
    ///
    /// Delayed retries are waited for. A second concurrent call returns
    /// immediately with `skipped` set.
    pub async fn drain<F, Fut>(&self, mut executor: F) -> DrainReport
    where
        F: FnMut(QueuedAction) -> Fut,
        Fut: Future<Output = ActionOutcome>,
    {
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("Drain already in progress");
            return DrainReport {
                skipped: true,
                ..Default::default()
            };
        }
        let _guard = DrainGuard(&self.draining);

        let mut report = DrainReport::default();
        loop {
            let next = match self.next_due() {
                NextAction::Ready(action) => action,
                NextAction::Wait(delay) => {
                    tracing::debug!(delay_ms = delay.as_millis() as u64, "Waiting for delayed action");
                    tokio::time::sleep(delay).await;
                    continue;
                }
                NextAction::Idle => break,
            };

            let id = next.id.clone();
            self.write_behind(StoreWrite::Put(next.clone())).await;
            let outcome = executor(next).await;
            if let Some(write) = self.settle(&id, outcome, &mut report) {
                self.write_behind(write).await;
            }
        }

        if report.succeeded + report.retried + report.failed > 0 {
            tracing::info!(
                succeeded = report.succeeded,
                retried = report.retried,
                failed = report.failed,
                "Queue drained"
            );
        }
        report
    }

    /// Pending and in-flight actions. Failed actions are not counted.
    pub fn size(&self) -> usize {
        pending_count(&self.state.lock().expect("action queue mutex poisoned"))
    }

    /// Every stored action, including failed ones, in replay order.
    pub fn peek_all(&self) -> Vec<QueuedAction> {
        let state = self.state.lock().expect("action queue mutex poisoned");
        let mut actions: Vec<QueuedAction> = state.actions.values().cloned().collect();
        actions.sort_by_key(QueuedAction::order_key);
        actions
    }

    pub fn get(&self, id: &str) -> Option<QueuedAction> {
        self.state
            .lock()
            .expect("action queue mutex poisoned")
            .actions
            .get(id)
            .cloned()
    }

    /// Delete one action from memory and the store.
    pub fn remove(&self, id: &str) -> ResilienceResult<bool> {
        let mut state = self.state.lock().expect("action queue mutex poisoned");
        if !state.actions.contains_key(id) {
            return Ok(false);
        }
        self.store.delete(id)?;
        state.actions.remove(id);
        metrics::record_queue_size(pending_count(&state));
        Ok(true)
    }

    /// Delete every action. Returns how many were removed.
    pub fn clear(&self) -> ResilienceResult<usize> {
        let mut state = self.state.lock().expect("action queue mutex poisoned");
        let ids: Vec<String> = state.actions.keys().cloned().collect();
        for id in &ids {
            self.store.delete(id)?;
            state.actions.remove(id);
        }
        tracing::info!(removed = ids.len(), "Action queue cleared");
        metrics::record_queue_size(0);
        Ok(ids.len())
    }

    /// Called with each action that is marked failed during a drain.
    pub fn on_failed<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&QueuedAction) + Send + Sync + 'static,
    {
        self.failed.subscribe(handler)
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    pub fn set_config(&self, config: QueueConfig) {
        self.config.store(Arc::new(config));
    }

    /// Pick the next action to run and mark it in flight.
    fn next_due(&self) -> NextAction {
        let now = now_millis();
        let mut state = self.state.lock().expect("action queue mutex poisoned");

        let mut pending: Vec<&QueuedAction> = state
            .actions
            .values()
            .filter(|a| a.status == ActionStatus::Pending)
            .collect();
        if pending.is_empty() {
            return NextAction::Idle;
        }
        pending.sort_by_key(|a| a.order_key());

        // Oldest pending enqueue per resource; only that one may run
        let mut resource_heads: HashMap<&str, u64> = HashMap::new();
        for action in &pending {
            if let Some(resource) = action.resource_key.as_deref() {
                let head = resource_heads.entry(resource).or_insert(action.enqueue_sequence);
                *head = (*head).min(action.enqueue_sequence);
            }
        }

        let ready = pending
            .iter()
            .filter(|a| {
                a.resource_key
                    .as_deref()
                    .map_or(true, |r| resource_heads.get(r) == Some(&a.enqueue_sequence))
            })
            .find(|a| a.is_due(now))
            .map(|a| a.id.clone());

        let Some(id) = ready else {
            let earliest = pending
                .iter()
                .filter_map(|a| a.next_attempt_at)
                .min()
                .unwrap_or(now);
            return NextAction::Wait(Duration::from_millis(earliest.saturating_sub(now).max(1)));
        };

        let Some(action) = state.actions.get_mut(&id) else {
            return NextAction::Idle;
        };
        action.status = ActionStatus::InFlight;
        action.attempts += 1;
        NextAction::Ready(action.clone())
    }

    /// Apply a drain write on the blocking pool so file I/O never stalls
    /// the runtime worker driving the drain.
    async fn write_behind(&self, write: StoreWrite) {
        let id = write.id().to_string();
        let rewrites = matches!(write, StoreWrite::Put(_));
        let store = Arc::clone(&self.store);
        let result = task::spawn_blocking(move || write.apply(store.as_ref()))
            .await
            .unwrap_or_else(|e| Err(ResilienceError::QueuePersist(format!("store task failed: {}", e))));
        if let Err(e) = result {
            tracing::warn!(id = %id, error = %e, "Failed to persist drain bookkeeping");
            return;
        }

        // A remove or clear that ran meanwhile must not be undone by the put
        let removed = rewrites
            && !self
                .state
                .lock()
                .expect("action queue mutex poisoned")
                .actions
                .contains_key(&id);
        if removed {
            let store = Arc::clone(&self.store);
            let key = id.clone();
            let result = task::spawn_blocking(move || store.delete(&key))
                .await
                .unwrap_or_else(|e| Err(ResilienceError::QueuePersist(format!("store task failed: {}", e))));
            if let Err(e) = result {
                tracing::warn!(id = %id, error = %e, "Failed to delete removed action");
            }
        }
    }

    /// Apply an executor outcome to action `id`. Returns the store write
    /// that makes the outcome durable.
    fn settle(&self, id: &str, outcome: ActionOutcome, report: &mut DrainReport) -> Option<StoreWrite> {
        let config = self.config.load();
        let mut state = self.state.lock().expect("action queue mutex poisoned");
        let next_sequence = state.next_sequence;

        // Removed (e.g. cleared) while the executor was running
        let Some(action) = state.actions.get_mut(id) else {
            return None;
        };

        let mut failed = None;
        let write;
        match outcome {
            ActionOutcome::Success => {
                tracing::debug!(id = %id, attempts = action.attempts, "Action replayed");
                write = StoreWrite::Delete(id.to_string());
                state.actions.remove(id);
                report.succeeded += 1;
                metrics::record_queue_action("succeeded");
            }
            ActionOutcome::RetryableFailure(reason) if action.attempts < action.max_retries => {
                let delay = calculate_backoff(action.attempts, config.backoff_base_ms, config.backoff_max_ms);
                action.status = ActionStatus::Pending;
                action.sequence = next_sequence;
                action.next_attempt_at = Some(now_millis() + delay.as_millis() as u64);
                action.last_error = Some(reason.clone());
                tracing::warn!(
                    id = %id,
                    attempt = action.attempts,
                    max_retries = action.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %reason,
                    "Action failed, requeued"
                );
                write = StoreWrite::Put(action.clone());
                state.next_sequence += 1;
                report.retried += 1;
                metrics::record_queue_action("retried");
            }
            ActionOutcome::RetryableFailure(reason) | ActionOutcome::PermanentFailure(reason) => {
                action.status = ActionStatus::Failed;
                action.next_attempt_at = None;
                action.last_error = Some(reason.clone());
                tracing::error!(
                    id = %id,
                    action_type = %action.action_type,
                    attempts = action.attempts,
                    error = %reason,
                    "Action failed permanently"
                );
                write = StoreWrite::Put(action.clone());
                failed = Some(action.clone());
                report.failed += 1;
                metrics::record_queue_action("failed");
            }
        }
        metrics::record_queue_size(pending_count(&state));
        drop(state);

        if let Some(action) = failed {
            self.failed.emit(&action);
        }
        Some(write)
    }
}

impl std::fmt::Debug for ActionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionQueue")
            .field("size", &self.size())
            .field("draining", &self.is_draining())
            .finish()
    }
}

enum NextAction {
    Ready(QueuedAction),
    Wait(Duration),
    Idle,
}

/// Drain bookkeeping destined for the durable store.
enum StoreWrite {
    Put(QueuedAction),
    Delete(String),
}

impl StoreWrite {
    fn id(&self) -> &str {
        match self {
            StoreWrite::Put(action) => &action.id,
            StoreWrite::Delete(id) => id,
        }
    }

    fn apply(&self, store: &dyn DurableStore) -> ResilienceResult<()> {
        match self {
            StoreWrite::Put(action) => persist(store, action),
            StoreWrite::Delete(id) => store.delete(id),
        }
    }
}

fn persist(store: &dyn DurableStore, action: &QueuedAction) -> ResilienceResult<()> {
    let bytes = serde_json::to_vec(action).map_err(|e| ResilienceError::QueuePersist(e.to_string()))?;
    store.put(&action.id, &bytes)
}

fn pending_count(state: &QueueState) -> usize {
    state
        .actions
        .values()
        .filter(|a| matches!(a.status, ActionStatus::Pending | ActionStatus::InFlight))
        .count()
}
