//! Queued action records.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Replay priority. Lower variants replay first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High = 0,
    Medium = 1,
    Low = 2,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::High => write!(f, "high"),
            Priority::Medium => write!(f, "medium"),
            Priority::Low => write!(f, "low"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

/// Lifecycle of a queued action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActionStatus {
    Pending,
    InFlight,
    Failed,
    Done,
}

/// A persisted mutation waiting for replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedAction {
    /// Unique and stable across restarts.
    pub id: String,
    /// Opaque action type, selects the replay handler.
    #[serde(rename = "type")]
    pub action_type: String,
    /// Opaque payload.
    pub payload: serde_json::Value,
    pub priority: Priority,
    /// Actions sharing a resource key replay strictly in enqueue order.
    #[serde(default)]
    pub resource_key: Option<String>,
    pub attempts: u32,
    pub max_retries: u32,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
    pub status: ActionStatus,
    /// Earliest replay time after a retryable failure (ms since epoch).
    #[serde(default)]
    pub next_attempt_at: Option<u64>,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Position in replay order within its priority tier; moves to the tail on retry.
    pub sequence: u64,
    /// Position at enqueue time; never changes.
    pub enqueue_sequence: u64,
}

impl QueuedAction {
    pub(crate) fn new(
        action_type: impl Into<String>,
        payload: serde_json::Value,
        options: &EnqueueOptions,
        max_retries: u32,
        sequence: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            action_type: action_type.into(),
            payload,
            priority: options.priority,
            resource_key: options.resource_key.clone(),
            attempts: 0,
            max_retries,
            created_at: now_millis(),
            status: ActionStatus::Pending,
            next_attempt_at: None,
            last_error: None,
            sequence,
            enqueue_sequence: sequence,
        }
    }

    /// True if the action is waiting and its retry delay has passed.
    pub fn is_due(&self, now_ms: u64) -> bool {
        self.status == ActionStatus::Pending && self.next_attempt_at.map_or(true, |at| at <= now_ms)
    }

    /// Replay order: priority first, then FIFO within the tier.
    pub fn order_key(&self) -> (Priority, u64) {
        (self.priority, self.sequence)
    }
}

/// Options for `ActionQueue::enqueue`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    pub priority: Priority,
    /// Queue default when unset.
    pub max_retries: Option<u32>,
    pub resource_key: Option<String>,
}

impl EnqueueOptions {
    pub fn priority(priority: Priority) -> Self {
        Self {
            priority,
            ..Default::default()
        }
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn resource(mut self, key: impl Into<String>) -> Self {
        self.resource_key = Some(key.into());
        self
    }
}

/// What the replay executor reports for one action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Success,
    /// Try again later, subject to `max_retries`.
    RetryableFailure(String),
    /// Give up now.
    PermanentFailure(String),
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
