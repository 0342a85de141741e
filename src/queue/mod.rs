//! Durable action queue.
//!
//! # Data Flow
//! ```text
//! Mutation while offline
//!     → action_queue.rs (enqueue: persist, then index in memory)
//!     → store.rs (DurableStore: one record per action)
//!
//! Connectivity restored
//!     → action_queue.rs (drain: priority, FIFO, per-resource order)
//!     → executor (success / retryable / permanent)
//!     → store.rs (delete on success, rewrite on retry or failure)
//! ```

pub mod action;
pub mod action_queue;
pub mod store;

pub use action::{ActionOutcome, ActionStatus, EnqueueOptions, Priority, QueuedAction};
pub use action_queue::{ActionQueue, DrainReport};
pub use store::{DurableStore, FileStore, MemoryStore};
