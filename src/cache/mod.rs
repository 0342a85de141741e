//! Response caching subsystem.
//!
//! # Data Flow
//! ```text
//! Request
//!     → key.rs (method + normalized URL + canonical body hash)
//!     → store.rs lookup: fresh hit returns immediately
//!     → on miss: live call, then store.rs set with the route's TTL
//!     → on live failure: store.rs stale read (flagged to the caller)
//!
//! Background:
//!     cleanup task purges entries past expiry + stale grace
//! ```
//!
//! # Design Decisions
//! - TTLs are route-specific, falling back to a default
//! - Expired entries stay readable as stale for a grace window
//! - Mutations bust the cache by key substring

pub mod key;
pub mod store;

pub use key::RequestKey;
pub use store::{CacheEntry, CacheStore, CachedValue, TtlPolicy};
