//! Client-side resilience layer.
//!
//! Wraps remote calls with circuit breaking, caching, request deduplication,
//! rate limiting and retry/backoff; persists mutations made while offline and
//! replays them in order when connectivity returns; keeps a persistent
//! realtime connection alive with heartbeats, reconnection and buffering.
//!
//! # Architecture Overview
//!
//! ```text
//!   application
//!       │
//!       ▼
//!  ┌───────────────────────────── facade ─────────────────────────────┐
//!  │                                                                   │
//!  │  request::coordinator ──▶ cache::store                            │
//!  │        │                                                          │
//!  │        ├──▶ resilience::{rate_limit, circuit_breaker, timeouts,   │
//!  │        │                  backoff, retries}                       │
//!  │        ▼                                                          │
//!  │     upstream (HttpTransport)                                      │
//!  │                                                                   │
//!  │  queue::action_queue ──▶ queue::store (FileStore / MemoryStore)   │
//!  │                                                                   │
//!  │  realtime::manager ──▶ realtime::transport (WsTransport)          │
//!  │        └──▶ realtime::auth                                        │
//!  └───────────────────────────────────────────────────────────────────┘
//!       config · observability · lifecycle · events
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod facade;
pub mod lifecycle;
pub mod observability;
pub mod queue;
pub mod realtime;
pub mod request;
pub mod resilience;
pub mod upstream;

pub use config::schema::ResilienceConfig;
pub use error::{Outcome, ResilienceError, ResilienceResult};
pub use facade::{MutateOptions, MutationOutcome, ResilienceFacade};
pub use lifecycle::Shutdown;
