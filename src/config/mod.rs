//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ResilienceConfig (validated)
//!     → ResilienceFacade (held in an ArcSwap)
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → ResilienceFacade::apply_config swaps it in
//! ```
//!
//! # Design Decisions
//! - Every field has a default; an empty file is a valid config
//! - Validation separates syntactic (serde) from semantic checks
//! - A reload that fails validation keeps the running config

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, ConfigError};
pub use schema::ResilienceConfig;
pub use watcher::ConfigWatcher;
