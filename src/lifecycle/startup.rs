//! Startup orchestration.
//!
//! # Responsibilities
//! - Load and validate configuration
//! - Initialize logging and the metrics exporter
//! - Build the facade, which starts its background tasks
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Observability comes up before anything that logs

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use crate::config::loader::{load_config, ConfigError};
use crate::config::schema::ResilienceConfig;
use crate::error::ResilienceError;
use crate::facade::ResilienceFacade;
use crate::observability::{logging, metrics};

/// Why startup failed.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid metrics address '{0}'")]
    MetricsAddress(String),

    #[error(transparent)]
    Resilience(#[from] ResilienceError),
}

/// Load the config at `path` (defaults when `None`), bring up observability
/// and build the facade.
pub fn start(path: Option<&Path>) -> Result<(ResilienceConfig, Arc<ResilienceFacade>), StartupError> {
    let config = match path {
        Some(path) => load_config(path)?,
        None => ResilienceConfig::default(),
    };

    logging::init_logging(&config.observability);
    if config.observability.metrics_enabled {
        let addr: SocketAddr = config
            .observability
            .metrics_address
            .parse()
            .map_err(|_| StartupError::MetricsAddress(config.observability.metrics_address.clone()))?;
        metrics::init_metrics(addr);
    }

    let facade = ResilienceFacade::builder(config.clone()).build()?;
    tracing::info!(
        config = ?path.map(|p| p.display().to_string()),
        realtime = config.realtime.enabled,
        queued = facade.queue_size(),
        "Resilience layer started"
    );
    Ok((config, facade))
}
