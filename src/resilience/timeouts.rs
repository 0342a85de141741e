//! Timeout enforcement.
//!
//! # Responsibilities
//! - Wrap every remote attempt with a hard deadline
//! - Cancel the attempt cleanly when the deadline passes
//!
//! # Design Decisions
//! - Uses Tokio's timeout facilities
//! - Elapsed deadlines surface as `ResilienceError::Timeout`, which is a service failure

use std::future::Future;
use std::time::Duration;

use crate::error::{ResilienceError, ResilienceResult};

/// Run `future` with a deadline of `limit`.
pub async fn with_timeout<T, F>(limit: Duration, future: F) -> ResilienceResult<T>
where
    F: Future<Output = ResilienceResult<T>>,
{
    match tokio::time::timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => Err(ResilienceError::Timeout(limit)),
    }
}
