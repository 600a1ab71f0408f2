//! Resilience utilities: bulkhead limiting for server-side work.
//!
//! The update server admits at most `max(executor_threads, 16)` concurrent
//! handlers; excess requests queue at the bulkhead instead of piling up
//! unbounded long-poll state.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Error returned when the bulkhead cannot hand out a slot.
#[derive(Debug, thiserror::Error)]
#[error("bulkhead has no free slots")]
pub struct BulkheadFull;

/// Semaphore-backed concurrency limiter. Dropping the permit releases the
/// slot.
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
}

impl Bulkhead {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Wait for a slot.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, BulkheadFull> {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| BulkheadFull)
    }

    /// Take a slot only if one is free right now.
    pub fn try_acquire(&self) -> Result<OwnedSemaphorePermit, BulkheadFull> {
        Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .map_err(|_| BulkheadFull)
    }

    /// Currently free slots.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}
