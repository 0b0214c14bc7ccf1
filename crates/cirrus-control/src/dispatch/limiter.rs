//! Per-function concurrency limits.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{timeout, Instant};

use crate::error::{ControlError, ControlResult};
use crate::types::FunctionId;

/// Bounds the number of in-flight invocations of each function.
///
/// Each function gets its own semaphore on first use. Requests wait for a
/// permit up to the queue timeout and are rejected after that.
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    per_function: usize,
    semaphores: DashMap<FunctionId, Arc<Semaphore>>,
}

impl ConcurrencyLimiter {
    /// Create a limiter allowing `per_function` concurrent invocations.
    #[must_use]
    pub fn new(per_function: usize) -> Self {
        Self {
            per_function: per_function.max(1),
            semaphores: DashMap::new(),
        }
    }

    fn semaphore(&self, function_id: &FunctionId) -> Arc<Semaphore> {
        self.semaphores
            .entry(function_id.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_function)))
            .clone()
    }

    /// Wait up to `wait` for a slot.
    ///
    /// Returns `Overloaded` if no slot frees up in time. The permit is
    /// released when dropped.
    pub async fn acquire(
        &self,
        function_id: &FunctionId,
        wait: Duration,
    ) -> ControlResult<OwnedSemaphorePermit> {
        let semaphore = self.semaphore(function_id);
        let start = Instant::now();

        match timeout(wait, semaphore.acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(ControlError::internal("concurrency limiter closed")),
            Err(_) => Err(ControlError::Overloaded {
                function_id: function_id.to_string(),
                waited: start.elapsed(),
            }),
        }
    }

    /// Number of invocations of `function_id` currently holding a slot.
    #[must_use]
    pub fn in_flight(&self, function_id: &FunctionId) -> usize {
        self.semaphores
            .get(function_id)
            .map_or(0, |s| self.per_function.saturating_sub(s.available_permits()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn permits_are_per_function() {
        let limiter = ConcurrencyLimiter::new(1);
        let a = FunctionId::new("a");
        let b = FunctionId::new("b");

        let _held = limiter.acquire(&a, Duration::from_millis(10)).await.unwrap();
        assert_eq!(limiter.in_flight(&a), 1);

        limiter
            .acquire(&b, Duration::from_millis(10))
            .await
            .expect("other function has its own slot");
    }

    #[tokio::test(start_paused = true)]
    async fn full_limiter_rejects_after_wait() {
        let limiter = ConcurrencyLimiter::new(1);
        let id = FunctionId::new("busy");

        let _held = limiter.acquire(&id, Duration::from_secs(1)).await.unwrap();
        let err = limiter
            .acquire(&id, Duration::from_millis(500))
            .await
            .unwrap_err();

        match err {
            ControlError::Overloaded { function_id, waited } => {
                assert_eq!(function_id, "busy");
                assert!(waited >= Duration::from_millis(500));
            }
            other => panic!("expected Overloaded, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropped_permit_frees_slot() {
        let limiter = ConcurrencyLimiter::new(1);
        let id = FunctionId::new("f");

        let permit = limiter.acquire(&id, Duration::from_millis(10)).await.unwrap();
        drop(permit);
        assert_eq!(limiter.in_flight(&id), 0);

        limiter.acquire(&id, Duration::from_millis(10)).await.unwrap();
    }
}
