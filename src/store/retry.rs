//! Explicit retry policy for record-store operations.
//!
//! The retry budget is a value passed to each call site, not an attribute
//! wrapped around it, so the semantics stay visible where they matter: a
//! reader of `store.start(...)` can see exactly how many attempts and how
//! much delay stand between a flaky database and a failed conversion.
//!
//! Fixed delay, bounded attempts. Store outages are either a blip (the
//! first retry wins) or a real outage (no schedule saves the attempt), and
//! a fixed delay keeps the worst-case duration of an attempt predictable.

use crate::error::StoreError;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Bounded fixed-delay retry for transient database failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Always at least 1.
    pub attempts: u32,
    /// Delay between attempts.
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }

    /// Run `op`, retrying transient failures until the budget is spent.
    ///
    /// Non-transient errors (malformed query, decode failure) are not worth
    /// retrying and surface immediately. Either way the caller sees
    /// [`StoreError::Unavailable`] carrying the last underlying error.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if is_transient(&e) && attempt < self.attempts => {
                    warn!(
                        "{}: transient store error on attempt {}/{}: {}",
                        label, attempt, self.attempts, e
                    );
                    tokio::time::sleep(self.delay).await;
                }
                Err(e) => {
                    return Err(StoreError::Unavailable {
                        attempts: attempt,
                        source: e,
                    })
                }
            }
        }
    }
}

/// Connectivity-shaped failures worth retrying.
fn is_transient(e: &sqlx::Error) -> bool {
    matches!(
        e,
        sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Tls(_)
    )
}
