//! Deadlock-aware retry for transactional units of work.
//!
//! A unit of work is everything between acquiring a connection and
//! committing or rolling back: the driver re-runs the whole unit, so every
//! attempt leases its own connection and releases it before the next attempt
//! starts. Only [`Error::Deadlock`] triggers a retry; any other error aborts
//! immediately.

use std::future::Future;

use crate::{Error, Result};

/// Bounded retry policy for deadlocked transactions.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

impl RetryPolicy {
    /// Creates a policy allowing `max_attempts` tries in total (clamped to a
    /// minimum of 1).
    #[must_use]
    pub const fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: if max_attempts == 0 { 1 } else { max_attempts },
        }
    }

    /// Total attempts allowed, including the first.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// Runs `unit` until it succeeds, fails with a non-deadlock error, or
/// exhausts the policy's attempt bound on deadlocks.
///
/// The closure receives the 1-based attempt number. The final deadlock is
/// surfaced to the caller unchanged.
pub async fn retry_on_deadlock<T, F, Fut>(policy: RetryPolicy, mut unit: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match unit(attempt).await {
            Err(Error::Deadlock) if attempt < policy.max_attempts() => {
                tracing::warn!(
                    attempt,
                    max_attempts = policy.max_attempts(),
                    "transaction deadlocked, retrying"
                );
                metrics::counter!("store_transaction_retries_total").increment(1);
                attempt += 1;
            },
            result => return result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Simulates a pooled lease: counts the release when dropped.
    struct Lease {
        releases: Arc<AtomicUsize>,
    }

    impl Drop for Lease {
        fn drop(&mut self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let calls = AtomicUsize::new(0);
        let result = retry_on_deadlock(RetryPolicy::default(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(42) }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_persistent_deadlock_tried_three_times_then_surfaced() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = retry_on_deadlock(RetryPolicy::default(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::Deadlock) }
        })
        .await;
        assert!(matches!(result, Err(Error::Deadlock)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_deadlock_then_success() {
        let calls = AtomicUsize::new(0);
        let result = retry_on_deadlock(RetryPolicy::default(), |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(Error::Deadlock)
                } else {
                    Ok("done")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_deadlock_error_is_never_retried() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = retry_on_deadlock(RetryPolicy::default(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::backend("execute", "constraint violated")) }
        })
        .await;
        assert!(matches!(result, Err(Error::Backend { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_each_attempt_acquires_and_releases_exactly_once() {
        let acquires = Arc::new(AtomicUsize::new(0));
        let releases = Arc::new(AtomicUsize::new(0));

        let result: Result<()> = retry_on_deadlock(RetryPolicy::default(), |_| {
            let acquires = Arc::clone(&acquires);
            let releases = Arc::clone(&releases);
            async move {
                acquires.fetch_add(1, Ordering::SeqCst);
                let _lease = Lease { releases };
                Err(Error::Deadlock)
            }
        })
        .await;

        assert!(matches!(result, Err(Error::Deadlock)));
        assert_eq!(acquires.load(Ordering::SeqCst), 3);
        assert_eq!(releases.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_single_attempt_policy_never_retries() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = retry_on_deadlock(RetryPolicy::new(1), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::Deadlock) }
        })
        .await;
        assert!(matches!(result, Err(Error::Deadlock)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_zero_attempts_clamped_to_one() {
        assert_eq!(RetryPolicy::new(0).max_attempts(), 1);
    }
}
