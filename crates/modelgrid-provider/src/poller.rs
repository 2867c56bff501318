//! Convergence poller — the single bounded retry-until-condition primitive.
//!
//! All "wait for the backend to reach state X" logic in the control plane
//! goes through [`poll_until`]; there is no other retry mechanism.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::error::{ProviderError, ProviderResult};

/// Repeatedly evaluate `condition` until it returns true, the timeout
/// elapses, or the condition itself errors.
///
/// The condition is evaluated once immediately, then every `interval`.
/// On timeout the call fails with [`ProviderError::ConvergenceTimeout`];
/// a condition error is propagated as-is. The total wait never exceeds
/// `timeout` by more than one interval.
pub async fn poll_until<F, Fut>(
    mut condition: F,
    timeout: Duration,
    interval: Duration,
) -> ProviderResult<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ProviderResult<bool>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        if condition().await? {
            debug!(attempt, "condition met");
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            debug!(attempt, ?timeout, "condition not met before deadline");
            return Err(ProviderError::ConvergenceTimeout(timeout));
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    #[tokio::test]
    async fn returns_on_first_true_tick() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        poll_until(
            move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(true)
                }
            },
            Duration::from_millis(100),
            Duration::from_millis(10),
        )
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn succeeds_once_condition_flips() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        poll_until(
            move || {
                let calls = calls_clone.clone();
                async move { Ok(calls.fetch_add(1, Ordering::SeqCst) >= 2) }
            },
            Duration::from_secs(5),
            Duration::from_millis(5),
        )
        .await
        .unwrap();

        // True on the third evaluation.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn times_out_when_condition_never_holds() {
        let timeout = Duration::from_millis(30);
        let interval = Duration::from_millis(10);
        let started = Instant::now();

        let result = poll_until(|| async { Ok(false) }, timeout, interval).await;

        assert!(matches!(
            result,
            Err(ProviderError::ConvergenceTimeout(t)) if t == timeout
        ));
        // Never exceeds the timeout by more than one interval (plus sched slack).
        assert!(started.elapsed() < timeout + interval + Duration::from_millis(50));
    }

    #[tokio::test]
    async fn condition_error_propagates_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result = poll_until(
            move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(ProviderError::Backend("boom".to_string()))
                }
            },
            Duration::from_secs(5),
            Duration::from_millis(5),
        )
        .await;

        assert!(matches!(result, Err(ProviderError::Backend(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sleeps_between_attempts() {
        let started = Instant::now();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        poll_until(
            move || {
                let calls = calls_clone.clone();
                async move { Ok(calls.fetch_add(1, Ordering::SeqCst) >= 1) }
            },
            Duration::from_secs(5),
            Duration::from_millis(20),
        )
        .await
        .unwrap();

        // One sleep happened between the two evaluations.
        assert!(started.elapsed() >= Duration::from_millis(20));
    }
}
