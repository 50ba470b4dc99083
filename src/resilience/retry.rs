//! Exponential backoff retry with jitter.
//!
//! Replaces the original's exception-based retry loop with a result-value
//! discriminant (`spec.md` §9): `retryable_predicate` decides whether a
//! failure should be retried at all, independent of attempt count.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3, base_delay: Duration::from_secs(1), max_delay: Duration::from_secs(60), jitter: true }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
        let capped = exp.min(self.max_delay);
        if !self.jitter {
            return capped;
        }
        let factor = rand::thread_rng().gen_range(0.75..=1.25);
        Duration::from_secs_f64(capped.as_secs_f64() * factor)
    }
}

/// Runs `f` up to `policy.max_attempts` times. `retryable` decides whether a
/// given error should be retried; a non-retryable error surfaces
/// immediately without consuming further attempts. `on_retry` is called
/// between attempts (for logging/metrics), not on the final failure.
pub async fn retry_async<T, E, F, Fut, R>(
    policy: RetryPolicy,
    retryable: R,
    mut on_retry: impl FnMut(u32, &E),
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(err) => {
                attempt += 1;
                if attempt >= policy.max_attempts || !retryable(&err) {
                    return Err(err);
                }
                on_retry(attempt, &err);
                tokio::time::sleep(policy.delay_for(attempt)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy { base_delay: Duration::from_millis(1), max_delay: Duration::from_millis(2), ..Default::default() };
        let result: Result<u32, &str> = retry_async(
            policy,
            |_: &&str| true,
            |_, _| {},
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { if n < 2 { Err("not yet") } else { Ok(42) } }
            },
        )
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_short_circuits() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::default();
        let result: Result<u32, &str> = retry_async(
            policy,
            |_: &&str| false,
            |_, _| {},
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("fatal") }
            },
        )
        .await;
        assert_eq!(result, Err("fatal"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
