use callcore::retry::RetryPolicy;
use log::debug;
use std::fmt::Display;
use std::future::Future;

/// Runs `op` until it succeeds, `should_retry` rejects the error, or the
/// policy's attempt budget is spent. `op` receives the 1-based attempt number.
///
/// The last error is returned unchanged so callers can still classify it.
pub async fn retry_with_backoff<T, E, F, Fut, R>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
    should_retry: R,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: Display,
{
    let mut failures = 0u32;
    loop {
        match op(failures + 1).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                failures += 1;
                if !should_retry(&e) {
                    return Err(e);
                }
                let Some(delay) = policy.next_delay(failures) else {
                    debug!("{label}: giving up after {failures} attempt(s): {e}");
                    return Err(e);
                };
                debug!("{label}: attempt {failures} failed ({e}), retrying in {delay:?}");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn retries_with_linear_backoff() {
        let policy = RetryPolicy::linear(3, Duration::from_secs(1));
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let result: Result<u32, String> = retry_with_backoff(
            &policy,
            "test",
            |attempt| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if attempt < 3 {
                        Err(format!("fail {attempt}"))
                    } else {
                        Ok(attempt)
                    }
                }
            },
            |_| true,
        )
        .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 1s after the first failure, 2s after the second.
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn stops_when_budget_is_spent() {
        let policy = RetryPolicy::linear(2, Duration::from_millis(200));
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<(), &str> = retry_with_backoff(
            &policy,
            "test",
            |_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("down")
                }
            },
            |_| true,
        )
        .await;
        assert_eq!(result, Err("down"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_retryable_error_returns_immediately() {
        let policy = RetryPolicy::linear(5, Duration::from_secs(10));
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<(), &str> = retry_with_backoff(
            &policy,
            "test",
            |_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("fatal")
                }
            },
            |e| *e != "fatal",
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
