//! Call-site retry for transient infrastructure failures.

use crate::error::{PipelineError, Result};
use std::future::Future;
use std::time::Duration;

const RETRY_DELAY_CAP: Duration = Duration::from_secs(30);

/// Delay before the Nth retry attempt (1-based): 250ms doubling, capped.
pub fn transient_retry_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let delay = Duration::from_millis(250u64.saturating_mul(1 << exp));
    delay.min(RETRY_DELAY_CAP)
}

/// Run `op`, retrying only `Transient`/`Channel` failures up to `attempts`
/// total tries with exponential backoff. Invariant violations and invalid
/// input surface immediately — retrying a caller bug just repeats it.
pub async fn with_backoff<T, F, Fut>(label: &str, attempts: u32, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);
    let mut tried = 0;
    loop {
        tried += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && tried < attempts => {
                let delay = transient_retry_delay(tried);
                tracing::warn!(
                    %e,
                    op = label,
                    attempt = tried,
                    retry_in_ms = delay.as_millis() as u64,
                    "transient failure; retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                if e.is_transient() {
                    tracing::error!(%e, op = label, attempts = tried, "retry budget exhausted");
                }
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn retry_delay_grows_exponentially_and_caps() {
        assert_eq!(transient_retry_delay(1).as_millis(), 250);
        assert_eq!(transient_retry_delay(2).as_millis(), 500);
        assert_eq!(transient_retry_delay(3).as_millis(), 1000);
        assert_eq!(transient_retry_delay(20).as_millis(), 30000);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let out = with_backoff("test", 5, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(PipelineError::Transient("flaky".to_string()))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(out, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn invariant_violations_are_never_retried() {
        let calls = AtomicU32::new(0);
        let err = with_backoff("test", 5, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(PipelineError::InvariantViolation("bug".to_string())) }
        })
        .await
        .unwrap_err();
        assert!(err.is_invariant_violation());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn budget_exhaustion_returns_the_last_error() {
        let calls = AtomicU32::new(0);
        let err = with_backoff("test", 2, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(PipelineError::Transient("down".to_string())) }
        })
        .await
        .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
