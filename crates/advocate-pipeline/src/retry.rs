//! Retry logic with configurable backoff policies for calls to the generation service.

use std::time::Duration;

use advocate_types::AdvocateError;

/// Backoff policy controlling the delay between retry attempts.
#[derive(Debug, Clone)]
pub enum BackoffPolicy {
    /// Fixed delay between retries.
    Fixed(Duration),
    /// Exponential backoff: base * 2^attempt, capped at max.
    Exponential { base: Duration, max: Duration },
    /// No delay between retries.
    None,
}

impl BackoffPolicy {
    /// Compute the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        match self {
            BackoffPolicy::Fixed(d) => *d,
            BackoffPolicy::Exponential { base, max } => {
                let millis = (base.as_millis() as u64)
                    .saturating_mul(2u64.saturating_pow(attempt as u32));
                Duration::from_millis(millis).min(*max)
            }
            BackoffPolicy::None => Duration::ZERO,
        }
    }

    /// Delay before the next attempt, honouring a provider's `retry_after`
    /// hint when it asks for longer than the policy would wait.
    pub fn delay_after_error(&self, attempt: usize, err: &AdvocateError) -> Duration {
        let base = self.delay_for_attempt(attempt);
        match err {
            AdvocateError::RateLimited { retry_after_ms, .. } if !matches!(self, BackoffPolicy::None) => {
                base.max(Duration::from_millis(*retry_after_ms))
            }
            _ => base,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
        }
    }
}

/// Execute an operation with retry logic.
///
/// The closure `f` is called up to `max_retries + 1` times. Only errors that
/// satisfy [`AdvocateError::is_retryable`] are retried; anything else is
/// returned immediately. Between retries the function sleeps for the duration
/// dictated by `policy`.
pub async fn execute_with_retry<T, F, Fut>(
    f: F,
    max_retries: usize,
    policy: &BackoffPolicy,
    label: &str,
) -> advocate_types::Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = advocate_types::Result<T>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < max_retries => {
                let delay = policy.delay_after_error(attempt, &e);
                tracing::warn!(stage = %label, attempt, delay_ms = %delay.as_millis(), error = %e, "Retryable error, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn timeout() -> AdvocateError {
        AdvocateError::RequestTimeout {
            provider: "test".into(),
            timeout_ms: 100,
        }
    }

    /// Fails with `make_err` for the first `failures` calls, then succeeds.
    async fn run(
        failures: usize,
        max_retries: usize,
        make_err: fn() -> AdvocateError,
    ) -> (advocate_types::Result<usize>, usize) {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result = execute_with_retry(
            move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < failures {
                    Err(make_err())
                } else {
                    Ok(n)
                }
            },
            max_retries,
            &BackoffPolicy::None,
            "tags",
        )
        .await;
        (result, counter.load(Ordering::SeqCst))
    }

    #[tokio::test]
    async fn first_success_makes_one_call() {
        let (result, calls) = run(0, 3, timeout).await;
        assert_eq!(result.unwrap(), 0);
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn timeouts_are_retried_until_success() {
        let (result, calls) = run(2, 3, timeout).await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn spent_retries_return_last_error() {
        let (result, calls) = run(usize::MAX, 2, || AdvocateError::RateLimited {
            provider: "test".into(),
            retry_after_ms: 0,
        })
        .await;
        assert!(matches!(result, Err(AdvocateError::RateLimited { .. })));
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn auth_errors_are_not_retried() {
        let (result, calls) = run(usize::MAX, 5, || AdvocateError::AuthError {
            provider: "test".into(),
        })
        .await;
        assert!(matches!(result, Err(AdvocateError::AuthError { .. })));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn malformed_output_is_not_a_transport_retry() {
        let (result, calls) = run(usize::MAX, 5, || AdvocateError::MalformedOutput {
            stage: "tags".into(),
            message: "bad".into(),
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn exponential_doubles_then_caps() {
        let policy = BackoffPolicy::Exponential {
            base: Duration::from_millis(100),
            max: Duration::from_millis(500),
        };
        let delays: Vec<u128> = (0..5).map(|a| policy.delay_for_attempt(a).as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500]);
        assert_eq!(policy.delay_for_attempt(64), Duration::from_millis(500));
        assert_eq!(
            BackoffPolicy::Fixed(Duration::from_millis(200)).delay_for_attempt(9),
            Duration::from_millis(200)
        );
    }

    #[test]
    fn rate_limit_hint_extends_delay() {
        let policy = BackoffPolicy::Fixed(Duration::from_millis(100));
        let limited = AdvocateError::RateLimited {
            provider: "x".into(),
            retry_after_ms: 2_000,
        };
        assert_eq!(policy.delay_after_error(0, &limited), Duration::from_millis(2_000));
        assert_eq!(policy.delay_after_error(0, &timeout()), Duration::from_millis(100));
        assert_eq!(BackoffPolicy::None.delay_after_error(0, &limited), Duration::ZERO);
    }
}
