use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Errors that distinguish "worth another attempt" from "give up now".
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

#[derive(Debug, Clone, Copy)]
pub enum Backoff {
    /// Same delay between every attempt.
    Fixed(Duration),
    /// Delay doubles after each failed attempt.
    Exponential(Duration),
}

impl Backoff {
    fn delay(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Fixed(d) => *d,
            Backoff::Exponential(base) => *base * 2u32.saturating_pow(attempt.saturating_sub(1)),
        }
    }
}

/// Run `op` up to `max_attempts` times, sleeping between retryable
/// failures. Returns the final result together with the number of attempts
/// actually made, so stages can record it.
pub async fn with_retries<T, E, F, Fut>(
    label: &str,
    max_attempts: u32,
    backoff: Backoff,
    mut op: F,
) -> (Result<T, E>, u32)
where
    E: Retryable + std::fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1u32;
    loop {
        match op(attempt).await {
            Ok(v) => return (Ok(v), attempt),
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let delay = backoff.delay(attempt);
                warn!(
                    stage = label,
                    attempt,
                    max_attempts,
                    delay_s = delay.as_secs(),
                    "attempt failed, retrying: {e}"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return (Err(e), attempt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct TestError(bool);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "test error")
        }
    }

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            self.0
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let (result, attempts) = with_retries(
            "test",
            3,
            Backoff::Fixed(Duration::from_millis(1)),
            move |_| async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TestError(true))
                } else {
                    Ok(42)
                }
            },
        )
        .await;
        assert_eq!(result.ok(), Some(42));
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn fatal_errors_stop_immediately() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let (result, attempts): (Result<(), _>, _) = with_retries(
            "test",
            5,
            Backoff::Fixed(Duration::from_millis(1)),
            move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError(false))
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn exponential_backoff_doubles() {
        let b = Backoff::Exponential(Duration::from_secs(5));
        assert_eq!(b.delay(1), Duration::from_secs(5));
        assert_eq!(b.delay(2), Duration::from_secs(10));
        assert_eq!(b.delay(3), Duration::from_secs(20));
    }
}
