use crate::config::RetryConfig;
use crate::metrics_defs::{RETRY_ATTEMPT, RETRY_EXHAUSTED};
use rand::Rng;
use shared::counter;
use std::future::Future;
use tokio::time::{Duration, sleep, timeout};
use tokio_util::sync::CancellationToken;

/// Errors that know whether repeating the operation could succeed.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Why a single attempt failed.
#[derive(thiserror::Error, Debug)]
pub enum AttemptError<E> {
    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Failed(E),
}

impl<E: Retryable> Retryable for AttemptError<E> {
    fn is_retryable(&self) -> bool {
        match self {
            AttemptError::Timeout(_) => true,
            AttemptError::Failed(e) => e.is_retryable(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: AttemptError<E> },
    #[error("failed with a non-retryable error on attempt {attempt}: {error}")]
    Permanent { attempt: u32, error: E },
    #[error("cancelled")]
    Cancelled,
}

/// Linear backoff with jitter, a timeout per attempt, and a bounded number of attempts.
///
/// Shared by every call site that talks to the market API so the policy is configured
/// in one place.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    max_attempts: u32,
    attempt_timeout: Duration,
    base_delay: Duration,
    max_jitter: Duration,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        attempt_timeout: Duration,
        base_delay: Duration,
        max_jitter: Duration,
    ) -> Self {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
            attempt_timeout,
            base_delay,
            max_jitter,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_secs(config.attempt_timeout_secs),
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_jitter_ms),
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before the attempt following attempt number `attempt` (1-based).
    fn delay_after(&self, attempt: u32) -> Duration {
        let jitter_ms = match self.max_jitter.as_millis() as u64 {
            0 => 0,
            max => rand::thread_rng().gen_range(0..=max),
        };
        self.base_delay.saturating_mul(attempt) + Duration::from_millis(jitter_ms)
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, runs out of
    /// attempts, or `cancel` fires. Cancellation interrupts both in-flight attempts and
    /// backoff sleeps.
    pub async fn run<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        operation: &str,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        E: Retryable + std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;
            counter!(RETRY_ATTEMPT).increment(1);

            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                outcome = timeout(self.attempt_timeout, op(attempt)) => outcome,
            };

            let failure = match outcome {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(error)) if !error.is_retryable() => {
                    return Err(RetryError::Permanent { attempt, error });
                }
                Ok(Err(error)) => AttemptError::Failed(error),
                Err(_elapsed) => AttemptError::Timeout(self.attempt_timeout),
            };

            if attempt >= self.max_attempts {
                counter!(RETRY_EXHAUSTED).increment(1);
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: failure,
                });
            }

            let delay = self.delay_after(attempt);
            tracing::warn!(
                operation,
                attempt,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "Attempt failed, retrying"
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                _ = sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(thiserror::Error, Debug, PartialEq)]
    enum TestError {
        #[error("transient")]
        Transient,
        #[error("permanent")]
        Permanent,
    }

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            matches!(self, TestError::Transient)
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_attempts,
            Duration::from_millis(200),
            Duration::from_millis(1),
            Duration::from_millis(1),
        )
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = fast_policy(5);

        let result = policy
            .run(&CancellationToken::new(), "test", |attempt| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if attempt < 3 {
                        Err(TestError::Transient)
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausts_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = fast_policy(5);

        let result: Result<(), _> = policy
            .run(&CancellationToken::new(), "test", |_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(TestError::Transient)
                }
            })
            .await;

        assert!(matches!(
            result,
            Err(RetryError::Exhausted {
                attempts: 5,
                last: AttemptError::Failed(TestError::Transient)
            })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = fast_policy(5);

        let result: Result<(), _> = policy
            .run(&CancellationToken::new(), "test", |_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(TestError::Permanent)
                }
            })
            .await;

        assert!(matches!(
            result,
            Err(RetryError::Permanent {
                attempt: 1,
                error: TestError::Permanent
            })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempt_timeout_is_retried() {
        let policy = RetryPolicy::new(
            2,
            Duration::from_millis(20),
            Duration::from_millis(1),
            Duration::ZERO,
        );

        let result: Result<(), RetryError<TestError>> = policy
            .run(&CancellationToken::new(), "test", |_| async {
                sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert!(matches!(
            result,
            Err(RetryError::Exhausted {
                attempts: 2,
                last: AttemptError::Timeout(_)
            })
        ));
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_backoff() {
        let policy = RetryPolicy::new(
            5,
            Duration::from_secs(1),
            Duration::from_secs(60),
            Duration::ZERO,
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = tokio::time::Instant::now();
        let result: Result<(), _> = policy
            .run(&cancel, "test", |_| async { Err(TestError::Transient) })
            .await;

        assert!(matches!(result, Err(RetryError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_backoff_is_linear() {
        let policy = RetryPolicy::new(
            5,
            Duration::from_secs(10),
            Duration::from_millis(100),
            Duration::ZERO,
        );

        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(3), Duration::from_millis(300));
    }
}
