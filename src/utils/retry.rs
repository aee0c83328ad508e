//! Retry utilities for resilient operations
//!
//! A bounded attempt loop with a fixed delay between attempts. The database
//! client builds its reconnect cycle on top of it; the operation is told which
//! attempt it is running so it can re-establish state first.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total number of attempts, including the first one
    pub max_attempts: u32,

    /// Pause before every retry
    pub delay: Duration,
}

impl RetryConfig {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Attempt budget, never less than one
    fn budget(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Why a retried operation gave up
#[derive(Debug)]
pub struct RetryFailure {
    /// Attempts made before giving up
    pub attempts: u32,

    /// Error of the last attempt
    pub error: Error,
}

/// Execute an operation until it succeeds or the attempt budget runs out
///
/// The closure receives the zero-based attempt number.
pub async fn with_retry<T, F, Fut>(
    config: &RetryConfig,
    mut operation: F,
) -> std::result::Result<T, RetryFailure>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = config.budget();
    let mut attempt = 0;

    loop {
        if attempt > 0 {
            debug!(
                attempt = attempt,
                delay_ms = config.delay.as_millis() as u64,
                "Waiting before next attempt"
            );
            tokio::time::sleep(config.delay).await;
        }

        match operation(attempt).await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(attempt = attempt, "Recovered after retry");
                }
                return Ok(result);
            }
            Err(e) => {
                attempt += 1;
                warn!(
                    attempt = attempt,
                    max_attempts = max_attempts,
                    error = %e,
                    "Attempt failed"
                );

                if attempt >= max_attempts {
                    return Err(RetryFailure {
                        attempts: attempt,
                        error: e,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn quick() -> RetryConfig {
        RetryConfig::fixed(3, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_first_attempt_wins() {
        let result = with_retry(&quick(), |_| async { Ok::<_, Error>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_recovers_after_two_failures() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = Arc::clone(&attempts);

        let result = with_retry(&quick(), move |_| {
            let attempts = Arc::clone(&attempts_clone);
            async move {
                let count = attempts.fetch_add(1, Ordering::SeqCst);
                if count < 2 {
                    return Err(Error::Database("simulated failure".into()));
                }
                Ok(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_budget_exhausted_reports_last_error() {
        let result: std::result::Result<(), _> = with_retry(&quick(), |_| async {
            Err(Error::Database("permanent failure".into()))
        })
        .await;

        let failure = result.unwrap_err();
        assert_eq!(failure.attempts, 3);
        assert!(failure.error.to_string().contains("permanent failure"));
    }

    #[tokio::test]
    async fn test_attempt_number_passed_to_operation() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);

        let _ = with_retry(&quick(), move |attempt| {
            seen_clone.lock().unwrap().push(attempt);
            async { Err::<(), _>(Error::Database("nope".into())) }
        })
        .await;

        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_zero_budget_still_runs_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);
        let config = RetryConfig::fixed(0, Duration::from_millis(1));

        let result: std::result::Result<(), _> = with_retry(&config, move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::Database("down".into())) }
        })
        .await;

        assert_eq!(result.unwrap_err().attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fixed_delay_between_attempts() {
        let config = RetryConfig::fixed(3, Duration::from_millis(20));
        let start = std::time::Instant::now();

        let _: std::result::Result<(), _> = with_retry(&config, |_| async {
            Err(Error::Database("down".into()))
        })
        .await;

        assert!(start.elapsed() >= Duration::from_millis(40));
    }
}
