//! Bounded retry loop for test attempts

use log::{debug, info, warn};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use trellis_core::{ErrorKind, RetryPolicy, TaskError};

use crate::cancellation::CancelToken;

/// Trait for errors that can be retried
pub trait Retryable {
    /// Whether this error is retryable
    fn is_retryable(&self) -> bool;
}

impl Retryable for TaskError {
    fn is_retryable(&self) -> bool {
        !matches!(self.kind, ErrorKind::Terminated | ErrorKind::Cancelled)
    }
}

impl Retryable for Vec<TaskError> {
    fn is_retryable(&self) -> bool {
        self.iter().all(Retryable::is_retryable)
    }
}

/// A successful value and how many attempts it took
#[derive(Debug, Clone, PartialEq)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
}

impl<T> Attempted<T> {
    /// Retries consumed before the value was produced
    pub fn retry_count(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Retry executor
///
/// Delays are served one after another, so a run where every attempt but the
/// last fails takes at least `count * delay`.
pub struct RetryExecutor {
    policy: RetryPolicy,
    cancel: Option<CancelToken>,
}

impl RetryExecutor {
    /// Create a new retry executor with the given policy
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            cancel: None,
        }
    }

    /// Stop retrying once `token` is cancelled
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Execute a function with retry logic and attempt context
    ///
    /// `f` receives the 1-indexed attempt number.
    pub async fn execute_with_context<F, Fut, T, E>(
        &self,
        mut f: F,
    ) -> Result<Attempted<T>, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + std::fmt::Debug,
    {
        let mut attempt = 1;

        loop {
            debug!(
                "Executing attempt {} of {}",
                attempt,
                self.policy.count + 1
            );

            match f(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        info!("Attempt {} passed after {} retries", attempt, attempt - 1);
                    }
                    return Ok(Attempted {
                        value,
                        attempts: attempt,
                    });
                }
                Err(error) => {
                    if !error.is_retryable() {
                        return Err(RetryError::NonRetryable {
                            attempts: attempt,
                            error,
                        });
                    }

                    if !self.policy.allows_retry_after(attempt) {
                        if self.policy.count > 0 {
                            warn!("Giving up after {} attempts: {:?}", attempt, error);
                        }
                        return Err(RetryError::Exhausted {
                            attempts: attempt,
                            last_error: error,
                        });
                    }

                    if self.is_cancelled() {
                        return Err(RetryError::Cancelled {
                            attempts: attempt,
                            last_error: error,
                        });
                    }

                    debug!(
                        "Attempt {} failed; retrying in {:?}",
                        attempt, self.policy.delay
                    );
                    self.wait(self.policy.delay).await;

                    if self.is_cancelled() {
                        return Err(RetryError::Cancelled {
                            attempts: attempt,
                            last_error: error,
                        });
                    }

                    attempt += 1;
                }
            }
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map(CancelToken::is_cancelled)
            .unwrap_or(false)
    }

    async fn wait(&self, delay: Duration) {
        if delay.is_zero() {
            return;
        }
        match &self.cancel {
            Some(token) => {
                let mut token = token.clone();
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = token.cancelled() => {}
                }
            }
            None => sleep(delay).await,
        }
    }
}

/// Retry error types
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E: std::fmt::Debug> {
    /// Every allowed attempt failed
    #[error("All {attempts} attempts failed; last error: {last_error:?}")]
    Exhausted { attempts: u32, last_error: E },

    /// Non-retryable error encountered
    #[error("Non-retryable error on attempt {attempts}: {error:?}")]
    NonRetryable { attempts: u32, error: E },

    /// The run was cancelled between attempts
    #[error("Cancelled after {attempts} attempts")]
    Cancelled { attempts: u32, last_error: E },
}

impl<E: std::fmt::Debug> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. }
            | RetryError::NonRetryable { attempts, .. }
            | RetryError::Cancelled { attempts, .. } => *attempts,
        }
    }

    pub fn retry_count(&self) -> u32 {
        self.attempts().saturating_sub(1)
    }

    /// Get the underlying error
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { last_error, .. } => last_error,
            RetryError::NonRetryable { error, .. } => error,
            RetryError::Cancelled { last_error, .. } => last_error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::CancellationController;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;
    use trellis_core::CancelReason;

    #[tokio::test]
    async fn test_pass_after_failures_counts_retries() {
        let executor = RetryExecutor::new(RetryPolicy::new(2, Duration::from_millis(100)));
        let started = Instant::now();

        let result = executor
            .execute_with_context(|attempt| async move {
                if attempt < 3 {
                    Err(TaskError::assertion(format!("attempt {}", attempt)))
                } else {
                    Ok(attempt)
                }
            })
            .await
            .unwrap();

        assert_eq!(result.value, 3);
        assert_eq!(result.retry_count(), 2);
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_exhausted_reports_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let executor = RetryExecutor::new(RetryPolicy::new(1, Duration::ZERO));

        let result: Result<Attempted<()>, _> = executor
            .execute_with_context(|attempt| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { Err(TaskError::assertion(format!("attempt {}", attempt))) }
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.retry_count(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(err.into_inner().message, "attempt 2");
    }

    #[tokio::test]
    async fn test_no_retry_policy_runs_once() {
        let executor = RetryExecutor::new(RetryPolicy::default());
        let result: Result<Attempted<()>, _> = executor
            .execute_with_context(|_| async { Err(TaskError::timeout(Duration::from_millis(5))) })
            .await;
        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 1, .. })));
    }

    #[tokio::test]
    async fn test_terminated_is_not_retried() {
        let executor = RetryExecutor::new(RetryPolicy::new(5, Duration::ZERO));
        let result: Result<Attempted<()>, _> = executor
            .execute_with_context(|_| async { Err(TaskError::terminated("killed")) })
            .await;
        assert!(matches!(result, Err(RetryError::NonRetryable { attempts: 1, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_delay() {
        let controller = CancellationController::new(None, Duration::from_secs(1));
        let executor = RetryExecutor::new(RetryPolicy::new(3, Duration::from_secs(60)))
            .with_cancel(controller.token());

        let run = executor.execute_with_context(|_| async {
            Err::<(), _>(TaskError::assertion("flaky"))
        });
        let cancel = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            controller.cancel(CancelReason::Operator);
        };

        let (result, _) = tokio::join!(run, cancel);
        assert!(matches!(result, Err(RetryError::Cancelled { attempts: 1, .. })));
    }
}
