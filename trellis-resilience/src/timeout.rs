//! Per-attempt deadlines
//!
//! The guarded future runs as its own task so that an attempt can be
//! abandoned when its deadline passes. Abandoning is cooperative: the task is
//! aborted, which only takes effect at its next suspension point, and whatever
//! it eventually produces is dropped with the join handle.

use std::any::Any;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Why an attempt produced no value
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttemptError {
    #[error("timed out after {}ms", .0.as_millis())]
    TimedOut(Duration),

    #[error("panicked: {0}")]
    Panicked(String),

    #[error("aborted")]
    Aborted,
}

impl AttemptError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, AttemptError::TimedOut(_))
    }
}

/// Run `fut` with a deadline of `limit`
///
/// A future that completes only after the deadline, because it held the
/// thread without yielding, is still reported as timed out.
pub async fn run_with_deadline<F, T>(limit: Duration, fut: F) -> Result<T, AttemptError>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let started = Instant::now();
    let mut handle = tokio::spawn(fut);

    match tokio::time::timeout(limit, &mut handle).await {
        Ok(Ok(value)) => {
            if started.elapsed() > limit {
                log::debug!(
                    "Attempt finished after its {}ms deadline; result discarded",
                    limit.as_millis()
                );
                return Err(AttemptError::TimedOut(limit));
            }
            Ok(value)
        }
        Ok(Err(join_error)) => {
            if join_error.is_panic() {
                Err(AttemptError::Panicked(panic_message(join_error.into_panic())))
            } else {
                Err(AttemptError::Aborted)
            }
        }
        Err(_) => {
            handle.abort();
            Err(AttemptError::TimedOut(limit))
        }
    }
}

/// Best-effort text of a panic payload
pub fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_completes_within_deadline() {
        let result = run_with_deadline(Duration::from_secs(1), async { 7 }).await;
        assert_eq!(result, Ok(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_discards_zombie_result() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();

        let result = run_with_deadline(Duration::from_millis(50), async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            flag.store(true, Ordering::SeqCst);
        })
        .await;

        assert_eq!(result, Err(AttemptError::TimedOut(Duration::from_millis(50))));
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_panic_is_captured() {
        let result: Result<(), _> =
            run_with_deadline(Duration::from_secs(1), async { panic!("kaboom") }).await;
        assert_eq!(result, Err(AttemptError::Panicked("kaboom".to_string())));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_blocking_past_deadline_is_timeout() {
        let result = run_with_deadline(Duration::from_millis(20), async {
            std::thread::sleep(Duration::from_millis(60));
            1
        })
        .await;
        assert!(result.unwrap_err().is_timeout());
    }
}
