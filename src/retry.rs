//! Deadline-bounded retry for external calls.
//!
//! Every external call gets a hard per-call deadline; inside it, transient
//! failures (throttling, brief unavailability) are retried with jittered
//! exponential backoff. Exhausting the deadline or the attempt budget
//! surfaces the last error to the caller, which omits the affected language
//! and moves on.

use crate::error::{PipelineError, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Base delay before the first retry.
const BASE_DELAY: Duration = Duration::from_millis(100);
/// Ceiling on a single backoff delay.
const MAX_DELAY: Duration = Duration::from_secs(2);

/// Backoff delay for the given zero-based attempt, with ±25 % jitter.
#[must_use]
pub fn backoff_delay(attempt: u32) -> Duration {
    let exp = BASE_DELAY.saturating_mul(1 << attempt.min(16)).min(MAX_DELAY);
    let jitter: f64 = rand::thread_rng().gen_range(-0.25..=0.25);
    exp.mul_f64((1.0 + jitter).max(0.0))
}

/// Run `op` under `deadline`, retrying transient errors up to
/// `max_attempts` total tries.
///
/// # Errors
///
/// Returns [`PipelineError::Deadline`] when the budget is exhausted, or the
/// operation's last error.
pub async fn with_deadline<T, F, Fut>(
    deadline: Duration,
    max_attempts: u32,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = max_attempts.max(1);
    let run = async {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt + 1 < attempts => {
                    let delay = backoff_delay(attempt);
                    tracing::debug!(attempt, ?delay, "transient failure, backing off: {e}");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    };

    match tokio::time::timeout(deadline, run).await {
        Ok(result) => result,
        Err(_) => Err(PipelineError::Deadline(deadline)),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn backoff_grows_and_caps() {
        for _ in 0..20 {
            assert!(backoff_delay(0) <= Duration::from_millis(125));
            assert!(backoff_delay(10) <= Duration::from_millis(2500));
        }
    }

    #[tokio::test]
    async fn success_passes_through() {
        let result: Result<u32> =
            with_deadline(Duration::from_secs(1), 3, || async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counted = Arc::clone(&calls);
        let result: Result<&str> = with_deadline(Duration::from_secs(5), 3, move || {
            let calls = Arc::clone(&counted);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(PipelineError::Translate("throttled".to_owned()))
                } else {
                    Ok("done")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn terminal_errors_fail_fast() {
        let calls = Arc::new(AtomicU32::new(0));
        let counted = Arc::clone(&calls);
        let result: Result<()> = with_deadline(Duration::from_secs(5), 3, move || {
            let calls = Arc::clone(&counted);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(PipelineError::Translate("unsupported language".to_owned()))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn attempt_budget_is_respected() {
        let calls = Arc::new(AtomicU32::new(0));
        let counted = Arc::clone(&calls);
        let result: Result<()> = with_deadline(Duration::from_secs(30), 3, move || {
            let calls = Arc::clone(&counted);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(PipelineError::Translate("throttled".to_owned()))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_cuts_off_slow_calls() {
        let result: Result<()> = with_deadline(Duration::from_millis(100), 3, || async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(PipelineError::Deadline(_))));
    }
}
