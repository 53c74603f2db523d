//! Bounded polling with exponential backoff and an absolute deadline.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::RetryPolicy;

/// Outcome of one poll attempt.
pub enum Attempt<T> {
    Ready(T),
    /// Not there yet; poll again after the backoff.
    Pending,
    /// Stop polling without a result.
    Abort,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RetryOutcome<T> {
    Ready(T),
    TimedOut { attempts: u32 },
    Aborted,
}

/// Backoff before attempt `attempt + 1`: `initial * 2^attempt`, capped.
pub fn backoff_for(policy: &RetryPolicy, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
    policy
        .initial_backoff()
        .saturating_mul(factor)
        .min(policy.max_backoff())
}

/// Call `poll` until it yields, aborts, runs out of attempts, or the deadline passes.
pub async fn poll_with_backoff<T, F, Fut>(policy: &RetryPolicy, mut poll: F) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Attempt<T>>,
{
    let deadline = Instant::now() + policy.deadline();
    let max_attempts = policy.max_attempts.max(1);
    let mut attempts = 0u32;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return RetryOutcome::TimedOut { attempts };
        }
        let result = tokio::time::timeout(remaining, poll(attempts)).await;
        attempts += 1;
        match result {
            Ok(Attempt::Ready(value)) => return RetryOutcome::Ready(value),
            Ok(Attempt::Abort) => return RetryOutcome::Aborted,
            Ok(Attempt::Pending) => {}
            Err(_) => return RetryOutcome::TimedOut { attempts },
        }
        if attempts >= max_attempts {
            return RetryOutcome::TimedOut { attempts };
        }

        let pause = backoff_for(policy, attempts - 1);
        let remaining = deadline.saturating_duration_since(Instant::now());
        if pause >= remaining {
            return RetryOutcome::TimedOut { attempts };
        }
        tokio::time::sleep(pause).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32, deadline_secs: u64) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff_ms: 10,
            max_backoff_ms: 40,
            deadline_secs,
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = policy(10, 10);
        assert_eq!(backoff_for(&p, 0), Duration::from_millis(10));
        assert_eq!(backoff_for(&p, 1), Duration::from_millis(20));
        assert_eq!(backoff_for(&p, 2), Duration::from_millis(40));
        assert_eq!(backoff_for(&p, 30), Duration::from_millis(40));
    }

    #[tokio::test(start_paused = true)]
    async fn ready_after_pending_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let outcome = poll_with_backoff(&policy(10, 10), |_| {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 3 {
                    Attempt::Pending
                } else {
                    Attempt::Ready("10.0.0.5:8443")
                }
            }
        })
        .await;
        assert_eq!(outcome, RetryOutcome::Ready("10.0.0.5:8443"));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let outcome: RetryOutcome<()> =
            poll_with_backoff(&policy(3, 60), |_| async { Attempt::Pending }).await;
        assert_eq!(outcome, RetryOutcome::TimedOut { attempts: 3 });
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_bounds_slow_polls() {
        let outcome: RetryOutcome<()> = poll_with_backoff(&policy(100, 1), |_| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Attempt::Ready(())
        })
        .await;
        assert_eq!(outcome, RetryOutcome::TimedOut { attempts: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn abort_stops_immediately() {
        let outcome: RetryOutcome<()> =
            poll_with_backoff(&policy(10, 10), |_| async { Attempt::Abort }).await;
        assert_eq!(outcome, RetryOutcome::Aborted);
    }
}
