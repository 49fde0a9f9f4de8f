use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Attempt budget for a retried task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    /// One attempt, no waiting.
    pub const fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(5))
    }
}

#[derive(Debug)]
pub enum TaskOutcome<T, E> {
    Done(T),
    Retryable(E),
    Fatal(E),
}

/// Drive `task` until it is done, fails fatally, or the attempt budget runs
/// out. The task receives the 1-based attempt number. The last error is
/// returned on exhaustion.
pub async fn run_with_retry<T, E, F, Fut>(name: &str, policy: RetryPolicy, mut task: F) -> Result<T, E>
where
    E: Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = TaskOutcome<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match task(attempt).await {
            TaskOutcome::Done(v) => return Ok(v),
            TaskOutcome::Fatal(e) => {
                tracing::warn!(task = name, attempt, error=%e, "task failed, not retrying");
                return Err(e);
            }
            TaskOutcome::Retryable(e) if attempt >= max_attempts => {
                tracing::warn!(task = name, attempt, error=%e, "task failed, retries exhausted");
                return Err(e);
            }
            TaskOutcome::Retryable(e) => {
                tracing::debug!(
                    task = name,
                    attempt,
                    backoff_ms = policy.backoff.as_millis() as u64,
                    error=%e,
                    "task failed, retrying"
                );
                tokio::time::sleep(policy.backoff).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_done() {
        let calls = AtomicU32::new(0);
        let start = tokio::time::Instant::now();
        let out: Result<u32, String> =
            run_with_retry("t", RetryPolicy::new(5, Duration::from_secs(2)), |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        TaskOutcome::Retryable("flaky".to_string())
                    } else {
                        TaskOutcome::Done(attempt)
                    }
                }
            })
            .await;

        assert_eq!(out, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_stops_immediately() {
        let calls = AtomicU32::new(0);
        let out: Result<(), String> = run_with_retry("t", RetryPolicy::default(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { TaskOutcome::Fatal("bad credential".to_string()) }
        })
        .await;

        assert_eq!(out, Err("bad credential".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_error() {
        let out: Result<(), String> =
            run_with_retry("t", RetryPolicy::new(3, Duration::from_millis(10)), |attempt| async move {
                TaskOutcome::Retryable(format!("attempt {attempt}"))
            })
            .await;
        assert_eq!(out, Err("attempt 3".to_string()));
    }
}
