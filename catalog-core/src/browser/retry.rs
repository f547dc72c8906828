use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::RetrySection;

/// Exponential backoff around a fallible async operation.
///
/// Attempt `n` (1-based) that fails is followed by a wait of
/// `min(base * 2^(n-1), max)` before attempt `n + 1`. There is no jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    task: String,
    retries: u32,
    base_delay: Duration,
    max_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct RetryOutcome<T> {
    pub result: T,
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemediationAction {
    RetryScheduled { delay_ms: u64 },
    Abort,
}

impl RemediationAction {
    pub fn label(&self) -> &'static str {
        match self {
            RemediationAction::RetryScheduled { .. } => "retry",
            RemediationAction::Abort => "abort",
        }
    }
}

/// Passed to the failure observer after every failed attempt.
#[derive(Debug)]
pub struct AttemptFailure<'a, E> {
    pub task: &'a str,
    pub attempt: u32,
    pub error: &'a E,
    pub action: RemediationAction,
}

impl RetryPolicy {
    pub fn new(task: impl Into<String>, config: &RetrySection) -> Self {
        Self::with_delays(
            task,
            config.retries,
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
    }

    pub fn with_delays(
        task: impl Into<String>,
        retries: u32,
        base_delay: Duration,
        max_delay: Duration,
    ) -> Self {
        Self {
            task: task.into(),
            retries,
            base_delay,
            max_delay,
        }
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// Wait that follows failed attempt `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub async fn run<F, Fut, T, E>(&self, operation: F) -> Result<RetryOutcome<T>, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.run_observed(operation, |_| {}).await
    }

    /// Like [`RetryPolicy::run`], reporting each failed attempt to `observer`.
    ///
    /// The error of the final attempt is returned unchanged.
    pub async fn run_observed<F, Fut, T, E, O>(
        &self,
        mut operation: F,
        mut observer: O,
    ) -> Result<RetryOutcome<T>, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
        O: FnMut(AttemptFailure<'_, E>),
    {
        let max_attempts = self.max_attempts();
        let mut attempt = 1u32;
        loop {
            match operation(attempt).await {
                Ok(result) => {
                    if attempt > 1 {
                        info!(task = %self.task, attempt, "operation succeeded after retry");
                    }
                    return Ok(RetryOutcome {
                        result,
                        attempts: attempt,
                    });
                }
                Err(error) => {
                    let action = if attempt >= max_attempts {
                        RemediationAction::Abort
                    } else {
                        RemediationAction::RetryScheduled {
                            delay_ms: self.delay_for_attempt(attempt).as_millis() as u64,
                        }
                    };
                    warn!(
                        task = %self.task,
                        attempt,
                        max_attempts,
                        action = action.label(),
                        error = %error,
                        "attempt failed"
                    );
                    observer(AttemptFailure {
                        task: &self.task,
                        attempt,
                        error: &error,
                        action,
                    });
                    match action {
                        RemediationAction::Abort => return Err(error),
                        RemediationAction::RetryScheduled { delay_ms } => {
                            if delay_ms > 0 {
                                sleep(Duration::from_millis(delay_ms)).await;
                            }
                        }
                    }
                    attempt += 1;
                }
            }
        }
    }
}

/// Runs `operation` under `policy`, returning only its value.
pub async fn with_retry<F, Fut, T, E>(policy: &RetryPolicy, operation: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    policy.run(operation).await.map(|outcome| outcome.result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::error::BrowserError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn policy(retries: u32, base_ms: u64, max_ms: u64) -> RetryPolicy {
        RetryPolicy::with_delays(
            "test",
            retries,
            Duration::from_millis(base_ms),
            Duration::from_millis(max_ms),
        )
    }

    #[test]
    fn delays_double_and_cap() {
        let policy = policy(5, 100, 350);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
        assert_eq!(policy.max_attempts(), 6);
    }

    #[test]
    fn builds_from_config_section() {
        let section = RetrySection {
            retries: 2,
            base_delay_ms: 2000,
            max_delay_ms: 10000,
        };
        let policy = RetryPolicy::new("login", &section);
        assert_eq!(policy.task(), "login");
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(4000));
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_operation_runs_retries_plus_one_times() {
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();
        let counter = Arc::clone(&calls);

        let result: Result<(), BrowserError> = with_retry(&policy(2, 100, 1000), |attempt| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(BrowserError::ExportStatus {
                    status: 500 + attempt as u16,
                })
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(BrowserError::ExportStatus { status }) => assert_eq!(status, 503),
            other => panic!("expected last error, got {other:?}"),
        }
        // 100ms after the first failure plus 200ms after the second.
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn success_on_first_attempt_does_not_wait() {
        let started = Instant::now();
        let outcome = policy(3, 1000, 5000)
            .run(|_| async { Ok::<_, BrowserError>(7) })
            .await
            .unwrap();
        assert_eq!(outcome.result, 7);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn fails_once_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let value = with_retry(&policy(2, 100, 1000), |attempt| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if attempt == 1 {
                    Err(BrowserError::Fetch("connection reset".into()))
                } else {
                    Ok("id,name\n")
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, "id,name\n");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn observer_sees_each_failure_with_remediation() {
        let mut seen = Vec::new();
        let outcome = policy(2, 50, 1000)
            .run_observed(
                |attempt| async move {
                    if attempt < 3 {
                        Err(BrowserError::Timeout(format!("attempt {attempt}")))
                    } else {
                        Ok(attempt)
                    }
                },
                |failure| seen.push((failure.attempt, failure.action)),
            )
            .await
            .unwrap();
        assert_eq!(outcome.attempts, 3);
        assert_eq!(
            seen,
            vec![
                (1, RemediationAction::RetryScheduled { delay_ms: 50 }),
                (2, RemediationAction::RetryScheduled { delay_ms: 100 }),
            ]
        );
    }

    #[tokio::test]
    async fn zero_retries_aborts_after_one_attempt() {
        let mut actions = Vec::new();
        let result = policy(0, 10, 10)
            .run_observed(
                |_| async { Err::<(), _>(BrowserError::LoginFailed { url: "x".into() }) },
                |failure| actions.push(failure.action),
            )
            .await;
        assert!(result.is_err());
        assert_eq!(actions, vec![RemediationAction::Abort]);
    }
}
