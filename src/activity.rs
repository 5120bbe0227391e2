// Retrying activity layer.
//
// Wraps a single unit of work (repository op, identity lookup, provider
// HTTP call) with bounded attempts and exponential backoff. Only failures
// classified as transient are retried; permanent failures propagate
// immediately. Every wrapped write must be keyed by correlation id so a
// retried timed-out-but-applied attempt does not duplicate effects.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, warn};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
    /// Bound on a single attempt; elapsed attempts count as transient
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: true,
            attempt_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl RetryConfig {
    /// Tight bounds for tests
    pub fn fast(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            jitter: false,
            attempt_timeout: Some(Duration::from_secs(5)),
        }
    }
}

/// Failure classification driving the retry decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Network timeout, 5xx, throttling: retried up to the bound
    Transient,
    /// Validation, 4xx other than throttling, not-found: never retried
    Permanent,
}

/// Failure reported by a wrapped operation, already classified
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ActivityFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl ActivityFailure {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Permanent,
            message: message.into(),
        }
    }

    /// Classify an HTTP status the way provider endpoints report failure:
    /// 5xx and throttling are transient, every other 4xx is permanent.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let kind = if status >= 500 || status == 429 {
            FailureKind::Transient
        } else {
            FailureKind::Permanent
        };
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for ActivityFailure {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return ActivityFailure::from_status(status.as_u16(), err.to_string());
        }
        // Connect/timeout/body errors without a status are network issues
        ActivityFailure::transient(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ActivityError {
    #[error("activity '{activity}' exhausted {attempts} attempts: {message}")]
    TransientExhausted {
        activity: String,
        attempts: u32,
        message: String,
    },

    #[error("activity '{activity}' failed permanently: {message}")]
    Permanent { activity: String, message: String },
}

impl ActivityError {
    pub fn message(&self) -> &str {
        match self {
            ActivityError::TransientExhausted { message, .. } => message,
            ActivityError::Permanent { message, .. } => message,
        }
    }
}

/// Successful outcome plus the number of attempts it took
#[derive(Debug, Clone)]
pub struct ActivityOutcome<T> {
    pub value: T,
    pub attempts: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ActivityRunner {
    config: RetryConfig,
}

impl ActivityRunner {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Execute one activity with bounded retry. The closure receives the
    /// 1-based attempt number so callers can key side effects.
    pub async fn run<T, F, Fut>(
        &self,
        activity: &str,
        mut op: F,
    ) -> Result<ActivityOutcome<T>, ActivityError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ActivityFailure>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut last_message = String::new();

        for attempt in 1..=max_attempts {
            let result = match self.config.attempt_timeout {
                Some(bound) => match tokio::time::timeout(bound, op(attempt)).await {
                    Ok(result) => result,
                    Err(_) => Err(ActivityFailure::transient(format!(
                        "attempt timed out after {}ms",
                        bound.as_millis()
                    ))),
                },
                None => op(attempt).await,
            };

            match result {
                Ok(value) => {
                    debug!(activity, attempt, "activity succeeded");
                    return Ok(ActivityOutcome { value, attempts: attempt });
                }
                Err(failure) if failure.kind == FailureKind::Permanent => {
                    error!(activity, attempt, error = %failure, "activity failed permanently");
                    return Err(ActivityError::Permanent {
                        activity: activity.to_string(),
                        message: failure.message,
                    });
                }
                Err(failure) => {
                    warn!(activity, attempt, error = %failure, "transient activity failure");
                    last_message = failure.message;
                    if attempt < max_attempts {
                        tokio::time::sleep(self.backoff_delay(attempt)).await;
                    }
                }
            }
        }

        error!(activity, attempts = max_attempts, "activity retries exhausted");
        Err(ActivityError::TransientExhausted {
            activity: activity.to_string(),
            attempts: max_attempts,
            message: last_message,
        })
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self.config.base_delay.as_millis() as u64;
        let delay = base.saturating_mul(1u64 << exp);
        let capped = delay.min(self.config.max_delay.as_millis() as u64);
        let millis = if self.config.jitter {
            let factor: f64 = rand::rng().random_range(0.5..1.5);
            ((capped as f64) * factor) as u64
        } else {
            capped
        };
        Duration::from_millis(millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let runner = ActivityRunner::new(RetryConfig::fast(4));
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let outcome = runner
            .run("flaky", |_| {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(ActivityFailure::transient("connection reset"))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(outcome.value, "done");
        assert_eq!(outcome.attempts, 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_bound_k_plus_one() {
        // Fails transiently k times; with max k+1 attempts the last one
        // succeeds and exactly k+1 attempts are recorded.
        let k = 3;
        let runner = ActivityRunner::new(RetryConfig::fast(k + 1));
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let outcome = runner
            .run("bounded", |_| {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n < k {
                        Err(ActivityFailure::transient("throttled"))
                    } else {
                        Ok(())
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(outcome.attempts, k + 1);
    }

    #[tokio::test]
    async fn exhaustion_surfaces_as_transient_exhausted() {
        let runner = ActivityRunner::new(RetryConfig::fast(2));
        let result: Result<ActivityOutcome<()>, _> = runner
            .run("always-down", |_| async {
                Err(ActivityFailure::transient("gateway timeout"))
            })
            .await;

        match result {
            Err(ActivityError::TransientExhausted { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let runner = ActivityRunner::new(RetryConfig::fast(5));
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result: Result<ActivityOutcome<()>, _> = runner
            .run("invalid", |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(ActivityFailure::permanent("validation rejected"))
                }
            })
            .await;

        assert!(matches!(result, Err(ActivityError::Permanent { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn status_classification() {
        assert_eq!(ActivityFailure::from_status(503, "").kind, FailureKind::Transient);
        assert_eq!(ActivityFailure::from_status(429, "").kind, FailureKind::Transient);
        assert_eq!(ActivityFailure::from_status(404, "").kind, FailureKind::Permanent);
        assert_eq!(ActivityFailure::from_status(400, "").kind, FailureKind::Permanent);
    }
}
