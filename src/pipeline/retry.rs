//! Bounded-attempt retry driver with cancellable backoff.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

use crate::error::{Error, Result};
use crate::telemetry::Telemetry;

/// Retry budget: attempt count and backoff shape.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub ceiling: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub const fn new(max_attempts: u32, initial_delay: Duration, ceiling: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            ceiling,
        }
    }
}

/// Absolute cancellation point for one pipeline run, fixed at identity
/// creation and carried by value through every suspension.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    /// A deadline `timeout` from now.
    #[must_use]
    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now() + timeout,
        }
    }

    #[must_use]
    pub fn expired(&self) -> bool {
        Instant::now() >= self.at
    }

    /// Sleep for `duration`, waking early with [`Error::Cancelled`] when
    /// the deadline fires first.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        tokio::select! {
            () = tokio::time::sleep(duration) => Ok(()),
            () = tokio::time::sleep_until(self.at) => Err(Error::Cancelled),
        }
    }
}

/// Run `op` up to `policy.max_attempts` times.
///
/// On failure, sleeps the current delay and doubles it up to the ceiling;
/// no sleep follows the last failure. A deadline firing during a sleep
/// returns [`Error::Cancelled`] without consuming remaining attempts, and
/// a cancelled attempt is never retried. Each failed attempt warns
/// telemetry; exhaustion reports the final error.
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    deadline: Deadline,
    telemetry: &Telemetry,
    what: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = policy.initial_delay;
    let mut last_error = String::new();

    for attempt in 1..=policy.max_attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(err) => {
                warn!(attempt, what, delay = ?delay, error = %err, "attempt failed");
                telemetry.warning(format!("retry attempt {attempt} for {what} failed: {err}"));
                last_error = err.to_string();

                // Skip the sleep after the final attempt.
                if attempt < policy.max_attempts {
                    deadline.sleep(delay).await?;
                    delay = (delay * 2).min(policy.ceiling);
                }
            }
        }
    }

    let err = Error::RetriesExhausted {
        attempts: policy.max_attempts,
        last: last_error,
    };
    telemetry.error(err.to_string());
    Err(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_secs(10), Duration::from_secs(30))
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_without_sleeping() {
        let start = Instant::now();
        let result = retry(
            &policy(),
            Deadline::after(Duration::from_secs(3600)),
            &Telemetry::disabled(),
            "noop",
            || async { Ok::<_, Error>(7) },
        )
        .await
        .unwrap();
        assert_eq!(result, 7);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn sleeps_only_between_attempts_and_doubles() {
        let attempts = AtomicU32::new(0);
        let start = Instant::now();

        let result: Result<()> = retry(
            &policy(),
            Deadline::after(Duration::from_secs(3600)),
            &Telemetry::disabled(),
            "always-failing",
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::Decode("nope".to_string())) }
            },
        )
        .await;

        // Three attempts, sleeps of 10s and 20s, none after the last.
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(30));
        let err = result.unwrap_err();
        assert!(err.to_string().contains("after 3 attempts"));
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_before_budget_is_spent() {
        let attempts = AtomicU32::new(0);
        let start = Instant::now();

        let result = retry(
            &policy(),
            Deadline::after(Duration::from_secs(3600)),
            &Telemetry::disabled(),
            "flaky",
            || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 1 {
                        Err(Error::Decode("transient".to_string()))
                    } else {
                        Ok(n)
                    }
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(result, 1);
        // One failure, one sleep of the initial delay.
        assert_eq!(start.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_is_capped_by_the_ceiling() {
        let wide = RetryPolicy::new(5, Duration::from_secs(10), Duration::from_secs(30));
        let start = Instant::now();

        let result: Result<()> = retry(
            &wide,
            Deadline::after(Duration::from_secs(3600)),
            &Telemetry::disabled(),
            "always-failing",
            || async { Err(Error::Decode("nope".to_string())) },
        )
        .await;

        assert!(result.is_err());
        // Sleeps: 10 + 20 + 30 + 30 (capped).
        assert_eq!(start.elapsed(), Duration::from_secs(90));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_interrupts_the_backoff_sleep() {
        let attempts = AtomicU32::new(0);

        let result: Result<()> = retry(
            &policy(),
            Deadline::after(Duration::from_secs(5)),
            &Telemetry::disabled(),
            "always-failing",
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::Decode("nope".to_string())) }
            },
        )
        .await;

        // The first 10s sleep crosses the 5s deadline: one attempt only.
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_is_not_retried() {
        let attempts = AtomicU32::new(0);

        let result: Result<()> = retry(
            &policy(),
            Deadline::after(Duration::from_secs(3600)),
            &Telemetry::disabled(),
            "cancelled-inside",
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::Cancelled) }
            },
        )
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
