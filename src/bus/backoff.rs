//! Retry and pacing policy for bus operations.
//!
//! The bus rate-limits roughly 100 requests per minute per agent, stricter
//! for bursts. Two mechanisms keep the kernel under that ceiling: a retry
//! policy with exponential backoff and jitter for failed calls, and a pacer
//! that spaces out iterating operations such as the backlog drain.

use super::BusError;
use chrono::Utc;
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Minimum spacing between retried calls on one agent channel.
pub const RETRY_FLOOR: Duration = Duration::from_millis(700);

/// Requests per minute the pacer allows for iterating operations. Kept
/// under the bus's own ceiling so bursts elsewhere do not tip it over.
pub const SAFE_REQUESTS_PER_MINUTE: u32 = 85;

/// Exponential backoff with jitter for transient bus failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts before a transient error is surfaced as fatal.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles each attempt.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: RETRY_FLOOR,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (zero-based), honouring a
    /// server-provided `retry_after` hint when it is longer than the
    /// computed backoff. Never under [`RETRY_FLOOR`].
    #[must_use]
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(1u32 << attempt.min(16))
            .min(self.max_delay);
        let base = match retry_after {
            Some(hint) => hint.max(exp),
            None => exp,
        };
        jitter(base).max(RETRY_FLOOR)
    }

    /// Runs `operation`, retrying transient failures until they succeed or
    /// the attempt budget runs out, at which point the last transient error
    /// is surfaced as fatal. Fatal errors short-circuit immediately.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Fatal`] on a fatal failure or after exhausting
    /// all attempts.
    pub async fn run<T, F, Fut>(&self, what: &str, mut operation: F) -> Result<T, BusError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BusError>>,
    {
        let mut attempt = 0u32;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(BusError::Transient {
                    reason,
                    retry_after,
                }) => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        warn!(what, attempts = attempt, "retries exhausted");
                        return Err(BusError::Fatal {
                            reason: format!("{what} failed after {attempt} attempts: {reason}"),
                        });
                    }
                    let delay = self.delay_for(attempt - 1, retry_after);
                    debug!(what, attempt, delay_ms = delay.as_millis() as u64, %reason, "retrying after transient failure");
                    tokio::time::sleep(delay).await;
                }
                Err(fatal @ BusError::Fatal { .. }) => return Err(fatal),
            }
        }
    }
}

/// Deterministic-enough jitter: up to +25%, seeded from the clock's
/// sub-millisecond noise. Enough to de-synchronise a fleet without
/// pulling in a random number generator.
fn jitter(d: Duration) -> Duration {
    let nanos = u64::try_from(Utc::now().timestamp_subsec_nanos()).unwrap_or(0);
    let fraction = f64::from(u32::try_from(nanos % 1000).unwrap_or(0)) / 1000.0;
    d + d.mul_f64(0.25 * fraction)
}

/// Spaces calls on one agent channel to a fixed request rate.
#[derive(Debug)]
pub struct Pacer {
    min_interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl Pacer {
    /// A pacer allowing `per_minute` calls per minute.
    #[must_use]
    pub fn new(per_minute: u32) -> Self {
        Self {
            min_interval: Duration::from_secs(60) / per_minute.max(1),
            last_call: Mutex::new(None),
        }
    }

    /// A pacer at the bus-safe rate of [`SAFE_REQUESTS_PER_MINUTE`].
    #[must_use]
    pub fn bus_safe() -> Self {
        Self::new(SAFE_REQUESTS_PER_MINUTE)
    }

    /// Waits until the next call is allowed, then records it.
    pub async fn pace(&self) {
        let mut last = self.last_call.lock().await;
        let now = Instant::now();
        if let Some(prev) = *last {
            let elapsed = now.duration_since(prev);
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_never_drops_below_the_floor() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(1),
            ..RetryPolicy::default()
        };
        assert!(policy.delay_for(0, None) >= RETRY_FLOOR);
    }

    #[test]
    fn delay_grows_and_caps() {
        let policy = RetryPolicy::default();
        let early = policy.delay_for(0, None);
        let late = policy.delay_for(10, None);
        assert!(late >= early);
        // 25% jitter on top of the 30s cap at most.
        assert!(late <= Duration::from_millis(37_500));
    }

    #[test]
    fn retry_after_hint_dominates_short_backoff() {
        let policy = RetryPolicy::default();
        let hinted = policy.delay_for(0, Some(Duration::from_secs(10)));
        assert!(hinted >= Duration::from_secs(10));
    }

    #[tokio::test]
    async fn run_retries_transient_then_succeeds() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        };
        let calls = AtomicU32::new(0);
        let result = policy
            .run("test-op", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(BusError::transient("not yet"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn run_surfaces_fatal_after_exhaustion() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        };
        let calls = AtomicU32::new(0);
        let err = policy
            .run("test-op", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(BusError::transient("still down")) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Fatal { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn run_short_circuits_on_fatal() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let err = policy
            .run("test-op", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(BusError::fatal("denied")) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Fatal { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pacer_spaces_consecutive_calls() {
        // 6000/min = one call per 10ms; keeps the test quick.
        let pacer = Pacer::new(6000);
        let start = Instant::now();
        pacer.pace().await;
        pacer.pace().await;
        pacer.pace().await;
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
