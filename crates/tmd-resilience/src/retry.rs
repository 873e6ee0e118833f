//! ---
//! tmd_section: "07-resilience-fault-tolerance"
//! tmd_subsection: "module"
//! tmd_type: "source"
//! tmd_scope: "code"
//! tmd_description: "Retry-with-backoff shared by step retry and auto-recovery."
//! tmd_version: "v0.1.0"
//! tmd_owner: "tbd"
//! ---
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tmd_common::config::RetryConfig;
use tmd_common::time::Clock;

/// Policy parameters controlling attempts and exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay applied after the first failed attempt.
    pub base_delay: Duration,
    /// Growth factor applied per additional failure.
    pub multiplier: f64,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Maximum random jitter added to each delay.
    pub jitter: Duration,
}

impl RetryPolicy {
    /// Construct a policy without jitter or delay cap.
    pub fn new(max_attempts: u32, base_delay: Duration, multiplier: f64) -> Self {
        Self {
            max_attempts,
            base_delay,
            multiplier,
            max_delay: Duration::MAX,
            jitter: Duration::ZERO,
        }
    }

    /// A policy that makes a single attempt.
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO, 1.0)
    }

    /// Copy of this policy with a different attempt budget.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Cap every delay at `max_delay`.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Add up to `jitter` of random delay.
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay to wait after failed attempt number `attempt` (1-indexed):
    /// `base_delay * multiplier^(attempt-1)`, capped at `max_delay`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let factor = self.multiplier.powi(exponent);
        let nanos = (self.base_delay.as_nanos() as f64 * factor).round();
        if !nanos.is_finite() || nanos >= self.max_delay.as_nanos() as f64 || nanos >= u64::MAX as f64
        {
            self.max_delay
        } else {
            Duration::from_nanos(nanos as u64)
        }
    }

    fn jittered_delay<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.backoff_delay(attempt);
        if self.jitter.is_zero() {
            base
        } else {
            let jitter_ms = rng.gen_range(0..=self.jitter.as_millis().max(1)) as u64;
            base.saturating_add(Duration::from_millis(jitter_ms))
        }
    }
}

impl From<RetryConfig> for RetryPolicy {
    fn from(config: RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: config.base_delay,
            multiplier: config.multiplier,
            max_delay: config.max_delay,
            jitter: config.jitter,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500), 2.0).with_max_delay(Duration::from_secs(10))
    }
}

/// Result of [`retry_with_backoff`].
#[derive(Debug)]
pub struct RetryReport<T, E> {
    /// Final outcome: the first success or the last failure.
    pub result: Result<T, E>,
    /// Attempts actually performed.
    pub attempts: u32,
    /// Delays slept between attempts, in order.
    pub delays: Vec<Duration>,
}

impl<T, E> RetryReport<T, E> {
    /// Number of retries performed after the first attempt.
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Run `operation` until it succeeds or the policy's attempt budget is spent,
/// sleeping on `clock` between attempts. The closure receives the 1-indexed attempt.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    clock: &dyn Clock,
    mut operation: F,
) -> RetryReport<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut delays = Vec::new();
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => {
                return RetryReport {
                    result: Ok(value),
                    attempts: attempt,
                    delays,
                }
            }
            Err(err) if attempt >= max_attempts => {
                return RetryReport {
                    result: Err(err),
                    attempts: attempt,
                    delays,
                }
            }
            Err(_) => {
                let delay = policy.jittered_delay(attempt, &mut rand::thread_rng());
                delays.push(delay);
                clock.sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use tmd_common::time::ManualClock;

    use super::*;

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), 2.0)
            .with_max_delay(Duration::from_millis(500));
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(400));
        assert_eq!(policy.backoff_delay(4), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn retries_until_success() {
        let clock = ManualClock::default();
        let policy = RetryPolicy::new(4, Duration::from_millis(10), 3.0);
        let calls = AtomicU32::new(0);
        let report = retry_with_backoff(&policy, &clock, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err("not yet")
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(report.result, Ok(3));
        assert_eq!(report.attempts, 3);
        assert_eq!(report.retries(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            clock.recorded_sleeps(),
            vec![Duration::from_millis(10), Duration::from_millis(30)]
        );
    }

    #[tokio::test]
    async fn exhaustion_returns_last_error_without_trailing_sleep() {
        let clock = ManualClock::default();
        let policy = RetryPolicy::new(2, Duration::from_millis(5), 2.0);
        let report: RetryReport<(), String> =
            retry_with_backoff(&policy, &clock, |attempt| async move {
                Err(format!("failure {attempt}"))
            })
            .await;
        assert_eq!(report.result, Err("failure 2".to_string()));
        assert_eq!(report.attempts, 2);
        assert_eq!(report.delays, vec![Duration::from_millis(5)]);
        assert_eq!(clock.recorded_sleeps().len(), 1);
    }

    #[test]
    fn converts_from_config() {
        let policy = RetryPolicy::from(RetryConfig {
            max_attempts: 2,
            base_delay: Duration::from_secs(1),
            multiplier: 1.5,
            max_delay: Duration::from_secs(4),
            jitter: Duration::ZERO,
        });
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(1_500));
    }
}
