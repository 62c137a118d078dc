use rand::Rng;
use std::thread::sleep;
use std::time::Duration;
use tracing::warn;

use crate::error::{ClientError, Result};

/// Exponential backoff with jitter, capped at `max_delay`.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            base_delay,
            max_delay,
            jitter: Duration::ZERO,
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// `span` plus a random share of the configured jitter.
    pub fn jittered(&self, span: Duration) -> Duration {
        if self.jitter.is_zero() {
            return span;
        }
        span + Duration::from_millis(rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64))
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff_with_jitter(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.jittered(self.base_delay.saturating_mul(1u32 << shift).min(self.max_delay))
    }

    /// Runs `op` until it succeeds, fails with a non-transient error, or the
    /// attempts are exhausted. The last error is returned.
    pub fn run<T>(&self, label: &str, op: impl FnMut(u32) -> Result<T>) -> Result<T> {
        self.run_while(label, ClientError::is_transient, op)
    }

    /// As [`RetryPolicy::run`], retrying only errors accepted by `retryable`.
    pub fn run_while<T>(
        &self,
        label: &str,
        retryable: impl Fn(&ClientError) -> bool,
        mut op: impl FnMut(u32) -> Result<T>,
    ) -> Result<T> {
        let mut attempt = 0;
        loop {
            match op(attempt) {
                Ok(v) => return Ok(v),
                Err(e) if retryable(&e) && attempt + 1 < self.attempts => {
                    attempt += 1;
                    let delay = self.backoff_with_jitter(attempt);
                    warn!(label, attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying");
                    sleep(delay);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Collapses the attempts of a failed connection into one error.
pub(crate) fn exhausted(target: &str, attempts: u32, last: &ClientError) -> ClientError {
    ClientError::Connection {
        target: target.to_string(),
        attempts,
        reason: last.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100), Duration::from_millis(500));
        assert_eq!(policy.backoff_with_jitter(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_with_jitter(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_with_jitter(3), Duration::from_millis(400));
        assert_eq!(policy.backoff_with_jitter(4), Duration::from_millis(500));
        assert_eq!(policy.backoff_with_jitter(40), Duration::from_millis(500));
    }

    #[test]
    fn jitter_within_bounds() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(1))
            .with_jitter(Duration::from_millis(50));
        for _ in 0..20 {
            let d = policy.backoff_with_jitter(1);
            assert!(d >= Duration::from_millis(100));
            assert!(d <= Duration::from_millis(150));
        }
    }

    #[test]
    fn zero_jitter_keeps_span() {
        let policy = RetryPolicy::new(1, Duration::ZERO, Duration::ZERO);
        assert_eq!(policy.jittered(Duration::from_millis(70)), Duration::from_millis(70));
    }

    #[test]
    fn retries_transient_until_success() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1), Duration::from_millis(2));
        let calls = Cell::new(0);
        let out = policy.run("t", |_| {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(ClientError::query("M", "N", "flaky"))
            } else {
                Ok(42)
            }
        });
        assert_eq!(out.unwrap(), 42);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn validation_errors_are_not_retried() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1), Duration::from_millis(2));
        let calls = Cell::new(0);
        let out: Result<()> = policy.run("t", |_| {
            calls.set(calls.get() + 1);
            Err(ClientError::UnknownPartition("x".into()))
        });
        assert!(out.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn predicate_limits_what_is_retried() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1), Duration::from_millis(2));
        let calls = Cell::new(0);
        let out: Result<()> = policy.run_while(
            "t",
            |e| !matches!(e, ClientError::Connection { .. }),
            |_| {
                calls.set(calls.get() + 1);
                Err(exhausted("http://n", 3, &ClientError::query("M", "N", "refused")))
            },
        );
        assert!(matches!(out, Err(ClientError::Connection { .. })));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn gives_up_after_attempts() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(1));
        let calls = Cell::new(0);
        let out: Result<()> = policy.run("t", |_| {
            calls.set(calls.get() + 1);
            Err(ClientError::query("M", "N", "down"))
        });
        assert!(out.is_err());
        assert_eq!(calls.get(), 3);
    }
}
