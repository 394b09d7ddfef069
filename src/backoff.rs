//! Exponential backoff with jitter, decoupled from any particular client.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::ConfigError;

/// Retry budget and delay curve for transient failures.
///
/// After the `n`th failed attempt the caller sleeps
/// `min(max_delay, base_delay * growth^n)` plus a uniform jitter in
/// `[0, jitter]`. `max_attempts` counts every attempt, including the first.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    growth: f64,
    max_delay: Duration,
    jitter: Duration,
}

impl RetryPolicy {
    /// Builds a policy, rejecting curves that never terminate or shrink.
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        growth: f64,
        max_delay: Duration,
        jitter: Duration,
    ) -> Result<Self, ConfigError> {
        if max_attempts == 0 {
            return Err(ConfigError::NotPositive {
                name: "max_attempts",
            });
        }
        if !(growth >= 1.0) {
            return Err(ConfigError::GrowthTooSmall(growth));
        }
        Ok(Self {
            max_attempts,
            base_delay,
            growth,
            max_delay,
            jitter,
        })
    }

    /// Policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Total attempts allowed per operation.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Upper bound on the random jitter added to each delay.
    pub fn jitter(&self) -> Duration {
        self.jitter
    }

    /// Deterministic part of the delay after `failed_attempts` failures.
    pub fn backoff(&self, failed_attempts: u32) -> Duration {
        let exponent = i32::try_from(failed_attempts).unwrap_or(i32::MAX);
        let millis = self.base_delay.as_millis() as f64 * self.growth.powi(exponent);
        if !millis.is_finite() || millis >= self.max_delay.as_millis() as f64 {
            return self.max_delay;
        }
        Duration::from_micros((millis * 1000.0).round() as u64)
    }

    /// Backoff plus a uniformly drawn jitter.
    pub fn delay_with_jitter<R: Rng + ?Sized>(&self, failed_attempts: u32, rng: &mut R) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rng.gen_range(0..=jitter_ms))
        };
        self.backoff(failed_attempts) + jitter
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_millis(250),
            growth: 1.8,
            max_delay: Duration::from_secs(60),
            jitter: Duration::from_millis(300),
        }
    }
}

/// Result of [`retry_with_backoff`] together with how many attempts it took.
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
}

/// Runs `op` until it succeeds, fails with a non-transient error, or the
/// policy's attempt budget is spent.
///
/// `op` receives the 1-based attempt number. `on_retry` is invoked before each
/// sleep with the failed attempt number, the error and the chosen delay.
pub async fn retry_with_backoff<T, E, Op, Fut, P, N>(
    policy: &RetryPolicy,
    mut op: Op,
    is_transient: P,
    mut on_retry: N,
) -> RetryOutcome<T, E>
where
    Op: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    N: FnMut(u32, &E, Duration),
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op(attempt).await {
            Ok(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt,
                }
            }
            Err(err) if is_transient(&err) && attempt < policy.max_attempts => {
                let delay = policy.delay_with_jitter(attempt, &mut rand::thread_rng());
                on_retry(attempt, &err, delay);
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                return RetryOutcome {
                    result: Err(err),
                    attempts: attempt,
                }
            }
        }
    }
}
