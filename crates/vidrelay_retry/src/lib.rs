//! Exponential backoff shared by every component that talks to a remote node.
//!
//! The law is `delay(attempt) = base_delay × multiplier^(attempt − 1)` with
//! 1-based attempt numbers, and an operation is never attempted more than
//! `max_attempts` times.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error, PartialEq)]
pub enum RetryPolicyError {
    #[error("max_attempts must be at least 1")]
    ZeroAttempts,
    #[error("multiplier must be a finite number >= 1, got {0}")]
    InvalidMultiplier(f64),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    multiplier: f64,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        multiplier: f64,
    ) -> Result<Self, RetryPolicyError> {
        if max_attempts == 0 {
            return Err(RetryPolicyError::ZeroAttempts);
        }
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(RetryPolicyError::InvalidMultiplier(multiplier));
        }
        Ok(Self {
            max_attempts,
            base_delay,
            multiplier,
        })
    }

    /// Policy that never retries and never sleeps.
    pub fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    /// Delay to wait after the given (1-based) attempt failed.
    ///
    /// Attempt 0 is treated as attempt 1. Saturates at `Duration::MAX`.
    pub fn compute_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.max(1) - 1;
        let factor = self.multiplier.powi(exponent.min(i32::MAX as u32) as i32);
        Duration::try_from_secs_f64(self.base_delay.as_secs_f64() * factor)
            .unwrap_or(Duration::MAX)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
}

impl<T, E> RetryOutcome<T, E> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Runs `operation` until it succeeds or the policy is exhausted.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    op_name: &str,
    operation: F,
) -> RetryOutcome<T, E>
where
    E: Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    retry_with_backoff_when(policy, op_name, |_| true, operation).await
}

/// Like [`retry_with_backoff`], but stops at the first error for which
/// `is_retryable` returns false.
pub async fn retry_with_backoff_when<T, E, F, Fut, R>(
    policy: &RetryPolicy,
    op_name: &str,
    is_retryable: R,
    mut operation: F,
) -> RetryOutcome<T, E>
where
    E: Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
{
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt,
                }
            }
            Err(error) if is_retryable(&error) && policy.should_retry(attempt) => {
                let delay = policy.compute_delay(attempt);
                warn!(
                    operation = op_name,
                    attempt,
                    max_attempts = policy.max_attempts(),
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "attempt failed, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => {
                warn!(
                    operation = op_name,
                    attempt,
                    max_attempts = policy.max_attempts(),
                    error = %error,
                    "giving up"
                );
                return RetryOutcome {
                    result: Err(error),
                    attempts: attempt,
                };
            }
        }
    }
}
