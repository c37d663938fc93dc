// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Strategies
//!
//! Connection attempts are driven by a `RetryPolicy`, so the connection code
//! only decides whether a failure is transient and the policy decides how
//! often and how long to wait. `FixedRetry` is the default: 5 attempts,
//! 2 seconds apart.

use std::{fmt::Display, future::Future, time::Duration};
use tracing::warn;

/// Default number of connection attempts
pub const DEFAULT_ATTEMPTS: u32 = 5;
/// Default delay between connection attempts
pub const DEFAULT_DELAY: Duration = Duration::from_secs(2);

/// Decides how many attempts are made and how long to wait between them.
pub trait RetryPolicy: Send + Sync + std::fmt::Debug {
    /// Total number of attempts, including the first one. Values below 1
    /// are treated as 1.
    fn max_attempts(&self) -> u32;

    /// Delay after the failed attempt number `attempt` (1-based).
    fn delay(&self, attempt: u32) -> Duration;
}

/// Fixed number of attempts separated by a constant delay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedRetry {
    attempts: u32,
    delay: Duration,
}

impl FixedRetry {
    /// Creates a policy with a constant delay.
    ///
    /// # Parameters
    /// * `attempts` - Total number of tries, including the first
    /// * `delay` - Pause between two tries
    pub fn new(attempts: u32, delay: Duration) -> Self {
        FixedRetry { attempts, delay }
    }

    /// A policy that tries exactly once.
    pub fn once() -> Self {
        FixedRetry::new(1, Duration::ZERO)
    }
}

impl Default for FixedRetry {
    fn default() -> Self {
        FixedRetry::new(DEFAULT_ATTEMPTS, DEFAULT_DELAY)
    }
}

impl RetryPolicy for FixedRetry {
    fn max_attempts(&self) -> u32 {
        self.attempts
    }

    fn delay(&self, _attempt: u32) -> Duration {
        self.delay
    }
}

/// Doubling delay, capped at `max_delay`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExponentialRetry {
    attempts: u32,
    base: Duration,
    max_delay: Duration,
}

impl ExponentialRetry {
    /// Creates a policy whose delay doubles after each try.
    ///
    /// # Parameters
    /// * `attempts` - Total number of tries, including the first
    /// * `base` - Pause after the first failure
    /// * `max_delay` - Upper bound of any single pause
    pub fn new(attempts: u32, base: Duration, max_delay: Duration) -> Self {
        ExponentialRetry {
            attempts,
            base,
            max_delay,
        }
    }
}

impl RetryPolicy for ExponentialRetry {
    fn max_attempts(&self) -> u32 {
        self.attempts
    }

    fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base.saturating_mul(factor).min(self.max_delay)
    }
}

/// Classification of a failed attempt.
#[derive(Debug)]
pub enum Attempt<E> {
    /// Worth trying again
    Transient(E),
    /// Retrying cannot help
    Fatal(E),
}

impl<E> Attempt<E> {
    /// The error, whichever way it was classified.
    pub fn into_inner(self) -> E {
        match self {
            Attempt::Transient(err) | Attempt::Fatal(err) => err,
        }
    }
}

/// Why `retry` gave up.
#[derive(Debug, PartialEq, Eq)]
pub enum RetryError<E> {
    /// Every attempt failed with a transient error
    Exhausted { attempts: u32, last: E },
    /// An attempt failed with a fatal error
    Aborted { attempt: u32, error: E },
}

/// Runs `op` until it succeeds, fails fatally or the policy is exhausted.
///
/// `op` receives the 1-based attempt number.
pub async fn retry<T, E, F, Fut>(policy: &dyn RetryPolicy, mut op: F) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, Attempt<E>>>,
    E: Display,
{
    let attempts = policy.max_attempts().max(1);
    let mut attempt = 1;

    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(Attempt::Fatal(error)) => return Err(RetryError::Aborted { attempt, error }),
            Err(Attempt::Transient(error)) => {
                if attempt >= attempts {
                    return Err(RetryError::Exhausted {
                        attempts,
                        last: error,
                    });
                }

                let delay = policy.delay(attempt);
                warn!(
                    error = error.to_string(),
                    attempt,
                    max_attempts = attempts,
                    "attempt failed, retrying in {:?}",
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
