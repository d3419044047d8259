//! Retry policies.
//!
//! Each acquisition tier owns one [`RetryPolicy`]: an attempt ceiling plus a
//! [`DelayStrategy`] applied between attempts. Which failures a tier retries
//! is decided by the predicate handed to [`RetryPolicy::run`], so ceilings and
//! delays stay independently configurable and testable.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;

/// Pause inserted between two attempts of the same tier.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum DelayStrategy {
    /// Retry immediately.
    #[default]
    None,
    Fixed(Duration),
    /// Uniformly random delay within `[min, max]`, de-correlating concurrent
    /// retries.
    Uniform { min: Duration, max: Duration },
}

impl DelayStrategy {
    pub fn uniform(min: Duration, max: Duration) -> Self {
        let max = if max < min { min } else { max };
        DelayStrategy::Uniform { min, max }
    }

    pub fn next_delay(&self) -> Duration {
        match *self {
            DelayStrategy::None => Duration::ZERO,
            DelayStrategy::Fixed(delay) => delay,
            DelayStrategy::Uniform { min, max } => {
                if max <= min {
                    return min;
                }
                let mut rng = rand::thread_rng();
                Duration::from_secs_f64(rng.gen_range(min.as_secs_f64()..=max.as_secs_f64()))
            }
        }
    }
}

/// Attempt ceiling plus inter-attempt delay for a single tier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: DelayStrategy,
}

/// Terminal failure of a retried operation.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Every permitted attempt failed with a retryable error.
    Exhausted { attempts: u32, last: E },
    /// The predicate refused to retry this error.
    Fatal { attempt: u32, error: E },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } => *attempts,
            RetryError::Fatal { attempt, .. } => *attempt,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }

    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Fatal { error, .. } => error,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay: DelayStrategy::None,
        }
    }

    pub fn with_delay(mut self, delay: DelayStrategy) -> Self {
        self.delay = delay;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delay(&self) -> DelayStrategy {
        self.delay
    }

    /// Run `op` until it succeeds, returns an error `is_retryable` rejects, or
    /// the ceiling is reached. `op` receives the 1-based attempt number and
    /// `on_retry` is told about every failure that will be retried, together
    /// with the delay about to be applied.
    pub async fn run<T, E, F, Fut, P, R>(
        &self,
        mut op: F,
        mut is_retryable: P,
        mut on_retry: R,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnMut(&E) -> bool,
        R: FnMut(u32, &E, Duration),
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !is_retryable(&error) {
                return Err(RetryError::Fatal { attempt, error });
            }
            if attempt >= self.max_attempts {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: error,
                });
            }

            let delay = self.delay.next_delay();
            on_retry(attempt, &error, delay);
            if delay > Duration::ZERO {
                sleep(delay).await;
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(1)
    }
}
