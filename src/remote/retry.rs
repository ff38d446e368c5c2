//! Retry with backoff
//!
//! Bounded retries for transient remote failures. Each wait is a random
//! duration below `base * 2^attempt`, capped at `max_delay`. Waiting blocks
//! the calling thread.

use std::fmt;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

/// Retry bound and delay curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

/// Every attempt failed; carries the last error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryExhausted<E> {
    pub attempts: u32,
    pub last_error: E,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(10, Duration::from_millis(10))
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: Duration::from_secs(5),
        }
    }

    /// Policy that retries without waiting.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO)
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    // == Backoff ==
    /// Random wait before retrying after `attempt` (0-based) failed.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let ceiling = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.min(16)))
            .min(self.max_delay);
        let ceiling_ms = ceiling.as_millis() as u64;
        if ceiling_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling_ms))
    }

    pub fn backoff_state(&self) -> Backoff {
        Backoff {
            policy: *self,
            attempt: 0,
        }
    }

    // == Execute ==
    /// Runs `op` until it succeeds or `max_attempts` attempts have failed.
    ///
    /// `op` receives the 0-based attempt number.
    pub fn execute<T, E, F>(&self, op_name: &str, mut op: F) -> Result<T, RetryExhausted<E>>
    where
        E: fmt::Display,
        F: FnMut(u32) -> Result<T, E>,
    {
        let mut backoff = self.backoff_state();
        loop {
            let attempt = backoff.attempt();
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(error) => match backoff.next() {
                    Some(delay) => {
                        debug!(
                            operation = op_name,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "Operation failed, retrying"
                        );
                        if !delay.is_zero() {
                            std::thread::sleep(delay);
                        }
                    }
                    None => {
                        return Err(RetryExhausted {
                            attempts: attempt + 1,
                            last_error: error,
                        })
                    }
                },
            }
        }
    }
}

// == Backoff State ==
/// Iterator-like backoff state for hand-written retry loops.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: u32,
}

impl Backoff {
    /// Number of attempts already consumed.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Records a failed attempt; returns the wait before the next one, or
    /// None once the policy is exhausted.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<Duration> {
        let failed = self.attempt;
        self.attempt += 1;
        if self.attempt >= self.policy.max_attempts {
            return None;
        }
        Some(self.policy.backoff(failed))
    }
}
