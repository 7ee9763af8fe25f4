//! Bounded retry with exponential backoff and jitter for client calls.
//!
//! Only `ClientError::Transient` is retried. Between attempts the caller's
//! cancellation check is polled, so a stop request takes effect without
//! waiting out the whole backoff.

use dojo_clients::ClientError;
use dojo_schema::RetrySection;
use rand::Rng;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, warn};

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. At least 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_section(&RetrySection::default())
    }
}

impl RetryPolicy {
    pub fn from_section(section: &RetrySection) -> Self {
        Self {
            max_attempts: section.max_attempts.max(1),
            base_delay: Duration::from_millis(section.base_delay_ms),
            max_delay: Duration::from_millis(section.max_delay_ms),
            multiplier: 2.0,
        }
    }

    /// Retry up to `max_attempts` times without sleeping between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 2.0,
        }
    }

    /// Nominal delay before attempt `attempt + 1` (attempts count from 1), before jitter.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .multiplier
            .powi(i32::try_from(attempt.saturating_sub(1).min(32)).unwrap_or(32));
        let secs = (self.base_delay.as_secs_f64() * exp).min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    fn jittered(delay: Duration) -> Duration {
        if delay.is_zero() {
            return delay;
        }
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64(delay.as_secs_f64() * jitter)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RetryError {
    /// A non-transient error; returned after the first attempt that produced it.
    #[error("{0}")]
    Failed(ClientError),
    #[error("{last} (gave up after {attempts} attempts)")]
    Exhausted { attempts: u32, last: ClientError },
    #[error("cancelled after {attempts} attempts; last error: {last}")]
    Cancelled { attempts: u32, last: ClientError },
}

/// Sleep for `total`, waking early (and returning `true`) once `cancelled` reports true.
fn sleep_unless_cancelled(total: Duration, cancelled: &dyn Fn() -> bool) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if cancelled() {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        std::thread::sleep((deadline - now).min(CANCEL_POLL_INTERVAL));
    }
}

/// Run `op` until it succeeds, fails non-transiently, runs out of attempts,
/// or `cancelled` fires between attempts.
pub fn retry_call<T>(
    policy: &RetryPolicy,
    name: &str,
    cancelled: &dyn Fn() -> bool,
    mut op: impl FnMut() -> Result<T, ClientError>,
) -> Result<T, RetryError> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_transient() => return Err(RetryError::Failed(e)),
            Err(e) => {
                if attempt >= policy.max_attempts {
                    error!(operation = %name, attempt, error = %e, "call failed after max retries");
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: e,
                    });
                }
                let delay = RetryPolicy::jittered(policy.nominal_delay(attempt));
                warn!(
                    operation = %name,
                    attempt,
                    error = %e,
                    delay_ms = delay.as_millis(),
                    "call failed, retrying"
                );
                if sleep_unless_cancelled(delay, cancelled) {
                    return Err(RetryError::Cancelled {
                        attempts: attempt,
                        last: e,
                    });
                }
            }
        }
    }
}
