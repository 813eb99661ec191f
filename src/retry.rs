//! Timeout + exponential backoff applied at every collaborator call.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::scheduler::CancelSignal;

/// Classification of collaborator errors for retry purposes.
pub trait Transient {
    /// Network, timeout, rate-limit and unavailable-service errors are transient.
    fn is_transient(&self) -> bool;

    /// Error value recorded when a call exceeds its timeout.
    fn timed_out(after: Duration) -> Self;
}

/// Why a retried call gave up.
#[derive(Debug, Error)]
pub enum RetryError<E: std::error::Error + 'static> {
    #[error("{0}")]
    Permanent(#[source] E),

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: E,
    },

    #[error("cancelled")]
    Cancelled,
}

/// Attempt count, delay curve and per-call timeout.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub call_timeout: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl BackoffPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            multiplier: config.multiplier,
            max_delay: Duration::from_millis(config.max_delay_ms),
            call_timeout: config.call_timeout(),
        }
    }

    /// Delay before retry number `attempt` (1-based: the delay after the first failure).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let millis = self.base_delay.as_millis() as f64 * factor;
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Run `call` until it succeeds, fails permanently, runs out of attempts,
    /// or `cancel` fires.
    ///
    /// An in-flight call is always awaited to completion; cancellation is only
    /// observed between attempts and while sleeping.
    pub async fn run<T, E, F, Fut>(
        &self,
        operation: &str,
        cancel: &CancelSignal,
        mut call: F,
    ) -> Result<T, RetryError<E>>
    where
        E: Transient + std::error::Error + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 1;
        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled);
            }

            let outcome = match tokio::time::timeout(self.call_timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(E::timed_out(self.call_timeout)),
            };

            let err = match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation, attempt, "call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !err.is_transient() {
                return Err(RetryError::Permanent(err));
            }
            if attempt >= self.max_attempts {
                return Err(RetryError::Exhausted { attempts: attempt, last: err });
            }

            let delay = self.delay_for(attempt);
            warn!(
                operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "transient failure, backing off"
            );
            if !cancel.sleep(delay).await {
                return Err(RetryError::Cancelled);
            }
            attempt += 1;
        }
    }
}
