//! Retry policy with selectable backoff.
//!
//! [`RetryPolicy::execute`] runs an async operation up to `max_retries + 1`
//! times, sleeping between attempts according to a [`BackoffStrategy`].
//! When every attempt fails it returns [`Error::RetryExhausted`] carrying the
//! retry budget and the last failure's message. The original error value is
//! not kept; capture it inside the closure if the full cause chain matters.
//!
//! ```rust
//! use staged_orchestrator::retry::{RetryPolicy, RetryPolicyConfig};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let policy = RetryPolicy::new(
//!     RetryPolicyConfig::new()
//!         .with_max_retries(2)
//!         .with_base_delay(Duration::from_millis(1)),
//! );
//! let value = policy
//!     .execute(|| async { Ok::<_, std::io::Error>(7) })
//!     .await
//!     .unwrap();
//! assert_eq!(value, 7);
//! assert_eq!(policy.get_state().successful_attempts, 1);
//! # });
//! ```

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime};

mod backoff;

pub use backoff::BackoffStrategy;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicyConfig {
    pub max_retries: u32,
    pub backoff: BackoffStrategy,
    #[serde(rename = "base_delay_ms", with = "crate::utils::time::duration_ms")]
    pub base_delay: Duration,
    #[serde(rename = "max_delay_ms", with = "crate::utils::time::duration_ms")]
    pub max_delay: Duration,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: BackoffStrategy::Exponential,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
        }
    }
}

impl RetryPolicyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_base_delay(mut self, d: Duration) -> Self {
        self.base_delay = d;
        self
    }

    pub fn with_max_delay(mut self, d: Duration) -> Self {
        self.max_delay = d;
        self
    }
}

/// Counters owned by one policy instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryState {
    /// Failed attempts of the operation currently (or last) in flight; 0 after a success.
    pub attempts: u32,
    pub total_attempts: u64,
    pub successful_attempts: u64,
    pub failed_attempts: u64,
    #[serde(with = "crate::utils::time::opt_epoch_ms")]
    pub last_attempt_at: Option<SystemTime>,
}

/// One logical retry budget.
///
/// Concurrent `execute` calls on the same instance are serialized: the second
/// caller waits until the first finishes, so the counters always describe a
/// single operation. Give each independent retryable unit its own instance.
pub struct RetryPolicy {
    config: RetryPolicyConfig,
    state: Mutex<RetryState>,
    gate: tokio::sync::Mutex<()>,
}

impl RetryPolicy {
    pub fn new(config: RetryPolicyConfig) -> Self {
        Self {
            config,
            state: Mutex::new(RetryState::default()),
            gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &RetryPolicyConfig {
        &self.config
    }

    pub async fn execute<T, E, F, Fut>(&self, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: std::fmt::Display,
    {
        let _serial = self.gate.lock().await;
        self.with_state(|s| s.attempts = 0);

        loop {
            let failed = self.with_state(|s| s.attempts);
            if failed > 0 {
                tokio::time::sleep(self.delay_for(failed)).await;
            }

            match f().await {
                Ok(value) => {
                    self.with_state(|s| {
                        s.last_attempt_at = Some(SystemTime::now());
                        s.total_attempts += 1;
                        s.successful_attempts += 1;
                        s.attempts = 0;
                    });
                    return Ok(value);
                }
                Err(e) => {
                    let last_error = e.to_string();
                    let attempts = self.with_state(|s| {
                        s.last_attempt_at = Some(SystemTime::now());
                        s.total_attempts += 1;
                        s.failed_attempts += 1;
                        s.attempts = s.attempts.saturating_add(1);
                        s.attempts
                    });
                    if attempts > self.config.max_retries {
                        tracing::error!(
                            attempts,
                            max_retries = self.config.max_retries,
                            error = %last_error,
                            "retry budget exhausted"
                        );
                        return Err(Error::RetryExhausted {
                            max_retries: self.config.max_retries,
                            attempts,
                            last_error,
                        });
                    }
                    tracing::warn!(
                        attempt = attempts,
                        delay_ms = self.delay_for(attempts).as_millis() as u64,
                        error = %last_error,
                        "attempt failed, retrying"
                    );
                }
            }
        }
    }

    /// Delay before the retry that follows `attempts` failures.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        self.config
            .backoff
            .delay(attempts, self.config.base_delay, self.config.max_delay)
    }

    pub fn get_state(&self) -> RetryState {
        self.with_state(|s| s.clone())
    }

    pub fn reset(&self) {
        self.with_state(|s| *s = RetryState::default());
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut RetryState) -> R) -> R {
        let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut st)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryPolicyConfig::default())
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("config", &self.config)
            .field("state", &self.get_state())
            .finish()
    }
}
