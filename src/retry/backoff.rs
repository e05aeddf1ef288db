//! Backoff curves.
//!
//! `attempts` is the number of failed attempts so far (1 when computing the
//! delay before the first retry):
//!
//! | strategy | delay |
//! |---|---|
//! | fixed | `base` |
//! | linear | `base × attempts` |
//! | exponential | `min(base × 2^(attempts−1), max)` |
//!
//! ```rust
//! use staged_orchestrator::retry::BackoffStrategy;
//! use std::time::Duration;
//!
//! let base = Duration::from_millis(1000);
//! let max = Duration::from_millis(30_000);
//! assert_eq!(BackoffStrategy::Exponential.delay(3, base, max), Duration::from_millis(4000));
//! assert_eq!(BackoffStrategy::Exponential.delay(6, base, max), max);
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    Fixed,
    Linear,
    #[default]
    Exponential,
}

impl BackoffStrategy {
    pub fn delay(&self, attempts: u32, base: Duration, max: Duration) -> Duration {
        let base_ms = base.as_millis().min(u64::MAX as u128) as u64;
        let ms = match self {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Linear => base_ms.saturating_mul(attempts as u64),
            BackoffStrategy::Exponential => {
                let exp = attempts.saturating_sub(1);
                let factor = 1u64.checked_shl(exp).unwrap_or(u64::MAX);
                let max_ms = max.as_millis().min(u64::MAX as u128) as u64;
                base_ms.saturating_mul(factor).min(max_ms)
            }
        };
        Duration::from_millis(ms)
    }
}
