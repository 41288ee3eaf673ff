//! Backoff between failed attempts.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Exponential backoff with jitter
///
/// The delay after the `n`th failed attempt is
/// `min(base * 2^(n - 1), max) * (1 ± jitter)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay after the first failure (in seconds)
    ///
    /// Default: 60 seconds
    #[serde(default = "defaults::base_retry_delay_secs")]
    pub base_retry_delay_secs: u64,

    /// Cap on the exponential growth (in seconds)
    ///
    /// Default: 3600 seconds (1 hour)
    #[serde(default = "defaults::max_retry_delay_secs")]
    pub max_retry_delay_secs: u64,

    /// Delays are randomised within ±`jitter_factor` so jobs that failed
    /// together don't retry together.
    ///
    /// Default: 0.1 (±10%)
    #[serde(default = "defaults::retry_jitter_factor")]
    pub retry_jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_retry_delay_secs: defaults::base_retry_delay_secs(),
            max_retry_delay_secs: defaults::max_retry_delay_secs(),
            retry_jitter_factor: defaults::retry_jitter_factor(),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt, without jitter. `failed_attempts` is
    /// the number of attempts made so far (1 after the first failure).
    #[must_use]
    pub fn base_delay(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1);
        let secs = if exponent >= 63 {
            self.max_retry_delay_secs
        } else {
            self.base_retry_delay_secs
                .saturating_mul(1u64 << exponent)
                .min(self.max_retry_delay_secs)
        };

        Duration::from_secs(secs)
    }

    /// [`Self::base_delay`] with jitter applied. A jitter factor that isn't
    /// finite counts as no jitter.
    #[must_use]
    pub fn delay(&self, failed_attempts: u32) -> Duration {
        let base = self.base_delay(failed_attempts);
        let jitter_factor = if self.retry_jitter_factor.is_finite() {
            self.retry_jitter_factor.clamp(0.0, 1.0)
        } else {
            0.0
        };
        if jitter_factor <= f64::EPSILON {
            return base;
        }

        let base = base.as_secs_f64();
        let range = base * jitter_factor;
        let jitter: f64 = rand::rng().random_range(-range..=range);
        Duration::try_from_secs_f64((base + jitter).max(0.0)).unwrap_or(Duration::MAX)
    }

    /// Rejects delays that can't be added to a timestamp and jitter factors
    /// outside `0.0..=1.0`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, secs) in [
            ("base_retry_delay_secs", self.base_retry_delay_secs),
            ("max_retry_delay_secs", self.max_retry_delay_secs),
        ] {
            if i64::try_from(secs)
                .ok()
                .and_then(TimeDelta::try_seconds)
                .is_none()
            {
                return Err(ConfigError::RetryDelayTooLarge { field, secs });
            }
        }

        if !(0.0..=1.0).contains(&self.retry_jitter_factor) {
            return Err(ConfigError::InvalidJitter(self.retry_jitter_factor));
        }

        Ok(())
    }

    #[must_use]
    pub fn next_attempt_at(&self, failed_attempts: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.delay(failed_attempts))
            .unwrap_or(chrono::Duration::MAX);
        now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

mod defaults {
    pub const fn base_retry_delay_secs() -> u64 {
        60
    }

    pub const fn max_retry_delay_secs() -> u64 {
        3600
    }

    pub const fn retry_jitter_factor() -> f64 {
        0.1
    }
}
