//! Delivery backoff and jitter.
//!
//! Attempt semantics: attempt `0` is the initial delivery (no delay); the `n`th retry waits
//! `initial * 2^(n-1)`, capped at `max`. With the defaults (5 minutes, 30 minute cap) the
//! schedule is 5m, 10m, 20m, 30m, 30m...
//!
//! Example
//! ```rust
//! use std::time::Duration;
//! use pulse_scheduler::DeliveryBackoff;
//!
//! let backoff = DeliveryBackoff::default();
//! assert_eq!(backoff.delay(0), Duration::ZERO);
//! assert_eq!(backoff.delay(1), Duration::from_secs(5 * 60));
//! assert_eq!(backoff.delay(2), Duration::from_secs(10 * 60));
//! assert_eq!(backoff.delay(4), Duration::from_secs(30 * 60)); // capped
//! ```

use crate::config::BackoffConfig;
use crate::error::ConfigError;
use crate::retry::{DeliveryAttempts, FailedDelivery, FailurePolicy, RetryItem};
use chrono::{DateTime, TimeDelta, Utc};
use rand::{rng, Rng};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

/// Default first retry delay.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(5 * 60);
/// Default delay cap.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30 * 60);
/// Default total attempts, the initial delivery included.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Jitter strategy for randomizing retry delays.
///
/// - `None`: exact delays, for tests and tightly controlled workflows.
/// - `Full`: uniform in `[0, delay]`.
/// - `Equal`: uniform in `[delay/2, delay]`, keeps a floor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Jitter {
    #[default]
    None,
    Full,
    Equal,
}

impl Jitter {
    /// Apply jitter to a delay duration
    pub fn apply(&self, delay: Duration) -> Duration {
        let mut rng = rng();
        self.apply_with_rng(delay, &mut rng)
    }

    /// Apply jitter with a custom RNG (for testing)
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        let millis = as_millis_saturated(delay);
        match self {
            Jitter::None => delay,
            _ if millis == 0 => Duration::ZERO,
            Jitter::Full => Duration::from_millis(rng.random_range(0..=millis)),
            Jitter::Equal => Duration::from_millis(rng.random_range(millis / 2..=millis)),
        }
    }
}

fn as_millis_saturated(duration: Duration) -> u64 {
    duration.as_millis().try_into().unwrap_or(u64::MAX)
}

/// Capped exponential backoff with an attempt limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryBackoff {
    initial: Duration,
    max: Duration,
    max_attempts: u32,
    jitter: Jitter,
}

impl Default for DeliveryBackoff {
    fn default() -> Self {
        Self {
            initial: DEFAULT_INITIAL_DELAY,
            max: DEFAULT_MAX_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            jitter: Jitter::None,
        }
    }
}

impl DeliveryBackoff {
    pub fn new(initial: Duration, max: Duration, max_attempts: u32) -> Result<Self, ConfigError> {
        if initial.is_zero() {
            return Err(ConfigError::ZeroDuration { field: "initial_delay" });
        }
        if max < initial {
            return Err(ConfigError::MaxBelowInitial { initial, max });
        }
        if max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        Ok(Self { initial, max, max_attempts, jitter: Jitter::None })
    }

    pub fn from_config(config: &BackoffConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(config.initial_delay(), config.max_delay(), config.max_attempts)?.with_jitter(config.jitter))
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Un-jittered delay before retry number `retry` (0 = initial delivery, no delay).
    pub fn delay(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.checked_pow(retry - 1).unwrap_or(u32::MAX);
        self.initial.checked_mul(factor).map_or(self.max, |delay| delay.min(self.max))
    }

    /// When the next attempt should run, given how many attempts have been made.
    ///
    /// `None` once the attempt limit is reached.
    pub fn next_retry_at(&self, attempts_made: u32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if attempts_made >= self.max_attempts {
            return None;
        }
        let delay = self.jitter.apply(self.delay(attempts_made));
        let delta = TimeDelta::from_std(delay).unwrap_or(TimeDelta::MAX);
        Some(now.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC))
    }
}

/// Failure policy that reschedules with [`DeliveryBackoff`] until attempts run out.
///
/// The context's own limit ([`DeliveryAttempts::max_attempts`]) wins when it is lower.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackoffFailurePolicy {
    backoff: DeliveryBackoff,
}

impl BackoffFailurePolicy {
    pub fn new(backoff: DeliveryBackoff) -> Self {
        Self { backoff }
    }

    pub fn backoff(&self) -> &DeliveryBackoff {
        &self.backoff
    }
}

impl<C> FailurePolicy<C> for BackoffFailurePolicy
where
    C: DeliveryAttempts + Clone + Send + Sync + 'static,
{
    fn on_failure(&self, failed: &FailedDelivery<'_, C>) -> Option<RetryItem<C>> {
        let mut context = failed.context.clone();
        context.record_attempt();

        let limit = context
            .max_attempts()
            .map_or(self.backoff.max_attempts, |own| own.min(self.backoff.max_attempts));
        let attempts = context.attempts();
        if attempts >= limit {
            info!(target: "pulse_scheduler::retry", item_id = %failed.id, attempts, "retry attempts exhausted");
            return None;
        }

        let not_before = self.backoff.next_retry_at(attempts, failed.failed_at)?;
        Some(RetryItem::new(failed.id.clone(), not_before, context))
    }
}
