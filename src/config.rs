//! Configuration for all components.
//!
//! Every section deserializes with defaults, so a partial document (or `{}`) is valid. Durations
//! are whole seconds. `validate` is called by the `from_json_str` entry point and by builders.
//!
//! ```rust
//! use pulse_scheduler::PulseConfig;
//! use std::time::Duration;
//!
//! let config = PulseConfig::from_json_str(r#"{ "admission": { "limit": 20 } }"#).unwrap();
//! assert_eq!(config.admission.limit, 20);
//! assert_eq!(config.admission.window(), Duration::from_secs(60));
//! ```

use crate::aggregation::{AggregationWindow, MAX_CATCH_UP_HOURS};
use crate::backoff::Jitter;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PulseConfig {
    pub admission: AdmissionConfig,
    pub retry: RetryConfig,
    pub aggregation: AggregationConfig,
    pub backoff: BackoffConfig,
}

impl PulseConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.admission.validate()?;
        self.retry.validate()?;
        self.aggregation.validate()?;
        self.backoff.validate()
    }
}

/// Admission limiter settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Requests admitted per key per window.
    pub limit: u32,
    pub window_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self { limit: 100, window_secs: 60, sweep_interval_secs: 300 }
    }
}

impl AdmissionConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limit == 0 {
            return Err(ConfigError::ZeroLimit);
        }
        non_zero(self.window_secs, "admission.window_secs")?;
        non_zero(self.sweep_interval_secs, "admission.sweep_interval_secs")
    }
}

/// Retry scheduler settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub reconcile_interval_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { reconcile_interval_secs: 300 }
    }
}

impl RetryConfig {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        non_zero(self.reconcile_interval_secs, "retry.reconcile_interval_secs")
    }
}

/// Longest accepted settle delay.
pub const MAX_SETTLE_DELAY: Duration = Duration::from_secs(60 * 60);

/// Longest accepted catch-up horizon, matching the lookback cap of `boundaries_due`.
pub const MAX_CATCH_UP_HORIZON: Duration = Duration::from_secs(MAX_CATCH_UP_HOURS as u64 * 60 * 60);

/// Aggregation worker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    pub hourly_timeout_secs: u64,
    pub daily_timeout_secs: u64,
    pub monthly_timeout_secs: u64,
    /// How far back a fresh start re-runs missed boundaries. `0` runs only the latest boundary.
    pub catch_up_horizon_secs: u64,
    /// Wait after each boundary before aggregating, for late raw events.
    pub settle_delay_secs: u64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            hourly_timeout_secs: 10 * 60,
            daily_timeout_secs: 30 * 60,
            monthly_timeout_secs: 60 * 60,
            catch_up_horizon_secs: 24 * 60 * 60,
            settle_delay_secs: 0,
        }
    }
}

impl AggregationConfig {
    /// Bound on a single pass of `window`.
    pub fn timeout_for(&self, window: AggregationWindow) -> Duration {
        Duration::from_secs(match window {
            AggregationWindow::Hour => self.hourly_timeout_secs,
            AggregationWindow::Day => self.daily_timeout_secs,
            AggregationWindow::Month => self.monthly_timeout_secs,
        })
    }

    pub fn catch_up_horizon(&self) -> Option<Duration> {
        (self.catch_up_horizon_secs > 0).then(|| Duration::from_secs(self.catch_up_horizon_secs))
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_delay_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        non_zero(self.hourly_timeout_secs, "aggregation.hourly_timeout_secs")?;
        non_zero(self.daily_timeout_secs, "aggregation.daily_timeout_secs")?;
        non_zero(self.monthly_timeout_secs, "aggregation.monthly_timeout_secs")?;
        at_most(self.catch_up_horizon_secs, MAX_CATCH_UP_HORIZON, "aggregation.catch_up_horizon_secs")?;
        // Strictly below an hour, otherwise a boundary would be overtaken by the next one.
        if self.settle_delay() >= MAX_SETTLE_DELAY {
            return Err(ConfigError::TooLong { field: "aggregation.settle_delay_secs", max: MAX_SETTLE_DELAY });
        }
        Ok(())
    }
}

/// Delivery backoff settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_delay_secs: u64,
    pub max_delay_secs: u64,
    /// Total attempts, the initial delivery included.
    pub max_attempts: u32,
    pub jitter: Jitter,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self { initial_delay_secs: 5 * 60, max_delay_secs: 30 * 60, max_attempts: 5, jitter: Jitter::None }
    }
}

impl BackoffConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        non_zero(self.initial_delay_secs, "backoff.initial_delay_secs")?;
        if self.max_delay_secs < self.initial_delay_secs {
            return Err(ConfigError::MaxBelowInitial { initial: self.initial_delay(), max: self.max_delay() });
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        Ok(())
    }
}

fn non_zero(value: u64, field: &'static str) -> Result<(), ConfigError> {
    if value == 0 {
        Err(ConfigError::ZeroDuration { field })
    } else {
        Ok(())
    }
}

fn at_most(value_secs: u64, max: Duration, field: &'static str) -> Result<(), ConfigError> {
    if value_secs > max.as_secs() {
        Err(ConfigError::TooLong { field, max })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        PulseConfig::default().validate().unwrap();
    }

    #[test]
    fn timeouts_per_window() {
        let config = AggregationConfig::default();
        assert_eq!(config.timeout_for(AggregationWindow::Hour), Duration::from_secs(600));
        assert_eq!(config.timeout_for(AggregationWindow::Day), Duration::from_secs(1800));
        assert_eq!(config.timeout_for(AggregationWindow::Month), Duration::from_secs(3600));
    }

    #[test]
    fn zero_horizon_disables_catch_up() {
        let config = AggregationConfig { catch_up_horizon_secs: 0, ..Default::default() };
        assert_eq!(config.catch_up_horizon(), None);
    }

    #[test]
    fn aggregation_durations_are_bounded() {
        let horizon = AggregationConfig { catch_up_horizon_secs: MAX_CATCH_UP_HORIZON.as_secs(), ..Default::default() };
        horizon.validate().unwrap();

        let horizon = AggregationConfig { catch_up_horizon_secs: 9_000_000_000_000, ..Default::default() };
        assert_eq!(
            horizon.validate(),
            Err(ConfigError::TooLong { field: "aggregation.catch_up_horizon_secs", max: MAX_CATCH_UP_HORIZON })
        );

        let settle = AggregationConfig { settle_delay_secs: 3599, ..Default::default() };
        settle.validate().unwrap();
        let settle = AggregationConfig { settle_delay_secs: 3600, ..Default::default() };
        assert!(matches!(settle.validate(), Err(ConfigError::TooLong { field: "aggregation.settle_delay_secs", .. })));
    }

    #[test]
    fn backoff_cap_below_initial_is_rejected() {
        let config = BackoffConfig { initial_delay_secs: 600, max_delay_secs: 60, ..Default::default() };
        assert!(matches!(config.validate(), Err(ConfigError::MaxBelowInitial { .. })));
    }
}
