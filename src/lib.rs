#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Pulse Scheduler
//!
//! Background scheduling and admission control for a media control plane.
//!
//! ## Components
//!
//! - **Admission limiter**: per-key sliding-window log, a background sweep, and a tower layer
//!   that rejects requests before they reach business logic.
//! - **Retry scheduler**: one cancellable timer per item, replace-on-reschedule, reconciliation
//!   from durable storage, and graceful shutdown that waits for running deliveries.
//! - **Aggregation worker**: hourly, daily and monthly usage rollups aligned to UTC boundaries,
//!   idempotent under restart, each pass bounded by a timeout.
//!
//! Each component is an owned value; share it with `Arc` (or clone the handle) and start/stop it
//! from the process supervisor. Everything observable is logged through `tracing` and emitted as
//! a [`telemetry::ControlEvent`] to a pluggable sink.
//!
//! ## Quick Start
//!
//! ```rust
//! use pulse_scheduler::{PulseConfig, SlidingWindowLimiter, WindowKey};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = PulseConfig::default();
//!     let limiter = Arc::new(SlidingWindowLimiter::from_config(&config.admission).unwrap());
//!     let sweeper = limiter.spawn_sweeper(config.admission.sweep_interval());
//!
//!     let key = WindowKey::project("p-123");
//!     assert!(limiter.allow(&key));
//!
//!     sweeper.stop().await;
//! }
//! ```

pub mod admission;
pub mod aggregation;
pub mod backoff;
pub mod clock;
pub mod config;
pub mod error;
pub mod prelude;
pub mod retry;
pub mod telemetry;

// Re-exports
pub use admission::{AdmissionLayer, Decision, SlidingWindowLimiter, SweeperHandle, WindowKey};
pub use aggregation::{
    boundaries_due, AggregationPeriod, AggregationWindow, AggregationWorker, InMemoryUsageStore,
    UsageStore,
};
pub use backoff::{BackoffFailurePolicy, DeliveryBackoff, Jitter};
pub use clock::{Clock, ManualClock, MonotonicClock, SystemClock, TokioClock, WallClock};
pub use config::{AdmissionConfig, AggregationConfig, BackoffConfig, PulseConfig, RetryConfig};
pub use error::{
    AdmissionError, AggregationError, ConfigError, DeliveryError, SchedulerError, StoreError,
};
pub use retry::{
    DeliveryExecutor, FailurePolicy, InMemoryRetryStore, ItemId, RetryItem, RetryPersistence,
    RetryScheduler, RetryStats, WebhookDelivery,
};
