//! Convenient re-exports for common Pulse Scheduler types.
pub use crate::{
    admission::{AdmissionLayer, AdmissionService, Decision, SlidingWindowLimiter, SweeperHandle, WindowKey},
    aggregation::{
        boundaries_due, AggregateKey, AggregateRecord, AggregationPeriod, AggregationWindow,
        AggregationWorker, InMemoryUsageStore, PassReport, UsageEvent, UsageEventKind, UsageStore,
        UsageSummary, WorkerStatus,
    },
    backoff::{BackoffFailurePolicy, DeliveryBackoff, Jitter},
    clock::{Clock, ManualClock, SystemClock, TokioClock, WallClock},
    config::PulseConfig,
    error::{AdmissionError, AggregationError, ConfigError, DeliveryError, SchedulerError, StoreError},
    retry::{
        DeliveryAttempts, DeliveryExecutor, FailedDelivery, FailurePolicy, InMemoryRetryStore, ItemId,
        NoReschedule, RetryItem, RetryPersistence, RetryScheduler, RetryStats, WebhookDelivery,
    },
    telemetry::{ControlEvent, LogSink, MemorySink, NullSink, TelemetrySink},
};
