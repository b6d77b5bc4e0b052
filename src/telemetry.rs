//! Telemetry for the admission limiter, the retry scheduler and the aggregation worker.
//!
//! Components emit [`ControlEvent`]s into a [`TelemetrySink`]. Sinks are `tower::Service`s, so
//! they compose with the usual tower combinators. Emission is best effort: a sink that is not
//! ready or fails never affects the component that emitted the event.
//!
//! Operational logging goes through `tracing` independently of the sink; the sink is the
//! structured record of what each component did.
//!
//! Sink order is not causal across an item's lifecycle. Events raised from synchronous calls
//! (`Scheduled`, `Cancelled`) are emitted from a spawned task and may land after the `Fired` event
//! for the same item, or after the scheduler's `stop()` returned. Consumers that need ordering
//! should sort by the timestamps they attach on receipt, or rely on the `tracing` output, which is
//! written inline.
//!
//! ```rust
//! use pulse_scheduler::telemetry::{ControlEvent, RetryEvent};
//!
//! let event = ControlEvent::Retry(RetryEvent::Fired { item_id: "log-42".into() });
//! assert_eq!(event.to_string(), "Retry::Fired(log-42)");
//! ```

pub mod events;
pub mod sinks;

pub use events::{event_to_json, AdmissionEvent, AggregationEvent, ControlEvent, RetryEvent};
pub use sinks::{emit_best_effort, LogSink, MemorySink, NullSink, SinkFuture, TelemetrySink};
