use crate::admission::SlidingWindowLimiter;
use crate::telemetry::{emit_best_effort, AdmissionEvent, ControlEvent, TelemetrySink};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// Handle to a running sweeper task.
///
/// Dropping the handle also stops the task (the shutdown channel closes).
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    pub(crate) fn spawn<S>(limiter: Arc<SlidingWindowLimiter>, interval: Duration, sink: S) -> Self
    where
        S: TelemetrySink,
    {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        // A zero period would panic in `interval_at`.
        let period = interval.max(Duration::from_millis(1));

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = limiter.sweep();
                        let tracked = limiter.tracked_keys();
                        debug!(target: "pulse_scheduler::admission", removed, tracked, "admission sweep");
                        emit_best_effort(
                            &sink,
                            ControlEvent::Admission(AdmissionEvent::Swept { removed, tracked }),
                        )
                        .await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        Self { shutdown, task }
    }

    /// Signal the task to exit and wait for it.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
