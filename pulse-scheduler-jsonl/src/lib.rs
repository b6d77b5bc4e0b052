//! JSONL sink for `pulse-scheduler`. Appends one control event per line.
//! Always writes; bring your own path.

use pulse_scheduler::telemetry::{ControlEvent, SinkFuture, TelemetrySink};
use std::io;
use std::path::PathBuf;
use std::task::{Context, Poll};

#[derive(Clone, Debug)]
pub struct JsonlSink {
    path: PathBuf,
}

impl JsonlSink {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl tower_service::Service<ControlEvent> for JsonlSink {
    type Response = ();
    type Error = io::Error;
    type Future = SinkFuture<io::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: ControlEvent) -> Self::Future {
        let path = self.path.clone();
        let line = event.to_json().to_string() + "\n";
        Box::pin(async move {
            use tokio::io::AsyncWriteExt;
            let mut file =
                tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await?;
            if let Err(error) = file.write_all(line.as_bytes()).await {
                tracing::warn!(path = %path.display(), %error, "jsonl sink write failed");
                return Err(error);
            }
            file.flush().await?;
            Ok(())
        })
    }
}

impl TelemetrySink for JsonlSink {
    type SinkError = io::Error;
}
