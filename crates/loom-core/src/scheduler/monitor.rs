//! Per-attempt monitor: polls one adapter handle and forwards snapshots to
//! the scheduler loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::Message;
use crate::compute::{BackendHandle, ComputeBackend};
use crate::domain::TaskId;

pub(crate) struct Monitor {
    pub task_id: TaskId,
    pub attempt: u32,
    pub handle: BackendHandle,
    pub backend: Arc<dyn ComputeBackend>,
    pub tx: mpsc::UnboundedSender<Message>,
    pub interval: Duration,
    pub max_failures: u32,
}

impl Monitor {
    /// Poll until a final report arrives, polling fails `max_failures` times
    /// in a row, or `stop` fires.
    pub async fn run(self, stop: CancellationToken) {
        let mut failures = 0u32;
        loop {
            if stop.is_cancelled() {
                return;
            }
            // Not raced against `stop`: a dropped poll could lose a final report.
            match self.backend.poll(&self.handle).await {
                Ok(snapshot) => {
                    failures = 0;
                    let finished = snapshot.report.is_some();
                    let sent = self.tx.send(Message::Progress {
                        task_id: self.task_id,
                        attempt: self.attempt,
                        snapshot,
                    });
                    if finished || sent.is_err() {
                        return;
                    }
                }
                Err(err) => {
                    failures += 1;
                    tracing::warn!(
                        task_id = %self.task_id,
                        attempt = self.attempt,
                        adapter = %self.handle.adapter,
                        failures,
                        error = %err,
                        "poll failed"
                    );
                    if failures >= self.max_failures {
                        let _ = self.tx.send(Message::PollFailed {
                            task_id: self.task_id,
                            attempt: self.attempt,
                            error: err.to_string(),
                        });
                        return;
                    }
                }
            }

            tokio::select! {
                _ = stop.cancelled() => return,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }
}
