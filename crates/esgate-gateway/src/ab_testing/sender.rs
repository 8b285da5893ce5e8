//! Result senders.
//!
//! [`DispatchingSender`] decouples A/B processors from the collector: `send`
//! only enqueues, and a single background loop forwards each record to the
//! collector that is active at that moment. The active collector is local to
//! that loop and only changes through [`SenderControl`] messages.

use async_trait::async_trait;
use esgate_kernel::ab_testing::{AbResult, Collector, ResultSender};
use esgate_kernel::config::AbTestingConfig;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Instruction from the coordinator to the sender loop.
pub enum SenderControl {
    /// Forward subsequent results to this collector, or drop them on `None`.
    UseCollector(Option<Arc<dyn Collector>>),
}

// ─────────────────────────────────────────────────────────────────────────────
// DispatchingSender
// ─────────────────────────────────────────────────────────────────────────────

pub struct DispatchingSender {
    results: mpsc::Sender<AbResult>,
    control: mpsc::Sender<SenderControl>,
}

/// Receiving half of a [`DispatchingSender`], run by [`SenderLoop::run`].
pub struct SenderLoop {
    results: mpsc::Receiver<AbResult>,
    control: mpsc::Receiver<SenderControl>,
}

impl DispatchingSender {
    pub fn new(config: &AbTestingConfig) -> (Self, SenderLoop) {
        let (results_tx, results_rx) = mpsc::channel(config.result_queue_capacity.max(1));
        let (control_tx, control_rx) = mpsc::channel(config.control_queue_capacity.max(1));
        (
            Self {
                results: results_tx,
                control: control_tx,
            },
            SenderLoop {
                results: results_rx,
                control: control_rx,
            },
        )
    }

    /// Queue a control message; waits while the control queue is full.
    pub async fn control(&self, message: SenderControl) {
        if self.control.send(message).await.is_err() {
            debug!("sender loop stopped, control message dropped");
        }
    }

    pub(crate) fn control_handle(&self) -> mpsc::Sender<SenderControl> {
        self.control.clone()
    }
}

#[async_trait]
impl ResultSender for DispatchingSender {
    async fn send(&self, result: AbResult) {
        if let Err(e) = self.results.send(result).await {
            debug!(request_id = %e.0.request_id, "sender loop stopped, A/B result dropped");
        }
    }
}

impl SenderLoop {
    /// Forward results until `shutdown` is cancelled or every sender handle
    /// is gone. Pending control messages are always applied before results.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut active: Option<Arc<dyn Collector>> = None;
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                Some(message) = self.control.recv() => match message {
                    SenderControl::UseCollector(collector) => {
                        let previous = active.as_ref().map(|c| c.id());
                        let next = collector.as_ref().map(|c| c.id());
                        if previous != next {
                            info!(?previous, ?next, "sender switched collector");
                        }
                        active = collector;
                    }
                },

                Some(result) = self.results.recv() => match &active {
                    Some(collector) => collector.collect(result).await,
                    None => debug!(
                        request_id = %result.request_id,
                        "no active collector, A/B result dropped"
                    ),
                },

                else => break,
            }
        }
        debug!("sender loop stopped");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// NoopSender
// ─────────────────────────────────────────────────────────────────────────────

/// Sender handed out when no index has A/B testing enabled.
#[derive(Debug, Default)]
pub struct NoopSender;

#[async_trait]
impl ResultSender for NoopSender {
    async fn send(&self, _result: AbResult) {}

    fn is_enabled(&self) -> bool {
        false
    }
}
