//! Lifecycle owner of the A/B-testing subsystem.
//!
//! The coordinator runs the sender loop and a health loop. The health loop
//! keeps exactly one collector wired into the sender:
//!
//! | Event | Reaction |
//! |-------|----------|
//! | no collector | create and start one, send `UseCollector(Some(..))` |
//! | healthy report from the current collector | reconfirm it |
//! | unhealthy report from the current collector | send `UseCollector(None)`, stop it |
//! | report from an older generation | ignored |
//! | periodic tick | nothing |
//! | shutdown | stop the current collector, exit |

use super::collector::CollectorFactory;
use super::sender::{DispatchingSender, NoopSender, SenderControl, SenderLoop};
use crate::processor::panic_message;
use esgate_kernel::ab_testing::{Collector, HealthMessage, ResultSender};
use esgate_kernel::config::GatewayConfig;
use futures::FutureExt;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Capacity of the collector → coordinator health queue.
const HEALTH_QUEUE_CAPACITY: usize = 16;

struct Pending {
    sender_loop: SenderLoop,
    control: mpsc::Sender<SenderControl>,
}

pub struct SenderCoordinator {
    sender: Arc<dyn ResultSender>,
    factory: Arc<dyn CollectorFactory>,
    health_interval: Duration,
    pending: Mutex<Option<Pending>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    token: CancellationToken,
}

impl SenderCoordinator {
    pub fn new(config: &GatewayConfig, factory: Arc<dyn CollectorFactory>) -> Self {
        let (sender, pending): (Arc<dyn ResultSender>, _) = if config.ab_testing_active() {
            let (sender, sender_loop) = DispatchingSender::new(&config.ab_testing);
            let control = sender.control_handle();
            (
                Arc::new(sender),
                Some(Pending {
                    sender_loop,
                    control,
                }),
            )
        } else {
            (Arc::new(NoopSender), None)
        };
        Self {
            sender,
            factory,
            health_interval: config.ab_testing.health_check_interval(),
            pending: Mutex::new(pending),
            tasks: Mutex::new(Vec::new()),
            token: CancellationToken::new(),
        }
    }

    /// The dispatching sender when at least one index enables A/B testing
    /// and a shadow cluster is configured, a no-op sender otherwise.
    pub fn get_sender(&self) -> Arc<dyn ResultSender> {
        Arc::clone(&self.sender)
    }

    pub fn is_enabled(&self) -> bool {
        self.sender.is_enabled()
    }

    /// Spawn the sender and health loops. Later calls do nothing.
    pub fn start(&self) {
        let Some(pending) = self.pending.lock().take() else {
            debug!("A/B testing disabled or already started");
            return;
        };
        info!("starting A/B testing coordinator");

        let sender_task = tokio::spawn(pending.sender_loop.run(self.token.clone()));

        let (health_tx, health_rx) = mpsc::channel(HEALTH_QUEUE_CAPACITY);
        let health = HealthLoop {
            factory: Arc::clone(&self.factory),
            control: pending.control,
            health_tx,
            health_rx,
            interval: self.health_interval,
            token: self.token.clone(),
            next_id: 0,
            current: None,
        };
        let token = self.token.clone();
        let health_task = tokio::spawn(async move {
            if let Err(panic) = AssertUnwindSafe(health.run()).catch_unwind().await {
                error!(panic = %panic_message(panic.as_ref()), "A/B health loop panicked, disabling A/B testing");
                token.cancel();
            }
        });

        self.tasks.lock().extend([sender_task, health_task]);
    }

    /// Cancel both loops and wait up to `deadline` for them to finish.
    pub async fn stop(&self, deadline: Duration) {
        self.token.cancel();
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        if tasks.is_empty() {
            return;
        }
        if tokio::time::timeout(deadline, futures::future::join_all(tasks))
            .await
            .is_err()
        {
            warn!("A/B testing loops did not stop before the deadline");
        }
        info!("A/B testing coordinator stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Health loop
// ─────────────────────────────────────────────────────────────────────────────

struct HealthLoop {
    factory: Arc<dyn CollectorFactory>,
    control: mpsc::Sender<SenderControl>,
    health_tx: mpsc::Sender<HealthMessage>,
    health_rx: mpsc::Receiver<HealthMessage>,
    interval: Duration,
    token: CancellationToken,
    next_id: u64,
    current: Option<Arc<dyn Collector>>,
}

impl HealthLoop {
    async fn run(mut self) {
        loop {
            if self.current.is_none() {
                self.replace_collector().await;
            }
            tokio::select! {
                _ = self.token.cancelled() => break,
                Some(message) = self.health_rx.recv() => self.on_health(message).await,
                _ = tokio::time::sleep(self.interval) => debug!("coordinator health tick"),
            }
        }
        if let Some(collector) = self.current.take() {
            collector.stop();
        }
        info!("A/B health loop stopped");
    }

    async fn replace_collector(&mut self) {
        let id = self.next_id;
        self.next_id += 1;
        let collector = self.factory.create(id, self.health_tx.clone());
        collector.start();
        info!(collector = id, "collector wired into sender");
        self.use_collector(Some(Arc::clone(&collector))).await;
        self.current = Some(collector);
    }

    async fn on_health(&mut self, message: HealthMessage) {
        let Some(current) = self.current.clone() else {
            return;
        };
        if message.collector != current.id() {
            debug!(
                collector = message.collector,
                current = current.id(),
                "ignoring health report from a replaced collector"
            );
            return;
        }
        if message.is_healthy {
            self.use_collector(Some(current)).await;
        } else {
            warn!(collector = current.id(), "collector reported unhealthy, replacing it");
            self.use_collector(None).await;
            current.stop();
            self.current = None;
        }
    }

    async fn use_collector(&self, collector: Option<Arc<dyn Collector>>) {
        if self
            .control
            .send(SenderControl::UseCollector(collector))
            .await
            .is_err()
        {
            debug!("sender loop stopped, control message dropped");
        }
    }
}
