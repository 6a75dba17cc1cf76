//! Periodic reconciliation task.
//!
//! The only background work the core owns. Each tick runs
//! [`Reconciler::reconcile_all`] on the blocking pool, since the store's
//! row locks are synchronous.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

use crate::reconciler::{ReconcileSummary, Reconciler};

pub struct ReconcileScheduler {
    reconciler: Arc<Reconciler>,
    period: Duration,
}

impl ReconcileScheduler {
    /// Scheduler using the reconciler's configured interval.
    #[must_use]
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        let period = Duration::from_secs(reconciler.config().interval_secs);
        Self { reconciler, period }
    }

    #[must_use]
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Spawn the loop on the current tokio runtime. The first pass runs
    /// immediately.
    #[must_use]
    pub fn start(self) -> SchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let reconciler = self.reconciler;
        let period = self.period;

        let task = tokio::spawn(async move {
            let mut timer = interval(period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut passes = 0u64;

            info!(period_ms = period.as_millis(), "Reconciliation scheduler started");
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!(passes, "Reconciliation scheduler received shutdown signal");
                        break;
                    }
                    _ = timer.tick() => {
                        let reconciler = Arc::clone(&reconciler);
                        match tokio::task::spawn_blocking(move || reconciler.reconcile_all()).await {
                            Ok(summary) => {
                                passes += 1;
                                log_pass(passes, &summary);
                            }
                            Err(e) => error!(error = %e, "Reconciliation pass panicked"),
                        }
                    }
                }
            }
            passes
        });

        SchedulerHandle { shutdown_tx, task }
    }
}

fn log_pass(pass: u64, summary: &ReconcileSummary) {
    if summary.corrected > 0 || summary.deferred > 0 || summary.failed > 0 {
        info!(
            pass,
            corrected = summary.corrected,
            deferred = summary.deferred,
            failed = summary.failed,
            "Scheduled reconciliation found drift"
        );
    }
}

/// Handle to a running [`ReconcileScheduler`].
pub struct SchedulerHandle {
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<u64>,
}

impl SchedulerHandle {
    /// Stop the loop after the current pass and return how many passes ran.
    pub async fn shutdown(self) -> u64 {
        let _ = self.shutdown_tx.send(()).await;
        match self.task.await {
            Ok(passes) => passes,
            Err(e) => {
                error!(error = %e, "Reconciliation scheduler task failed");
                0
            }
        }
    }
}
