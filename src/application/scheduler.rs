use super::SettlementContext;
use super::dispatcher::{CleanupPolicy, PayoutDispatcher};
use super::reconciler::{ReconcilerConfig, SettlementReconciler};
use super::sweeper::ExpirySweeper;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior, interval};
use tracing::{error, info};

/// Cadence of the background jobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub reconcile_every: Duration,
    pub dispatch_every: Duration,
    pub sweep_every: Duration,
    /// How often the cleanup watermark is checked. The pass itself runs at
    /// most once per `CleanupPolicy::interval`.
    pub cleanup_check_every: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            reconcile_every: Duration::from_secs(45 * 60),
            dispatch_every: Duration::from_secs(60 * 60),
            sweep_every: Duration::from_secs(60 * 60),
            cleanup_check_every: Duration::from_secs(60 * 60),
        }
    }
}

/// Runs the reconciler pull sweep, dispatcher, expiry sweeper and ledger
/// cleanup on fixed intervals. Each job is its own task; a failing run is
/// logged and the job waits for its next tick.
pub struct Scheduler {
    config: SchedulerConfig,
    reconciler: Arc<SettlementReconciler>,
    dispatcher: Arc<PayoutDispatcher>,
    sweeper: Arc<ExpirySweeper>,
}

impl Scheduler {
    pub fn new(
        ctx: SettlementContext,
        config: SchedulerConfig,
        reconciler_config: ReconcilerConfig,
        cleanup_policy: CleanupPolicy,
    ) -> Self {
        Self {
            config,
            reconciler: Arc::new(SettlementReconciler::new(ctx.clone(), reconciler_config)),
            dispatcher: Arc::new(PayoutDispatcher::new(ctx.clone(), cleanup_policy)),
            sweeper: Arc::new(ExpirySweeper::new(ctx)),
        }
    }

    /// Spawns one task per job. Abort the handles to stop.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        info!(config = ?self.config, "starting settlement scheduler");

        let reconciler = self.reconciler.clone();
        let reconcile = spawn_every(self.config.reconcile_every, move || {
            let reconciler = reconciler.clone();
            async move {
                if let Err(e) = reconciler.sweep_recent().await {
                    error!(error = %e, "reconciliation sweep failed");
                }
            }
        });

        let dispatcher = self.dispatcher.clone();
        let dispatch = spawn_every(self.config.dispatch_every, move || {
            let dispatcher = dispatcher.clone();
            async move {
                dispatcher.run().await;
            }
        });

        let sweeper = self.sweeper.clone();
        let sweep = spawn_every(self.config.sweep_every, move || {
            let sweeper = sweeper.clone();
            async move {
                if let Err(e) = sweeper.run().await {
                    error!(error = %e, "expiry sweep failed");
                }
            }
        });

        let dispatcher = self.dispatcher.clone();
        let cleanup = spawn_every(self.config.cleanup_check_every, move || {
            let dispatcher = dispatcher.clone();
            async move {
                if let Err(e) = dispatcher.cleanup_if_due().await {
                    error!(error = %e, "ledger cleanup failed");
                }
            }
        });

        vec![reconcile, dispatch, sweep, cleanup]
    }
}

fn spawn_every<F, Fut>(period: Duration, mut job: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            job().await;
        }
    })
}
