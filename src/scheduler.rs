//! Periodic target refresh
//!
//! Re-reads the desired targets every [`REFRESH_INTERVAL`] and reconciles the
//! active collector set against them. A failed cycle is logged and the loop
//! keeps going; the next cycle retries with a fresh read.

use crate::adapter::RegistryAdapter;
use crate::config::load_config;
use crate::reconcile::{ReconcileReport, Reconciler};
use crate::target::Target;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Time between two refresh cycles
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(10);

/// Where the desired target list comes from
pub trait TargetSource: Send + Sync + 'static {
    fn load(&self) -> Result<Vec<Target>>;
}

/// Reads targets from the exporter configuration file on every call
#[derive(Debug, Clone)]
pub struct ConfigFileSource {
    path: PathBuf,
}

impl ConfigFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl TargetSource for ConfigFileSource {
    fn load(&self) -> Result<Vec<Target>> {
        let config = load_config(&self.path)?;
        // Malformed lines were already reported while parsing
        let (targets, _skipped) = config.targets();
        Ok(targets)
    }
}

/// Outcome counters of the refresh loop
#[derive(Debug, Default)]
pub struct RefreshStats {
    cycles: AtomicU64,
    failures: AtomicU64,
}

impl RefreshStats {
    /// Completed cycles, failed ones included
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    fn record(&self, success: bool) {
        if !success {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        self.cycles.fetch_add(1, Ordering::Relaxed);
    }
}

/// Handle to a running refresh loop
///
/// Dropping the handle also ends the loop, after the cycle in progress.
pub struct SchedulerHandle {
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
    stats: Arc<RefreshStats>,
}

impl SchedulerHandle {
    pub fn stats(&self) -> Arc<RefreshStats> {
        Arc::clone(&self.stats)
    }

    /// Signal the loop to stop and wait for it to exit
    pub async fn stop(self) {
        // The loop may already be gone, which is what we want anyway
        let _ = self.stop_tx.send(());
        if let Err(e) = self.task.await {
            warn!("Refresh task ended abnormally: {}", e);
        }
    }
}

pub struct RefreshScheduler;

impl RefreshScheduler {
    /// Start the refresh loop. The first cycle runs one `period` from now.
    pub fn spawn<A, S>(engine: Arc<Reconciler<A>>, source: S, period: Duration) -> SchedulerHandle
    where
        A: RegistryAdapter + 'static,
        S: TargetSource,
    {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let stats = Arc::new(RefreshStats::default());
        let task_stats = Arc::clone(&stats);
        let source = Arc::new(source);

        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!("Refresh interval: {:?}", period);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match refresh_once(&engine, &source).await {
                            Ok(report) => {
                                if report.changed() {
                                    info!(
                                        "Targets refreshed: {} added, {} replaced, {} removed",
                                        report.added, report.replaced, report.removed
                                    );
                                }
                                task_stats.record(true);
                            }
                            Err(e) => {
                                error!("Error refreshing targets: {:#}", e);
                                task_stats.record(false);
                            }
                        }
                    }

                    _ = &mut stop_rx => {
                        debug!("Refresh loop stopped");
                        break;
                    }
                }
            }
        });

        SchedulerHandle {
            stop_tx,
            task,
            stats,
        }
    }
}

/// One load-and-reconcile cycle, run on the blocking pool
pub async fn refresh_once<A, S>(engine: &Arc<Reconciler<A>>, source: &Arc<S>) -> Result<ReconcileReport>
where
    A: RegistryAdapter + 'static,
    S: TargetSource,
{
    let engine = Arc::clone(engine);
    let source = Arc::clone(source);

    tokio::task::spawn_blocking(move || {
        let desired = source.load().context("failed to load targets")?;
        let report = engine.reconcile(&desired)?;
        Ok(report)
    })
    .await
    .context("refresh task panicked")?
}
