use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{self, JoinHandle};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use wager_config::ReconciliationConfig;
use wager_core::AccountKey;
use wager_ledger::LedgerStore;

use crate::{ReconcileReport, Reconciler};

/// Periodically reconciles a set of accounts, one task per account.
///
/// Ticks of the same account run strictly one after another: a tick that
/// outlives the interval delays the next one and missed ticks are skipped.
pub struct ReconciliationScheduler<S> {
    reconciler: Arc<Reconciler<S>>,
    accounts: Vec<AccountKey>,
    period: Duration,
    window: usize,
}

impl<S: LedgerStore + 'static> ReconciliationScheduler<S> {
    pub fn new(store: Arc<S>, accounts: Vec<AccountKey>, period: Duration, window: usize) -> Self {
        Self {
            reconciler: Arc::new(Reconciler::new(store)),
            accounts,
            period,
            window,
        }
    }

    pub fn from_config(store: Arc<S>, accounts: Vec<AccountKey>, config: &ReconciliationConfig) -> Self {
        Self::new(store, accounts, config.interval(), config.window)
    }

    /// Spawn the per-account loops on the current tokio runtime.
    ///
    /// The first tick fires one full period after start.
    pub fn start(self) -> SchedulerHandle {
        let Self {
            reconciler,
            accounts,
            period,
            window,
        } = self;
        let (shutdown, signal) = watch::channel(false);
        let tasks = accounts
            .into_iter()
            .map(|account| {
                info!(
                    account = %account,
                    interval_ms = period.as_millis() as u64,
                    window,
                    "starting reconciliation schedule"
                );
                tokio::spawn(run_schedule(
                    Arc::clone(&reconciler),
                    account,
                    period,
                    window,
                    signal.clone(),
                ))
            })
            .collect();
        SchedulerHandle { shutdown, tasks }
    }
}

/// Running scheduler. Dropping the handle also stops the loops.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Signal every loop to exit and wait for in-flight ticks to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "reconciliation task ended abnormally");
            }
        }
        info!("reconciliation scheduler stopped");
    }
}

async fn run_schedule<S: LedgerStore + 'static>(
    reconciler: Arc<Reconciler<S>>,
    account: AccountKey,
    period: Duration,
    window: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                run_tick(&reconciler, &account, window).await;
            }
        }
    }
    debug!(account = %account, "reconciliation schedule exited");
}

/// One tick. Failures are logged and left for the next tick to make up.
async fn run_tick<S: LedgerStore + 'static>(
    reconciler: &Arc<Reconciler<S>>,
    account: &AccountKey,
    window: usize,
) -> Option<ReconcileReport> {
    let worker = Arc::clone(reconciler);
    let key = account.clone();
    match task::spawn_blocking(move || worker.reconcile_window(&key, window)).await {
        Ok(Ok(report)) => {
            if report.is_noop() {
                debug!(
                    account = %account,
                    examined = report.examined,
                    "reconciliation tick found nothing to cancel"
                );
            } else {
                info!(
                    account = %account,
                    cancelled = report.cancelled.len(),
                    delta = %report.delta,
                    balance = %report.balance,
                    "reconciliation tick reversed transactions"
                );
            }
            Some(report)
        }
        Ok(Err(err)) => {
            error!(account = %account, error = %err, "reconciliation tick failed");
            None
        }
        Err(err) => {
            error!(account = %account, error = %err, "reconciliation tick panicked");
            None
        }
    }
}
