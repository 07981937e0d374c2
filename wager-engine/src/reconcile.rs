use std::sync::Arc;

use wager_core::{AccountKey, Amount, TransactionId};
use wager_ledger::{LedgerError, LedgerResult, LedgerStore};

/// Summary of one reconciliation pass over an account.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconcileReport {
    pub account: AccountKey,
    /// Transactions read from the window, cancelled ones included.
    pub examined: usize,
    /// Transactions reversed by this pass, newest first.
    pub cancelled: Vec<TransactionId>,
    /// Net balance change applied.
    pub delta: Amount,
    /// Balance after the pass.
    pub balance: Amount,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.cancelled.is_empty()
    }
}

/// Reverses the trailing window of an account's applied transactions.
pub struct Reconciler<S> {
    store: Arc<S>,
}

impl<S: LedgerStore> Reconciler<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Cancel every not-yet-cancelled transaction among the `window` most
    /// recent ones and undo their balance effect in one update.
    ///
    /// Runs under the same account lock as ingestion. Re-running over an
    /// overlapping window never reverses a transaction twice.
    pub fn reconcile_window(&self, key: &AccountKey, window: usize) -> LedgerResult<ReconcileReport> {
        self.store.with_locked_account(key, |scope| {
            let recent = scope.recent_applied(window)?;
            let mut delta = Amount::ZERO;
            let mut cancelled = Vec::new();
            for record in recent.iter().filter(|record| !record.cancelled) {
                delta = delta
                    .checked_add(record.state.reversal(record.amount))
                    .ok_or_else(|| LedgerError::Overflow(format!("reversal of {}", record.id)))?;
                if !scope.mark_cancelled(&record.id)? {
                    return Err(LedgerError::InvalidState(format!(
                        "transaction {} was cancelled concurrently",
                        record.id
                    )));
                }
                cancelled.push(record.id.clone());
            }
            let balance = if cancelled.is_empty() {
                scope.account().balance
            } else {
                scope.adjust_balance(delta)?
            };
            Ok(ReconcileReport {
                account: key.clone(),
                examined: recent.len(),
                cancelled,
                delta,
                balance,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wager_core::TxState;
    use wager_ledger::{MemoryLedgerStore, NewTransaction};

    fn seeded(opening: i64, wagers: &[(&str, TxState, i64)]) -> Arc<MemoryLedgerStore> {
        let store = Arc::new(MemoryLedgerStore::new());
        let key = AccountKey::from("1");
        store
            .create_account(&key, Amount::from_raw(opening))
            .unwrap();
        for (id, state, raw) in wagers {
            store
                .with_locked_account(&key, |scope| {
                    let tx = NewTransaction::applied(
                        TransactionId::from(*id),
                        *state,
                        Amount::from_raw(*raw),
                        "game",
                    );
                    scope.insert_if_absent(&tx)?;
                    scope.adjust_balance(state.effect(Amount::from_raw(*raw)))
                })
                .unwrap();
        }
        store
    }

    #[test]
    fn reverses_window_in_one_update() {
        let store = seeded(
            1_000,
            &[
                ("a", TxState::Win, 5_000),
                ("b", TxState::Lose, 2_000),
                ("c", TxState::Win, 300),
            ],
        );
        let key = AccountKey::from("1");
        let reconciler = Reconciler::new(Arc::clone(&store));
        let report = reconciler.reconcile_window(&key, 10).unwrap();
        assert_eq!(report.examined, 3);
        assert_eq!(report.delta.raw(), -3_300);
        assert_eq!(report.balance.raw(), 1_000);
        let ids: Vec<_> = report.cancelled.iter().map(|id| id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);
        assert!(store.history(&key, 10).unwrap().iter().all(|r| r.cancelled));
    }

    #[test]
    fn second_pass_is_a_no_op() {
        let store = seeded(0, &[("a", TxState::Win, 5_000)]);
        let key = AccountKey::from("1");
        let reconciler = Reconciler::new(Arc::clone(&store));
        reconciler.reconcile_window(&key, 10).unwrap();
        let again = reconciler.reconcile_window(&key, 10).unwrap();
        assert!(again.is_noop());
        assert_eq!(again.examined, 1);
        assert_eq!(again.balance, Amount::ZERO);
    }

    #[test]
    fn window_limits_to_most_recent() {
        let store = seeded(
            0,
            &[
                ("old", TxState::Win, 1_000),
                ("mid", TxState::Win, 2_000),
                ("new", TxState::Win, 4_000),
            ],
        );
        let key = AccountKey::from("1");
        let reconciler = Reconciler::new(Arc::clone(&store));
        let report = reconciler.reconcile_window(&key, 2).unwrap();
        assert_eq!(report.balance.raw(), 1_000);
        let old = store
            .history(&key, 10)
            .unwrap()
            .into_iter()
            .find(|r| r.id.as_str() == "old")
            .unwrap();
        assert!(!old.cancelled);
    }

    #[test]
    fn unknown_account_fails() {
        let store = Arc::new(MemoryLedgerStore::new());
        let reconciler = Reconciler::new(store);
        let err = reconciler
            .reconcile_window(&AccountKey::from("ghost"), 10)
            .unwrap_err();
        assert!(matches!(err, LedgerError::UnknownAccount(_)));
    }
}
