use wager_core::{AccountKey, Amount, TransactionId};

use crate::{Account, Insertion, LedgerError, LedgerResult, NewTransaction, TransactionRecord};

/// Abstraction over durable ledger storage engines.
///
/// Every balance mutation goes through [`LedgerStore::with_locked_account`]:
/// the account is locked, read, handed to the closure, and the whole store
/// transaction commits only if the closure returns `Ok`. Any `Err` (or a
/// failed commit) leaves the ledger exactly as it was.
pub trait LedgerStore: Send + Sync {
    /// Run `work` against `key` while holding the account's write lock.
    fn with_locked_account<T, E, F>(&self, key: &AccountKey, work: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn AccountScope) -> Result<T, E>,
        E: From<LedgerError>;

    /// Provision an account. Accounts are never created by ingestion.
    fn create_account(&self, key: &AccountKey, opening_balance: Amount) -> LedgerResult<Account>;

    /// Unlocked point read of an account.
    fn account(&self, key: &AccountKey) -> LedgerResult<Option<Account>>;

    /// Most recent transactions of an account, rejected ones included,
    /// newest first.
    fn history(&self, key: &AccountKey, limit: usize) -> LedgerResult<Vec<TransactionRecord>>;
}

/// Operations available while an account is locked.
pub trait AccountScope {
    /// Account as read under the lock, kept current by [`adjust_balance`].
    ///
    /// [`adjust_balance`]: AccountScope::adjust_balance
    fn account(&self) -> &Account;

    /// Look up a transaction by identifier, whichever account it belongs to.
    fn transaction(&mut self, id: &TransactionId) -> LedgerResult<Option<TransactionRecord>>;

    /// Insert a transaction unless its identifier already exists.
    fn insert_if_absent(&mut self, tx: &NewTransaction) -> LedgerResult<Insertion>;

    /// Latest `limit` applied transactions of the locked account, ordered by
    /// `created_at` then insertion sequence, newest first.
    fn recent_applied(&mut self, limit: usize) -> LedgerResult<Vec<TransactionRecord>>;

    /// Flip `cancelled` to true. Returns false if it was already set.
    fn mark_cancelled(&mut self, id: &TransactionId) -> LedgerResult<bool>;

    /// Add a signed delta to the balance and return the new balance.
    fn adjust_balance(&mut self, delta: Amount) -> LedgerResult<Amount>;
}

pub(crate) fn checked_balance(account: &Account, delta: Amount) -> LedgerResult<Amount> {
    account.balance.checked_add(delta).ok_or_else(|| {
        LedgerError::Overflow(format!(
            "delta {} to account {}",
            delta.raw(),
            account.routing_key
        ))
    })
}
