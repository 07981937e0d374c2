use std::collections::HashMap;

use chrono::Utc;
use parking_lot::Mutex;
use wager_core::{AccountKey, Amount, TransactionId};

use crate::record::{micros_to_datetime, next_created_at};
use crate::store::checked_balance;
use crate::{
    Account, AccountScope, Insertion, LedgerError, LedgerResult, LedgerStore, NewTransaction,
    TransactionRecord, TxStatus,
};

/// In-process ledger store with the same commit/rollback semantics as the
/// SQLite store.
///
/// A single mutex stands in for the account lock. A scope mutates the shared
/// state in place and records enough to undo itself when the closure fails.
#[derive(Debug, Default)]
pub struct MemoryLedgerStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    accounts: HashMap<AccountKey, Account>,
    transactions: Vec<TransactionRecord>,
    index: HashMap<TransactionId, usize>,
    last_created_at: Option<i64>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LedgerStore for MemoryLedgerStore {
    fn with_locked_account<T, E, F>(&self, key: &AccountKey, work: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn AccountScope) -> Result<T, E>,
        E: From<LedgerError>,
    {
        let mut guard = self.state.lock();
        let account = guard
            .accounts
            .get(key)
            .cloned()
            .ok_or_else(|| LedgerError::UnknownAccount(key.clone()))?;
        let mut scope = MemoryScope::begin(&mut guard, account);
        match work(&mut scope) {
            Ok(value) => {
                scope.commit();
                Ok(value)
            }
            Err(err) => {
                scope.rollback();
                Err(err)
            }
        }
    }

    fn create_account(&self, key: &AccountKey, opening_balance: Amount) -> LedgerResult<Account> {
        let mut guard = self.state.lock();
        if guard.accounts.contains_key(key) {
            return Err(LedgerError::AccountExists(key.clone()));
        }
        let account = Account {
            id: guard.accounts.len() as i64 + 1,
            routing_key: key.clone(),
            balance: opening_balance,
        };
        guard.accounts.insert(key.clone(), account.clone());
        Ok(account)
    }

    fn account(&self, key: &AccountKey) -> LedgerResult<Option<Account>> {
        Ok(self.state.lock().accounts.get(key).cloned())
    }

    fn history(&self, key: &AccountKey, limit: usize) -> LedgerResult<Vec<TransactionRecord>> {
        let guard = self.state.lock();
        let account = guard
            .accounts
            .get(key)
            .ok_or_else(|| LedgerError::UnknownAccount(key.clone()))?;
        Ok(guard.newest_first(account.id, limit, |_| true))
    }
}

impl MemoryState {
    fn newest_first(
        &self,
        account_id: i64,
        limit: usize,
        filter: impl Fn(&TransactionRecord) -> bool,
    ) -> Vec<TransactionRecord> {
        let mut rows: Vec<_> = self
            .transactions
            .iter()
            .filter(|record| record.account_id == account_id && filter(record))
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then(b.sequence.cmp(&a.sequence))
        });
        rows.truncate(limit);
        rows
    }
}

/// Locked view over the shared state plus the undo log for this scope.
struct MemoryScope<'a> {
    state: &'a mut MemoryState,
    account: Account,
    /// Rows at or past this position were appended by this scope.
    first_inserted: usize,
    /// Positions whose `cancelled` flag this scope set.
    flipped: Vec<usize>,
    last_created_at: Option<i64>,
}

impl<'a> MemoryScope<'a> {
    fn begin(state: &'a mut MemoryState, account: Account) -> Self {
        Self {
            first_inserted: state.transactions.len(),
            last_created_at: state.last_created_at,
            flipped: Vec::new(),
            state,
            account,
        }
    }

    /// The balance lives on the scope until commit; rows are already in place.
    fn commit(self) {
        let Self { state, account, .. } = self;
        state.accounts.insert(account.routing_key.clone(), account);
    }

    fn rollback(self) {
        let MemoryState {
            transactions,
            index,
            last_created_at,
            ..
        } = self.state;
        for position in self.flipped {
            if let Some(record) = transactions.get_mut(position) {
                record.cancelled = false;
            }
        }
        for record in transactions.drain(self.first_inserted..) {
            index.remove(&record.id);
        }
        *last_created_at = self.last_created_at;
    }
}

impl AccountScope for MemoryScope<'_> {
    fn account(&self) -> &Account {
        &self.account
    }

    fn transaction(&mut self, id: &TransactionId) -> LedgerResult<Option<TransactionRecord>> {
        Ok(self
            .state
            .index
            .get(id)
            .map(|&position| self.state.transactions[position].clone()))
    }

    fn insert_if_absent(&mut self, tx: &NewTransaction) -> LedgerResult<Insertion> {
        if let Some(&position) = self.state.index.get(&tx.id) {
            return Ok(Insertion::Existing(self.state.transactions[position].clone()));
        }
        let micros = next_created_at(Utc::now(), self.state.last_created_at);
        let created_at = micros_to_datetime(micros)
            .ok_or_else(|| LedgerError::InvalidState(format!("invalid created_at {micros}")))?;
        let record = TransactionRecord {
            sequence: self.state.transactions.len() as i64 + 1,
            id: tx.id.clone(),
            account_id: self.account.id,
            state: tx.state,
            amount: tx.amount,
            source: tx.source.clone(),
            status: tx.status,
            cancelled: false,
            created_at,
        };
        self.state
            .index
            .insert(tx.id.clone(), self.state.transactions.len());
        self.state.transactions.push(record.clone());
        self.state.last_created_at = Some(micros);
        Ok(Insertion::Inserted(record))
    }

    fn recent_applied(&mut self, limit: usize) -> LedgerResult<Vec<TransactionRecord>> {
        Ok(self.state.newest_first(self.account.id, limit, |record| {
            record.status == TxStatus::Applied
        }))
    }

    fn mark_cancelled(&mut self, id: &TransactionId) -> LedgerResult<bool> {
        let Some(&position) = self.state.index.get(id) else {
            return Ok(false);
        };
        let record = &mut self.state.transactions[position];
        if record.account_id != self.account.id || record.cancelled {
            return Ok(false);
        }
        record.cancelled = true;
        self.flipped.push(position);
        Ok(true)
    }

    fn adjust_balance(&mut self, delta: Amount) -> LedgerResult<Amount> {
        let balance = checked_balance(&self.account, delta)?;
        self.account.balance = balance;
        Ok(balance)
    }
}
