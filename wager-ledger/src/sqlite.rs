use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use tracing::debug;
use wager_core::{AccountKey, Amount, TransactionId, TxState};

use crate::record::{micros_to_datetime, next_created_at};
use crate::store::checked_balance;
use crate::{
    Account, AccountScope, Insertion, LedgerError, LedgerResult, LedgerStore, NewTransaction,
    TransactionRecord, TxStatus,
};

const LEDGER_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS account (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    routing_key TEXT NOT NULL UNIQUE,
    balance INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS ledger_transaction (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    transaction_id TEXT NOT NULL UNIQUE,
    account_id INTEGER NOT NULL REFERENCES account(id),
    state TEXT NOT NULL CHECK (state IN ('win', 'lose')),
    amount INTEGER NOT NULL CHECK (amount >= 0),
    source TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'applied' CHECK (status IN ('applied', 'rejected')),
    cancelled INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS ledger_transaction_idx_account_created
    ON ledger_transaction(account_id, created_at DESC, seq DESC);
"#;

/// Ordering only matters within an account; served by the account index.
const LAST_CREATED_AT_SQL: &str =
    "SELECT MAX(created_at) FROM ledger_transaction WHERE account_id = ?1";

const TRANSACTION_COLUMNS: &str =
    "seq, transaction_id, account_id, state, amount, source, status, cancelled, created_at";

/// SQLite-backed ledger store.
///
/// SQLite has no row locks; the account lock is the database write lock taken
/// by `BEGIN IMMEDIATE`, which serializes every writer on the file. Waiting
/// writers block for up to `busy_timeout` before failing.
#[derive(Clone, Debug)]
pub struct SqliteLedgerStore {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteLedgerStore {
    pub fn new(path: impl Into<PathBuf>, busy_timeout: Duration) -> LedgerResult<Self> {
        let store = Self {
            path: path.into(),
            busy_timeout,
        };
        store.initialize_schema()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn initialize_schema(&self) -> LedgerResult<()> {
        let conn = self.connect()?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.execute_batch(LEDGER_SCHEMA)?;
        debug!(path = %self.path.display(), "ledger schema ready");
        Ok(())
    }

    fn connect(&self) -> LedgerResult<Connection> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(self.busy_timeout)?;
        conn.execute_batch("PRAGMA synchronous = NORMAL; PRAGMA foreign_keys = ON;")?;
        Ok(conn)
    }
}

impl LedgerStore for SqliteLedgerStore {
    fn with_locked_account<T, E, F>(&self, key: &AccountKey, work: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn AccountScope) -> Result<T, E>,
        E: From<LedgerError>,
    {
        let mut conn = self.connect()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(LedgerError::from)?;
        let account =
            load_account(&tx, key)?.ok_or_else(|| LedgerError::UnknownAccount(key.clone()))?;
        let value = {
            let mut scope = SqliteScope {
                conn: &tx,
                account,
            };
            work(&mut scope)?
        };
        tx.commit().map_err(LedgerError::from)?;
        Ok(value)
    }

    fn create_account(&self, key: &AccountKey, opening_balance: Amount) -> LedgerResult<Account> {
        let conn = self.connect()?;
        let result = conn.execute(
            "INSERT INTO account (routing_key, balance) VALUES (?1, ?2)",
            params![key.as_str(), opening_balance.raw()],
        );
        match result {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                return Err(LedgerError::AccountExists(key.clone()));
            }
            Err(err) => return Err(err.into()),
        }
        debug!(account = %key, balance = %opening_balance, "account created");
        Ok(Account {
            id: conn.last_insert_rowid(),
            routing_key: key.clone(),
            balance: opening_balance,
        })
    }

    fn account(&self, key: &AccountKey) -> LedgerResult<Option<Account>> {
        let conn = self.connect()?;
        load_account(&conn, key)
    }

    fn history(&self, key: &AccountKey, limit: usize) -> LedgerResult<Vec<TransactionRecord>> {
        let conn = self.connect()?;
        let Some(account) = load_account(&conn, key)? else {
            return Err(LedgerError::UnknownAccount(key.clone()));
        };
        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM ledger_transaction
             WHERE account_id = ?1
             ORDER BY created_at DESC, seq DESC
             LIMIT ?2"
        );
        query_records(&conn, &sql, account.id, limit)
    }
}

struct SqliteScope<'a> {
    conn: &'a Connection,
    account: Account,
}

impl AccountScope for SqliteScope<'_> {
    fn account(&self) -> &Account {
        &self.account
    }

    fn transaction(&mut self, id: &TransactionId) -> LedgerResult<Option<TransactionRecord>> {
        find_transaction(self.conn, id)
    }

    fn insert_if_absent(&mut self, tx: &NewTransaction) -> LedgerResult<Insertion> {
        let last: Option<i64> = self.conn.query_row(
            LAST_CREATED_AT_SQL,
            params![self.account.id],
            |row| row.get(0),
        )?;
        let created_at = next_created_at(Utc::now(), last);
        let inserted = self.conn.execute(
            "INSERT INTO ledger_transaction (
                transaction_id, account_id, state, amount, source, status, cancelled, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)
             ON CONFLICT(transaction_id) DO NOTHING",
            params![
                tx.id.as_str(),
                self.account.id,
                tx.state.as_str(),
                tx.amount.raw(),
                tx.source,
                tx.status.as_str(),
                created_at
            ],
        )?;
        let record = find_transaction(self.conn, &tx.id)?.ok_or_else(|| {
            LedgerError::InvalidState(format!("transaction {} missing after insert", tx.id))
        })?;
        if inserted == 1 {
            Ok(Insertion::Inserted(record))
        } else {
            Ok(Insertion::Existing(record))
        }
    }

    fn recent_applied(&mut self, limit: usize) -> LedgerResult<Vec<TransactionRecord>> {
        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM ledger_transaction
             WHERE account_id = ?1 AND status = 'applied'
             ORDER BY created_at DESC, seq DESC
             LIMIT ?2"
        );
        query_records(self.conn, &sql, self.account.id, limit)
    }

    fn mark_cancelled(&mut self, id: &TransactionId) -> LedgerResult<bool> {
        let updated = self.conn.execute(
            "UPDATE ledger_transaction SET cancelled = 1
             WHERE transaction_id = ?1 AND account_id = ?2 AND cancelled = 0",
            params![id.as_str(), self.account.id],
        )?;
        Ok(updated == 1)
    }

    fn adjust_balance(&mut self, delta: Amount) -> LedgerResult<Amount> {
        let balance = checked_balance(&self.account, delta)?;
        let updated = self.conn.execute(
            "UPDATE account SET balance = ?1 WHERE id = ?2",
            params![balance.raw(), self.account.id],
        )?;
        if updated != 1 {
            return Err(LedgerError::InvalidState(format!(
                "account {} disappeared while locked",
                self.account.routing_key
            )));
        }
        self.account.balance = balance;
        Ok(balance)
    }
}

fn load_account(conn: &Connection, key: &AccountKey) -> LedgerResult<Option<Account>> {
    let row = conn
        .query_row(
            "SELECT id, routing_key, balance FROM account WHERE routing_key = ?1",
            params![key.as_str()],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            },
        )
        .optional()?;
    Ok(row.map(|(id, routing_key, balance)| Account {
        id,
        routing_key: AccountKey::from(routing_key),
        balance: Amount::from_raw(balance),
    }))
}

fn find_transaction(conn: &Connection, id: &TransactionId) -> LedgerResult<Option<TransactionRecord>> {
    let sql = format!("SELECT {TRANSACTION_COLUMNS} FROM ledger_transaction WHERE transaction_id = ?1");
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params![id.as_str()])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_record(row)?)),
        None => Ok(None),
    }
}

fn query_records(
    conn: &Connection,
    sql: &str,
    account_id: i64,
    limit: usize,
) -> LedgerResult<Vec<TransactionRecord>> {
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params![account_id, limit])?;
    let mut records = Vec::new();
    while let Some(row) = rows.next()? {
        records.push(row_to_record(row)?);
    }
    Ok(records)
}

fn row_to_record(row: &rusqlite::Row<'_>) -> LedgerResult<TransactionRecord> {
    let sequence: i64 = row.get(0)?;
    let transaction_id: String = row.get(1)?;
    let account_id: i64 = row.get(2)?;
    let state_str: String = row.get(3)?;
    let amount: i64 = row.get(4)?;
    let source: String = row.get(5)?;
    let status_str: String = row.get(6)?;
    let cancelled: bool = row.get(7)?;
    let created_at_micros: i64 = row.get(8)?;

    let state = TxState::from_str(&state_str)
        .map_err(|err| LedgerError::Serialization(err.to_string()))?;
    let status = TxStatus::from_str(&status_str).map_err(LedgerError::Serialization)?;
    let created_at = micros_to_datetime(created_at_micros).ok_or_else(|| {
        LedgerError::Serialization(format!("invalid created_at {created_at_micros}"))
    })?;

    Ok(TransactionRecord {
        sequence,
        id: TransactionId::from(transaction_id),
        account_id,
        state,
        amount: Amount::from_raw(amount),
        source,
        status,
        cancelled,
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store(dir: &tempfile::TempDir) -> SqliteLedgerStore {
        SqliteLedgerStore::new(dir.path().join("ledger.db"), Duration::from_secs(5)).unwrap()
    }

    fn win(id: &str, raw: i64) -> NewTransaction {
        NewTransaction::applied(TransactionId::from(id), TxState::Win, Amount::from_raw(raw), "game")
    }

    #[test]
    fn insert_if_absent_keeps_first_row() {
        let dir = tempdir().unwrap();
        let store = store(&dir);
        let key = AccountKey::from("1");
        store.create_account(&key, Amount::ZERO).unwrap();

        let first = store
            .with_locked_account(&key, |scope| scope.insert_if_absent(&win("t-1", 1_000)))
            .unwrap();
        assert!(first.is_inserted());

        let second = store
            .with_locked_account(&key, |scope| scope.insert_if_absent(&win("t-1", 9_000)))
            .unwrap();
        assert!(!second.is_inserted());
        assert_eq!(second.record().amount.raw(), 1_000);
        assert_eq!(second.record().sequence, first.record().sequence);
    }

    #[test]
    fn failed_scope_rolls_back_everything() {
        let dir = tempdir().unwrap();
        let store = store(&dir);
        let key = AccountKey::from("1");
        store.create_account(&key, Amount::ZERO).unwrap();

        let result: LedgerResult<()> = store.with_locked_account(&key, |scope| {
            scope.insert_if_absent(&win("t-1", 1_000))?;
            scope.adjust_balance(Amount::from_raw(1_000))?;
            Err(LedgerError::InvalidState("abort".into()))
        });
        assert!(result.is_err());
        assert_eq!(store.account(&key).unwrap().unwrap().balance, Amount::ZERO);
        assert!(store.history(&key, 10).unwrap().is_empty());
    }

    #[test]
    fn unknown_account_is_reported() {
        let dir = tempdir().unwrap();
        let store = store(&dir);
        let err = store
            .with_locked_account(&AccountKey::from("nobody"), |scope| {
                Ok::<_, LedgerError>(scope.account().balance)
            })
            .unwrap_err();
        assert!(matches!(err, LedgerError::UnknownAccount(_)));
    }

    #[test]
    fn duplicate_account_is_rejected() {
        let dir = tempdir().unwrap();
        let store = store(&dir);
        let key = AccountKey::from("1");
        store.create_account(&key, Amount::ZERO).unwrap();
        let err = store.create_account(&key, Amount::ZERO).unwrap_err();
        assert!(matches!(err, LedgerError::AccountExists(_)));
    }

    #[test]
    fn recent_applied_skips_rejections_and_orders_newest_first() {
        let dir = tempdir().unwrap();
        let store = store(&dir);
        let key = AccountKey::from("1");
        store.create_account(&key, Amount::ZERO).unwrap();
        store
            .with_locked_account(&key, |scope| {
                scope.insert_if_absent(&win("a", 1))?;
                scope.insert_if_absent(&win("b", 2).rejected())?;
                scope.insert_if_absent(&win("c", 3))?;
                Ok::<_, LedgerError>(())
            })
            .unwrap();
        let recent = store
            .with_locked_account(&key, |scope| scope.recent_applied(10))
            .unwrap();
        let ids: Vec<_> = recent.iter().map(|r| r.id.as_str().to_string()).collect();
        assert_eq!(ids, vec!["c", "a"]);
        assert_eq!(store.history(&key, 10).unwrap().len(), 3);
    }

    #[test]
    fn mark_cancelled_flips_once() {
        let dir = tempdir().unwrap();
        let store = store(&dir);
        let key = AccountKey::from("1");
        store.create_account(&key, Amount::ZERO).unwrap();
        let id = TransactionId::from("a");
        let flips = store
            .with_locked_account(&key, |scope| {
                scope.insert_if_absent(&win("a", 1))?;
                let first = scope.mark_cancelled(&id)?;
                let second = scope.mark_cancelled(&id)?;
                Ok::<_, LedgerError>((first, second))
            })
            .unwrap();
        assert_eq!(flips, (true, false));
        assert!(store.history(&key, 1).unwrap()[0].cancelled);
    }

    #[test]
    fn latest_timestamp_lookup_uses_account_index() {
        let dir = tempdir().unwrap();
        let store = store(&dir);
        let conn = store.connect().unwrap();
        let mut stmt = conn
            .prepare(&format!("EXPLAIN QUERY PLAN {LAST_CREATED_AT_SQL}"))
            .unwrap();
        let details: Vec<String> = stmt
            .query_map(params![1_i64], |row| row.get::<_, String>(3))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert!(
            details
                .iter()
                .any(|detail| detail.contains("ledger_transaction_idx_account_created")),
            "{details:?}"
        );
        assert!(!details.iter().any(|detail| detail.starts_with("SCAN")), "{details:?}");
    }

    #[test]
    fn transaction_lookup_finds_rows_by_id() {
        let dir = tempdir().unwrap();
        let store = store(&dir);
        let key = AccountKey::from("1");
        store.create_account(&key, Amount::ZERO).unwrap();
        let (missing, found) = store
            .with_locked_account(&key, |scope| {
                let missing = scope.transaction(&TransactionId::from("a"))?;
                scope.insert_if_absent(&win("a", 7))?;
                let found = scope.transaction(&TransactionId::from("a"))?;
                Ok::<_, LedgerError>((missing, found))
            })
            .unwrap();
        assert!(missing.is_none());
        assert_eq!(found.unwrap().amount.raw(), 7);
    }
}
