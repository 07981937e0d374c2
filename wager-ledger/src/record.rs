use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use wager_core::{AccountKey, Amount, TransactionId, TxState};

/// Player account as seen inside the ledger.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub routing_key: AccountKey,
    pub balance: Amount,
}

/// Whether a stored transaction moved the balance.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Applied,
    /// Terminal record of a wager refused for insufficient funds.
    Rejected,
}

impl TxStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TxStatus::Applied => "applied",
            TxStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "applied" => Ok(TxStatus::Applied),
            "rejected" => Ok(TxStatus::Rejected),
            other => Err(format!("unknown transaction status: {other}")),
        }
    }
}

/// Transaction row as persisted by a store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// Insertion sequence; breaks `created_at` ties.
    pub sequence: i64,
    pub id: TransactionId,
    pub account_id: i64,
    pub state: TxState,
    pub amount: Amount,
    pub source: String,
    pub status: TxStatus,
    pub cancelled: bool,
    pub created_at: DateTime<Utc>,
}

impl TransactionRecord {
    /// Signed balance delta this transaction produced when it was applied.
    pub fn effect(&self) -> Amount {
        match self.status {
            TxStatus::Applied => self.state.effect(self.amount),
            TxStatus::Rejected => Amount::ZERO,
        }
    }
}

/// Transaction about to be inserted; the store assigns sequence and time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewTransaction {
    pub id: TransactionId,
    pub state: TxState,
    pub amount: Amount,
    pub source: String,
    pub status: TxStatus,
}

impl NewTransaction {
    pub fn applied(
        id: TransactionId,
        state: TxState,
        amount: Amount,
        source: impl Into<String>,
    ) -> Self {
        Self {
            id,
            state,
            amount,
            source: source.into(),
            status: TxStatus::Applied,
        }
    }

    pub fn rejected(mut self) -> Self {
        self.status = TxStatus::Rejected;
        self
    }
}

/// Result of an insert-if-absent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Insertion {
    Inserted(TransactionRecord),
    /// The identifier was already known; the stored row is returned untouched.
    Existing(TransactionRecord),
}

impl Insertion {
    pub fn is_inserted(&self) -> bool {
        matches!(self, Insertion::Inserted(_))
    }

    pub fn record(&self) -> &TransactionRecord {
        match self {
            Insertion::Inserted(record) | Insertion::Existing(record) => record,
        }
    }
}

/// Next `created_at` in microseconds, strictly after `last` even if the
/// wall clock stepped backwards.
pub(crate) fn next_created_at(now: DateTime<Utc>, last: Option<i64>) -> i64 {
    let now = now.timestamp_micros();
    match last {
        Some(last) if last >= now => last + 1,
        _ => now,
    }
}

pub(crate) fn micros_to_datetime(micros: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_micros(micros)
}
