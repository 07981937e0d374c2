use thiserror::Error;
use wager_core::AccountKey;

/// Result alias for ledger operations.
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Error type surfaced by ledger store operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("account {0} not found")]
    UnknownAccount(AccountKey),
    #[error("account {0} already exists")]
    AccountExists(AccountKey),
    #[error("balance overflow while applying {0}")]
    Overflow(String),
    #[error("invalid ledger state: {0}")]
    InvalidState(String),
}

impl From<rusqlite::Error> for LedgerError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Storage(value.to_string())
    }
}

impl From<std::io::Error> for LedgerError {
    fn from(value: std::io::Error) -> Self {
        Self::Storage(value.to_string())
    }
}
