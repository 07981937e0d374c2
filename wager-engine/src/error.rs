use thiserror::Error;
use wager_core::{Amount, AmountError, UnsupportedState};
use wager_ledger::LedgerError;

/// Request problems detected before any store work happens.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("transaction id must not be empty")]
    EmptyTransactionId,
    #[error(transparent)]
    Amount(#[from] AmountError),
    #[error(transparent)]
    State(#[from] UnsupportedState),
    #[error("source type {0:?} is not supported")]
    UnsupportedSource(String),
}

/// Failure of a single ingestion call.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("insufficient funds: balance {available}, stake {required}")]
    InsufficientFunds { available: Amount, required: Amount },
    #[error(transparent)]
    Store(#[from] LedgerError),
}

impl IngestError {
    /// Whether the caller is at fault and the request should not be retried
    /// as-is.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            IngestError::Validation(_) | IngestError::InsufficientFunds { .. }
        )
    }
}
