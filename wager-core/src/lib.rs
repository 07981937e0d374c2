//! Core domain types shared by the Wager ledger crates.

mod amount;
mod types;

pub use amount::{Amount, AmountError, AMOUNT_SCALE};
pub use types::{AccountKey, TransactionId, TxState, UnsupportedState};
