//! Ledger store primitives and storage backends used by the Wager runtime.

mod error;
mod memory;
mod record;
mod sqlite;
mod store;

pub use error::{LedgerError, LedgerResult};
pub use memory::MemoryLedgerStore;
pub use record::{Account, Insertion, NewTransaction, TransactionRecord, TxStatus};
pub use sqlite::SqliteLedgerStore;
pub use store::{AccountScope, LedgerStore};
