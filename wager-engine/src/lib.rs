//! Ledger mutation logic: idempotent wager ingestion and the windowed
//! reconciliation job, generic over any [`wager_ledger::LedgerStore`].

mod error;
mod ingest;
mod reconcile;
mod scheduler;

pub use error::{IngestError, ValidationError};
pub use ingest::{IngestOutcome, IngestionService, TransactionRequest};
pub use reconcile::{ReconcileReport, Reconciler};
pub use scheduler::{ReconciliationScheduler, SchedulerHandle};
