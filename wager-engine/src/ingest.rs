use std::sync::Arc;

use tracing::{debug, info, warn};
use wager_config::{LedgerConfig, RejectionPolicy};
use wager_core::{AccountKey, Amount, TransactionId, TxState};
use wager_ledger::{Insertion, LedgerError, LedgerStore, NewTransaction, TxStatus};

use crate::{IngestError, ValidationError};

/// Raw inbound wager, exactly as the transport decoded it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionRequest {
    pub account: AccountKey,
    pub transaction_id: String,
    pub state: String,
    pub amount: String,
    pub source: String,
}

/// Successful ingestion result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IngestOutcome {
    /// First sighting of the identifier; the balance moved.
    Applied { balance: Amount },
    /// The identifier was already applied; nothing changed.
    Replayed,
}

/// Request fields that are checked before the store is touched.
#[derive(Clone, Debug)]
struct Stake {
    id: TransactionId,
    amount: Amount,
}

enum Decision {
    Applied {
        state: TxState,
        balance: Amount,
    },
    Replayed,
    Rejected {
        available: Amount,
        required: Amount,
        replay: bool,
    },
}

/// Applies wagers to accounts, at most once per transaction identifier.
pub struct IngestionService<S> {
    store: Arc<S>,
    config: LedgerConfig,
}

impl<S: LedgerStore> IngestionService<S> {
    pub fn new(store: Arc<S>, config: LedgerConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Account used when the transport does not name one.
    pub fn default_account(&self) -> AccountKey {
        AccountKey::from(self.config.account_key.as_str())
    }

    /// Validate and apply one wager inside a single locked store transaction.
    ///
    /// Replays of a known identifier succeed without touching the balance,
    /// whatever amount, state or source they carry. State and source are
    /// only checked on the first sighting of an identifier.
    pub fn apply(&self, request: &TransactionRequest) -> Result<IngestOutcome, IngestError> {
        let stake = self.validate(request)?;
        let policy = self.config.rejections;

        let decision = self
            .store
            .with_locked_account(&request.account, |scope| -> Result<Decision, IngestError> {
                let available = scope.account().balance;
                if let Some(existing) = scope.transaction(&stake.id)? {
                    return Ok(match existing.status {
                        TxStatus::Applied => Decision::Replayed,
                        TxStatus::Rejected => Decision::Rejected {
                            available,
                            required: existing.amount,
                            replay: true,
                        },
                    });
                }

                let state: TxState = request.state.parse().map_err(ValidationError::from)?;
                if !self.config.source_allowed(&request.source) {
                    return Err(ValidationError::UnsupportedSource(request.source.clone()).into());
                }
                let insufficient = state == TxState::Lose && available < stake.amount;
                let mut record = NewTransaction::applied(
                    stake.id.clone(),
                    state,
                    stake.amount,
                    request.source.clone(),
                );
                if insufficient && policy == RejectionPolicy::Persist {
                    record = record.rejected();
                }

                match scope.insert_if_absent(&record)? {
                    Insertion::Existing(existing) => Err(LedgerError::InvalidState(format!(
                        "transaction {} appeared while the account was locked",
                        existing.id
                    ))
                    .into()),
                    Insertion::Inserted(inserted) if insufficient => match policy {
                        // the Err unwinds the insert together with everything else
                        RejectionPolicy::Rollback => Err(IngestError::InsufficientFunds {
                            available,
                            required: inserted.amount,
                        }),
                        RejectionPolicy::Persist => Ok(Decision::Rejected {
                            available,
                            required: inserted.amount,
                            replay: false,
                        }),
                    },
                    Insertion::Inserted(inserted) => {
                        let balance = scope.adjust_balance(inserted.effect())?;
                        Ok(Decision::Applied { state, balance })
                    }
                }
            })
            .inspect_err(|err| match err {
                IngestError::InsufficientFunds { available, required } => warn!(
                    account = %request.account,
                    transaction_id = %stake.id,
                    balance = %available,
                    stake = %required,
                    "lose rejected for insufficient funds"
                ),
                IngestError::Validation(reason) => debug!(
                    account = %request.account,
                    transaction_id = %stake.id,
                    error = %reason,
                    "new transaction refused"
                ),
                IngestError::Store(_) => {}
            })?;

        match decision {
            Decision::Applied { state, balance } => {
                info!(
                    account = %request.account,
                    transaction_id = %stake.id,
                    state = %state,
                    amount = %stake.amount,
                    source = %request.source,
                    balance = %balance,
                    "transaction applied"
                );
                Ok(IngestOutcome::Applied { balance })
            }
            Decision::Replayed => {
                debug!(
                    account = %request.account,
                    transaction_id = %stake.id,
                    "transaction already processed"
                );
                Ok(IngestOutcome::Replayed)
            }
            Decision::Rejected {
                available,
                required,
                replay,
            } => {
                warn!(
                    account = %request.account,
                    transaction_id = %stake.id,
                    balance = %available,
                    stake = %required,
                    replay,
                    "lose rejected for insufficient funds"
                );
                Err(IngestError::InsufficientFunds {
                    available,
                    required,
                })
            }
        }
    }

    fn validate(&self, request: &TransactionRequest) -> Result<Stake, ValidationError> {
        let amount = Amount::parse(&request.amount)?;
        if request.transaction_id.is_empty() {
            return Err(ValidationError::EmptyTransactionId);
        }
        Ok(Stake {
            id: TransactionId::from(request.transaction_id.as_str()),
            amount,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wager_ledger::MemoryLedgerStore;

    fn service(config: LedgerConfig) -> IngestionService<MemoryLedgerStore> {
        let store = Arc::new(MemoryLedgerStore::new());
        store
            .create_account(&AccountKey::from("1"), Amount::ZERO)
            .unwrap();
        IngestionService::new(store, config)
    }

    fn request(id: &str, state: &str, amount: &str) -> TransactionRequest {
        TransactionRequest {
            account: AccountKey::from("1"),
            transaction_id: id.to_string(),
            state: state.to_string(),
            amount: amount.to_string(),
            source: "game".to_string(),
        }
    }

    fn balance(service: &IngestionService<MemoryLedgerStore>) -> String {
        service
            .store()
            .account(&service.default_account())
            .unwrap()
            .unwrap()
            .balance
            .to_string()
    }

    #[test]
    fn win_then_lose_conserves_balance() {
        let service = service(LedgerConfig::default());
        let outcome = service.apply(&request("w", "win", "11.11")).unwrap();
        assert_eq!(
            outcome,
            IngestOutcome::Applied {
                balance: Amount::from_raw(11_110)
            }
        );
        assert_eq!(balance(&service), "11.11");
        service.apply(&request("l", "lose", "11.11")).unwrap();
        assert_eq!(balance(&service), "0.00");
    }

    #[test]
    fn replay_with_different_payload_is_a_no_op() {
        let service = service(LedgerConfig::default());
        service.apply(&request("w", "win", "11.11")).unwrap();
        let replay = service.apply(&request("w", "lose", "3")).unwrap();
        assert_eq!(replay, IngestOutcome::Replayed);
        assert_eq!(balance(&service), "11.11");
    }

    #[test]
    fn replay_with_unknown_state_or_source_is_a_no_op() {
        let service = service(LedgerConfig::default());
        service.apply(&request("w", "win", "11.11")).unwrap();

        let replay = service.apply(&request("w", "qwerty", "11.11")).unwrap();
        assert_eq!(replay, IngestOutcome::Replayed);

        let mut other_source = request("w", "win", "11.11");
        other_source.source = "other".into();
        assert_eq!(service.apply(&other_source).unwrap(), IngestOutcome::Replayed);

        assert_eq!(balance(&service), "11.11");
        let history = service.store().history(&service.default_account(), 10).unwrap();
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn unsupported_state_leaves_ledger_untouched() {
        let service = service(LedgerConfig::default());
        let err = service.apply(&request("q", "qwerty", "1")).unwrap_err();
        assert!(err.is_client_error());
        assert!(matches!(err, IngestError::Validation(ValidationError::State(_))));
        assert_eq!(balance(&service), "0.00");
        let history = service.store().history(&service.default_account(), 10).unwrap();
        assert!(history.is_empty());
    }

    #[test]
    fn unknown_source_is_refused() {
        let service = service(LedgerConfig::default());
        let mut req = request("s", "win", "1");
        req.source = "qwerty".into();
        let err = service.apply(&req).unwrap_err();
        assert!(matches!(
            err,
            IngestError::Validation(ValidationError::UnsupportedSource(_))
        ));
        assert_eq!(balance(&service), "0.00");
    }

    #[test]
    fn malformed_amount_is_a_validation_error() {
        let service = service(LedgerConfig::default());
        let err = service.apply(&request("m", "win", "eleven")).unwrap_err();
        assert!(matches!(err, IngestError::Validation(ValidationError::Amount(_))));
        let err = service.apply(&request("", "win", "1")).unwrap_err();
        assert!(matches!(
            err,
            IngestError::Validation(ValidationError::EmptyTransactionId)
        ));
    }

    #[test]
    fn persisted_rejection_stays_rejected() {
        let service = service(LedgerConfig::default());
        let err = service.apply(&request("l", "lose", "11.11")).unwrap_err();
        assert!(matches!(err, IngestError::InsufficientFunds { .. }));
        assert_eq!(balance(&service), "0.00");

        service.apply(&request("w", "win", "50")).unwrap();
        let err = service.apply(&request("l", "lose", "11.11")).unwrap_err();
        assert!(matches!(err, IngestError::InsufficientFunds { .. }));
        assert_eq!(balance(&service), "50.00");
    }

    #[test]
    fn replayed_rejection_reports_the_stored_stake() {
        let service = service(LedgerConfig::default());
        service.apply(&request("l", "lose", "11.11")).unwrap_err();
        let err = service.apply(&request("l", "lose", "2")).unwrap_err();
        match err {
            IngestError::InsufficientFunds {
                available,
                required,
            } => {
                assert_eq!(available, Amount::ZERO);
                assert_eq!(required, Amount::from_raw(11_110));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn rollback_policy_allows_a_later_retry() {
        let config = LedgerConfig {
            rejections: RejectionPolicy::Rollback,
            ..LedgerConfig::default()
        };
        let service = service(config);
        let err = service.apply(&request("l", "lose", "11.11")).unwrap_err();
        assert!(matches!(err, IngestError::InsufficientFunds { .. }));
        assert!(service
            .store()
            .history(&service.default_account(), 10)
            .unwrap()
            .is_empty());

        service.apply(&request("w", "win", "50")).unwrap();
        let outcome = service.apply(&request("l", "lose", "11.11")).unwrap();
        assert_eq!(
            outcome,
            IngestOutcome::Applied {
                balance: Amount::from_raw(38_890)
            }
        );
    }

    #[test]
    fn unknown_account_is_a_store_error() {
        let service = service(LedgerConfig::default());
        let mut req = request("x", "win", "1");
        req.account = AccountKey::from("missing");
        let err = service.apply(&req).unwrap_err();
        assert!(!err.is_client_error());
    }
}
