//! Multi-recipient batch settlement escalation.
//!
//! A batch walks INITIALIZED -> DELEGATED -> PROCESSING -> FINALIZED, and may
//! be CANCELLED from any non-terminal phase. Ledger access sits behind ports
//! so the escalation logic carries no chain specifics.
//!
//! Partial failure is first-class: individual recipient transfers may fail
//! without poisoning the batch, `processed_count` against `total_count` tells
//! callers exactly how much settled, and finalize succeeds on a partially
//! processed batch rather than stranding the completed transfers.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::encryption::{commitment, encode_batch, EncryptionEngine};
use crate::error::{AppError, AppResult};
use crate::intents::normalize_amount;
use crate::store::{SettlementStore, StoreError};
use crate::types::b64;
use crate::utils::{now_ms, IdGen};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchPhase {
    Initialized,
    Delegated,
    Processing,
    Finalized,
    Cancelled,
}

impl BatchPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finalized | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRecipient {
    pub recipient: String,
    #[serde(with = "b64")]
    pub encrypted_amount: Vec<u8>,
    pub amount_commitment: String,
    pub processed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSettlement {
    pub id: String,
    pub phase: BatchPhase,
    pub sender: String,
    pub recipients: Vec<BatchRecipient>,
    pub processed_count: u32,
    pub total_count: u32,
    /// Sum of every recipient amount in minor units. Recorded at creation;
    /// not recoverable later from the per-recipient envelopes.
    pub total_amount_minor: u64,
    pub created_ms: u128,
    pub updated_ms: u128,
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger rejected operation: {0}")]
    Rejected(String),
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}

/// Delegated-settlement operations on the underlying ledger.
pub trait LedgerPort: Send + Sync {
    /// Hand the batch's accounts to the fast settlement layer. The amounts go
    /// along as one length-prefixed frame, with the recipient count alongside
    /// so the layer can validate the set up front.
    fn delegate(
        &self,
        batch_id: &str,
        sender: &str,
        recipient_count: u32,
        framed_amounts: &[u8],
    ) -> Result<(), LedgerError>;
    /// Execute one encrypted transfer inside the delegated session.
    fn transfer(&self, batch_id: &str, recipient: &str, envelope: &[u8]) -> Result<(), LedgerError>;
    /// Commit the delegated session and return accounts to the base layer.
    fn settle(&self, batch_id: &str) -> Result<(), LedgerError>;
    /// Abort the delegated session without committing.
    fn abort(&self, batch_id: &str) -> Result<(), LedgerError>;
}

/// Read-side balance lookup, minor units.
pub trait BalancePort: Send + Sync {
    fn available_balance(&self, account: &str) -> Result<u64, LedgerError>;
}

/// Deterministic cost model: flat delegation overhead plus a per-recipient
/// transfer cost, in minor units. Same inputs, same answer.
pub const COST_BASE_MINOR: u64 = 5_000;
pub const COST_PER_RECIPIENT_MINOR: u64 = 1_200;

pub fn estimate_cost(recipient_count: u32) -> u64 {
    COST_BASE_MINOR + COST_PER_RECIPIENT_MINOR * u64::from(recipient_count)
}

#[derive(Debug, Deserialize)]
pub struct BatchEntry {
    pub recipient: String,
    /// Major units, normalized the same way single intents are.
    pub amount: f64,
}

pub struct BatchEscalation {
    store: Arc<dyn SettlementStore>,
    ledger: Arc<dyn LedgerPort>,
    balance: Arc<dyn BalancePort>,
    engine: EncryptionEngine,
    ids: IdGen,
}

impl BatchEscalation {
    pub fn new(
        store: Arc<dyn SettlementStore>,
        ledger: Arc<dyn LedgerPort>,
        balance: Arc<dyn BalancePort>,
        engine: EncryptionEngine,
    ) -> Self {
        Self {
            store,
            ledger,
            balance,
            engine,
            ids: IdGen::default(),
        }
    }

    /// Create an INITIALIZED batch after checking the sender can cover every
    /// transfer plus the estimated escalation cost.
    pub fn create(&self, sender: &str, entries: &[BatchEntry]) -> AppResult<BatchSettlement> {
        if entries.is_empty() {
            return Err(AppError::BadRequest("batch needs at least one recipient".into()));
        }
        let mut total_minor = 0u64;
        let mut recipients = Vec::with_capacity(entries.len());
        for entry in entries {
            let minor = normalize_amount(entry.amount)?;
            total_minor = total_minor
                .checked_add(minor)
                .ok_or_else(|| AppError::BadRequest("batch total overflows".into()))?;
            let envelope = self
                .engine
                .encrypt_integer(minor, sender)
                .map_err(|e| AppError::Internal(format!("amount encryption failed: {e}")))?;
            recipients.push(BatchRecipient {
                recipient: entry.recipient.clone(),
                amount_commitment: commitment(&envelope),
                encrypted_amount: envelope,
                processed: false,
                error: None,
            });
        }

        let required = total_minor.saturating_add(estimate_cost(entries.len() as u32));
        let available = self
            .balance
            .available_balance(sender)
            .map_err(|e| AppError::BadGateway(e.to_string()))?;
        if available < required {
            return Err(AppError::BadRequest(format!(
                "insufficient balance: need {required} minor units, have {available}"
            )));
        }

        let batch = BatchSettlement {
            id: self.ids.next("batch"),
            phase: BatchPhase::Initialized,
            sender: sender.to_string(),
            total_count: recipients.len() as u32,
            recipients,
            processed_count: 0,
            total_amount_minor: total_minor,
            created_ms: now_ms(),
            updated_ms: now_ms(),
        };
        self.store.insert_batch(batch.clone());
        info!(batch_id = %batch.id, recipients = batch.total_count, "batch created");
        Ok(batch)
    }

    pub fn get(&self, id: &str) -> AppResult<BatchSettlement> {
        self.store
            .get_batch(id)
            .ok_or_else(|| AppError::NotFound(format!("batch {id}")))
    }

    /// INITIALIZED -> DELEGATED. The ledger call happens first so a refused
    /// delegation leaves the batch INITIALIZED and retryable.
    pub fn delegate(&self, id: &str) -> AppResult<BatchSettlement> {
        let batch = self.get(id)?;
        if batch.phase != BatchPhase::Initialized {
            return Err(AppError::Conflict(format!(
                "batch {id} is {:?}, delegate needs INITIALIZED",
                batch.phase
            )));
        }
        let envelopes: Vec<Vec<u8>> = batch
            .recipients
            .iter()
            .map(|r| r.encrypted_amount.clone())
            .collect();
        self.ledger
            .delegate(
                &batch.id,
                &batch.sender,
                batch.total_count,
                &encode_batch(&envelopes),
            )
            .map_err(|e| AppError::BadGateway(e.to_string()))?;
        self.transition(id, BatchPhase::Initialized, BatchPhase::Delegated)
    }

    /// DELEGATED -> PROCESSING, executing every recipient transfer. A failed
    /// transfer is recorded on its recipient and does not stop the rest.
    pub fn process(&self, id: &str) -> AppResult<BatchSettlement> {
        let batch = self.transition(id, BatchPhase::Delegated, BatchPhase::Processing)?;
        for (idx, recipient) in batch.recipients.iter().enumerate() {
            let outcome =
                self.ledger
                    .transfer(&batch.id, &recipient.recipient, &recipient.encrypted_amount);
            match outcome {
                Ok(()) => {
                    self.store
                        .update_batch(id, &mut |b| {
                            b.recipients[idx].processed = true;
                            b.processed_count += 1;
                        })
                        .map_err(|e| map_store_error(e, id))?;
                }
                Err(err) => {
                    warn!(batch_id = %id, recipient = %recipient.recipient, error = %err,
                        "batch transfer failed");
                    self.store
                        .update_batch(id, &mut |b| {
                            b.recipients[idx].error = Some(err.to_string());
                        })
                        .map_err(|e| map_store_error(e, id))?;
                }
            }
        }
        self.get(id)
    }

    /// PROCESSING -> FINALIZED. Succeeds on a partially processed batch; the
    /// gap between `processed_count` and `total_count` is the caller's signal.
    pub fn finalize(&self, id: &str) -> AppResult<BatchSettlement> {
        let current = self.get(id)?;
        if current.phase != BatchPhase::Processing {
            return Err(AppError::Conflict(format!(
                "batch {id} is {:?}, finalize needs PROCESSING",
                current.phase
            )));
        }
        self.ledger
            .settle(id)
            .map_err(|e| AppError::BadGateway(e.to_string()))?;
        let batch = self.transition(id, BatchPhase::Processing, BatchPhase::Finalized)?;
        if batch.processed_count < batch.total_count {
            warn!(batch_id = %id, processed = batch.processed_count, total = batch.total_count,
                "batch finalized with unprocessed recipients");
        }
        Ok(batch)
    }

    /// Any non-terminal phase -> CANCELLED. Aborts the delegated session when
    /// one is open.
    pub fn cancel(&self, id: &str) -> AppResult<BatchSettlement> {
        let current = self.get(id)?;
        if current.phase.is_terminal() {
            return Err(AppError::Conflict(format!(
                "batch {id} is {:?} and cannot be cancelled",
                current.phase
            )));
        }
        if matches!(current.phase, BatchPhase::Delegated | BatchPhase::Processing) {
            if let Err(err) = self.ledger.abort(id) {
                warn!(batch_id = %id, error = %err, "delegated session abort failed");
            }
        }
        self.store
            .update_batch(id, &mut |b| {
                b.phase = BatchPhase::Cancelled;
            })
            .map_err(|e| map_store_error(e, id))
    }

    fn transition(
        &self,
        id: &str,
        from: BatchPhase,
        to: BatchPhase,
    ) -> AppResult<BatchSettlement> {
        let mut conflict = None;
        let batch = self
            .store
            .update_batch(id, &mut |b| {
                if b.phase == from {
                    b.phase = to;
                } else {
                    conflict = Some(b.phase);
                }
            })
            .map_err(|e| map_store_error(e, id))?;
        if let Some(phase) = conflict {
            return Err(AppError::Conflict(format!(
                "batch {id} is {phase:?}, expected {from:?}"
            )));
        }
        Ok(batch)
    }
}

fn map_store_error(err: StoreError, id: &str) -> AppError {
    match err {
        StoreError::NotFound(_) => AppError::NotFound(format!("batch {id}")),
        StoreError::StatusConflict { current } => {
            AppError::Conflict(format!("batch {id} is {current:?}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeLedger {
        failing_recipients: HashSet<String>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeLedger {
        fn failing(recipients: &[&str]) -> Self {
            Self {
                failing_recipients: recipients.iter().map(|r| r.to_string()).collect(),
                calls: Mutex::default(),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl LedgerPort for FakeLedger {
        fn delegate(
            &self,
            _batch_id: &str,
            _sender: &str,
            recipient_count: u32,
            framed_amounts: &[u8],
        ) -> Result<(), LedgerError> {
            let envelopes = crate::encryption::decode_batch(framed_amounts, recipient_count)
                .map_err(|e| LedgerError::Rejected(e.to_string()))?;
            self.calls
                .lock()
                .unwrap()
                .push(format!("delegate:{}", envelopes.len()));
            Ok(())
        }

        fn transfer(
            &self,
            _batch_id: &str,
            recipient: &str,
            _envelope: &[u8],
        ) -> Result<(), LedgerError> {
            self.calls.lock().unwrap().push(format!("transfer:{recipient}"));
            if self.failing_recipients.contains(recipient) {
                return Err(LedgerError::Rejected("account frozen".into()));
            }
            Ok(())
        }

        fn settle(&self, _batch_id: &str) -> Result<(), LedgerError> {
            self.calls.lock().unwrap().push("settle".into());
            Ok(())
        }

        fn abort(&self, _batch_id: &str) -> Result<(), LedgerError> {
            self.calls.lock().unwrap().push("abort".into());
            Ok(())
        }
    }

    struct FixedBalance(u64);

    impl BalancePort for FixedBalance {
        fn available_balance(&self, _account: &str) -> Result<u64, LedgerError> {
            Ok(self.0)
        }
    }

    fn escalation(ledger: Arc<FakeLedger>, balance_minor: u64) -> BatchEscalation {
        BatchEscalation::new(
            Arc::new(MemoryStore::new()),
            ledger,
            Arc::new(FixedBalance(balance_minor)),
            EncryptionEngine::new([3u8; 32]),
        )
    }

    fn entries() -> Vec<BatchEntry> {
        ["alice", "bob", "carol"]
            .iter()
            .map(|r| BatchEntry {
                recipient: r.to_string(),
                amount: 2.0,
            })
            .collect()
    }

    #[test]
    fn cost_estimate_is_deterministic_and_linear() {
        assert_eq!(estimate_cost(0), COST_BASE_MINOR);
        assert_eq!(estimate_cost(3), estimate_cost(3));
        assert_eq!(
            estimate_cost(4) - estimate_cost(3),
            COST_PER_RECIPIENT_MINOR
        );
    }

    #[test]
    fn full_lifecycle_settles_every_recipient() {
        let ledger = Arc::new(FakeLedger::default());
        let esc = escalation(ledger.clone(), 100_000_000);
        let batch = esc.create("payer", &entries()).unwrap();
        assert_eq!(batch.phase, BatchPhase::Initialized);
        assert_eq!(batch.total_count, 3);
        // 3 recipients at 2.0 major units each.
        assert_eq!(batch.total_amount_minor, 6_000_000);
        assert_eq!(esc.get(&batch.id).unwrap().total_amount_minor, 6_000_000);

        assert_eq!(esc.delegate(&batch.id).unwrap().phase, BatchPhase::Delegated);
        let processed = esc.process(&batch.id).unwrap();
        assert_eq!(processed.phase, BatchPhase::Processing);
        assert_eq!(processed.processed_count, 3);

        let done = esc.finalize(&batch.id).unwrap();
        assert_eq!(done.phase, BatchPhase::Finalized);

        let calls = ledger.calls();
        assert_eq!(calls.first().map(String::as_str), Some("delegate:3"));
        assert_eq!(calls.last().map(String::as_str), Some("settle"));
    }

    #[test]
    fn partial_failure_is_surfaced_and_finalize_still_succeeds() {
        let ledger = Arc::new(FakeLedger::failing(&["bob"]));
        let esc = escalation(ledger, 100_000_000);
        let batch = esc.create("payer", &entries()).unwrap();
        esc.delegate(&batch.id).unwrap();

        let processed = esc.process(&batch.id).unwrap();
        assert_eq!(processed.processed_count, 2);
        assert_eq!(processed.total_count, 3);
        let bob = processed
            .recipients
            .iter()
            .find(|r| r.recipient == "bob")
            .unwrap();
        assert!(!bob.processed);
        assert!(bob.error.as_deref().unwrap().contains("account frozen"));

        let done = esc.finalize(&batch.id).unwrap();
        assert_eq!(done.phase, BatchPhase::Finalized);
        assert_eq!(done.processed_count, 2);
    }

    #[test]
    fn insufficient_balance_blocks_creation() {
        let ledger = Arc::new(FakeLedger::default());
        // 3 transfers of 2.0 = 6_000_000 minor plus escalation cost.
        let esc = escalation(ledger, 6_000_000);
        let err = esc.create("payer", &entries()).unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[test]
    fn phase_transitions_are_gated() {
        let ledger = Arc::new(FakeLedger::default());
        let esc = escalation(ledger, 100_000_000);
        let batch = esc.create("payer", &entries()).unwrap();

        // Cannot process or finalize straight from INITIALIZED.
        assert!(matches!(esc.process(&batch.id), Err(AppError::Conflict(_))));
        assert!(matches!(esc.finalize(&batch.id), Err(AppError::Conflict(_))));

        esc.delegate(&batch.id).unwrap();
        assert!(matches!(esc.delegate(&batch.id), Err(AppError::Conflict(_))));
    }

    #[test]
    fn cancel_is_allowed_from_any_non_terminal_phase() {
        let ledger = Arc::new(FakeLedger::default());
        let esc = escalation(ledger.clone(), 100_000_000);

        let a = esc.create("payer", &entries()).unwrap();
        assert_eq!(esc.cancel(&a.id).unwrap().phase, BatchPhase::Cancelled);
        assert!(matches!(esc.cancel(&a.id), Err(AppError::Conflict(_))));

        let b = esc.create("payer", &entries()).unwrap();
        esc.delegate(&b.id).unwrap();
        assert_eq!(esc.cancel(&b.id).unwrap().phase, BatchPhase::Cancelled);
        assert!(ledger.calls().iter().any(|c| c == "abort"));

        let c = esc.create("payer", &entries()).unwrap();
        esc.delegate(&c.id).unwrap();
        esc.process(&c.id).unwrap();
        esc.finalize(&c.id).unwrap();
        assert!(matches!(esc.cancel(&c.id), Err(AppError::Conflict(_))));
    }

    #[test]
    fn empty_batch_is_rejected() {
        let ledger = Arc::new(FakeLedger::default());
        let esc = escalation(ledger, 100_000_000);
        assert!(matches!(
            esc.create("payer", &[]),
            Err(AppError::BadRequest(_))
        ));
    }
}
