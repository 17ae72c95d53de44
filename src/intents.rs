//! Payment intent lifecycle.
//!
//! - `create` encrypts the amount, persists the intent as PENDING and hands
//!   submission to a background task so the API answers immediately.
//! - `confirm` moves PENDING to PROCESSING and, when the background
//!   submission never landed, retries it inline. A cluster that is down does
//!   not fail the confirm; the callback path or a later retry settles it.
//! - `cancel` is only legal from PENDING or PROCESSING.
//!
//! Background submission failures are never silent: they land in a bounded
//! dead-letter buffer and bump a counter.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{error, info, warn};

use crate::cluster::ClusterClient;
use crate::encryption::{commitment, EncryptionEngine};
use crate::error::{AppError, AppResult};
use crate::metrics::metrics;
use crate::store::{SettlementStore, StoreError};
use crate::types::{
    ComputationRecord, ComputationRequest, ComputationStatus, CreateIntentRequest,
    CreateTransferRequest, ListIntentsQuery, ListIntentsResponse, PaymentIntent, PaymentStatus,
    TransferRecord, UpdateIntentRequest,
};
use crate::utils::{now_ms, IdGen};

/// Minor units per major unit (6-decimal settlement assets).
pub const MINOR_UNITS: f64 = 1_000_000.0;
/// Largest integer exactly representable in an f64 amount (2^53).
const MAX_SAFE_MINOR: f64 = 9_007_199_254_740_992.0;

const DEFAULT_PAGE: usize = 50;
const MAX_PAGE: usize = 200;
const DEAD_LETTER_CAP: usize = 256;

pub const COMPUTATION_TYPE: &str = "private_payment";
pub const TRANSFER_COMPUTATION_TYPE: &str = "private_transfer";

/// Round a major-unit amount to integer minor units.
pub fn normalize_amount(amount: f64) -> AppResult<u64> {
    if !amount.is_finite() {
        return Err(AppError::BadRequest("amount must be a finite number".into()));
    }
    if amount <= 0.0 {
        return Err(AppError::BadRequest("amount must be positive".into()));
    }
    let scaled = (amount * MINOR_UNITS).round();
    if scaled > MAX_SAFE_MINOR {
        return Err(AppError::BadRequest(
            "amount exceeds the representable range".into(),
        ));
    }
    Ok(scaled as u64)
}

#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub record_id: String,
    pub error: String,
    pub at_ms: u128,
}

/// Bounded FIFO of failed background submissions, oldest evicted first.
#[derive(Default)]
pub struct DeadLetters {
    entries: Mutex<VecDeque<DeadLetter>>,
}

impl DeadLetters {
    fn push(&self, entry: DeadLetter) {
        let mut entries = self.entries.lock().expect("dead letter lock poisoned");
        if entries.len() >= DEAD_LETTER_CAP {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    pub fn snapshot(&self) -> Vec<DeadLetter> {
        self.entries
            .lock()
            .expect("dead letter lock poisoned")
            .iter()
            .cloned()
            .collect()
    }
}

/// Cheap to clone; shared state sits behind `Arc` so background submission
/// tasks can carry their own handle.
#[derive(Clone)]
pub struct SettlementOrchestrator {
    store: Arc<dyn SettlementStore>,
    cluster: ClusterClient,
    engine: EncryptionEngine,
    ids: Arc<IdGen>,
    callback_url: Option<String>,
    dead_letters: Arc<DeadLetters>,
}

impl SettlementOrchestrator {
    pub fn new(
        store: Arc<dyn SettlementStore>,
        cluster: ClusterClient,
        engine: EncryptionEngine,
        callback_url: Option<String>,
    ) -> Self {
        Self {
            store,
            cluster,
            engine,
            ids: Arc::new(IdGen::default()),
            callback_url,
            dead_letters: Arc::new(DeadLetters::default()),
        }
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.snapshot()
    }

    pub async fn create(&self, req: CreateIntentRequest) -> AppResult<PaymentIntent> {
        req.validate()?;
        let minor = normalize_amount(req.amount)?;
        let counterparty_id = req.counterparty_id.trim().to_string();
        let envelope = self
            .engine
            .encrypt_integer(minor, &counterparty_id)
            .map_err(|e| AppError::Internal(format!("amount encryption failed: {e}")))?;
        let amount_commitment = commitment(&envelope);

        let id = self.ids.next("pi");
        let intent = PaymentIntent {
            id: id.clone(),
            status: PaymentStatus::Pending,
            amount_commitment,
            encrypted_amount: envelope,
            computation: ComputationRecord::queued(),
            recipient: req.recipient.trim().to_string(),
            currency: req.currency.trim().to_uppercase(),
            counterparty_id,
            description: req.description,
            metadata: req.metadata.unwrap_or(serde_json::Value::Null),
            tx_signature: None,
            created_ms: now_ms(),
            updated_ms: now_ms(),
        };
        self.store.insert_intent(intent.clone());
        metrics().intents_created_total.inc();
        info!(intent_id = %id, recipient = %intent.recipient, "payment intent created");

        // Fire and forget: a submission failure leaves the intent PENDING and
        // is retried at confirm time.
        let this = self.clone();
        let spawn_id = id.clone();
        tokio::spawn(async move {
            if let Err(err) = this.submit_for_intent(&spawn_id).await {
                this.record_submission_failure(&spawn_id, &err);
            }
        });

        Ok(intent)
    }

    pub fn get(&self, id: &str) -> AppResult<PaymentIntent> {
        self.store
            .get_intent(id)
            .ok_or_else(|| AppError::NotFound(format!("payment intent {id}")))
    }

    pub fn list(&self, query: &ListIntentsQuery) -> ListIntentsResponse {
        let all = self.store.list_intents(query.status);
        let total = all.len();
        let offset = query.offset.unwrap_or(0);
        let limit = query.limit.unwrap_or(DEFAULT_PAGE).min(MAX_PAGE);
        let data: Vec<PaymentIntent> = all.into_iter().skip(offset).take(limit).collect();
        let has_more = offset + data.len() < total;
        ListIntentsResponse {
            data,
            total,
            has_more,
        }
    }

    pub fn update(&self, id: &str, req: UpdateIntentRequest) -> AppResult<PaymentIntent> {
        req.validate()?;
        self.store
            .update_intent_if_status(
                id,
                &[
                    PaymentStatus::Pending,
                    PaymentStatus::Processing,
                    PaymentStatus::Confirmed,
                ],
                &mut |intent| {
                    if let Some(d) = req.description.clone() {
                        intent.description = Some(d);
                    }
                    if let Some(m) = req.metadata.clone() {
                        intent.metadata = m;
                    }
                },
            )
            .map_err(|e| map_store_error(e, id))
    }

    /// PENDING -> PROCESSING, with an inline submission retry when the
    /// background submit never produced a computation id.
    pub async fn confirm(&self, id: &str) -> AppResult<PaymentIntent> {
        let intent = self
            .store
            .update_intent_if_status(id, &[PaymentStatus::Pending], &mut |intent| {
                intent.status = PaymentStatus::Processing;
            })
            .map_err(|e| map_store_error(e, id))?;

        if intent.computation.computation_id.is_none() {
            match self.submit_for_intent(id).await {
                Ok(computation_id) => {
                    info!(intent_id = %id, %computation_id, "submission retried at confirm");
                }
                Err(err) => {
                    // The confirm itself stands; settlement is late, not lost.
                    warn!(intent_id = %id, error = %err, "confirm-time submission failed");
                    self.record_submission_failure(id, &err);
                }
            }
        }
        self.get(id)
    }

    pub fn cancel(&self, id: &str) -> AppResult<PaymentIntent> {
        self.store
            .update_intent_if_status(
                id,
                &[PaymentStatus::Pending, PaymentStatus::Processing],
                &mut |intent| {
                    intent.status = PaymentStatus::Cancelled;
                    intent.computation.status = ComputationStatus::Cancelled;
                },
            )
            .map_err(|e| map_store_error(e, id))
    }

    /// Direct transfer with an awaited submission. Unlike intents there is no
    /// confirm step, so a cluster refusal surfaces to the caller while the
    /// record stays PENDING for inspection.
    pub async fn create_transfer(&self, req: CreateTransferRequest) -> AppResult<TransferRecord> {
        req.validate()?;
        let minor = normalize_amount(req.amount)?;
        let sender = req.sender.trim().to_string();
        let envelope = self
            .engine
            .encrypt_integer(minor, &sender)
            .map_err(|e| AppError::Internal(format!("amount encryption failed: {e}")))?;

        let id = self.ids.next("tr");
        let record = TransferRecord {
            id: id.clone(),
            status: PaymentStatus::Pending,
            amount_commitment: commitment(&envelope),
            encrypted_amount: envelope.clone(),
            computation: ComputationRecord::queued(),
            sender: sender.clone(),
            recipient: req.recipient.trim().to_string(),
            signature: None,
            created_ms: now_ms(),
            updated_ms: now_ms(),
        };
        self.store.insert_transfer(record);

        let request = ComputationRequest {
            computation_type: TRANSFER_COMPUTATION_TYPE.to_string(),
            encrypted_inputs: vec![envelope],
            counterparty_id: sender,
            metadata: serde_json::json!({ "transfer_id": id }),
            callback_url: self.callback_url.clone(),
            correlation_id: id.clone(),
        };
        match self.cluster.submit(&request).await {
            Ok(resp) => {
                let computation_id = resp.computation_id;
                self.store
                    .update_transfer(&id, &mut |t| {
                        t.status = PaymentStatus::Processing;
                        t.computation.computation_id = Some(computation_id.clone());
                    })
                    .map_err(|e| map_store_error(e, &id))?;
                info!(transfer_id = %id, %computation_id, "transfer submitted");
            }
            Err(err) => {
                let err = AppError::from(err);
                self.record_transfer_failure(&id, &err);
                return Err(err);
            }
        }
        self.get_transfer(&id)
    }

    pub fn get_transfer(&self, id: &str) -> AppResult<TransferRecord> {
        self.store
            .get_transfer(id)
            .ok_or_else(|| AppError::NotFound(format!("transfer {id}")))
    }

    fn record_transfer_failure(&self, id: &str, err: &AppError) {
        metrics().submission_failures_total.inc();
        error!(transfer_id = %id, error = %err, "transfer submission dead-lettered");
        self.dead_letters.push(DeadLetter {
            record_id: id.to_string(),
            error: err.to_string(),
            at_ms: now_ms(),
        });
        let _ = self.store.update_transfer(id, &mut |t| {
            if !t.computation.status.is_terminal() {
                t.computation.status = ComputationStatus::Failed;
                t.computation.error = Some("submission failed".into());
            }
        });
    }

    /// Submit the intent's envelope to the cluster and persist the returned
    /// computation id. Idempotent per intent: a second call after a recorded
    /// id is a no-op.
    async fn submit_for_intent(&self, id: &str) -> AppResult<String> {
        let intent = self.get(id)?;
        if let Some(existing) = intent.computation.computation_id {
            return Ok(existing);
        }
        let request = ComputationRequest {
            computation_type: COMPUTATION_TYPE.to_string(),
            encrypted_inputs: vec![intent.encrypted_amount.clone()],
            counterparty_id: intent.counterparty_id.clone(),
            metadata: serde_json::json!({
                "payment_intent_id": intent.id,
                "currency": intent.currency,
            }),
            callback_url: self.callback_url.clone(),
            correlation_id: intent.id.clone(),
        };
        let started = now_ms();
        let resp = self.cluster.submit(&request).await?;
        metrics()
            .submit_ms
            .observe(now_ms().saturating_sub(started) as f64);

        let computation_id = resp.computation_id.clone();
        self.store
            .update_intent(id, &mut |intent| {
                intent.computation.computation_id = Some(resp.computation_id.clone());
            })
            .map_err(|e| map_store_error(e, id))?;
        info!(intent_id = %id, %computation_id, "computation submitted");
        Ok(computation_id)
    }

    fn record_submission_failure(&self, id: &str, err: &AppError) {
        metrics().submission_failures_total.inc();
        error!(intent_id = %id, error = %err, "computation submission dead-lettered");
        self.dead_letters.push(DeadLetter {
            record_id: id.to_string(),
            error: err.to_string(),
            at_ms: now_ms(),
        });
        // Mark the attempt on the record; the intent status itself stays put.
        let _ = self.store.update_intent(id, &mut |intent| {
            if !intent.computation.status.is_terminal() {
                intent.computation.status = ComputationStatus::Failed;
                intent.computation.error = Some("submission failed".into());
            }
        });
    }
}

fn map_store_error(err: StoreError, id: &str) -> AppError {
    match err {
        StoreError::NotFound(_) => AppError::NotFound(format!("payment intent {id}")),
        StoreError::StatusConflict { current } => AppError::Conflict(format!(
            "payment intent {id} is {current:?} and cannot transition"
        )),
    }
}
