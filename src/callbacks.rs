//! Cluster callback verification and ingestion.
//!
//! Checks run cheapest-first: header presence, then timestamp freshness,
//! then the HMAC over the exact raw request bytes. The MAC comparison is
//! constant-time via `Mac::verify_slice`.
//!
//! Ingestion is idempotent and never regresses state: late QUEUED/RUNNING
//! notices after a terminal computation are dropped, redelivered terminal
//! callbacks apply cleanly, and a user cancellation outlasts a subsequent
//! SUCCEEDED from the cluster (though the late notice still lands its audit
//! fields on the computation sub-record). Unknown computation ids are
//! acknowledged and counted; the cluster must not retry what we cannot route.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use tracing::{info, warn};

use crate::metrics::metrics;
use crate::store::{EntityMut, SettlementStore};
use crate::types::{
    CallbackPayload, CallbackResultPayload, ComputationRecord, ComputationStatus, EntityType,
    PaymentStatus,
};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-cluster-signature";
pub const TIMESTAMP_HEADER: &str = "x-cluster-timestamp";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CallbackRejection {
    #[error("missing required header {0}")]
    MissingHeader(&'static str),
    #[error("timestamp header is not a unix timestamp")]
    BadTimestamp,
    #[error("timestamp outside tolerance: {skew_secs}s")]
    StaleTimestamp { skew_secs: i64 },
    #[error("signature header is not valid hex")]
    BadSignatureEncoding,
    #[error("signature mismatch")]
    SignatureMismatch,
}

pub struct CallbackVerifier {
    secret: Vec<u8>,
    tolerance_secs: u64,
}

impl CallbackVerifier {
    pub fn new(secret: Vec<u8>, tolerance_secs: u64) -> Self {
        Self {
            secret,
            tolerance_secs,
        }
    }

    pub fn verify(
        &self,
        signature_header: Option<&str>,
        timestamp_header: Option<&str>,
        body: &[u8],
        now_unix: i64,
    ) -> Result<(), CallbackRejection> {
        let signature = signature_header
            .ok_or(CallbackRejection::MissingHeader(SIGNATURE_HEADER))?
            .trim();
        let timestamp = timestamp_header
            .ok_or(CallbackRejection::MissingHeader(TIMESTAMP_HEADER))?
            .trim();

        let ts: i64 = timestamp
            .parse()
            .map_err(|_| CallbackRejection::BadTimestamp)?;
        let skew_secs = (now_unix - ts).abs();
        if skew_secs > self.tolerance_secs as i64 {
            return Err(CallbackRejection::StaleTimestamp { skew_secs });
        }

        let sig_bytes =
            hex::decode(signature).map_err(|_| CallbackRejection::BadSignatureEncoding)?;
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|_| CallbackRejection::SignatureMismatch)?;
        mac.update(body);
        mac.verify_slice(&sig_bytes)
            .map_err(|_| CallbackRejection::SignatureMismatch)
    }
}

/// What ingestion did with a verified callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Applied,
    /// The callback matched a record but changed nothing (redelivery or a
    /// stale out-of-order notice).
    NoOp,
    /// No record owns this computation id. Acked anyway.
    UnknownEntity,
}

pub struct CallbackService {
    store: Arc<dyn SettlementStore>,
}

impl CallbackService {
    pub fn new(store: Arc<dyn SettlementStore>) -> Self {
        Self { store }
    }

    pub fn apply(&self, payload: &CallbackPayload) -> Disposition {
        let mut changed = false;
        let found = self
            .store
            .update_by_computation_id(&payload.computation_id, &mut |entity| {
                // Resolution keys on the computation id alone; the entity_type
                // field is advisory and only worth a note when it disagrees.
                changed = match entity {
                    EntityMut::Intent(intent) => {
                        if payload.entity_type == Some(EntityType::Transfer) {
                            warn!(computation_id = %payload.computation_id,
                                "entity_type hint says transfer, resolved a payment intent");
                        }
                        let c = apply_to_computation(&mut intent.computation, payload);
                        let s = apply_payment_status(&mut intent.status, payload.status);
                        if let Some(sig) = payload.tx_signature.clone() {
                            intent.tx_signature = Some(sig);
                        }
                        c || s
                    }
                    EntityMut::Transfer(transfer) => {
                        if payload.entity_type == Some(EntityType::PaymentIntent) {
                            warn!(computation_id = %payload.computation_id,
                                "entity_type hint says payment intent, resolved a transfer");
                        }
                        let c = apply_to_computation(&mut transfer.computation, payload);
                        let s = apply_payment_status(&mut transfer.status, payload.status);
                        if let Some(sig) = payload.tx_signature.clone() {
                            transfer.signature = Some(sig);
                        }
                        c || s
                    }
                };
            });

        if !found {
            metrics().callbacks_unknown_entity_total.inc();
            warn!(
                computation_id = %payload.computation_id,
                "callback for unknown computation id dropped"
            );
            return Disposition::UnknownEntity;
        }
        if changed {
            info!(
                computation_id = %payload.computation_id,
                status = ?payload.status,
                "callback applied"
            );
            Disposition::Applied
        } else {
            Disposition::NoOp
        }
    }
}

/// Update the computation sub-record. A terminal status never moves again,
/// so late progress notices change nothing. A late terminal notice still
/// lands its audit fields (signature, timestamps, result) into any gaps, so
/// the cluster's settlement evidence survives a user cancellation.
fn apply_to_computation(record: &mut ComputationRecord, payload: &CallbackPayload) -> bool {
    if record.status.is_terminal() {
        if payload.status.is_terminal() {
            return backfill_audit_fields(record, payload);
        }
        return false;
    }
    match payload.status {
        ComputationStatus::Queued | ComputationStatus::Running => {
            let changed = record.status != payload.status;
            record.status = payload.status;
            changed
        }
        terminal => {
            record.status = terminal;
            record.error = payload.error.clone();
            record.finalized_at = payload.finalized_at.clone();
            record.finalization_signature = payload.finalization_signature.clone();
            if let Some(result) = &payload.result {
                let (ciphertext, nonce) = decode_result(&payload.computation_id, result);
                record.result_ciphertext = ciphertext;
                record.result_nonce = nonce;
            }
            true
        }
    }
}

/// Copy missing audit fields from a late terminal notice. Populated fields
/// are never overwritten, which keeps redelivery a no-op.
fn backfill_audit_fields(record: &mut ComputationRecord, payload: &CallbackPayload) -> bool {
    let mut changed = false;
    let mut fill = |slot: &mut Option<String>, value: &Option<String>| {
        if slot.is_none() && value.is_some() {
            *slot = value.clone();
            changed = true;
        }
    };
    fill(&mut record.error, &payload.error);
    fill(&mut record.finalized_at, &payload.finalized_at);
    fill(&mut record.finalization_signature, &payload.finalization_signature);
    if let Some(result) = &payload.result {
        let (ciphertext, nonce) = decode_result(&payload.computation_id, result);
        if record.result_ciphertext.is_none() && ciphertext.is_some() {
            record.result_ciphertext = ciphertext;
            changed = true;
        }
        if record.result_nonce.is_none() && nonce.is_some() {
            record.result_nonce = nonce;
            changed = true;
        }
    }
    changed
}

/// Map a terminal computation status onto the settlement record. Terminal
/// settlement states never move again, which is what keeps a user
/// cancellation sticky against a late SUCCEEDED.
fn apply_payment_status(status: &mut PaymentStatus, incoming: ComputationStatus) -> bool {
    if status.is_terminal() {
        return false;
    }
    let next = match incoming {
        ComputationStatus::Succeeded => PaymentStatus::Finalized,
        ComputationStatus::Failed => PaymentStatus::Failed,
        ComputationStatus::Cancelled => PaymentStatus::Cancelled,
        ComputationStatus::Queued | ComputationStatus::Running => return false,
    };
    *status = next;
    true
}

/// Base64-decode optional result fields. A malformed field is logged and
/// dropped so partial result data never blocks status progression.
fn decode_result(
    computation_id: &str,
    result: &CallbackResultPayload,
) -> (Option<Vec<u8>>, Option<Vec<u8>>) {
    let decode = |field: &str, value: &Option<String>| -> Option<Vec<u8>> {
        let raw = value.as_deref()?;
        match BASE64.decode(raw) {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                warn!(%computation_id, field, %err, "malformed result field dropped");
                None
            }
        }
    };
    (
        decode("ciphertext", &result.ciphertext),
        decode("nonce", &result.nonce),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::PaymentIntent;
    use crate::utils::now_ms;

    fn sign(secret: &[u8], body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn verifier_accepts_fresh_signed_callback() {
        let secret = b"0123456789abcdef".to_vec();
        let v = CallbackVerifier::new(secret.clone(), 300);
        let body = br#"{"computation_id":"comp-1"}"#;
        let sig = sign(&secret, body);
        assert!(v
            .verify(Some(&sig), Some("1000000"), body, 1_000_000)
            .is_ok());
        // Skew inside the window, either direction.
        assert!(v
            .verify(Some(&sig), Some("1000000"), body, 1_000_299)
            .is_ok());
        assert!(v
            .verify(Some(&sig), Some("1000299"), body, 1_000_000)
            .is_ok());
    }

    #[test]
    fn verifier_rejects_missing_headers_and_stale_timestamps() {
        let secret = b"0123456789abcdef".to_vec();
        let v = CallbackVerifier::new(secret.clone(), 300);
        let body = b"{}";
        let sig = sign(&secret, body);

        assert_eq!(
            v.verify(None, Some("1000000"), body, 1_000_000),
            Err(CallbackRejection::MissingHeader(SIGNATURE_HEADER))
        );
        assert_eq!(
            v.verify(Some(&sig), None, body, 1_000_000),
            Err(CallbackRejection::MissingHeader(TIMESTAMP_HEADER))
        );
        assert_eq!(
            v.verify(Some(&sig), Some("not-a-number"), body, 1_000_000),
            Err(CallbackRejection::BadTimestamp)
        );
        assert!(matches!(
            v.verify(Some(&sig), Some("1000000"), body, 1_000_301),
            Err(CallbackRejection::StaleTimestamp { skew_secs: 301 })
        ));
        assert!(matches!(
            v.verify(Some(&sig), Some("1000301"), body, 1_000_000),
            Err(CallbackRejection::StaleTimestamp { .. })
        ));
    }

    #[test]
    fn verifier_rejects_bad_signatures() {
        let secret = b"0123456789abcdef".to_vec();
        let v = CallbackVerifier::new(secret.clone(), 300);
        let body = b"{}";

        assert_eq!(
            v.verify(Some("zz-not-hex"), Some("1000000"), body, 1_000_000),
            Err(CallbackRejection::BadSignatureEncoding)
        );
        let wrong = sign(b"another-secret--", body);
        assert_eq!(
            v.verify(Some(&wrong), Some("1000000"), body, 1_000_000),
            Err(CallbackRejection::SignatureMismatch)
        );
        // Signature over different bytes.
        let sig = sign(&secret, b"other body");
        assert_eq!(
            v.verify(Some(&sig), Some("1000000"), body, 1_000_000),
            Err(CallbackRejection::SignatureMismatch)
        );
    }

    fn store_with_intent(status: PaymentStatus) -> (Arc<MemoryStore>, CallbackService) {
        let store = Arc::new(MemoryStore::new());
        store.insert_intent(PaymentIntent {
            id: "pi-1".into(),
            status,
            amount_commitment: "0x00".into(),
            encrypted_amount: vec![0u8; 36],
            computation: ComputationRecord {
                computation_id: Some("comp-1".into()),
                ..ComputationRecord::queued()
            },
            recipient: "r".into(),
            currency: "USDC".into(),
            counterparty_id: "m".into(),
            description: None,
            metadata: serde_json::Value::Null,
            tx_signature: None,
            created_ms: now_ms(),
            updated_ms: now_ms(),
        });
        let service = CallbackService::new(store.clone());
        (store, service)
    }

    fn payload(status: ComputationStatus) -> CallbackPayload {
        CallbackPayload {
            computation_id: "comp-1".into(),
            entity_type: None,
            status,
            finalized_at: Some("2026-08-29T12:00:00Z".into()),
            finalization_signature: Some("finsig".into()),
            tx_signature: Some("txsig".into()),
            error: None,
            result: Some(CallbackResultPayload {
                ciphertext: Some(BASE64.encode([1u8; 36])),
                nonce: Some(BASE64.encode([2u8; 12])),
                ..Default::default()
            }),
            metadata: None,
        }
    }

    #[test]
    fn succeeded_callback_finalizes_the_intent() {
        let (store, service) = store_with_intent(PaymentStatus::Processing);
        assert_eq!(
            service.apply(&payload(ComputationStatus::Succeeded)),
            Disposition::Applied
        );
        let intent = store.get_intent("pi-1").unwrap();
        assert_eq!(intent.status, PaymentStatus::Finalized);
        assert_eq!(intent.computation.status, ComputationStatus::Succeeded);
        assert_eq!(intent.tx_signature.as_deref(), Some("txsig"));
        assert_eq!(intent.computation.result_ciphertext, Some(vec![1u8; 36]));
    }

    #[test]
    fn redelivered_terminal_callback_is_a_noop() {
        let (store, service) = store_with_intent(PaymentStatus::Processing);
        let p = payload(ComputationStatus::Succeeded);
        assert_eq!(service.apply(&p), Disposition::Applied);
        assert_eq!(service.apply(&p), Disposition::NoOp);
        assert_eq!(
            store.get_intent("pi-1").unwrap().status,
            PaymentStatus::Finalized
        );
    }

    #[test]
    fn late_progress_notice_does_not_regress_terminal_state() {
        let (store, service) = store_with_intent(PaymentStatus::Processing);
        service.apply(&payload(ComputationStatus::Succeeded));
        assert_eq!(
            service.apply(&payload(ComputationStatus::Running)),
            Disposition::NoOp
        );
        let intent = store.get_intent("pi-1").unwrap();
        assert_eq!(intent.status, PaymentStatus::Finalized);
        assert_eq!(intent.computation.status, ComputationStatus::Succeeded);
    }

    #[test]
    fn user_cancellation_outlasts_late_success() {
        let (store, service) = store_with_intent(PaymentStatus::Cancelled);
        // Simulate the user-driven cancel having already marked the record.
        store
            .update_intent("pi-1", &mut |i| {
                i.computation.status = ComputationStatus::Cancelled;
            })
            .unwrap();
        let p = payload(ComputationStatus::Succeeded);
        // The audit fields land, so the first delivery counts as applied.
        assert_eq!(service.apply(&p), Disposition::Applied);
        let intent = store.get_intent("pi-1").unwrap();
        assert_eq!(intent.status, PaymentStatus::Cancelled);
        assert_eq!(intent.computation.status, ComputationStatus::Cancelled);
        assert_eq!(
            intent.computation.finalization_signature.as_deref(),
            Some("finsig")
        );
        assert_eq!(
            intent.computation.finalized_at.as_deref(),
            Some("2026-08-29T12:00:00Z")
        );
        assert_eq!(intent.computation.result_ciphertext, Some(vec![1u8; 36]));
        // Redelivery finds every field populated and changes nothing.
        assert_eq!(service.apply(&p), Disposition::NoOp);
        assert_eq!(
            store.get_intent("pi-1").unwrap().status,
            PaymentStatus::Cancelled
        );
    }

    #[test]
    fn progress_callbacks_update_only_the_computation() {
        let (store, service) = store_with_intent(PaymentStatus::Processing);
        assert_eq!(
            service.apply(&payload(ComputationStatus::Running)),
            Disposition::Applied
        );
        let intent = store.get_intent("pi-1").unwrap();
        assert_eq!(intent.status, PaymentStatus::Processing);
        assert_eq!(intent.computation.status, ComputationStatus::Running);
    }

    #[test]
    fn failed_callback_marks_the_payment_failed() {
        let (store, service) = store_with_intent(PaymentStatus::Processing);
        let mut p = payload(ComputationStatus::Failed);
        p.error = Some("circuit blew up".into());
        service.apply(&p);
        let intent = store.get_intent("pi-1").unwrap();
        assert_eq!(intent.status, PaymentStatus::Failed);
        assert_eq!(
            intent.computation.error.as_deref(),
            Some("circuit blew up")
        );
    }

    #[test]
    fn transfer_records_settle_through_callbacks_too() {
        let store = Arc::new(MemoryStore::new());
        store.insert_transfer(crate::types::TransferRecord {
            id: "tr-1".into(),
            status: PaymentStatus::Processing,
            amount_commitment: "0x00".into(),
            encrypted_amount: vec![0u8; 36],
            computation: ComputationRecord {
                computation_id: Some("comp-1".into()),
                ..ComputationRecord::queued()
            },
            sender: "s".into(),
            recipient: "r".into(),
            signature: None,
            created_ms: now_ms(),
            updated_ms: now_ms(),
        });
        let service = CallbackService::new(store.clone());
        assert_eq!(
            service.apply(&payload(ComputationStatus::Succeeded)),
            Disposition::Applied
        );
        let transfer = store.get_transfer("tr-1").unwrap();
        assert_eq!(transfer.status, PaymentStatus::Finalized);
        assert_eq!(transfer.signature.as_deref(), Some("txsig"));
    }

    #[test]
    fn unknown_computation_id_is_acked_and_dropped() {
        let (_, service) = store_with_intent(PaymentStatus::Processing);
        let mut p = payload(ComputationStatus::Succeeded);
        p.computation_id = "comp-unknown".into();
        assert_eq!(service.apply(&p), Disposition::UnknownEntity);
    }

    #[test]
    fn malformed_result_field_is_dropped_without_blocking() {
        let (store, service) = store_with_intent(PaymentStatus::Processing);
        let mut p = payload(ComputationStatus::Succeeded);
        p.result = Some(CallbackResultPayload {
            ciphertext: Some("!!not-base64!!".into()),
            nonce: Some(BASE64.encode([2u8; 12])),
            ..Default::default()
        });
        assert_eq!(service.apply(&p), Disposition::Applied);
        let intent = store.get_intent("pi-1").unwrap();
        assert_eq!(intent.status, PaymentStatus::Finalized);
        assert!(intent.computation.result_ciphertext.is_none());
        assert_eq!(intent.computation.result_nonce, Some(vec![2u8; 12]));
    }
}
