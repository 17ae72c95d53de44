//! API + domain types shared across modules.
//!
//! We separate these from the orchestrator so the handlers stay readable.

use crate::error::AppError;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------
// Input validation helpers (spam protection)
// ---------------------------------------------------------------------
const MAX_ID_LEN: usize = 128;
const MAX_RECIPIENT_LEN: usize = 128;
const MAX_CURRENCY_LEN: usize = 16;
const MAX_DESCRIPTION_LEN: usize = 1024;
const MAX_METADATA_JSON_LEN: usize = 16 * 1024;

pub fn ensure_len_le(field: &str, s: &str, max: usize) -> Result<(), AppError> {
    if s.len() > max {
        return Err(AppError::BadRequest(format!(
            "{field} too long: {} chars (max {max})",
            s.len()
        )));
    }
    Ok(())
}

fn ensure_non_empty(field: &str, s: &str) -> Result<(), AppError> {
    if s.trim().is_empty() {
        return Err(AppError::BadRequest(format!("{field} must be non-empty")));
    }
    Ok(())
}

// ---------------------------------------------------------------------
// Serde helpers for binary fields (wire encoding is base64)
// ---------------------------------------------------------------------
pub mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

pub mod b64_opt {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(bytes) => s.serialize_some(&STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let s: Option<String> = Option::deserialize(d)?;
        match s {
            Some(s) => STANDARD
                .decode(s.as_bytes())
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------

/// Status of one MPC computation, as tracked per settlement attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComputationStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl ComputationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Map a cluster wire status string onto the domain status.
    ///
    /// The cluster's status endpoint historically used lowercase forms
    /// ("queued", "processing", "completed", "failed"); callbacks use the
    /// uppercase domain forms. We accept both.
    pub fn from_wire(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "QUEUED" => Some(Self::Queued),
            "RUNNING" | "PROCESSING" => Some(Self::Running),
            "SUCCEEDED" | "COMPLETED" => Some(Self::Succeeded),
            "FAILED" => Some(Self::Failed),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Processing,
    Confirmed,
    Finalized,
    Failed,
    Cancelled,
}

impl PaymentStatus {
    /// Terminal states are immutable: only external retention policy removes
    /// the record, and no callback or user action may leave them.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finalized | Self::Failed | Self::Cancelled)
    }
}

// ---------------------------------------------------------------------
// Persisted records
// ---------------------------------------------------------------------

/// Per-attempt computation sub-record, owned jointly by the orchestrator
/// (outbound) and the callback ingestion service (inbound).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputationRecord {
    /// Correlation key between outbound submission and inbound callback.
    /// `None` until the first successful submission.
    pub computation_id: Option<String>,
    pub status: ComputationStatus,
    #[serde(with = "b64_opt", default, skip_serializing_if = "Option::is_none")]
    pub result_ciphertext: Option<Vec<u8>>,
    #[serde(with = "b64_opt", default, skip_serializing_if = "Option::is_none")]
    pub result_nonce: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finalized_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finalization_signature: Option<String>,
}

impl ComputationRecord {
    pub fn queued() -> Self {
        Self {
            computation_id: None,
            status: ComputationStatus::Queued,
            result_ciphertext: None,
            result_nonce: None,
            error: None,
            finalized_at: None,
            finalization_signature: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    pub status: PaymentStatus,
    /// SHA-256 over the encrypted envelope, hex with `0x` prefix.
    pub amount_commitment: String,
    #[serde(with = "b64")]
    pub encrypted_amount: Vec<u8>,
    pub computation: ComputationRecord,
    pub recipient: String,
    pub currency: String,
    /// Settlement identity the amount is encrypted under (key-derivation salt).
    pub counterparty_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub metadata: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_signature: Option<String>,
    pub created_ms: u128,
    pub updated_ms: u128,
}

/// Direct transfer tracked outside the payment-intent flow. Callbacks may
/// target these by computation id exactly as they target intents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRecord {
    pub id: String,
    pub status: PaymentStatus,
    pub amount_commitment: String,
    #[serde(with = "b64")]
    pub encrypted_amount: Vec<u8>,
    pub computation: ComputationRecord,
    pub sender: String,
    pub recipient: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    pub created_ms: u128,
    pub updated_ms: u128,
}

// ---------------------------------------------------------------------
// Cluster wire types (outbound §6)
// ---------------------------------------------------------------------

/// Immutable computation request, created by the orchestrator at submission.
#[derive(Debug, Clone)]
pub struct ComputationRequest {
    pub computation_type: String,
    pub encrypted_inputs: Vec<Vec<u8>>,
    pub counterparty_id: String,
    pub metadata: serde_json::Value,
    pub callback_url: Option<String>,
    pub correlation_id: String,
}

#[derive(Debug, Serialize)]
pub struct SubmitBody {
    pub computation_type: String,
    pub encrypted_inputs: Vec<String>,
    pub user_pubkey: String,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    pub reference_id: String,
}

#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    pub computation_id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub computation_id: String,
    pub status: String,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub created_at: Option<i64>,
    #[serde(default)]
    pub completed_at: Option<i64>,
}

// ---------------------------------------------------------------------
// Callback wire types (inbound §6)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    PaymentIntent,
    Transfer,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackPayload {
    pub computation_id: String,
    #[serde(default)]
    pub entity_type: Option<EntityType>,
    pub status: ComputationStatus,
    #[serde(default)]
    pub finalized_at: Option<String>,
    #[serde(default)]
    pub finalization_signature: Option<String>,
    #[serde(default)]
    pub tx_signature: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub result: Option<CallbackResultPayload>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Optional result fields are decoded defensively: a malformed field is
/// dropped rather than failing the whole callback, since partial result data
/// must not block status progression.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackResultPayload {
    #[serde(default)]
    pub ciphertext: Option<String>,
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub encryption_public_key: Option<String>,
    #[serde(default)]
    pub commitment: Option<String>,
    #[serde(default)]
    pub amount_commitment: Option<String>,
    #[serde(default)]
    pub signature: Option<String>,
}

// ---------------------------------------------------------------------
// HTTP API request types
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateIntentRequest {
    pub recipient: String,
    /// Major-unit amount; rounded to the nearest integer minor unit before
    /// encryption. Values outside the safe-integer range are rejected.
    pub amount: f64,
    pub currency: String,
    /// Settlement identity to derive the encryption key from (merchant wallet).
    pub counterparty_id: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl CreateIntentRequest {
    pub fn validate(&self) -> Result<(), AppError> {
        ensure_non_empty("recipient", &self.recipient)?;
        ensure_len_le("recipient", self.recipient.trim(), MAX_RECIPIENT_LEN)?;
        ensure_non_empty("currency", &self.currency)?;
        ensure_len_le("currency", self.currency.trim(), MAX_CURRENCY_LEN)?;
        ensure_non_empty("counterparty_id", &self.counterparty_id)?;
        ensure_len_le("counterparty_id", self.counterparty_id.trim(), MAX_ID_LEN)?;
        if let Some(d) = self.description.as_deref() {
            ensure_len_le("description", d, MAX_DESCRIPTION_LEN)?;
        }
        if let Some(m) = &self.metadata {
            // Cheap "size first" guard to avoid storing pathological blobs.
            let len = serde_json::to_string(m).map(|s| s.len()).unwrap_or(0);
            if len > MAX_METADATA_JSON_LEN {
                return Err(AppError::BadRequest(format!(
                    "metadata too large: {len} bytes (max {MAX_METADATA_JSON_LEN})"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateTransferRequest {
    /// Sender account; also the identity the amount is encrypted under.
    pub sender: String,
    pub recipient: String,
    pub amount: f64,
}

impl CreateTransferRequest {
    pub fn validate(&self) -> Result<(), AppError> {
        ensure_non_empty("sender", &self.sender)?;
        ensure_len_le("sender", self.sender.trim(), MAX_ID_LEN)?;
        ensure_non_empty("recipient", &self.recipient)?;
        ensure_len_le("recipient", self.recipient.trim(), MAX_RECIPIENT_LEN)?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateIntentRequest {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl UpdateIntentRequest {
    pub fn validate(&self) -> Result<(), AppError> {
        if let Some(d) = self.description.as_deref() {
            ensure_len_le("description", d, MAX_DESCRIPTION_LEN)?;
        }
        if let Some(m) = &self.metadata {
            let len = serde_json::to_string(m).map(|s| s.len()).unwrap_or(0);
            if len > MAX_METADATA_JSON_LEN {
                return Err(AppError::BadRequest(format!(
                    "metadata too large: {len} bytes (max {MAX_METADATA_JSON_LEN})"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListIntentsQuery {
    #[serde(default)]
    pub status: Option<PaymentStatus>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ListIntentsResponse {
    pub data: Vec<PaymentIntent>,
    pub total: usize,
    pub has_more: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn computation_status_wire_mapping() {
        assert_eq!(
            ComputationStatus::from_wire("queued"),
            Some(ComputationStatus::Queued)
        );
        assert_eq!(
            ComputationStatus::from_wire("processing"),
            Some(ComputationStatus::Running)
        );
        assert_eq!(
            ComputationStatus::from_wire("completed"),
            Some(ComputationStatus::Succeeded)
        );
        assert_eq!(
            ComputationStatus::from_wire("SUCCEEDED"),
            Some(ComputationStatus::Succeeded)
        );
        assert_eq!(ComputationStatus::from_wire("weird"), None);
    }

    #[test]
    fn callback_payload_parses_with_optional_fields_missing() {
        let p: CallbackPayload = serde_json::from_str(
            r#"{"computation_id":"comp-1","status":"SUCCEEDED"}"#,
        )
        .unwrap();
        assert_eq!(p.computation_id, "comp-1");
        assert_eq!(p.status, ComputationStatus::Succeeded);
        assert!(p.entity_type.is_none());
        assert!(p.result.is_none());
    }

    #[test]
    fn create_request_validation_rejects_empty_fields() {
        let req = CreateIntentRequest {
            recipient: "  ".into(),
            amount: 10.0,
            currency: "USDC".into(),
            counterparty_id: "merchant-1".into(),
            description: None,
            metadata: None,
        };
        assert!(req.validate().is_err());
    }
}
