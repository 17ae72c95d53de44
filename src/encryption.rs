//! Amount encryption for MPC submission.
//!
//! - Per-counterparty keys derived from the master key with HKDF-SHA256,
//!   salted by the counterparty id so keys never cross identities.
//! - ChaCha20-Poly1305 envelopes: 12-byte random nonce followed by
//!   ciphertext + 16-byte tag. A u64 plaintext always yields 36 bytes.
//! - Length-prefixed batch framing for multi-envelope submissions.
//!
//! Authentication failure is surfaced as its own error variant and never
//! produces a default plaintext.

use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    ChaCha20Poly1305, Key, Nonce,
};
use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
/// Smallest well-formed envelope: nonce + empty ciphertext + tag.
pub const MIN_ENVELOPE_LEN: usize = NONCE_LEN + TAG_LEN;
/// Envelope size for a u64 plaintext.
pub const U64_ENVELOPE_LEN: usize = NONCE_LEN + 8 + TAG_LEN;

/// Key-derivation domain separator. Changing this invalidates every
/// previously derived key.
const HKDF_INFO: &[u8] = b"settlement-engine-amount-v1";

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("authentication failed: envelope rejected")]
    AuthenticationFailed,
    #[error("encryption failed")]
    EncryptFailed,
    #[error("batch count mismatch: declared {declared}, found {found}")]
    CountMismatch { declared: u32, found: u32 },
    #[error("truncated batch: {0}")]
    Truncated(String),
}

/// Stateless engine over the 32-byte master key. Cheap to clone; per-call
/// key derivation keeps no per-counterparty material resident.
#[derive(Clone)]
pub struct EncryptionEngine {
    master_key: [u8; 32],
}

impl EncryptionEngine {
    pub fn new(master_key: [u8; 32]) -> Self {
        Self { master_key }
    }

    /// HKDF-SHA256(ikm = master key, salt = counterparty id, info = domain tag).
    fn derive_key(&self, counterparty_id: &str) -> [u8; 32] {
        let hk = Hkdf::<Sha256>::new(Some(counterparty_id.as_bytes()), &self.master_key);
        let mut okm = [0u8; 32];
        // 32-byte output is always within HKDF-SHA256's limit.
        hk.expand(HKDF_INFO, &mut okm)
            .unwrap_or_else(|_| unreachable!("hkdf output length is fixed at 32"));
        okm
    }

    /// Encrypt a little-endian u64 amount into a 36-byte envelope.
    pub fn encrypt_integer(&self, value: u64, counterparty_id: &str) -> Result<Vec<u8>, CryptoError> {
        self.encrypt(&value.to_le_bytes(), counterparty_id)
    }

    pub fn encrypt(&self, plaintext: &[u8], counterparty_id: &str) -> Result<Vec<u8>, CryptoError> {
        let key = self.derive_key(counterparty_id);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ct = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| CryptoError::EncryptFailed)?;
        let mut envelope = Vec::with_capacity(NONCE_LEN + ct.len());
        envelope.extend_from_slice(&nonce);
        envelope.extend_from_slice(&ct);
        Ok(envelope)
    }

    pub fn decrypt(&self, envelope: &[u8], counterparty_id: &str) -> Result<Vec<u8>, CryptoError> {
        if envelope.len() < MIN_ENVELOPE_LEN {
            return Err(CryptoError::Malformed(format!(
                "envelope {} bytes, need at least {MIN_ENVELOPE_LEN}",
                envelope.len()
            )));
        }
        let key = self.derive_key(counterparty_id);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        let (nonce, ct) = envelope.split_at(NONCE_LEN);
        cipher
            .decrypt(Nonce::from_slice(nonce), ct)
            .map_err(|_| CryptoError::AuthenticationFailed)
    }

    /// Decrypt an envelope that must hold exactly a little-endian u64.
    pub fn decrypt_integer(&self, envelope: &[u8], counterparty_id: &str) -> Result<u64, CryptoError> {
        let pt = self.decrypt(envelope, counterparty_id)?;
        let bytes: [u8; 8] = pt.as_slice().try_into().map_err(|_| {
            CryptoError::Malformed(format!("plaintext {} bytes, expected 8", pt.len()))
        })?;
        Ok(u64::from_le_bytes(bytes))
    }
}

/// SHA-256 commitment over an encrypted envelope, `0x`-prefixed lowercase hex.
pub fn commitment(envelope: &[u8]) -> String {
    let digest = Sha256::digest(envelope);
    format!("0x{}", hex::encode(digest))
}

// ---------------------------------------------------------------------
// Batch framing: {count: u32 LE} then per item {len: u32 LE, bytes}.
// ---------------------------------------------------------------------

pub fn encode_batch(envelopes: &[Vec<u8>]) -> Vec<u8> {
    let total: usize = envelopes.iter().map(|e| 4 + e.len()).sum();
    let mut out = Vec::with_capacity(4 + total);
    out.extend_from_slice(&(envelopes.len() as u32).to_le_bytes());
    for env in envelopes {
        out.extend_from_slice(&(env.len() as u32).to_le_bytes());
        out.extend_from_slice(env);
    }
    out
}

/// Decode a framed batch, validating every envelope's minimum length.
/// Fails closed: truncation, a header count that disagrees with the
/// payload, or a payload that does not hold `expected_count` envelopes
/// all reject the whole batch.
pub fn decode_batch(data: &[u8], expected_count: u32) -> Result<Vec<Vec<u8>>, CryptoError> {
    let mut cursor = 0usize;
    let declared = read_u32(data, &mut cursor)
        .ok_or_else(|| CryptoError::Truncated("missing count header".into()))?;
    let mut envelopes = Vec::with_capacity(declared.min(1024) as usize);
    while cursor < data.len() {
        let len = read_u32(data, &mut cursor)
            .ok_or_else(|| CryptoError::Truncated("missing length prefix".into()))? as usize;
        let end = cursor
            .checked_add(len)
            .filter(|&end| end <= data.len())
            .ok_or_else(|| {
                CryptoError::Truncated(format!(
                    "envelope of {len} bytes declared, {} remaining",
                    data.len() - cursor
                ))
            })?;
        let env = &data[cursor..end];
        if env.len() < MIN_ENVELOPE_LEN {
            return Err(CryptoError::Malformed(format!(
                "batch envelope {} bytes, need at least {MIN_ENVELOPE_LEN}",
                env.len()
            )));
        }
        envelopes.push(env.to_vec());
        cursor = end;
    }
    let found = envelopes.len() as u32;
    if found != declared {
        return Err(CryptoError::CountMismatch { declared, found });
    }
    if found != expected_count {
        return Err(CryptoError::CountMismatch {
            declared: expected_count,
            found,
        });
    }
    Ok(envelopes)
}

fn read_u32(data: &[u8], cursor: &mut usize) -> Option<u32> {
    let end = cursor.checked_add(4)?;
    if end > data.len() {
        return None;
    }
    let bytes: [u8; 4] = data[*cursor..end].try_into().ok()?;
    *cursor = end;
    Some(u32::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> EncryptionEngine {
        EncryptionEngine::new([7u8; 32])
    }

    #[test]
    fn integer_round_trip() {
        let e = engine();
        let env = e.encrypt_integer(123_456_789, "merchant-a").unwrap();
        assert_eq!(env.len(), U64_ENVELOPE_LEN);
        assert_eq!(e.decrypt_integer(&env, "merchant-a").unwrap(), 123_456_789);
    }

    #[test]
    fn keys_are_isolated_per_counterparty() {
        let e = engine();
        let env = e.encrypt_integer(42, "merchant-a").unwrap();
        let err = e.decrypt_integer(&env, "merchant-b").unwrap_err();
        assert!(matches!(err, CryptoError::AuthenticationFailed));
    }

    #[test]
    fn nonces_differ_between_calls() {
        let e = engine();
        let a = e.encrypt_integer(42, "merchant-a").unwrap();
        let b = e.encrypt_integer(42, "merchant-a").unwrap();
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
        assert_ne!(a, b);
    }

    #[test]
    fn tampered_envelope_is_rejected() {
        let e = engine();
        let mut env = e.encrypt_integer(42, "merchant-a").unwrap();
        // Flip one ciphertext bit.
        env[NONCE_LEN] ^= 0x01;
        let err = e.decrypt_integer(&env, "merchant-a").unwrap_err();
        assert!(matches!(err, CryptoError::AuthenticationFailed));
    }

    #[test]
    fn short_envelope_is_malformed_not_auth_failure() {
        let e = engine();
        let err = e.decrypt(&[0u8; MIN_ENVELOPE_LEN - 1], "merchant-a").unwrap_err();
        assert!(matches!(err, CryptoError::Malformed(_)));
    }

    #[test]
    fn commitment_is_prefixed_hex() {
        let c = commitment(b"anything");
        assert!(c.starts_with("0x"));
        assert_eq!(c.len(), 2 + 64);
    }

    #[test]
    fn batch_round_trip() {
        let e = engine();
        let envs: Vec<Vec<u8>> = (0..3)
            .map(|i| e.encrypt_integer(i, "merchant-a").unwrap())
            .collect();
        let framed = encode_batch(&envs);
        assert_eq!(decode_batch(&framed, 3).unwrap(), envs);
    }

    #[test]
    fn empty_batch_round_trip() {
        let framed = encode_batch(&[]);
        assert!(decode_batch(&framed, 0).unwrap().is_empty());
    }

    #[test]
    fn batch_count_mismatch_is_rejected() {
        let e = engine();
        let envs = vec![e.encrypt_integer(1, "m").unwrap()];
        let mut framed = encode_batch(&envs);
        // Claim two envelopes while carrying one.
        framed[..4].copy_from_slice(&2u32.to_le_bytes());
        let err = decode_batch(&framed, 2).unwrap_err();
        assert!(matches!(
            err,
            CryptoError::CountMismatch {
                declared: 2,
                found: 1
            }
        ));
    }

    #[test]
    fn batch_with_unexpected_count_is_rejected() {
        let e = engine();
        let envs: Vec<Vec<u8>> = (0..2)
            .map(|i| e.encrypt_integer(i, "m").unwrap())
            .collect();
        // Well-formed two-item batch, caller expected one.
        let framed = encode_batch(&envs);
        let err = decode_batch(&framed, 1).unwrap_err();
        assert!(matches!(
            err,
            CryptoError::CountMismatch {
                declared: 1,
                found: 2
            }
        ));
    }

    #[test]
    fn truncated_batch_is_rejected() {
        let e = engine();
        let envs = vec![e.encrypt_integer(1, "m").unwrap()];
        let framed = encode_batch(&envs);
        let err = decode_batch(&framed[..framed.len() - 5], 1).unwrap_err();
        assert!(matches!(err, CryptoError::Truncated(_)));
    }

    #[test]
    fn batch_envelope_below_minimum_is_rejected() {
        // One item of 10 bytes, shorter than any valid envelope.
        let mut framed = Vec::new();
        framed.extend_from_slice(&1u32.to_le_bytes());
        framed.extend_from_slice(&10u32.to_le_bytes());
        framed.extend_from_slice(&[0u8; 10]);
        let err = decode_batch(&framed, 1).unwrap_err();
        assert!(matches!(err, CryptoError::Malformed(_)));
    }
}
