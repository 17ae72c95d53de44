//! Environment-driven configuration for `settlement-engine`.
//!
//! We keep this intentionally small and explicit:
//! - encryption master key + callback shared secret (validated at load, not at first use)
//! - MPC cluster endpoint + polling defaults
//! - callback replay tolerance
//! - bind address

use anyhow::Context;
use std::env;

/// Known development placeholder keys. Booting with one of these would mean
/// every deployment shares the same master secret, so we refuse to start.
const PLACEHOLDER_MASTER_KEYS: [&str; 2] = [
    "0000000000000000000000000000000000000000000000000000000000000000",
    "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef",
];

#[derive(Clone)]
pub struct Config {
    /// 32-byte master secret for per-counterparty key derivation. Never logged.
    pub master_key: [u8; 32],
    /// Shared secret for verifying MPC cluster callbacks (raw bytes, from hex).
    pub callback_secret: Vec<u8>,
    /// Reject callbacks whose timestamp is further than this many seconds from
    /// local time, in either direction.
    pub callback_tolerance_secs: u64,
    /// Base URL of the MPC cluster HTTP API, e.g. `http://127.0.0.1:8001`.
    pub cluster_url: String,
    /// URL the cluster should POST callbacks to (advertised in submissions).
    pub callback_url: Option<String>,
    /// Base URL of the delegated settlement layer. Batch endpoints are
    /// disabled when unset.
    pub ledger_url: Option<String>,
    /// Default bound for `await_completion`.
    pub computation_timeout_ms: u64,
    /// Default poll interval for `await_completion`.
    pub poll_interval_ms: u64,
    /// Axum bind address, host:port.
    pub api_bind: String,
}

fn env_required(key: &str) -> anyhow::Result<String> {
    env::var(key).with_context(|| format!("Missing env var: {key}"))
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Parse and validate a 64-char hex master key.
///
/// Fails fast on wrong length, non-hex content, or a known placeholder value
/// so we never boot the service with insecure crypto.
pub fn parse_master_key(key_hex: &str) -> anyhow::Result<[u8; 32]> {
    let key_hex = key_hex.trim();
    if key_hex.len() != 64 {
        anyhow::bail!(
            "master key must be a 64 character hex string (found length {})",
            key_hex.len()
        );
    }
    let normalized = key_hex.to_ascii_lowercase();
    if PLACEHOLDER_MASTER_KEYS.contains(&normalized.as_str()) {
        anyhow::bail!(
            "master key is a known placeholder value; configure a unique secret before deployment"
        );
    }
    let mut key = [0u8; 32];
    hex::decode_to_slice(&normalized, &mut key).context("master key must be valid hex")?;
    Ok(key)
}

fn parse_callback_secret(secret_hex: &str) -> anyhow::Result<Vec<u8>> {
    let secret_hex = secret_hex.trim();
    if secret_hex.is_empty() {
        anyhow::bail!("callback secret is set but empty");
    }
    let bytes = hex::decode(secret_hex).context("CALLBACK_SHARED_SECRET must be hex-encoded")?;
    if bytes.len() < 16 {
        anyhow::bail!(
            "CALLBACK_SHARED_SECRET too short ({} bytes, need at least 16)",
            bytes.len()
        );
    }
    Ok(bytes)
}

pub fn load_config() -> anyhow::Result<Config> {
    let master_key = parse_master_key(&env_required("ENCRYPTION_MASTER_KEY")?)
        .context("Invalid ENCRYPTION_MASTER_KEY")?;
    let callback_secret = parse_callback_secret(&env_required("CALLBACK_SHARED_SECRET")?)?;

    let cluster_url = env_required("CLUSTER_URL")?
        .trim()
        .trim_end_matches('/')
        .to_string();
    if !cluster_url.starts_with("http://") && !cluster_url.starts_with("https://") {
        anyhow::bail!("CLUSTER_URL must start with http:// or https://");
    }

    let callback_url = env::var("CALLBACK_URL")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let ledger_url = env::var("LEDGER_URL")
        .ok()
        .map(|s| s.trim().trim_end_matches('/').to_string())
        .filter(|s| !s.is_empty());
    if let Some(url) = &ledger_url {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            anyhow::bail!("LEDGER_URL must start with http:// or https://");
        }
    }

    let mut callback_tolerance_secs = env_u64("CALLBACK_TOLERANCE_SECS", 300);
    if callback_tolerance_secs == 0 {
        tracing::warn!("CALLBACK_TOLERANCE_SECS=0 would reject every callback; using 300");
        callback_tolerance_secs = 300;
    }

    let computation_timeout_ms = env_u64("COMPUTATION_TIMEOUT_MS", 30_000);
    let poll_interval_ms = env_u64("COMPUTATION_POLL_INTERVAL_MS", 1_000).max(10);

    // Secure-by-default bind: only listen on loopback unless explicitly configured.
    let api_bind = env::var("API_BIND").unwrap_or_else(|_| "127.0.0.1:8601".to_string());

    Ok(Config {
        master_key,
        callback_secret,
        callback_tolerance_secs,
        cluster_url,
        callback_url,
        ledger_url,
        computation_timeout_ms,
        poll_interval_ms,
        api_bind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn master_key_rejects_placeholders() {
        for k in PLACEHOLDER_MASTER_KEYS {
            assert!(parse_master_key(k).is_err(), "placeholder accepted: {k}");
        }
        // Uppercase form of a placeholder is still a placeholder.
        let upper = PLACEHOLDER_MASTER_KEYS[1].to_ascii_uppercase();
        assert!(parse_master_key(&upper).is_err());
    }

    #[test]
    fn master_key_rejects_bad_length_and_non_hex() {
        assert!(parse_master_key("abcd").is_err());
        let non_hex = "zz".repeat(32);
        assert!(parse_master_key(&non_hex).is_err());
    }

    #[test]
    fn master_key_accepts_valid_hex() {
        let k = "4b9c87c6a5f3d20419b2e0b9876543214b9c87c6a5f3d20419b2e0b987654321";
        let parsed = parse_master_key(k).unwrap();
        assert_eq!(parsed[0], 0x4b);
        assert_eq!(parsed[31], 0x21);
    }

    #[test]
    fn callback_secret_must_be_hex_and_long_enough() {
        assert!(parse_callback_secret("not-hex").is_err());
        assert!(parse_callback_secret("aabb").is_err());
        assert!(parse_callback_secret(&"ab".repeat(32)).is_ok());
    }
}
