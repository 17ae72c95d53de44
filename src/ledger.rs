//! HTTP-backed implementations of the batch ledger ports.
//!
//! The settlement layer exposes delegated-session endpoints over HTTP; these
//! adapters translate the port calls onto that API. They use a blocking
//! client on purpose: the ports are synchronous seams and the handlers run
//! batch work on the blocking pool.

use std::sync::OnceLock;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Deserialize;

use crate::batch::{BalancePort, LedgerError, LedgerPort};

pub struct HttpLedger {
    // Built on first use: the blocking client must come up on the blocking
    // pool, never on an async worker thread.
    http: OnceLock<reqwest::blocking::Client>,
    base_url: String,
}

impl HttpLedger {
    pub fn new(base_url: String) -> Self {
        Self {
            http: OnceLock::new(),
            base_url,
        }
    }

    fn post(&self, path: &str, body: serde_json::Value) -> Result<(), LedgerError> {
        let url = format!("{}{path}", self.base_url);
        let resp = self
            .http
            .get_or_init(reqwest::blocking::Client::new)
            .post(&url)
            .json(&body)
            .send()
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?;
        check_status(resp)
    }
}

fn check_status(resp: reqwest::blocking::Response) -> Result<(), LedgerError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    let body = resp.text().unwrap_or_default();
    let message = format!("{status}: {}", body.trim().chars().take(256).collect::<String>());
    if status.is_client_error() {
        Err(LedgerError::Rejected(message))
    } else {
        Err(LedgerError::Unavailable(message))
    }
}

impl LedgerPort for HttpLedger {
    fn delegate(
        &self,
        batch_id: &str,
        sender: &str,
        recipient_count: u32,
        framed_amounts: &[u8],
    ) -> Result<(), LedgerError> {
        self.post(
            &format!("/sessions/{batch_id}/delegate"),
            serde_json::json!({
                "sender": sender,
                "recipient_count": recipient_count,
                "framed_amounts": BASE64.encode(framed_amounts),
            }),
        )
    }

    fn transfer(&self, batch_id: &str, recipient: &str, envelope: &[u8]) -> Result<(), LedgerError> {
        self.post(
            &format!("/sessions/{batch_id}/transfers"),
            serde_json::json!({
                "recipient": recipient,
                "envelope": BASE64.encode(envelope),
            }),
        )
    }

    fn settle(&self, batch_id: &str) -> Result<(), LedgerError> {
        self.post(&format!("/sessions/{batch_id}/settle"), serde_json::json!({}))
    }

    fn abort(&self, batch_id: &str) -> Result<(), LedgerError> {
        self.post(&format!("/sessions/{batch_id}/abort"), serde_json::json!({}))
    }
}

#[derive(Deserialize)]
struct BalanceBody {
    available: u64,
}

pub struct HttpBalance {
    http: OnceLock<reqwest::blocking::Client>,
    base_url: String,
}

impl HttpBalance {
    pub fn new(base_url: String) -> Self {
        Self {
            http: OnceLock::new(),
            base_url,
        }
    }
}

impl BalancePort for HttpBalance {
    fn available_balance(&self, account: &str) -> Result<u64, LedgerError> {
        let url = format!("{}/accounts/{account}/balance", self.base_url);
        let resp = self
            .http
            .get_or_init(reqwest::blocking::Client::new)
            .get(&url)
            .send()
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            return Err(LedgerError::Rejected(format!("{status}: {}", body.trim())));
        }
        let body: BalanceBody = resp
            .json()
            .map_err(|e| LedgerError::Unavailable(format!("bad balance body: {e}")))?;
        Ok(body.available)
    }
}
