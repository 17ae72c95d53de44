//! Confidential settlement engine.
//!
//! HTTP service that accepts payment intents, encrypts amounts for the MPC
//! cluster, and ingests signed completion callbacks.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

mod batch;
mod callbacks;
mod cluster;
mod config;
mod encryption;
mod error;
mod handlers;
mod intents;
mod ledger;
mod metrics;
mod router;
mod state;
mod store;
mod types;
mod utils;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = config::load_config().context("loading configuration")?;
    let bind = cfg.api_bind.clone();
    let state = Arc::new(state::AppState::new(cfg));
    let app = router::build(state);

    let listener = tokio::net::TcpListener::bind(bind.as_str())
        .await
        .with_context(|| format!("binding {bind}"))?;
    info!(%bind, "settlement engine listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .context("server error")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::callbacks::{CallbackService, CallbackVerifier};
    use crate::cluster::ClusterClient;
    use crate::encryption::{commitment, EncryptionEngine, U64_ENVELOPE_LEN};
    use crate::intents::SettlementOrchestrator;
    use crate::store::{MemoryStore, SettlementStore};
    use crate::types::{
        CallbackPayload, ComputationStatus, CreateIntentRequest, PaymentStatus,
    };
    use hmac::Mac;
    use std::sync::Arc;

    #[tokio::test]
    async fn intent_settles_end_to_end_through_a_signed_callback() {
        let store: Arc<dyn SettlementStore> = Arc::new(MemoryStore::new());
        let cluster = ClusterClient::new(reqwest::Client::new(), "http://127.0.0.1:1".into());
        let engine = EncryptionEngine::new([5u8; 32]);
        let orchestrator = Arc::new(SettlementOrchestrator::new(
            store.clone(),
            cluster,
            engine.clone(),
            None,
        ));

        let intent = orchestrator
            .create(CreateIntentRequest {
                recipient: "wallet-xyz".into(),
                amount: 25.0,
                currency: "USDC".into(),
                counterparty_id: "merchant-7".into(),
                description: None,
                metadata: None,
            })
            .await
            .unwrap();
        assert_eq!(intent.status, PaymentStatus::Pending);
        assert_eq!(intent.encrypted_amount.len(), U64_ENVELOPE_LEN);
        assert_eq!(intent.amount_commitment, commitment(&intent.encrypted_amount));
        assert_eq!(
            engine
                .decrypt_integer(&intent.encrypted_amount, "merchant-7")
                .unwrap(),
            25_000_000
        );

        let confirmed = orchestrator.confirm(&intent.id).await.unwrap();
        assert_eq!(confirmed.status, PaymentStatus::Processing);

        // The cluster in this test is unreachable, so record the computation
        // id the way a successful submission would have.
        store
            .update_intent(&intent.id, &mut |i| {
                i.computation.computation_id = Some("comp-e2e".into());
                i.computation.status = ComputationStatus::Running;
            })
            .unwrap();

        // Cluster side: sign the callback body and deliver it.
        let secret = b"integration-test-secret".to_vec();
        let body = serde_json::json!({
            "computation_id": "comp-e2e",
            "status": "SUCCEEDED",
            "finalization_signature": "sig-abc",
            "tx_signature": "tx-abc",
        })
        .to_string();
        let mut mac = hmac::Hmac::<sha2::Sha256>::new_from_slice(&secret).unwrap();
        mac.update(body.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        let verifier = CallbackVerifier::new(secret, 300);
        verifier
            .verify(Some(&signature), Some("1000000"), body.as_bytes(), 1_000_010)
            .unwrap();

        let payload: CallbackPayload = serde_json::from_str(&body).unwrap();
        CallbackService::new(store.clone()).apply(&payload);

        let settled = orchestrator.get(&intent.id).unwrap();
        assert_eq!(settled.status, PaymentStatus::Finalized);
        assert_eq!(settled.computation.status, ComputationStatus::Succeeded);
        assert_eq!(settled.tx_signature.as_deref(), Some("tx-abc"));
        assert_eq!(
            settled.computation.finalization_signature.as_deref(),
            Some("sig-abc")
        );
    }
}
