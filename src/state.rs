use std::sync::Arc;

use crate::batch::BatchEscalation;
use crate::callbacks::{CallbackService, CallbackVerifier};
use crate::cluster::ClusterClient;
use crate::config::Config;
use crate::encryption::EncryptionEngine;
use crate::intents::SettlementOrchestrator;
use crate::ledger::{HttpBalance, HttpLedger};
use crate::store::{MemoryStore, SettlementStore};

pub struct AppState {
    pub cfg: Config,
    pub store: Arc<dyn SettlementStore>,
    pub cluster: ClusterClient,
    pub orchestrator: Arc<SettlementOrchestrator>,
    pub verifier: CallbackVerifier,
    pub callbacks: CallbackService,
    /// Present only when a settlement-layer URL is configured.
    pub batches: Option<Arc<BatchEscalation>>,
}

impl AppState {
    pub fn new(cfg: Config) -> Self {
        let store: Arc<dyn SettlementStore> = Arc::new(MemoryStore::new());
        let http = reqwest::Client::new();
        let cluster = ClusterClient::new(http, cfg.cluster_url.clone());
        let engine = EncryptionEngine::new(cfg.master_key);
        let orchestrator = Arc::new(SettlementOrchestrator::new(
            store.clone(),
            cluster.clone(),
            engine.clone(),
            cfg.callback_url.clone(),
        ));
        let verifier =
            CallbackVerifier::new(cfg.callback_secret.clone(), cfg.callback_tolerance_secs);
        let callbacks = CallbackService::new(store.clone());

        let batches = cfg.ledger_url.clone().map(|url| {
            Arc::new(BatchEscalation::new(
                store.clone(),
                Arc::new(HttpLedger::new(url.clone())),
                Arc::new(HttpBalance::new(url)),
                engine,
            ))
        });

        Self {
            cfg,
            store,
            cluster,
            orchestrator,
            verifier,
            callbacks,
            batches,
        }
    }
}
