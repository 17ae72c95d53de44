use crate::handlers;
use crate::state::AppState;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub fn build(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::public::health))
        .route("/ready", get(handlers::public::readiness))
        .route("/metrics", get(crate::metrics::metrics_handler))
        .route(
            "/v1/payment_intents",
            post(handlers::intents::create_intent).get(handlers::intents::list_intents),
        )
        .route(
            "/v1/payment_intents/:id",
            get(handlers::intents::get_intent).post(handlers::intents::update_intent),
        )
        .route(
            "/v1/payment_intents/:id/confirm",
            post(handlers::intents::confirm_intent),
        )
        .route(
            "/v1/payment_intents/:id/cancel",
            post(handlers::intents::cancel_intent),
        )
        .route(
            "/v1/submissions/dead_letters",
            get(handlers::intents::dead_letters),
        )
        .route(
            "/v1/computation/callbacks",
            post(handlers::callbacks::ingest_callback),
        )
        .route(
            "/v1/transfers",
            post(handlers::transfers::create_transfer),
        )
        .route(
            "/v1/transfers/:id",
            get(handlers::transfers::get_transfer),
        )
        .route(
            "/v1/computations/:id",
            get(handlers::computations::computation_status),
        )
        .route(
            "/v1/computations/:id/await",
            post(handlers::computations::await_computation),
        )
        .route(
            "/v1/batches",
            post(handlers::batches::create_batch),
        )
        .route("/v1/batches/estimate", get(handlers::batches::estimate))
        .route("/v1/batches/:id", get(handlers::batches::get_batch))
        .route(
            "/v1/batches/:id/delegate",
            post(handlers::batches::delegate_batch),
        )
        .route(
            "/v1/batches/:id/process",
            post(handlers::batches::process_batch),
        )
        .route(
            "/v1/batches/:id/finalize",
            post(handlers::batches::finalize_batch),
        )
        .route(
            "/v1/batches/:id/cancel",
            post(handlers::batches::cancel_batch),
        )
        .with_state(state)
        .layer(DefaultBodyLimit::max(256 * 1024))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
