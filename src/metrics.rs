use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;
use std::sync::OnceLock;

pub struct Metrics {
    registry: Registry,
    pub intents_created_total: Counter,
    /// Fire-and-forget submissions that errored out; these show up nowhere
    /// else, so the counter plus the dead-letter log is their only trace.
    pub submission_failures_total: Counter,
    pub callbacks_accepted_total: Counter,
    pub callbacks_rejected_total: Counter,
    pub callbacks_unknown_entity_total: Counter,
    pub submit_ms: Histogram,
}

fn buckets_ms() -> Vec<f64> {
    vec![
        10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10_000.0, 30_000.0,
    ]
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(|| {
        let mut registry = Registry::default();
        let intents_created_total = Counter::default();
        registry.register(
            "settlement_intents_created_total",
            "Payment intents created total",
            intents_created_total.clone(),
        );
        let submission_failures_total = Counter::default();
        registry.register(
            "settlement_submission_failures_total",
            "Background computation submissions failed total",
            submission_failures_total.clone(),
        );
        let callbacks_accepted_total = Counter::default();
        registry.register(
            "settlement_callbacks_accepted_total",
            "Cluster callbacks accepted total",
            callbacks_accepted_total.clone(),
        );
        let callbacks_rejected_total = Counter::default();
        registry.register(
            "settlement_callbacks_rejected_total",
            "Cluster callbacks rejected (signature/timestamp) total",
            callbacks_rejected_total.clone(),
        );
        let callbacks_unknown_entity_total = Counter::default();
        registry.register(
            "settlement_callbacks_unknown_entity_total",
            "Cluster callbacks for unknown computation ids total",
            callbacks_unknown_entity_total.clone(),
        );
        let submit_ms = Histogram::new(buckets_ms().into_iter());
        registry.register(
            "settlement_submit_ms",
            "Cluster submission latency (ms)",
            submit_ms.clone(),
        );

        Metrics {
            registry,
            intents_created_total,
            submission_failures_total,
            callbacks_accepted_total,
            callbacks_rejected_total,
            callbacks_unknown_entity_total,
            submit_ms,
        }
    })
}

pub async fn metrics_handler() -> impl IntoResponse {
    let mut buf = String::new();
    if encode(&mut buf, &metrics().registry).is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, String::new());
    }
    (StatusCode::OK, buf)
}
