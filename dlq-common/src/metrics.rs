use std::time::Instant;

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse,
    routing::get, Router,
};
use health::HealthRegistry;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub const EVENTBUS_PUBLISH_ENQUEUED: &str = "eventbus_publish_enqueued_total";
pub const EVENTBUS_PUBLISH_ENQUEUE_FAILURES: &str = "eventbus_publish_enqueue_failures_total";
pub const EVENTBUS_PUBLISH_DELIVERED: &str = "eventbus_publish_delivered_total";
pub const EVENTBUS_PUBLISH_DELIVERY_FAILURES: &str = "eventbus_publish_delivery_failures_total";
pub const EVENTBUS_POLL_ERRORS: &str = "eventbus_poll_errors_total";
pub const EVENTBUS_CONSUMER_ERRORS: &str = "eventbus_consumer_errors_total";
pub const EVENTBUS_MESSAGES_PROCESSED: &str = "eventbus_messages_processed_total";
pub const EVENTBUS_TRANSACTIONS: &str = "eventbus_transactions_total";
pub const EVENTBUS_TRANSACTION_DURATION: &str = "eventbus_transaction_duration_seconds";

pub const DLQ_MESSAGES_SENT: &str = "dlq_messages_sent_total";
pub const DLQ_SEND_RETRIES: &str = "dlq_send_retries_total";
pub const DLQ_MESSAGES_SPOOLED: &str = "dlq_messages_spooled_total";
pub const DLQ_MESSAGES_LOST: &str = "dlq_messages_lost_total";
pub const DLQ_MESSAGES_DROPPED: &str = "dlq_messages_dropped_total";

pub const DLQ_HTTP_REQUESTS: &str = "dlq_http_requests_total";
pub const DLQ_HTTP_REQUEST_DURATION: &str = "dlq_http_request_duration_seconds";

/// Bind a `TcpListener` on the provided bind address to serve a `Router` on it.
/// The server stops when `shutdown` completes.
pub async fn serve<F>(router: Router, bind: &str, shutdown: F) -> Result<(), std::io::Error>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

/// Add the probe and metrics routes to `router`. `/_liveness` reports the registry status.
pub fn setup_metrics_routes(router: Router, liveness: HealthRegistry) -> Router {
    let recorder_handle = setup_metrics_recorder();

    add_probe_routes(router, liveness)
        .route(
            "/metrics",
            get(move || std::future::ready(recorder_handle.render())),
        )
        .layer(axum::middleware::from_fn(track_metrics))
}

fn add_probe_routes(router: Router, liveness: HealthRegistry) -> Router {
    router
        .route("/_readiness", get(|| async { "ok" }))
        .route(
            "/_liveness",
            get(move || std::future::ready(liveness.get_status())),
        )
}

/// Install the global Prometheus recorder. Panics when called twice in a process.
pub fn setup_metrics_recorder() -> PrometheusHandle {
    // Transactions include dead letter retries, hence the longer tail
    const DURATION_SECONDS: &[f64] = &[
        0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(DURATION_SECONDS)
        .expect("histogram buckets are not empty")
        .install_recorder()
        .expect("failed to install the metrics recorder")
}

/// Route template of the request when it matched one, its raw path otherwise.
fn route_label(req: &Request<Body>) -> String {
    req.extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_owned())
        .unwrap_or_else(|| req.uri().path().to_owned())
}

/// Count and time every request served by the probe, metrics and message routes.
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let started = Instant::now();
    let route = route_label(&req);
    let method = req.method().to_string();

    let response = next.run(req).await;

    let labels = [
        ("method", method),
        ("route", route),
        ("status", response.status().as_u16().to_string()),
    ];
    metrics::counter!(DLQ_HTTP_REQUESTS, &labels).increment(1);
    metrics::histogram!(DLQ_HTTP_REQUEST_DURATION, &labels)
        .record(started.elapsed().as_secs_f64());

    response
}
