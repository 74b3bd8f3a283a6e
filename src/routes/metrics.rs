use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// Register descriptions for every metric the crate emits.
pub fn describe_metrics() {
    metrics::describe_counter!(
        "refinery_jobs_requeued_total",
        "Jobs replaced by a retry successor, by kind and failure mode"
    );
    metrics::describe_counter!(
        "refinery_jobs_given_up_total",
        "Jobs that exhausted their retries, by kind and failure mode"
    );
    metrics::describe_counter!(
        "refinery_dispatch_failures_total",
        "Queue submissions that failed after local retries"
    );
    metrics::describe_counter!(
        "refinery_jobs_finished_total",
        "Jobs finalized by a worker, by kind and outcome"
    );
    metrics::describe_histogram!(
        "refinery_sweep_seconds",
        "Duration of one reconciliation sweep"
    );
    metrics::describe_gauge!(
        "refinery_queue_depth",
        "Jobs waiting in the task queue, by kind"
    );
}

/// Prometheus metrics scrape endpoint.
pub async fn prometheus_metrics(
    axum::extract::State(handle): axum::extract::State<Arc<PrometheusHandle>>,
) -> impl IntoResponse {
    handle.render()
}
