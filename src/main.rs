use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use data_refinery::{
    app_state::AppState,
    config::AppConfig,
    db,
    routes,
    services::{clock::SystemClock, queue::JobQueue, reconciler::Reconciler},
};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing data refinery foreman");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);
    routes::metrics::describe_metrics();

    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    tracing::info!("Connecting to Redis task queue");
    let queue = JobQueue::new(&config.redis_url).expect("Failed to initialize job queue");

    let objects = config
        .object_store()
        .expect("Failed to initialize object storage client");

    let state = AppState::new(db_pool, queue, objects);

    let policy = config.retry_policy();
    tracing::info!(
        max_retries = policy.max_retries,
        max_run_time_secs = policy.max_run_time.num_seconds(),
        max_queue_time_secs = policy.max_queue_time.num_seconds(),
        min_loop_period_secs = policy.min_loop_period.as_secs(),
        "Starting reconciliation loops"
    );
    let reconciler = Arc::new(Reconciler::new(
        state.store.clone(),
        state.queue.clone(),
        Arc::new(SystemClock),
        policy,
    ));
    let cancel = CancellationToken::new();
    let loops = reconciler.spawn(cancel.clone());

    let app = routes::router(state, prometheus_handle);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Foreman listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    tracing::info!("Shutting down reconciliation loops");
    cancel.cancel();
    for handle in loops {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Reconciliation loop panicked");
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
