use data_refinery::{
    app_state::AppState,
    config::AppConfig,
    db,
    models::job::JobKind,
    pipeline::{steps::default_registry, PipelineExecutor},
    services::{downloader::DownloadWorker, paths::PathResolver, queue::JobQueue},
};
use std::sync::Arc;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

struct Worker {
    queue: Arc<JobQueue>,
    downloader: DownloadWorker,
    executor: PipelineExecutor,
}

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting data refinery worker");

    let config = AppConfig::from_env().expect("Failed to load configuration");

    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Initializing services");
    let queue = JobQueue::new(&config.redis_url).expect("Failed to initialize job queue");
    let objects = config
        .object_store()
        .expect("Failed to initialize object storage client");
    let state = AppState::new(db_pool, queue, objects);

    let identity = config.worker_identity();
    let paths: Arc<dyn PathResolver> = Arc::new(config.layout());
    let registry = Arc::new(default_registry(paths.clone(), state.objects.clone()));

    let worker = Worker {
        queue: state.queue.clone(),
        downloader: DownloadWorker::new(
            state.store.clone(),
            state.queue.clone(),
            paths.clone(),
            state.objects.clone(),
            identity.clone(),
        ),
        executor: PipelineExecutor::new(state.store.clone(), registry, identity.clone())
            .with_temp_cleanup(paths),
    };

    tracing::info!(worker_id = %identity.id, version = %identity.version, "Worker ready, starting job loop");

    let poll_interval = config.poll_interval();
    loop {
        match worker.process_next_job().await {
            Ok(true) => {
                tracing::debug!("Job processed, checking for next job");
            }
            Ok(false) => {
                tracing::trace!("No jobs available, sleeping");
                sleep(poll_interval).await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Error polling task queue, will retry");
                sleep(poll_interval).await;
            }
        }
    }
}

impl Worker {
    /// Run the next queued job, downloader jobs first.
    /// Returns Ok(true) if a job was run, Ok(false) if both queues were empty.
    async fn process_next_job(&self) -> Result<bool, Box<dyn std::error::Error>> {
        for kind in JobKind::ALL {
            let Some(queued) = self.queue.dequeue(kind).await? else {
                continue;
            };

            tracing::info!(kind = %queued.kind, job_id = %queued.job_id, "Received job");

            // The job record carries its own outcome; the queue entry is
            // released either way and the reconciler handles failures.
            let outcome = match queued.kind {
                JobKind::Downloader => self.downloader.run(queued.job_id).await,
                JobKind::Processor => self.executor.run(queued.job_id).await,
            };
            tracing::info!(
                kind = %queued.kind,
                job_id = %queued.job_id,
                success = ?outcome,
                "Job run complete"
            );

            self.queue.complete(&queued).await?;
            return Ok(true);
        }
        Ok(false)
    }
}
