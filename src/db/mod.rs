use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

use crate::models::batch::{Batch, BatchId, BatchStatus, NewBatch};
use crate::models::job::{Job, JobId, JobKind, JobPayload, StuckQuery, WorkerIdentity};
use crate::models::pipeline::PipelineName;
use crate::services::queue::{DispatchError, Dispatcher};

pub mod memory;
pub mod queries;

pub use memory::MemoryJobStore;
pub use queries::PgJobStore;

/// Initialize PostgreSQL connection pool
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await
}

/// Run database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| sqlx::Error::Migrate(Box::new(e)))
}

/// Persisted state for jobs, batches and their associations.
///
/// Every multi-row change (`requeue`, `give_up`, `hand_off_batch`) is atomic:
/// after a crash the store holds either the state before or after it.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_batch(&self, batch: NewBatch) -> Result<Batch, StoreError>;

    async fn get_batch(&self, id: BatchId) -> Result<Option<Batch>, StoreError>;

    async fn set_batch_status(&self, ids: &[BatchId], status: BatchStatus) -> Result<(), StoreError>;

    /// Insert a fresh job (`success` unknown, not retried, zero retries)
    /// associated with `batches` in the given order.
    async fn create_job(&self, payload: JobPayload, batches: &[BatchId]) -> Result<Job, StoreError>;

    async fn get_job(&self, kind: JobKind, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Batches associated with a job, in association order.
    async fn job_batches(&self, kind: JobKind, id: JobId) -> Result<Vec<Batch>, StoreError>;

    /// Record `start_time = now` and the worker identity.
    async fn mark_started(
        &self,
        kind: JobKind,
        id: JobId,
        worker: &WorkerIdentity,
    ) -> Result<Job, StoreError>;

    /// Record `end_time = now` and the outcome.
    ///
    /// Repeating the same outcome is a no-op; a different outcome for an
    /// already finished job is a [`StoreError::Consistency`].
    async fn mark_finished(
        &self,
        kind: JobKind,
        id: JobId,
        success: bool,
        failure_reason: Option<&str>,
    ) -> Result<Job, StoreError>;

    /// Create the successor of a job (same payload and batches, one more
    /// retry) and latch the original as retried and failed.
    ///
    /// Fails with [`StoreError::AlreadyRetried`] when another sweep got
    /// there first; no successor is created in that case.
    async fn requeue(&self, kind: JobKind, id: JobId) -> Result<Job, StoreError>;

    /// Permanently fail a job: retried and failed with no successor. Its
    /// batches still in this job's stage (see [`owned_batch_statuses`]) move
    /// to FAILED; batches already handed to a later stage are left alone.
    async fn give_up(&self, kind: JobKind, id: JobId) -> Result<Job, StoreError>;

    async fn find_stuck(&self, kind: JobKind, query: StuckQuery) -> Result<Vec<Job>, StoreError>;

    /// Mark a batch DOWNLOADED, create its processor job and dispatch it as
    /// one unit. A failed dispatch leaves the batch and jobs untouched.
    ///
    /// Returns `None` without dispatching when the batch is no longer NEW,
    /// i.e. an earlier attempt of the downloader chain already handed it off.
    async fn hand_off_batch(
        &self,
        batch_id: BatchId,
        pipeline: PipelineName,
        dispatcher: &dyn Dispatcher,
    ) -> Result<Option<Job>, StoreError>;
}

/// Batch statuses a job of `kind` is responsible for.
pub fn owned_batch_statuses(kind: JobKind) -> &'static [BatchStatus] {
    match kind {
        JobKind::Downloader => &[BatchStatus::New, BatchStatus::Downloading],
        JobKind::Processor => &[BatchStatus::Downloaded, BatchStatus::Processing],
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} job {id} not found")]
    JobNotFound { kind: JobKind, id: JobId },

    #[error("batch {0} not found")]
    BatchNotFound(BatchId),

    #[error("{kind} job {id} already finished with success={recorded}, refusing success={requested}")]
    Consistency {
        kind: JobKind,
        id: JobId,
        recorded: bool,
        requested: bool,
    },

    #[error("{kind} job {id} was already retried")]
    AlreadyRetried { kind: JobKind, id: JobId },

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
