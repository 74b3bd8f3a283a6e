use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

use crate::models::job::{JobId, JobKind};
use crate::services::retry::{with_retries, IsRetryable, TRANSIENT_ATTEMPTS};

const DOWNLOADER_QUEUE_KEY: &str = "refinery:downloader_jobs";
const PROCESSOR_QUEUE_KEY: &str = "refinery:processor_jobs";
const PROCESSING_KEY: &str = "refinery:processing";

fn queue_key(kind: JobKind) -> &'static str {
    match kind {
        JobKind::Downloader => DOWNLOADER_QUEUE_KEY,
        JobKind::Processor => PROCESSOR_QUEUE_KEY,
    }
}

/// Submits a job id to the external task queue.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, kind: JobKind, job_id: JobId) -> Result<(), DispatchError>;
}

/// Dispatch with the bounded local retry used for transient queue failures.
pub async fn dispatch_with_retry(
    dispatcher: &dyn Dispatcher,
    kind: JobKind,
    job_id: JobId,
) -> Result<(), DispatchError> {
    let result = with_retries(TRANSIENT_ATTEMPTS, "dispatch", || {
        dispatcher.dispatch(kind, job_id)
    })
    .await;
    if result.is_err() {
        metrics::counter!("refinery_dispatch_failures_total", "kind" => kind.as_ref().to_string())
            .increment(1);
    }
    result
}

/// Message placed on the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub kind: JobKind,
    pub job_id: JobId,
}

/// Redis-backed task queue, one list per job kind.
pub struct JobQueue {
    client: redis::Client,
}

impl JobQueue {
    pub fn new(redis_url: &str) -> Result<Self, DispatchError> {
        let client = redis::Client::open(redis_url).map_err(DispatchError::Redis)?;
        Ok(Self { client })
    }

    pub async fn enqueue(&self, job: &QueuedJob) -> Result<(), DispatchError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let payload = serde_json::to_string(job)?;
        conn.lpush::<_, _, ()>(queue_key(job.kind), &payload).await?;
        Ok(())
    }

    /// Pop the oldest job of `kind`, moving it to the processing list.
    pub async fn dequeue(&self, kind: JobKind) -> Result<Option<QueuedJob>, DispatchError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let result: Option<String> = conn.rpoplpush(queue_key(kind), PROCESSING_KEY).await?;

        match result {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    /// Remove a job from the processing list once the worker is done with it.
    pub async fn complete(&self, job: &QueuedJob) -> Result<(), DispatchError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let payload = serde_json::to_string(job)?;
        conn.lrem::<_, _, ()>(PROCESSING_KEY, 1, &payload).await?;
        Ok(())
    }

    pub async fn health_check(&self) -> Result<(), DispatchError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }

    pub async fn queue_depth(&self, kind: JobKind) -> Result<u64, DispatchError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let depth: u64 = conn.llen(queue_key(kind)).await?;
        Ok(depth)
    }
}

#[async_trait]
impl Dispatcher for JobQueue {
    async fn dispatch(&self, kind: JobKind, job_id: JobId) -> Result<(), DispatchError> {
        tracing::debug!(kind = %kind, job_id = %job_id, "Dispatching job");
        self.enqueue(&QueuedJob { kind, job_id }).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("queue unavailable: {0}")]
    Unavailable(String),
}

impl IsRetryable for DispatchError {
    fn is_retryable(&self) -> bool {
        !matches!(self, DispatchError::Serialize(_))
    }
}
