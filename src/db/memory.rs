use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{JobStore, StoreError};
use crate::models::batch::{Batch, BatchId, BatchStatus, NewBatch};
use crate::models::job::{Job, JobId, JobKind, JobPayload, StuckQuery, WorkerIdentity};
use crate::models::pipeline::PipelineName;
use crate::services::clock::{Clock, SystemClock};
use crate::services::queue::{dispatch_with_retry, Dispatcher};

/// In-process job store.
///
/// Each operation runs under one lock, which gives the same all-or-nothing
/// behaviour as the transactional Postgres store. Timestamps come from the
/// injected clock, and every `mark_finished` call is counted per job.
pub struct MemoryJobStore {
    state: Mutex<MemoryState>,
    clock: Arc<dyn Clock>,
}

#[derive(Default)]
struct MemoryState {
    batches: HashMap<BatchId, Batch>,
    jobs: HashMap<JobId, Job>,
    job_order: Vec<JobId>,
    links: Vec<Link>,
    finish_calls: HashMap<JobId, usize>,
}

struct Link {
    kind: JobKind,
    job_id: JobId,
    batch_id: BatchId,
}

impl MemoryState {
    fn job(&self, kind: JobKind, id: JobId) -> Result<&Job, StoreError> {
        self.jobs
            .get(&id)
            .filter(|job| job.kind() == kind)
            .ok_or(StoreError::JobNotFound { kind, id })
    }

    fn job_mut(&mut self, kind: JobKind, id: JobId) -> Result<&mut Job, StoreError> {
        self.jobs
            .get_mut(&id)
            .filter(|job| job.kind() == kind)
            .ok_or(StoreError::JobNotFound { kind, id })
    }

    fn linked_batches(&self, kind: JobKind, id: JobId) -> Vec<BatchId> {
        self.links
            .iter()
            .filter(|link| link.kind == kind && link.job_id == id)
            .map(|link| link.batch_id)
            .collect()
    }

    fn check_batches(&self, batches: &[BatchId]) -> Result<(), StoreError> {
        match batches.iter().find(|id| !self.batches.contains_key(id)) {
            Some(missing) => Err(StoreError::BatchNotFound(*missing)),
            None => Ok(()),
        }
    }

    fn insert_job(
        &mut self,
        id: JobId,
        payload: JobPayload,
        num_retries: i32,
        batches: &[BatchId],
        now: chrono::DateTime<chrono::Utc>,
    ) -> Job {
        let job = Job {
            id,
            payload,
            num_retries,
            retried: false,
            success: None,
            created_at: now,
            start_time: None,
            end_time: None,
            worker_id: None,
            worker_version: None,
            failure_reason: None,
        };
        self.links.extend(batches.iter().map(|batch_id| Link {
            kind: job.kind(),
            job_id: job.id,
            batch_id: *batch_id,
        }));
        self.job_order.push(job.id);
        self.jobs.insert(job.id, job.clone());
        job
    }

    fn latch_retried(
        &mut self,
        kind: JobKind,
        id: JobId,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Job, StoreError> {
        let job = self.job_mut(kind, id)?;
        if job.retried {
            return Err(StoreError::AlreadyRetried { kind, id });
        }
        job.retried = true;
        job.success = Some(false);
        job.end_time.get_or_insert(now);
        Ok(job.clone())
    }

    fn set_status(&mut self, ids: &[BatchId], status: BatchStatus, now: chrono::DateTime<chrono::Utc>) {
        for id in ids {
            if let Some(batch) = self.batches.get_mut(id) {
                batch.status = status;
                batch.updated_at = now;
            }
        }
    }
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            clock,
        }
    }

    /// All jobs of one kind in creation order.
    pub async fn jobs(&self, kind: JobKind) -> Vec<Job> {
        let state = self.state.lock().await;
        state
            .job_order
            .iter()
            .filter_map(|id| state.jobs.get(id))
            .filter(|job| job.kind() == kind)
            .cloned()
            .collect()
    }

    /// How many times `mark_finished` was called for a job.
    pub async fn finish_calls(&self, id: JobId) -> usize {
        self.state
            .lock()
            .await
            .finish_calls
            .get(&id)
            .copied()
            .unwrap_or(0)
    }
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert_batch(&self, batch: NewBatch) -> Result<Batch, StoreError> {
        let now = self.clock.now();
        let batch = Batch {
            id: Uuid::new_v4(),
            source_type: batch.source_type,
            name: batch.name,
            internal_location: batch.internal_location,
            download_url: batch.download_url,
            raw_format: batch.raw_format,
            processed_format: batch.processed_format,
            pipeline_required: batch.pipeline_required,
            size_in_bytes: batch.size_in_bytes,
            platform_accession_code: batch.platform_accession_code,
            experiment_accession_code: batch.experiment_accession_code,
            organism_id: batch.organism_id,
            organism_name: batch.organism_name,
            status: BatchStatus::New,
            created_at: now,
            updated_at: now,
        };
        self.state
            .lock()
            .await
            .batches
            .insert(batch.id, batch.clone());
        Ok(batch)
    }

    async fn get_batch(&self, id: BatchId) -> Result<Option<Batch>, StoreError> {
        Ok(self.state.lock().await.batches.get(&id).cloned())
    }

    async fn set_batch_status(&self, ids: &[BatchId], status: BatchStatus) -> Result<(), StoreError> {
        let now = self.clock.now();
        self.state.lock().await.set_status(ids, status, now);
        Ok(())
    }

    async fn create_job(&self, payload: JobPayload, batches: &[BatchId]) -> Result<Job, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.check_batches(batches)?;
        Ok(state.insert_job(Uuid::new_v4(), payload, 0, batches, now))
    }

    async fn get_job(&self, kind: JobKind, id: JobId) -> Result<Option<Job>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.job(kind, id).ok().cloned())
    }

    async fn job_batches(&self, kind: JobKind, id: JobId) -> Result<Vec<Batch>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .linked_batches(kind, id)
            .iter()
            .filter_map(|batch_id| state.batches.get(batch_id))
            .cloned()
            .collect())
    }

    async fn mark_started(
        &self,
        kind: JobKind,
        id: JobId,
        worker: &WorkerIdentity,
    ) -> Result<Job, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let job = state.job_mut(kind, id)?;
        job.start_time = Some(now);
        job.worker_id = Some(worker.id.clone());
        job.worker_version = Some(worker.version.clone());
        Ok(job.clone())
    }

    async fn mark_finished(
        &self,
        kind: JobKind,
        id: JobId,
        success: bool,
        failure_reason: Option<&str>,
    ) -> Result<Job, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        *state.finish_calls.entry(id).or_insert(0) += 1;

        let job = state.job_mut(kind, id)?;
        if let Some(recorded) = job.success {
            if recorded == success {
                return Ok(job.clone());
            }
            return Err(StoreError::Consistency {
                kind,
                id,
                recorded,
                requested: success,
            });
        }

        job.success = Some(success);
        job.end_time = Some(now);
        if let Some(reason) = failure_reason {
            job.failure_reason = Some(reason.to_string());
        }
        Ok(job.clone())
    }

    async fn requeue(&self, kind: JobKind, id: JobId) -> Result<Job, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let previous = state.latch_retried(kind, id, now)?;
        let batches = state.linked_batches(kind, id);
        Ok(state.insert_job(
            Uuid::new_v4(),
            previous.payload,
            previous.num_retries + 1,
            &batches,
            now,
        ))
    }

    async fn give_up(&self, kind: JobKind, id: JobId) -> Result<Job, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let job = state.latch_retried(kind, id, now)?;
        let owned = super::owned_batch_statuses(kind);
        let batches: Vec<_> = state
            .linked_batches(kind, id)
            .into_iter()
            .filter(|batch_id| {
                state
                    .batches
                    .get(batch_id)
                    .is_some_and(|batch| owned.contains(&batch.status))
            })
            .collect();
        state.set_status(&batches, BatchStatus::Failed, now);
        Ok(job)
    }

    async fn find_stuck(&self, kind: JobKind, query: StuckQuery) -> Result<Vec<Job>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .job_order
            .iter()
            .filter_map(|id| state.jobs.get(id))
            .filter(|job| job.kind() == kind && query.matches(job))
            .cloned()
            .collect())
    }

    async fn hand_off_batch(
        &self,
        batch_id: BatchId,
        pipeline: PipelineName,
        dispatcher: &dyn Dispatcher,
    ) -> Result<Option<Job>, StoreError> {
        let mut state = self.state.lock().await;
        let status = state
            .batches
            .get(&batch_id)
            .map(|batch| batch.status)
            .ok_or(StoreError::BatchNotFound(batch_id))?;
        if status != BatchStatus::New {
            return Ok(None);
        }

        // Nothing is written until the dispatch went through.
        let job_id = Uuid::new_v4();
        dispatch_with_retry(dispatcher, JobKind::Processor, job_id).await?;

        let now = self.clock.now();
        state.set_status(&[batch_id], BatchStatus::Downloaded, now);
        let job = state.insert_job(
            job_id,
            JobPayload::Processor { pipeline },
            0,
            &[batch_id],
            now,
        );

        Ok(Some(job))
    }
}
