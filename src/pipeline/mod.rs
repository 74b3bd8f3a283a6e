//! Staged pipeline execution for processor jobs.
//!
//! A pipeline is an ordered list of [`Step`]s run against one [`JobContext`].
//! The executor stops at the first step that errors or reports
//! `success = false`, and always finalizes the job exactly once.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::db::{JobStore, StoreError};
use crate::models::batch::{Batch, BatchStatus};
use crate::models::job::{Job, JobId, JobKind, WorkerIdentity};
use crate::models::pipeline::PipelineName;
use crate::services::paths::PathResolver;
use crate::services::storage::StorageError;

pub mod steps;

/// Job-scoped state shared by the steps of one pipeline run.
///
/// The job and its batches are fixed for the whole run; steps can only read
/// them. Everything else a step wants to hand to a later step goes in the
/// value map.
#[derive(Debug, Clone)]
pub struct JobContext {
    job: Job,
    batches: Vec<Batch>,
    pub success: Option<bool>,
    pub failure_reason: Option<String>,
    values: HashMap<String, serde_json::Value>,
}

impl JobContext {
    pub fn new(job: Job, batches: Vec<Batch>) -> Self {
        Self {
            job,
            batches,
            success: None,
            failure_reason: None,
            values: HashMap::new(),
        }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn job_id(&self) -> JobId {
        self.job.id
    }

    pub fn batches(&self) -> &[Batch] {
        &self.batches
    }

    /// Record a failure. The first recorded reason wins.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.success = Some(false);
        if self.failure_reason.is_none() {
            self.failure_reason = Some(reason.into());
        }
    }

    pub fn has_failed(&self) -> bool {
        self.success == Some(false)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.values.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<serde_json::Value> {
        self.values.remove(key)
    }
}

/// One stage of a pipeline.
#[async_trait]
pub trait Step: Send + Sync {
    fn name(&self) -> &str;

    /// Advance the context. Fail by returning an error or by calling
    /// [`JobContext::fail`].
    async fn run(&self, ctx: &mut JobContext) -> Result<(), StepError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("{0}")]
    Failed(String),
}

/// Maps pipeline names to their step sequences.
#[derive(Default, Clone)]
pub struct PipelineRegistry {
    pipelines: HashMap<PipelineName, Vec<Arc<dyn Step>>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: PipelineName, steps: Vec<Arc<dyn Step>>) -> &mut Self {
        self.pipelines.insert(name, steps);
        self
    }

    pub fn steps(&self, name: PipelineName) -> Option<&[Arc<dyn Step>]> {
        self.pipelines.get(&name).map(Vec::as_slice)
    }
}

/// Runs processor jobs through their registered pipelines.
pub struct PipelineExecutor {
    store: Arc<dyn JobStore>,
    registry: Arc<PipelineRegistry>,
    worker: WorkerIdentity,
    paths: Option<Arc<dyn PathResolver>>,
}

impl PipelineExecutor {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<PipelineRegistry>,
        worker: WorkerIdentity,
    ) -> Self {
        Self {
            store,
            registry,
            worker,
            paths: None,
        }
    }

    /// Remove the job's temp directory when the job is finalized, whatever
    /// step it stopped at.
    pub fn with_temp_cleanup(mut self, paths: Arc<dyn PathResolver>) -> Self {
        self.paths = Some(paths);
        self
    }

    /// Run one processor job to completion.
    ///
    /// Returns the recorded outcome, or `None` when the job could not be
    /// loaded or started (nothing to finalize).
    pub async fn run(&self, job_id: JobId) -> Option<bool> {
        let job = match self.store.get_job(JobKind::Processor, job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tracing::error!(job_id = %job_id, "Cannot find processor job record");
                return None;
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to load processor job");
                return None;
            }
        };

        let job = match self
            .store
            .mark_started(JobKind::Processor, job_id, &self.worker)
            .await
        {
            Ok(started) => started,
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to mark processor job started");
                return None;
            }
        };

        let pipeline = job.pipeline().unwrap_or(PipelineName::NoOp);

        tracing::info!(
            job_id = %job_id,
            pipeline = %pipeline,
            num_retries = job.num_retries,
            "Starting processor job"
        );

        let mut ctx = match self.store.job_batches(JobKind::Processor, job_id).await {
            Ok(batches) => JobContext::new(job, batches),
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to load batches");
                let mut ctx = JobContext::new(job, Vec::new());
                ctx.fail(format!("failed to load batches: {}", e));
                return Some(self.finalize(ctx).await);
            }
        };

        if ctx.batches().is_empty() {
            tracing::error!(job_id = %job_id, "No batches found for processor job");
            ctx.fail("no batches associated with job");
            return Some(self.finalize(ctx).await);
        }

        let Some(steps) = self.registry.steps(pipeline) else {
            tracing::error!(job_id = %job_id, pipeline = %pipeline, "No steps registered for pipeline");
            ctx.fail(format!("no steps registered for pipeline {}", pipeline));
            return Some(self.finalize(ctx).await);
        };

        if steps.is_empty() {
            tracing::error!(job_id = %job_id, pipeline = %pipeline, "Empty pipeline specified");
        }

        for step in steps {
            tracing::debug!(job_id = %job_id, step = step.name(), "Running step");

            if let Err(e) = step.run(&mut ctx).await {
                tracing::error!(
                    job_id = %job_id,
                    step = step.name(),
                    error = %e,
                    "Unhandled error in pipeline step"
                );
                ctx.success = Some(false);
                ctx.failure_reason = Some(format!("step {} failed: {}", step.name(), e));
                break;
            }

            if ctx.has_failed() {
                tracing::error!(
                    job_id = %job_id,
                    step = step.name(),
                    "Step reported failure, terminating pipeline"
                );
                if ctx.failure_reason.is_none() {
                    ctx.failure_reason = Some(format!("step {} reported failure", step.name()));
                }
                break;
            }
        }

        Some(self.finalize(ctx).await)
    }

    /// Record the outcome and, on success, mark the batches processed.
    ///
    /// Never fails: storage errors here are logged and swallowed.
    async fn finalize(&self, ctx: JobContext) -> bool {
        let success = ctx.success.unwrap_or(true);
        let job_id = ctx.job_id();

        if let Some(paths) = &self.paths {
            let temp_dir = paths.job_temp_dir(job_id);
            if let Err(e) = tokio::fs::remove_dir_all(&temp_dir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(
                        job_id = %job_id,
                        path = %temp_dir.display(),
                        error = %e,
                        "Failed to remove temp directory"
                    );
                }
            }
        }

        match self
            .store
            .mark_finished(
                JobKind::Processor,
                job_id,
                success,
                ctx.failure_reason.as_deref(),
            )
            .await
        {
            Ok(_) => {}
            Err(e @ StoreError::Consistency { .. }) => {
                tracing::error!(job_id = %job_id, error = %e, "Conflicting outcome for finished job");
                return success;
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to record job outcome");
                return success;
            }
        }

        metrics::counter!(
            "refinery_jobs_finished_total",
            "kind" => JobKind::Processor.as_ref().to_string(),
            "outcome" => if success { "success" } else { "failure" }
        )
        .increment(1);

        if success {
            let ids: Vec<_> = ctx.batches().iter().map(|b| b.id).collect();
            if let Err(e) = self.store.set_batch_status(&ids, BatchStatus::Processed).await {
                tracing::error!(job_id = %job_id, error = %e, "Failed to mark batches processed");
            }
            tracing::info!(job_id = %job_id, batches = ids.len(), "Processor job completed");
        } else {
            tracing::warn!(
                job_id = %job_id,
                reason = ctx.failure_reason.as_deref().unwrap_or("unknown"),
                "Processor job failed"
            );
        }

        success
    }
}
