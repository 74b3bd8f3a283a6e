//! Downloader jobs: fetch one archive, unpack it into per-batch raw
//! locations and hand every batch over to a new processor job.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::db::{JobStore, StoreError};
use crate::models::batch::{Batch, BatchStatus};
use crate::models::job::{JobId, JobKind, WorkerIdentity};
use crate::models::pipeline::PipelineName;
use crate::services::paths::{object_key, PathResolver};
use crate::services::queue::Dispatcher;
use crate::services::retry::{with_retries, IsRetryable, TRANSIENT_ATTEMPTS};
use crate::services::storage::{upload_file, ObjectStore, StorageError};

/// Chooses the processing pipeline for a freshly downloaded batch.
pub type PipelineSelector = Arc<dyn Fn(&Batch) -> PipelineName + Send + Sync>;

/// Batches are only grouped into one job when they come from one archive.
pub fn verify_batch_grouping(batches: &[Batch]) -> Result<(), DownloadError> {
    let Some(first) = batches.first() else {
        return Err(DownloadError::NoBatches);
    };
    match batches.iter().find(|b| b.download_url != first.download_url) {
        Some(other) => Err(DownloadError::Grouping {
            expected: first.download_url.clone(),
            found: other.download_url.clone(),
        }),
        None => Ok(()),
    }
}

/// Extract every file entry of a zip archive into `dest`.
fn extract_zip(archive_path: &Path, dest: &Path) -> Result<Vec<PathBuf>, DownloadError> {
    let file = std::fs::File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file)?;
    let mut extracted = Vec::new();

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let Some(relative) = entry.enclosed_name().map(|p| p.to_path_buf()) else {
            tracing::warn!(entry = entry.name(), "Skipping archive entry with unsafe path");
            continue;
        };
        let out_path = dest.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::fs::File::create(&out_path)?;
        std::io::copy(&mut entry, &mut out)?;
        extracted.push(out_path);
    }

    Ok(extracted)
}

fn is_zip(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("zip"))
        .unwrap_or(false)
}

/// Runs downloader jobs.
pub struct DownloadWorker {
    store: Arc<dyn JobStore>,
    dispatcher: Arc<dyn Dispatcher>,
    paths: Arc<dyn PathResolver>,
    objects: Option<Arc<dyn ObjectStore>>,
    http: reqwest::Client,
    worker: WorkerIdentity,
    select_pipeline: PipelineSelector,
}

impl DownloadWorker {
    pub fn new(
        store: Arc<dyn JobStore>,
        dispatcher: Arc<dyn Dispatcher>,
        paths: Arc<dyn PathResolver>,
        objects: Option<Arc<dyn ObjectStore>>,
        worker: WorkerIdentity,
    ) -> Self {
        Self {
            store,
            dispatcher,
            paths,
            objects,
            http: reqwest::Client::new(),
            worker,
            select_pipeline: Arc::new(|batch: &Batch| batch.pipeline_required),
        }
    }

    /// Replace the default batch-to-pipeline mapping (`pipeline_required`).
    pub fn with_pipeline_selector(mut self, select: PipelineSelector) -> Self {
        self.select_pipeline = select;
        self
    }

    /// Run one downloader job to completion.
    ///
    /// Returns the recorded outcome, or `None` when the job could not be
    /// loaded or started.
    pub async fn run(&self, job_id: JobId) -> Option<bool> {
        match self.store.get_job(JobKind::Downloader, job_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                tracing::error!(job_id = %job_id, "Cannot find downloader job record");
                return None;
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to load downloader job");
                return None;
            }
        }

        let job = match self
            .store
            .mark_started(JobKind::Downloader, job_id, &self.worker)
            .await
        {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to mark downloader job started");
                return None;
            }
        };

        tracing::info!(job_id = %job_id, num_retries = job.num_retries, "Starting downloader job");

        let outcome = match self.store.job_batches(JobKind::Downloader, job_id).await {
            Ok(batches) => self.download_and_hand_off(job_id, &batches).await,
            Err(e) => Err(DownloadError::Store(e)),
        };

        let failure_reason = match &outcome {
            Ok(()) => None,
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Downloader job failed");
                Some(e.to_string())
            }
        };
        let success = outcome.is_ok();

        match self
            .store
            .mark_finished(JobKind::Downloader, job_id, success, failure_reason.as_deref())
            .await
        {
            Ok(_) => {
                metrics::counter!(
                    "refinery_jobs_finished_total",
                    "kind" => JobKind::Downloader.as_ref().to_string(),
                    "outcome" => if success { "success" } else { "failure" }
                )
                .increment(1);
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to record downloader job outcome");
            }
        }

        Some(success)
    }

    async fn download_and_hand_off(&self, job_id: JobId, batches: &[Batch]) -> Result<(), DownloadError> {
        verify_batch_grouping(batches)?;

        // A retried job only redoes the batches its predecessor did not hand off.
        let pending: Vec<Batch> = batches
            .iter()
            .filter(|b| b.status == BatchStatus::New)
            .cloned()
            .collect();
        if pending.is_empty() {
            tracing::info!(job_id = %job_id, "All batches already handed off");
            return Ok(());
        }
        let batches = pending.as_slice();

        let temp_dir = self.paths.job_temp_dir(job_id);
        let result = self.fetch_into_raw(job_id, batches, &temp_dir).await;

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
        result?;

        tracing::info!(job_id = %job_id, batches = batches.len(), "Downloaded and extracted");

        for batch in batches {
            let pipeline = (self.select_pipeline)(batch);
            let Some(processor_job) = self
                .store
                .hand_off_batch(batch.id, pipeline, self.dispatcher.as_ref())
                .await?
            else {
                tracing::info!(job_id = %job_id, batch_id = %batch.id, "Batch already handed off");
                continue;
            };
            tracing::debug!(
                job_id = %job_id,
                batch_id = %batch.id,
                processor_job_id = %processor_job.id,
                pipeline = %pipeline,
                "Queued processor job"
            );
        }

        Ok(())
    }

    /// Download the shared URL into the job temp dir and place each batch's
    /// file at its raw location.
    async fn fetch_into_raw(
        &self,
        job_id: JobId,
        batches: &[Batch],
        temp_dir: &Path,
    ) -> Result<(), DownloadError> {
        let first = &batches[0];
        tokio::fs::create_dir_all(temp_dir).await?;
        let download_path = temp_dir.join(first.download_file_name());

        let bytes = with_retries(TRANSIENT_ATTEMPTS, "download", || {
            self.download_file(&first.download_url, &download_path)
        })
        .await?;
        tracing::debug!(job_id = %job_id, url = %first.download_url, bytes, "Download complete");

        let extracted_dir = temp_dir.join("extracted");
        if is_zip(&download_path) {
            let archive = download_path.clone();
            let dest = extracted_dir.clone();
            tokio::task::spawn_blocking(move || extract_zip(&archive, &dest))
                .await
                .map_err(|e| DownloadError::Extract(e.to_string()))??;
        }

        for batch in batches {
            let source = if is_zip(&download_path) {
                extracted_dir.join(&batch.name)
            } else {
                download_path.clone()
            };
            if !tokio::fs::try_exists(&source).await? {
                return Err(DownloadError::MissingFile(batch.name.clone()));
            }
            self.store_raw_file(&source, batch).await?;
        }

        Ok(())
    }

    async fn store_raw_file(&self, source: &Path, batch: &Batch) -> Result<(), DownloadError> {
        let raw_path = self.paths.raw_path(batch);
        if self.paths.is_remote() {
            let objects = self
                .objects
                .as_deref()
                .ok_or_else(|| StorageError::Config("remote storage without object store".to_string()))?;
            upload_file(objects, &object_key(&raw_path), source).await?;
        } else {
            if let Some(parent) = raw_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(source, &raw_path).await?;
        }
        Ok(())
    }

    /// Stream `url` to `dest`, returning the number of bytes written.
    async fn download_file(&self, url: &str, dest: &Path) -> Result<u64, DownloadError> {
        use tokio::io::AsyncWriteExt;

        let mut response = self.http.get(url).send().await?.error_for_status()?;
        let mut file = tokio::fs::File::create(dest).await?;
        let mut written = 0u64;

        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        Ok(written)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("no batches associated with job")]
    NoBatches,

    #[error("batches in one job must share a download URL: expected {expected}, found {found}")]
    Grouping { expected: String, found: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("extraction failed: {0}")]
    Extract(String),

    #[error("file {0} not found in download")]
    MissingFile(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl IsRetryable for DownloadError {
    fn is_retryable(&self) -> bool {
        match self {
            DownloadError::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().map(|s| s.is_server_error()).unwrap_or(false)
            }
            DownloadError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}
