//! Built-in processor steps that move files between raw, temp and processed
//! locations. Scientific transformations are registered next to these by
//! whoever deploys the workers.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

use super::{JobContext, PipelineRegistry, Step, StepError};
use crate::models::pipeline::PipelineName;
use crate::services::paths::{object_key, PathResolver};
use crate::services::storage::{download_to_file, upload_file, ObjectStore};

fn remote_store(objects: &Option<Arc<dyn ObjectStore>>) -> Result<&dyn ObjectStore, StepError> {
    objects
        .as_deref()
        .ok_or_else(|| StepError::Failed("remote storage enabled without an object store".to_string()))
}

async fn ensure_parent(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) => tokio::fs::create_dir_all(parent).await,
        None => Ok(()),
    }
}

/// Copies each batch's raw file into the job's temp area.
pub struct FetchRawFiles {
    paths: Arc<dyn PathResolver>,
    objects: Option<Arc<dyn ObjectStore>>,
}

impl FetchRawFiles {
    pub fn new(paths: Arc<dyn PathResolver>, objects: Option<Arc<dyn ObjectStore>>) -> Self {
        Self { paths, objects }
    }
}

#[async_trait]
impl Step for FetchRawFiles {
    fn name(&self) -> &str {
        "fetch_raw_files"
    }

    async fn run(&self, ctx: &mut JobContext) -> Result<(), StepError> {
        let job_id = ctx.job_id();
        for batch in ctx.batches() {
            let raw_path = self.paths.raw_path(batch);
            let temp_path = self.paths.temp_path(batch, job_id);
            ensure_parent(&temp_path).await?;

            if self.paths.is_remote() {
                download_to_file(remote_store(&self.objects)?, &object_key(&raw_path), &temp_path)
                    .await?;
            } else {
                tokio::fs::copy(&raw_path, &temp_path).await?;
            }

            tracing::debug!(
                job_id = %job_id,
                batch_id = %batch.id,
                path = %temp_path.display(),
                "Fetched raw file"
            );
        }
        Ok(())
    }
}

/// Identity transform: the processed file is the raw file.
pub struct PassThrough {
    paths: Arc<dyn PathResolver>,
}

impl PassThrough {
    pub fn new(paths: Arc<dyn PathResolver>) -> Self {
        Self { paths }
    }
}

#[async_trait]
impl Step for PassThrough {
    fn name(&self) -> &str {
        "pass_through"
    }

    async fn run(&self, ctx: &mut JobContext) -> Result<(), StepError> {
        let job_id = ctx.job_id();
        for batch in ctx.batches() {
            tokio::fs::copy(
                self.paths.temp_path(batch, job_id),
                self.paths.temp_post_path(batch, job_id),
            )
            .await?;
        }
        Ok(())
    }
}

/// Moves processed output to its durable location.
///
/// A failed upload fails the job; the batch temp directory is removed
/// either way.
pub struct UploadProcessedFiles {
    paths: Arc<dyn PathResolver>,
    objects: Option<Arc<dyn ObjectStore>>,
}

impl UploadProcessedFiles {
    pub fn new(paths: Arc<dyn PathResolver>, objects: Option<Arc<dyn ObjectStore>>) -> Self {
        Self { paths, objects }
    }

    async fn upload(&self, source: &Path, destination: &Path) -> Result<(), StepError> {
        if self.paths.is_remote() {
            upload_file(remote_store(&self.objects)?, &object_key(destination), source).await?;
        } else {
            ensure_parent(destination).await?;
            tokio::fs::copy(source, destination).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Step for UploadProcessedFiles {
    fn name(&self) -> &str {
        "upload_processed_files"
    }

    async fn run(&self, ctx: &mut JobContext) -> Result<(), StepError> {
        let job_id = ctx.job_id();
        let batches = ctx.batches().to_vec();

        for batch in &batches {
            let source = self.paths.temp_post_path(batch, job_id);
            let destination = self.paths.processed_path(batch);
            let result = self.upload(&source, &destination).await;

            let temp_dir = self.paths.temp_dir(batch, job_id);
            if let Err(e) = tokio::fs::remove_dir_all(&temp_dir).await {
                tracing::warn!(
                    job_id = %job_id,
                    path = %temp_dir.display(),
                    error = %e,
                    "Failed to remove temp directory"
                );
            }

            if let Err(e) = result {
                tracing::error!(
                    job_id = %job_id,
                    batch_id = %batch.id,
                    path = %destination.display(),
                    error = %e,
                    "Failed to upload processed file"
                );
                ctx.fail(format!(
                    "failed to upload processed file {}",
                    destination.display()
                ));
                return Ok(());
            }
        }
        Ok(())
    }
}

/// Removes raw files once processing succeeded. Failures are only logged.
pub struct CleanupRawFiles {
    paths: Arc<dyn PathResolver>,
    objects: Option<Arc<dyn ObjectStore>>,
}

impl CleanupRawFiles {
    pub fn new(paths: Arc<dyn PathResolver>, objects: Option<Arc<dyn ObjectStore>>) -> Self {
        Self { paths, objects }
    }

    async fn remove(&self, raw_path: &Path) -> Result<(), StepError> {
        if self.paths.is_remote() {
            remote_store(&self.objects)?
                .delete(&object_key(raw_path))
                .await?;
        } else {
            tokio::fs::remove_file(raw_path).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Step for CleanupRawFiles {
    fn name(&self) -> &str {
        "cleanup_raw_files"
    }

    async fn run(&self, ctx: &mut JobContext) -> Result<(), StepError> {
        for batch in ctx.batches() {
            let raw_path = self.paths.raw_path(batch);
            if let Err(e) = self.remove(&raw_path).await {
                tracing::warn!(
                    job_id = %ctx.job_id(),
                    batch_id = %batch.id,
                    path = %raw_path.display(),
                    error = %e,
                    "Failed to remove raw file"
                );
            }
        }
        Ok(())
    }
}

/// Registry with the pipelines this crate can run on its own.
pub fn default_registry(
    paths: Arc<dyn PathResolver>,
    objects: Option<Arc<dyn ObjectStore>>,
) -> PipelineRegistry {
    let no_op: Vec<Arc<dyn Step>> = vec![
        Arc::new(FetchRawFiles::new(paths.clone(), objects.clone())),
        Arc::new(PassThrough::new(paths.clone())),
        Arc::new(UploadProcessedFiles::new(paths.clone(), objects.clone())),
        Arc::new(CleanupRawFiles::new(paths, objects)),
    ];

    let mut registry = PipelineRegistry::new();
    registry.register(PipelineName::NoOp, no_op);
    registry
}
