use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::pipeline::PipelineName;

pub type BatchId = Uuid;

/// Lifecycle status of a batch.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    New,
    Downloading,
    Downloaded,
    Processing,
    Processed,
    Failed,
}

/// One downloadable, processable unit of data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Batch {
    pub id: BatchId,
    pub source_type: String,
    /// File name of this batch inside its download (e.g. the archive member).
    pub name: String,
    /// Relative directory used for raw/temp/processed locations.
    pub internal_location: String,
    pub download_url: String,
    pub raw_format: String,
    pub processed_format: String,
    pub pipeline_required: PipelineName,
    pub size_in_bytes: i64,
    pub platform_accession_code: String,
    pub experiment_accession_code: String,
    pub organism_id: i64,
    pub organism_name: String,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A batch as produced by the discovery collaborator, before it is persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewBatch {
    pub source_type: String,
    pub name: String,
    pub internal_location: String,
    pub download_url: String,
    pub raw_format: String,
    pub processed_format: String,
    pub pipeline_required: PipelineName,
    pub size_in_bytes: i64,
    pub platform_accession_code: String,
    pub experiment_accession_code: String,
    pub organism_id: i64,
    pub organism_name: String,
}

impl Batch {
    /// Name of the processed output: the raw name with its extension
    /// replaced by `processed_format`.
    pub fn processed_name(&self) -> String {
        let stem = self.name.split('.').next().unwrap_or(&self.name);
        format!("{}.{}", stem, self.processed_format)
    }

    /// Last path segment of the download URL.
    pub fn download_file_name(&self) -> String {
        let path = match reqwest::Url::parse(&self.download_url) {
            Ok(url) => url.path().to_string(),
            Err(_) => self.download_url.clone(),
        };
        path.rsplit('/')
            .find(|segment| !segment.is_empty())
            .unwrap_or("download")
            .to_string()
    }
}
