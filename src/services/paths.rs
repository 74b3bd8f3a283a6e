use std::path::{Path, PathBuf};

use crate::models::batch::Batch;
use crate::models::job::JobId;

/// Where a batch's files live at each stage.
///
/// Raw and processed locations are object keys when remote storage is in
/// use and absolute local paths otherwise. Temp locations are always local
/// and are scoped by job id so concurrent jobs never share a directory.
pub trait PathResolver: Send + Sync {
    fn raw_dir(&self, batch: &Batch) -> PathBuf;

    fn raw_path(&self, batch: &Batch) -> PathBuf {
        self.raw_dir(batch).join(&batch.name)
    }

    /// Directory owned by one job; removed when the job is done with it.
    fn job_temp_dir(&self, job_id: JobId) -> PathBuf;

    fn temp_dir(&self, batch: &Batch, job_id: JobId) -> PathBuf {
        self.job_temp_dir(job_id).join(batch.id.to_string())
    }

    /// Local copy of the raw file a processor works on.
    fn temp_path(&self, batch: &Batch, job_id: JobId) -> PathBuf {
        self.temp_dir(batch, job_id).join(&batch.name)
    }

    /// Processor output before it is moved to its processed location.
    fn temp_post_path(&self, batch: &Batch, job_id: JobId) -> PathBuf {
        self.temp_dir(batch, job_id).join(batch.processed_name())
    }

    fn processed_path(&self, batch: &Batch) -> PathBuf;

    /// Whether raw/processed locations are object storage keys.
    fn is_remote(&self) -> bool;
}

/// Prefix-based layout under one local root.
#[derive(Debug, Clone)]
pub struct FsLayout {
    pub local_root: PathBuf,
    pub raw_prefix: String,
    pub temp_prefix: String,
    pub processed_prefix: String,
    pub remote: bool,
}

impl FsLayout {
    pub fn new(local_root: impl Into<PathBuf>) -> Self {
        Self {
            local_root: local_root.into(),
            raw_prefix: "raw".to_string(),
            temp_prefix: "temp".to_string(),
            processed_prefix: "processed".to_string(),
            remote: false,
        }
    }

    pub fn with_remote(mut self, remote: bool) -> Self {
        self.remote = remote;
        self
    }

    fn durable_root(&self, prefix: &str) -> PathBuf {
        if self.remote {
            PathBuf::from(prefix)
        } else {
            self.local_root.join(prefix)
        }
    }
}

impl PathResolver for FsLayout {
    fn raw_dir(&self, batch: &Batch) -> PathBuf {
        self.durable_root(&self.raw_prefix)
            .join(&batch.internal_location)
    }

    fn job_temp_dir(&self, job_id: JobId) -> PathBuf {
        self.local_root
            .join(&self.temp_prefix)
            .join(job_id.to_string())
    }

    fn processed_path(&self, batch: &Batch) -> PathBuf {
        self.durable_root(&self.processed_prefix)
            .join(&batch.internal_location)
            .join(batch.processed_name())
    }

    fn is_remote(&self) -> bool {
        self.remote
    }
}

/// Object storage key for a path produced by a remote layout.
pub fn object_key(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::batch::BatchStatus;
    use crate::models::pipeline::PipelineName;
    use chrono::Utc;
    use uuid::Uuid;

    fn batch() -> Batch {
        let now = Utc::now();
        Batch {
            id: Uuid::new_v4(),
            source_type: "ARRAY_EXPRESS".to_string(),
            name: "GSM1426072.CEL".to_string(),
            internal_location: "A-AFFY-141/AFFY_TO_PCL".to_string(),
            download_url: "https://example.org/E-GEOD-59071.raw.3.zip".to_string(),
            raw_format: "CEL".to_string(),
            processed_format: "PCL".to_string(),
            pipeline_required: PipelineName::AffyToPcl,
            size_in_bytes: 0,
            platform_accession_code: "A-AFFY-141".to_string(),
            experiment_accession_code: "E-GEOD-59071".to_string(),
            organism_id: 9606,
            organism_name: "HOMO SAPIENS".to_string(),
            status: BatchStatus::New,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_local_layout() {
        let layout = FsLayout::new("/data");
        let batch = batch();
        assert_eq!(
            layout.raw_path(&batch),
            PathBuf::from("/data/raw/A-AFFY-141/AFFY_TO_PCL/GSM1426072.CEL")
        );
        assert_eq!(
            layout.processed_path(&batch),
            PathBuf::from("/data/processed/A-AFFY-141/AFFY_TO_PCL/GSM1426072.PCL")
        );
    }

    #[test]
    fn test_remote_layout_drops_root_for_durable_paths() {
        let layout = FsLayout::new("/data").with_remote(true);
        let batch = batch();
        assert_eq!(
            object_key(&layout.raw_path(&batch)),
            "raw/A-AFFY-141/AFFY_TO_PCL/GSM1426072.CEL"
        );
        assert!(layout.job_temp_dir(Uuid::new_v4()).starts_with("/data/temp"));
    }

    #[test]
    fn test_temp_paths_are_scoped_by_job() {
        let layout = FsLayout::new("/data");
        let batch = batch();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        assert_ne!(layout.temp_path(&batch, first), layout.temp_path(&batch, second));
        assert!(layout
            .temp_post_path(&batch, first)
            .starts_with(layout.job_temp_dir(first)));
    }
}
