//! Shared fakes and fixtures for the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use data_refinery::models::batch::NewBatch;
use data_refinery::models::job::{JobId, JobKind};
use data_refinery::models::pipeline::PipelineName;
use data_refinery::services::queue::{DispatchError, Dispatcher};
use data_refinery::services::storage::{ObjectStore, StorageError};
use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Dispatcher that records every successful submission and can be told to
/// fail a number of attempts first.
#[derive(Default)]
pub struct RecordingDispatcher {
    dispatched: Mutex<Vec<(JobKind, JobId)>>,
    successes_left: AtomicUsize,
    failures_left: AtomicUsize,
    attempts: AtomicUsize,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` attempts with a transient error.
    pub fn failing(n: usize) -> Self {
        let dispatcher = Self::default();
        dispatcher.failures_left.store(n, Ordering::SeqCst);
        dispatcher
    }

    pub fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Let `successes` attempts through, then fail the following `failures`.
    pub fn fail_after(&self, successes: usize, failures: usize) {
        self.successes_left.store(successes, Ordering::SeqCst);
        self.failures_left.store(failures, Ordering::SeqCst);
    }

    pub fn dispatched(&self) -> Vec<(JobKind, JobId)> {
        self.dispatched.lock().unwrap().clone()
    }

    pub fn count_for(&self, job_id: JobId) -> usize {
        self.dispatched()
            .iter()
            .filter(|(_, id)| *id == job_id)
            .count()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dispatcher for RecordingDispatcher {
    async fn dispatch(&self, kind: JobKind, job_id: JobId) -> Result<(), DispatchError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let allowed = self
            .successes_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let failing = !allowed
            && self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(DispatchError::Unavailable("queue offline".to_string()));
        }
        self.dispatched.lock().unwrap().push((kind, job_id));
        Ok(())
    }
}

/// Object store backed by a map.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.objects.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn insert(&self, key: &str, data: &[u8]) {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), data.to_vec());
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(
        &self,
        key: &str,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), StorageError> {
        let data = self
            .object(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        sink.write_all(&data).await?;
        Ok(())
    }

    async fn put(
        &self,
        key: &str,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<(), StorageError> {
        let mut data = Vec::new();
        source.read_to_end(&mut data).await?;
        self.insert(key, &data);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }
}

pub fn sample_new_batch(download_url: &str, name: &str) -> NewBatch {
    NewBatch {
        source_type: "ARRAY_EXPRESS".to_string(),
        name: name.to_string(),
        internal_location: "A-AFFY-141/AFFY_TO_PCL".to_string(),
        download_url: download_url.to_string(),
        raw_format: "CEL".to_string(),
        processed_format: "PCL".to_string(),
        pipeline_required: PipelineName::AffyToPcl,
        size_in_bytes: 1024,
        platform_accession_code: "A-AFFY-141".to_string(),
        experiment_accession_code: "E-GEOD-59071".to_string(),
        organism_id: 9606,
        organism_name: "HOMO SAPIENS".to_string(),
    }
}

/// Zip archive containing the given (name, contents) entries.
pub fn zip_archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::FileOptions::default();
    for (name, contents) in entries {
        writer.start_file(*name, options).unwrap();
        writer.write_all(contents).unwrap();
    }
    writer.finish().unwrap().into_inner()
}
