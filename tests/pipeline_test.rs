mod helpers;

use async_trait::async_trait;
use data_refinery::db::{JobStore, MemoryJobStore, StoreError};
use data_refinery::models::batch::{Batch, BatchId, BatchStatus, NewBatch};
use data_refinery::models::job::{Job, JobId, JobKind, JobPayload, StuckQuery, WorkerIdentity};
use data_refinery::models::pipeline::PipelineName;
use data_refinery::pipeline::steps::{default_registry, FetchRawFiles};
use data_refinery::pipeline::{JobContext, PipelineExecutor, PipelineRegistry, Step, StepError};
use data_refinery::services::paths::{object_key, FsLayout, PathResolver};
use data_refinery::services::queue::Dispatcher;
use data_refinery::services::storage::ObjectStore;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use helpers::{sample_new_batch, MemoryObjectStore};

const URL: &str = "https://example.org/E-GEOD-59071.raw.3.zip";

/// What a scripted step does when run.
#[derive(Clone, Copy)]
enum Behaviour {
    Pass,
    Error,
    ReportFailure,
}

struct ScriptedStep {
    name: &'static str,
    behaviour: Behaviour,
    log: Arc<Mutex<Vec<&'static str>>>,
}

#[async_trait]
impl Step for ScriptedStep {
    fn name(&self) -> &str {
        self.name
    }

    async fn run(&self, ctx: &mut JobContext) -> Result<(), StepError> {
        self.log.lock().unwrap().push(self.name);
        match self.behaviour {
            Behaviour::Pass => {
                ctx.insert(self.name, serde_json::json!(true));
                Ok(())
            }
            Behaviour::Error => Err(StepError::Failed("simulated crash".to_string())),
            Behaviour::ReportFailure => {
                ctx.fail(format!("{} rejected the input", self.name));
                Ok(())
            }
        }
    }
}

struct Fixture {
    store: Arc<MemoryJobStore>,
    log: Arc<Mutex<Vec<&'static str>>>,
    registry: PipelineRegistry,
}

impl Fixture {
    fn new() -> Self {
        Self {
            store: Arc::new(MemoryJobStore::new()),
            log: Arc::new(Mutex::new(Vec::new())),
            registry: PipelineRegistry::new(),
        }
    }

    fn register(&mut self, pipeline: PipelineName, script: &[(&'static str, Behaviour)]) {
        let steps: Vec<Arc<dyn Step>> = script
            .iter()
            .map(|&(name, behaviour)| {
                Arc::new(ScriptedStep {
                    name,
                    behaviour,
                    log: self.log.clone(),
                }) as Arc<dyn Step>
            })
            .collect();
        self.registry.register(pipeline, steps);
    }

    fn executor(self) -> (PipelineExecutor, Arc<MemoryJobStore>, Arc<Mutex<Vec<&'static str>>>) {
        let executor = PipelineExecutor::new(
            self.store.clone(),
            Arc::new(self.registry),
            WorkerIdentity::new("test-worker"),
        );
        (executor, self.store, self.log)
    }
}

async fn processor_job(store: &MemoryJobStore, pipeline: PipelineName, batches: usize) -> JobId {
    let mut ids = Vec::new();
    for i in 0..batches {
        let batch = store
            .insert_batch(sample_new_batch(URL, &format!("GSM{}.CEL", i)))
            .await
            .unwrap();
        ids.push(batch.id);
    }
    store
        .create_job(JobPayload::Processor { pipeline }, &ids)
        .await
        .unwrap()
        .id
}

#[tokio::test]
async fn test_all_steps_pass() {
    let mut fixture = Fixture::new();
    fixture.register(
        PipelineName::AffyToPcl,
        &[("fetch", Behaviour::Pass), ("convert", Behaviour::Pass)],
    );
    let (executor, store, log) = fixture.executor();
    let job_id = processor_job(&store, PipelineName::AffyToPcl, 2).await;

    assert_eq!(executor.run(job_id).await, Some(true));
    assert_eq!(*log.lock().unwrap(), vec!["fetch", "convert"]);

    let job = store.get_job(JobKind::Processor, job_id).await.unwrap().unwrap();
    assert_eq!(job.success, Some(true));
    assert!(job.start_time.is_some() && job.end_time.is_some());
    assert_eq!(job.worker_id.as_deref(), Some("test-worker"));

    for batch in store.job_batches(JobKind::Processor, job_id).await.unwrap() {
        assert_eq!(batch.status, BatchStatus::Processed);
    }
}

#[tokio::test]
async fn test_step_error_stops_pipeline() {
    let mut fixture = Fixture::new();
    fixture.register(
        PipelineName::AffyToPcl,
        &[
            ("fetch", Behaviour::Pass),
            ("convert", Behaviour::Error),
            ("upload", Behaviour::Pass),
        ],
    );
    let (executor, store, log) = fixture.executor();
    let job_id = processor_job(&store, PipelineName::AffyToPcl, 1).await;

    assert_eq!(executor.run(job_id).await, Some(false));
    assert_eq!(*log.lock().unwrap(), vec!["fetch", "convert"]);
    assert_eq!(store.finish_calls(job_id).await, 1);

    let job = store.get_job(JobKind::Processor, job_id).await.unwrap().unwrap();
    assert_eq!(job.success, Some(false));
    let reason = job.failure_reason.unwrap();
    assert!(reason.contains("convert"), "unexpected reason: {}", reason);

    let batches = store.job_batches(JobKind::Processor, job_id).await.unwrap();
    assert_eq!(batches[0].status, BatchStatus::New);
}

#[tokio::test]
async fn test_reported_failure_short_circuits() {
    let mut fixture = Fixture::new();
    fixture.register(
        PipelineName::Salmon,
        &[
            ("quantify", Behaviour::ReportFailure),
            ("upload", Behaviour::Pass),
        ],
    );
    let (executor, store, log) = fixture.executor();
    let job_id = processor_job(&store, PipelineName::Salmon, 1).await;

    assert_eq!(executor.run(job_id).await, Some(false));
    assert_eq!(*log.lock().unwrap(), vec!["quantify"]);
    assert_eq!(store.finish_calls(job_id).await, 1);

    let job = store.get_job(JobKind::Processor, job_id).await.unwrap().unwrap();
    assert_eq!(job.failure_reason.as_deref(), Some("quantify rejected the input"));
}

#[tokio::test]
async fn test_empty_pipeline_succeeds() {
    let mut fixture = Fixture::new();
    fixture.register(PipelineName::TranscriptomeIndexLong, &[]);
    let (executor, store, _) = fixture.executor();
    let job_id = processor_job(&store, PipelineName::TranscriptomeIndexLong, 1).await;

    assert_eq!(executor.run(job_id).await, Some(true));
    assert_eq!(store.finish_calls(job_id).await, 1);
}

#[tokio::test]
async fn test_unregistered_pipeline_fails_job() {
    let (executor, store, _) = Fixture::new().executor();
    let job_id = processor_job(&store, PipelineName::Salmon, 1).await;

    assert_eq!(executor.run(job_id).await, Some(false));
    let job = store.get_job(JobKind::Processor, job_id).await.unwrap().unwrap();
    assert_eq!(job.success, Some(false));
    assert!(job.failure_reason.unwrap().contains("SALMON"));
}

#[tokio::test]
async fn test_job_without_batches_fails() {
    let mut fixture = Fixture::new();
    fixture.register(PipelineName::AffyToPcl, &[("fetch", Behaviour::Pass)]);
    let (executor, store, log) = fixture.executor();
    let job_id = processor_job(&store, PipelineName::AffyToPcl, 0).await;

    assert_eq!(executor.run(job_id).await, Some(false));
    assert!(log.lock().unwrap().is_empty());
    assert_eq!(store.finish_calls(job_id).await, 1);
}

#[tokio::test]
async fn test_missing_job_is_not_finalized() {
    let (executor, store, _) = Fixture::new().executor();
    let job_id = uuid::Uuid::new_v4();

    assert_eq!(executor.run(job_id).await, None);
    assert_eq!(store.finish_calls(job_id).await, 0);
}

#[tokio::test]
async fn test_no_op_pipeline_on_local_disk() {
    let root = tempfile::tempdir().unwrap();
    let layout = FsLayout::new(root.path());
    let paths: Arc<dyn PathResolver> = Arc::new(layout.clone());
    let store = Arc::new(MemoryJobStore::new());

    let batch = store
        .insert_batch(sample_new_batch(URL, "GSM1426072.CEL"))
        .await
        .unwrap();
    let raw_path = layout.raw_path(&batch);
    tokio::fs::create_dir_all(raw_path.parent().unwrap()).await.unwrap();
    tokio::fs::write(&raw_path, b"intensities").await.unwrap();

    let job = store
        .create_job(JobPayload::Processor { pipeline: PipelineName::NoOp }, &[batch.id])
        .await
        .unwrap();

    let executor = PipelineExecutor::new(
        store.clone(),
        Arc::new(default_registry(paths.clone(), None)),
        WorkerIdentity::new("test-worker"),
    );
    assert_eq!(executor.run(job.id).await, Some(true));

    let processed = tokio::fs::read(layout.processed_path(&batch)).await.unwrap();
    assert_eq!(processed, b"intensities");
    assert!(!raw_path.exists());
    assert!(!layout.temp_dir(&batch, job.id).exists());

    let batch = store.get_batch(batch.id).await.unwrap().unwrap();
    assert_eq!(batch.status, BatchStatus::Processed);
}

#[tokio::test]
async fn test_no_op_pipeline_on_object_storage() {
    let root = tempfile::tempdir().unwrap();
    let layout = FsLayout::new(root.path()).with_remote(true);
    let paths: Arc<dyn PathResolver> = Arc::new(layout.clone());
    let objects = Arc::new(MemoryObjectStore::default());
    let store = Arc::new(MemoryJobStore::new());

    let batch = store
        .insert_batch(sample_new_batch(URL, "GSM1426072.CEL"))
        .await
        .unwrap();
    let raw_key = object_key(&layout.raw_path(&batch));
    objects.insert(&raw_key, b"intensities");

    let job = store
        .create_job(JobPayload::Processor { pipeline: PipelineName::NoOp }, &[batch.id])
        .await
        .unwrap();

    let object_store: Arc<dyn ObjectStore> = objects.clone();
    let executor = PipelineExecutor::new(
        store.clone(),
        Arc::new(default_registry(paths, Some(object_store))),
        WorkerIdentity::new("test-worker"),
    );
    assert_eq!(executor.run(job.id).await, Some(true));

    let processed_key = object_key(&layout.processed_path(&batch));
    assert_eq!(objects.keys(), vec![processed_key.clone()]);
    assert_eq!(objects.object(&processed_key).unwrap(), b"intensities");
}

#[tokio::test]
async fn test_no_op_pipeline_fails_when_raw_file_missing() {
    let root = tempfile::tempdir().unwrap();
    let paths: Arc<dyn PathResolver> = Arc::new(FsLayout::new(root.path()));
    let store = Arc::new(MemoryJobStore::new());
    let job_id = processor_job(&store, PipelineName::NoOp, 1).await;

    let executor = PipelineExecutor::new(
        store.clone(),
        Arc::new(default_registry(paths, None)),
        WorkerIdentity::new("test-worker"),
    );
    assert_eq!(executor.run(job_id).await, Some(false));

    let job = store.get_job(JobKind::Processor, job_id).await.unwrap().unwrap();
    assert!(job.failure_reason.unwrap().contains("fetch_raw_files"));
}

#[tokio::test]
async fn test_temp_dir_removed_when_step_fails_before_upload() {
    let root = tempfile::tempdir().unwrap();
    let layout = FsLayout::new(root.path());
    let paths: Arc<dyn PathResolver> = Arc::new(layout.clone());
    let store = Arc::new(MemoryJobStore::new());

    let batch = store
        .insert_batch(sample_new_batch(URL, "GSM1426072.CEL"))
        .await
        .unwrap();
    let raw_path = layout.raw_path(&batch);
    tokio::fs::create_dir_all(raw_path.parent().unwrap()).await.unwrap();
    tokio::fs::write(&raw_path, b"intensities").await.unwrap();
    let job = store
        .create_job(JobPayload::Processor { pipeline: PipelineName::AffyToPcl }, &[batch.id])
        .await
        .unwrap();

    let log = Arc::new(Mutex::new(Vec::new()));
    let mut registry = PipelineRegistry::new();
    registry.register(
        PipelineName::AffyToPcl,
        vec![
            Arc::new(FetchRawFiles::new(paths.clone(), None)) as Arc<dyn Step>,
            Arc::new(ScriptedStep {
                name: "convert",
                behaviour: Behaviour::Error,
                log: log.clone(),
            }) as Arc<dyn Step>,
        ],
    );

    let executor = PipelineExecutor::new(
        store.clone(),
        Arc::new(registry),
        WorkerIdentity::new("test-worker"),
    )
    .with_temp_cleanup(paths);
    assert_eq!(executor.run(job.id).await, Some(false));

    assert_eq!(*log.lock().unwrap(), vec!["convert"]);
    assert!(!layout.job_temp_dir(job.id).exists());
    assert!(raw_path.exists());
}

/// Memory store whose `mark_finished` always errors.
struct UnrecordableStore {
    inner: MemoryJobStore,
    finish_calls: AtomicUsize,
}

#[async_trait]
impl JobStore for UnrecordableStore {
    async fn insert_batch(&self, batch: NewBatch) -> Result<Batch, StoreError> {
        self.inner.insert_batch(batch).await
    }

    async fn get_batch(&self, id: BatchId) -> Result<Option<Batch>, StoreError> {
        self.inner.get_batch(id).await
    }

    async fn set_batch_status(&self, ids: &[BatchId], status: BatchStatus) -> Result<(), StoreError> {
        self.inner.set_batch_status(ids, status).await
    }

    async fn create_job(&self, payload: JobPayload, batches: &[BatchId]) -> Result<Job, StoreError> {
        self.inner.create_job(payload, batches).await
    }

    async fn get_job(&self, kind: JobKind, id: JobId) -> Result<Option<Job>, StoreError> {
        self.inner.get_job(kind, id).await
    }

    async fn job_batches(&self, kind: JobKind, id: JobId) -> Result<Vec<Batch>, StoreError> {
        self.inner.job_batches(kind, id).await
    }

    async fn mark_started(
        &self,
        kind: JobKind,
        id: JobId,
        worker: &WorkerIdentity,
    ) -> Result<Job, StoreError> {
        self.inner.mark_started(kind, id, worker).await
    }

    async fn mark_finished(
        &self,
        _kind: JobKind,
        _id: JobId,
        _success: bool,
        _failure_reason: Option<&str>,
    ) -> Result<Job, StoreError> {
        self.finish_calls.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Corrupt("connection reset".to_string()))
    }

    async fn requeue(&self, kind: JobKind, id: JobId) -> Result<Job, StoreError> {
        self.inner.requeue(kind, id).await
    }

    async fn give_up(&self, kind: JobKind, id: JobId) -> Result<Job, StoreError> {
        self.inner.give_up(kind, id).await
    }

    async fn find_stuck(&self, kind: JobKind, query: StuckQuery) -> Result<Vec<Job>, StoreError> {
        self.inner.find_stuck(kind, query).await
    }

    async fn hand_off_batch(
        &self,
        batch_id: BatchId,
        pipeline: PipelineName,
        dispatcher: &dyn Dispatcher,
    ) -> Result<Option<Job>, StoreError> {
        self.inner.hand_off_batch(batch_id, pipeline, dispatcher).await
    }
}

#[tokio::test]
async fn test_store_error_while_finalizing_is_logged_once() {
    for (behaviour, expected) in [(Behaviour::Pass, true), (Behaviour::Error, false)] {
        let store = Arc::new(UnrecordableStore {
            inner: MemoryJobStore::new(),
            finish_calls: AtomicUsize::new(0),
        });
        let job_id = processor_job(&store.inner, PipelineName::AffyToPcl, 1).await;

        let mut registry = PipelineRegistry::new();
        registry.register(
            PipelineName::AffyToPcl,
            vec![Arc::new(ScriptedStep {
                name: "convert",
                behaviour,
                log: Arc::new(Mutex::new(Vec::new())),
            }) as Arc<dyn Step>],
        );
        let executor = PipelineExecutor::new(
            store.clone(),
            Arc::new(registry),
            WorkerIdentity::new("test-worker"),
        );

        assert_eq!(executor.run(job_id).await, Some(expected));
        assert_eq!(store.finish_calls.load(Ordering::SeqCst), 1);

        // Nothing was recorded, so the batches are not marked processed.
        let batches = store.job_batches(JobKind::Processor, job_id).await.unwrap();
        assert_eq!(batches[0].status, BatchStatus::New);
        let job = store.get_job(JobKind::Processor, job_id).await.unwrap().unwrap();
        assert_eq!(job.success, None);
    }
}
