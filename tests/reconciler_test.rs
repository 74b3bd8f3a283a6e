mod helpers;

use chrono::Duration;
use data_refinery::db::{JobStore, MemoryJobStore};
use data_refinery::models::batch::BatchStatus;
use data_refinery::models::job::{FailureMode, JobKind, JobPayload, WorkerIdentity};
use data_refinery::models::pipeline::{DownloaderTask, PipelineName};
use data_refinery::services::clock::ManualClock;
use data_refinery::services::reconciler::{Reconciler, RetryPolicy};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use helpers::{sample_new_batch, RecordingDispatcher};

const URL: &str = "https://example.org/E-GEOD-59071.raw.3.zip";

struct Harness {
    store: Arc<MemoryJobStore>,
    dispatcher: Arc<RecordingDispatcher>,
    clock: Arc<ManualClock>,
    reconciler: Reconciler,
}

fn harness() -> Harness {
    let clock = Arc::new(ManualClock::default());
    let store = Arc::new(MemoryJobStore::with_clock(clock.clone()));
    let dispatcher = Arc::new(RecordingDispatcher::new());
    let reconciler = Reconciler::new(
        store.clone(),
        dispatcher.clone(),
        clock.clone(),
        RetryPolicy::default(),
    );
    Harness {
        store,
        dispatcher,
        clock,
        reconciler,
    }
}

async fn failed_downloader_job(store: &MemoryJobStore) -> data_refinery::models::job::Job {
    let batch = store.insert_batch(sample_new_batch(URL, "a.CEL")).await.unwrap();
    let job = store
        .create_job(
            JobPayload::Downloader {
                task: DownloaderTask::ArrayExpress,
            },
            &[batch.id],
        )
        .await
        .unwrap();
    store
        .mark_finished(JobKind::Downloader, job.id, false, Some("HTTP 503"))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_failed_job_below_max_is_requeued_once() {
    let h = harness();
    let job = failed_downloader_job(&h.store).await;

    let report = h
        .reconciler
        .sweep(JobKind::Downloader, FailureMode::Failed)
        .await
        .unwrap();
    assert_eq!(report.matched, 1);
    assert_eq!(report.requeued, 1);
    assert_eq!(report.given_up, 0);

    let jobs = h.store.jobs(JobKind::Downloader).await;
    assert_eq!(jobs.len(), 2);
    let successor = &jobs[1];
    assert_eq!(successor.num_retries, 1);
    assert_eq!(successor.payload, job.payload);
    assert!(jobs[0].retried);

    assert_eq!(h.dispatcher.dispatched(), vec![(JobKind::Downloader, successor.id)]);

    // The original no longer matches; a second sweep does nothing.
    let report = h
        .reconciler
        .sweep(JobKind::Downloader, FailureMode::Failed)
        .await
        .unwrap();
    assert_eq!(report.matched, 0);
    assert_eq!(h.dispatcher.dispatched().len(), 1);
}

#[tokio::test]
async fn test_retries_exhaust_into_give_up() {
    let h = harness();
    failed_downloader_job(&h.store).await;

    for round in 1..=2 {
        let report = h
            .reconciler
            .sweep(JobKind::Downloader, FailureMode::Failed)
            .await
            .unwrap();
        assert_eq!(report.requeued, 1, "round {}", round);

        let latest = h.store.jobs(JobKind::Downloader).await.pop().unwrap();
        h.store
            .mark_finished(JobKind::Downloader, latest.id, false, Some("still failing"))
            .await
            .unwrap();
    }

    let report = h
        .reconciler
        .sweep(JobKind::Downloader, FailureMode::Failed)
        .await
        .unwrap();
    assert_eq!(report.requeued, 0);
    assert_eq!(report.given_up, 1);

    let jobs = h.store.jobs(JobKind::Downloader).await;
    assert_eq!(jobs.len(), 3);
    assert!(jobs.iter().all(|job| job.retried));
    assert_eq!(jobs.last().unwrap().num_retries, 2);
    assert_eq!(h.dispatcher.dispatched().len(), 2);

    let batches = h
        .store
        .job_batches(JobKind::Downloader, jobs[0].id)
        .await
        .unwrap();
    assert_eq!(batches[0].status, BatchStatus::Failed);
}

#[tokio::test]
async fn test_hung_and_lost_are_disjoint() {
    let h = harness();
    let worker = WorkerIdentity::new("worker-1");

    let hung = h
        .store
        .create_job(JobPayload::Processor { pipeline: PipelineName::NoOp }, &[])
        .await
        .unwrap();
    h.store
        .mark_started(JobKind::Processor, hung.id, &worker)
        .await
        .unwrap();
    let lost = h
        .store
        .create_job(JobPayload::Processor { pipeline: PipelineName::NoOp }, &[])
        .await
        .unwrap();

    // Nothing is stuck before the cutoffs pass.
    h.clock.advance(Duration::hours(23));
    for mode in FailureMode::ALL {
        let report = h.reconciler.sweep(JobKind::Processor, mode).await.unwrap();
        assert_eq!(report.matched, 0, "{}", mode);
    }

    h.clock.advance(Duration::hours(2));
    let hung_report = h
        .reconciler
        .sweep(JobKind::Processor, FailureMode::Hung)
        .await
        .unwrap();
    assert_eq!(hung_report.requeued, 1);
    let after_hung = h.store.get_job(JobKind::Processor, hung.id).await.unwrap().unwrap();
    let untouched = h.store.get_job(JobKind::Processor, lost.id).await.unwrap().unwrap();
    assert!(after_hung.retried);
    assert!(!untouched.retried);
    assert_eq!(untouched.success, None);

    let lost_report = h
        .reconciler
        .sweep(JobKind::Processor, FailureMode::Lost)
        .await
        .unwrap();
    assert_eq!(lost_report.requeued, 1);

    let hung = h.store.get_job(JobKind::Processor, hung.id).await.unwrap().unwrap();
    let lost = h.store.get_job(JobKind::Processor, lost.id).await.unwrap().unwrap();
    assert!(hung.retried && lost.retried);
    assert_eq!(hung.success, Some(false));
    assert_eq!(lost.success, Some(false));
    assert!(hung.end_time.is_some() && lost.end_time.is_some());

    // Fresh successors are neither hung nor lost yet.
    assert_eq!(h.dispatcher.dispatched().len(), 2);
    let report = h
        .reconciler
        .sweep(JobKind::Processor, FailureMode::Lost)
        .await
        .unwrap();
    assert_eq!(report.matched, 0);
}

#[tokio::test(start_paused = true)]
async fn test_dispatch_failure_does_not_abort_sweep() {
    let h = harness();
    failed_downloader_job(&h.store).await;
    failed_downloader_job(&h.store).await;

    // Exhaust the local retries for the first successor only.
    h.dispatcher.fail_next(3);

    let report = h
        .reconciler
        .sweep(JobKind::Downloader, FailureMode::Failed)
        .await
        .unwrap();
    assert_eq!(report.matched, 2);
    assert_eq!(report.requeued, 2);
    assert_eq!(report.dispatch_failures, 1);
    assert_eq!(h.dispatcher.dispatched().len(), 1);

    // The undispatched successor is recorded and shows up as lost later.
    h.clock.advance(Duration::days(2));
    let report = h
        .reconciler
        .sweep(JobKind::Downloader, FailureMode::Lost)
        .await
        .unwrap();
    assert_eq!(report.matched, 2);
}

#[tokio::test(start_paused = true)]
async fn test_run_loop_stops_on_cancel() {
    let h = harness();
    let reconciler = Arc::new(h.reconciler);
    let cancel = CancellationToken::new();

    let handles = reconciler.clone().spawn(cancel.clone());
    assert_eq!(handles.len(), 6);

    tokio::time::sleep(std::time::Duration::from_secs(25)).await;
    cancel.cancel();
    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn test_run_loop_sweeps_every_period() {
    let h = harness();
    let store = h.store.clone();
    let reconciler = Arc::new(h.reconciler);
    let cancel = CancellationToken::new();

    let loop_reconciler = reconciler.clone();
    let loop_cancel = cancel.clone();
    let handle = tokio::spawn(async move {
        loop_reconciler
            .run_loop(JobKind::Downloader, FailureMode::Failed, loop_cancel)
            .await
    });

    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    failed_downloader_job(&store).await;
    assert_eq!(store.jobs(JobKind::Downloader).await.len(), 1);

    // Picked up by the next sweep, one loop period after the first.
    tokio::time::sleep(std::time::Duration::from_secs(10)).await;
    assert_eq!(store.jobs(JobKind::Downloader).await.len(), 2);

    cancel.cancel();
    handle.await.unwrap();
}
