//! Periodic sweeps that find failed, hung and lost jobs and either requeue
//! them or give up on them.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::db::{JobStore, StoreError};
use crate::models::job::{FailureMode, Job, JobKind, StuckQuery};
use crate::services::clock::Clock;
use crate::services::queue::{dispatch_with_retry, Dispatcher};

/// Bounds that decide when a job is stuck and how often it is retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Jobs with this many retries are given up on instead of requeued.
    pub max_retries: i32,
    /// Started jobs that have not finished after this long are hung.
    pub max_run_time: chrono::Duration,
    /// Jobs not started this long after creation are lost.
    pub max_queue_time: chrono::Duration,
    /// Minimum time between the starts of two sweeps of one loop.
    pub min_loop_period: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            max_run_time: chrono::Duration::days(1),
            max_queue_time: chrono::Duration::days(1),
            min_loop_period: Duration::from_secs(10),
        }
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub matched: usize,
    pub requeued: usize,
    pub given_up: usize,
    pub dispatch_failures: usize,
    /// Jobs another sweep handled first, or that failed to update.
    pub skipped: usize,
}

pub struct Reconciler {
    store: Arc<dyn JobStore>,
    dispatcher: Arc<dyn Dispatcher>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn JobStore>,
        dispatcher: Arc<dyn Dispatcher>,
        clock: Arc<dyn Clock>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            dispatcher,
            clock,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Predicate for `mode` evaluated against the current time.
    pub fn query_for(&self, mode: FailureMode) -> StuckQuery {
        let now = self.clock.now();
        match mode {
            FailureMode::Failed => StuckQuery::Failed,
            FailureMode::Hung => StuckQuery::Hung {
                started_before: now - self.policy.max_run_time,
            },
            FailureMode::Lost => StuckQuery::Lost {
                created_before: now - self.policy.max_queue_time,
            },
        }
    }

    /// Run one sweep over jobs of `kind` stuck in `mode`.
    ///
    /// Only a failed lookup aborts the sweep; per-job problems are logged and
    /// counted in the report.
    pub async fn sweep(&self, kind: JobKind, mode: FailureMode) -> Result<SweepReport, StoreError> {
        let started = Instant::now();
        let stuck = self.store.find_stuck(kind, self.query_for(mode)).await?;
        let mut report = SweepReport {
            matched: stuck.len(),
            ..SweepReport::default()
        };

        for job in &stuck {
            self.reconcile(kind, mode, job, &mut report).await;
        }

        metrics::histogram!(
            "refinery_sweep_seconds",
            "kind" => kind.as_ref().to_string(),
            "mode" => mode.as_ref().to_string()
        )
        .record(started.elapsed().as_secs_f64());

        if report.matched > 0 {
            tracing::info!(
                kind = %kind,
                mode = %mode,
                matched = report.matched,
                requeued = report.requeued,
                given_up = report.given_up,
                dispatch_failures = report.dispatch_failures,
                skipped = report.skipped,
                "Sweep finished"
            );
        }

        Ok(report)
    }

    async fn reconcile(&self, kind: JobKind, mode: FailureMode, job: &Job, report: &mut SweepReport) {
        let labels = [("kind", kind.as_ref().to_string()), ("mode", mode.as_ref().to_string())];

        if job.num_retries < self.policy.max_retries {
            let successor = match self.store.requeue(kind, job.id).await {
                Ok(successor) => successor,
                Err(StoreError::AlreadyRetried { .. }) => {
                    tracing::debug!(kind = %kind, job_id = %job.id, "Job already requeued by another sweep");
                    report.skipped += 1;
                    return;
                }
                Err(e) => {
                    tracing::error!(kind = %kind, job_id = %job.id, error = %e, "Failed to requeue job");
                    report.skipped += 1;
                    return;
                }
            };

            report.requeued += 1;
            metrics::counter!("refinery_jobs_requeued_total", &labels).increment(1);
            tracing::info!(
                kind = %kind,
                mode = %mode,
                job_id = %job.id,
                successor_id = %successor.id,
                num_retries = successor.num_retries,
                "Requeued job"
            );

            // The successor is recorded; if it never reaches the queue the
            // lost sweep picks it up later.
            if let Err(e) = dispatch_with_retry(self.dispatcher.as_ref(), kind, successor.id).await {
                tracing::error!(
                    kind = %kind,
                    job_id = %successor.id,
                    error = %e,
                    "Failed to dispatch requeued job"
                );
                report.dispatch_failures += 1;
            }
        } else {
            match self.store.give_up(kind, job.id).await {
                Ok(_) => {
                    report.given_up += 1;
                    metrics::counter!("refinery_jobs_given_up_total", &labels).increment(1);
                    tracing::error!(
                        kind = %kind,
                        mode = %mode,
                        job_id = %job.id,
                        num_retries = job.num_retries,
                        reason = job.failure_reason.as_deref().unwrap_or("none"),
                        "job failed permanently"
                    );
                }
                Err(StoreError::AlreadyRetried { .. }) => {
                    report.skipped += 1;
                }
                Err(e) => {
                    tracing::error!(kind = %kind, job_id = %job.id, error = %e, "Failed to give up on job");
                    report.skipped += 1;
                }
            }
        }
    }

    /// Sweep repeatedly, at most once per `min_loop_period`, until cancelled.
    pub async fn run_loop(&self, kind: JobKind, mode: FailureMode, cancel: CancellationToken) {
        tracing::info!(kind = %kind, mode = %mode, "Starting reconciliation loop");

        loop {
            let started = Instant::now();

            if let Err(e) = self.sweep(kind, mode).await {
                tracing::error!(kind = %kind, mode = %mode, error = %e, "Sweep failed");
            }

            let remaining = self.policy.min_loop_period.saturating_sub(started.elapsed());
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(remaining) => {}
            }
        }

        tracing::info!(kind = %kind, mode = %mode, "Reconciliation loop stopped");
    }

    /// Start one loop per job kind and failure mode.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for kind in JobKind::ALL {
            for mode in FailureMode::ALL {
                let reconciler = Arc::clone(&self);
                let cancel = cancel.clone();
                handles.push(tokio::spawn(async move {
                    reconciler.run_loop(kind, mode, cancel).await;
                }));
            }
        }
        handles
    }
}
