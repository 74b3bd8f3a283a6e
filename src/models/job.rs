use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::pipeline::{DownloaderTask, PipelineName};

pub type JobId = Uuid;

/// The two kinds of scheduled work.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobKind {
    Downloader,
    Processor,
}

impl JobKind {
    pub const ALL: [JobKind; 2] = [JobKind::Downloader, JobKind::Processor];
}

/// What a job does with its batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    Downloader { task: DownloaderTask },
    Processor { pipeline: PipelineName },
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::Downloader { .. } => JobKind::Downloader,
            JobPayload::Processor { .. } => JobKind::Processor,
        }
    }

    /// The stored tag: downloader task or applied pipeline.
    pub fn tag(&self) -> &'static str {
        match self {
            JobPayload::Downloader { task } => (*task).into(),
            JobPayload::Processor { pipeline } => (*pipeline).into(),
        }
    }
}

/// Identity of the worker process that ran a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerIdentity {
    pub id: String,
    pub version: String,
}

impl WorkerIdentity {
    /// Identity for this build of the crate.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// A persisted downloader or processor job.
///
/// `success` is `None` until the job is finished; it is set together with
/// `end_time`. Once `retried` is true the job is never picked up again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub payload: JobPayload,
    pub num_retries: i32,
    pub retried: bool,
    pub success: Option<bool>,
    pub created_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub worker_version: Option<String>,
    pub failure_reason: Option<String>,
}

impl Job {
    pub fn kind(&self) -> JobKind {
        self.payload.kind()
    }

    pub fn pipeline(&self) -> Option<PipelineName> {
        match self.payload {
            JobPayload::Processor { pipeline } => Some(pipeline),
            JobPayload::Downloader { .. } => None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.end_time.is_some()
    }
}

/// Failure modes the reconciler sweeps for.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailureMode {
    /// Finished with `success = false`.
    Failed,
    /// Started but never finished within the allowed run time.
    Hung,
    /// Never started within the allowed queue time.
    Lost,
}

impl FailureMode {
    pub const ALL: [FailureMode; 3] = [FailureMode::Failed, FailureMode::Hung, FailureMode::Lost];
}

/// Predicate selecting jobs stuck in one failure mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StuckQuery {
    Failed,
    Hung { started_before: DateTime<Utc> },
    Lost { created_before: DateTime<Utc> },
}

impl StuckQuery {
    pub fn mode(&self) -> FailureMode {
        match self {
            StuckQuery::Failed => FailureMode::Failed,
            StuckQuery::Hung { .. } => FailureMode::Hung,
            StuckQuery::Lost { .. } => FailureMode::Lost,
        }
    }

    pub fn matches(&self, job: &Job) -> bool {
        if job.retried {
            return false;
        }
        match *self {
            StuckQuery::Failed => job.success == Some(false),
            StuckQuery::Hung { started_before } => {
                job.success.is_none()
                    && job.end_time.is_none()
                    && job.start_time.is_some_and(|started| started < started_before)
            }
            StuckQuery::Lost { created_before } => {
                job.success.is_none()
                    && job.start_time.is_none()
                    && job.end_time.is_none()
                    && job.created_at < created_before
            }
        }
    }
}
