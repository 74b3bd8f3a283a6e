use async_trait::async_trait;
use sqlx::{postgres::PgRow, PgConnection, PgPool, Row};
use std::str::FromStr;
use uuid::Uuid;

use super::{owned_batch_statuses, JobStore, StoreError};
use crate::models::batch::{Batch, BatchId, BatchStatus, NewBatch};
use crate::models::job::{Job, JobId, JobKind, JobPayload, StuckQuery, WorkerIdentity};
use crate::models::pipeline::{DownloaderTask, PipelineName};
use crate::services::queue::{dispatch_with_retry, Dispatcher};

const JOB_COLUMNS: &str = "id, num_retries, retried, success, worker_id, worker_version, \
                           failure_reason, start_time, end_time, created_at";

const BATCH_FIELDS: [&str; 16] = [
    "id",
    "source_type",
    "name",
    "internal_location",
    "download_url",
    "raw_format",
    "processed_format",
    "pipeline_required",
    "size_in_bytes",
    "platform_accession_code",
    "experiment_accession_code",
    "organism_id",
    "organism_name",
    "status",
    "created_at",
    "updated_at",
];

/// Table names for one job kind.
struct Tables {
    jobs: &'static str,
    links: &'static str,
    tag: &'static str,
}

fn tables(kind: JobKind) -> Tables {
    match kind {
        JobKind::Downloader => Tables {
            jobs: "downloader_jobs",
            links: "downloader_jobs_batches",
            tag: "downloader_task",
        },
        JobKind::Processor => Tables {
            jobs: "processor_jobs",
            links: "processor_jobs_batches",
            tag: "pipeline_applied",
        },
    }
}

fn job_projection(kind: JobKind) -> String {
    format!("{}, {} AS payload_tag", JOB_COLUMNS, tables(kind).tag)
}

fn batch_columns(alias: &str) -> String {
    BATCH_FIELDS
        .iter()
        .map(|field| format!("{}.{}", alias, field))
        .collect::<Vec<_>>()
        .join(", ")
}

fn job_from_row(kind: JobKind, row: &PgRow) -> Result<Job, StoreError> {
    let tag: String = row.try_get("payload_tag")?;
    let payload = match kind {
        JobKind::Downloader => JobPayload::Downloader {
            task: DownloaderTask::from_str(&tag)
                .map_err(|_| StoreError::Corrupt(format!("unknown downloader task {}", tag)))?,
        },
        JobKind::Processor => JobPayload::Processor {
            pipeline: PipelineName::from_str(&tag)
                .map_err(|_| StoreError::Corrupt(format!("unknown pipeline {}", tag)))?,
        },
    };

    Ok(Job {
        id: row.try_get("id")?,
        payload,
        num_retries: row.try_get("num_retries")?,
        retried: row.try_get("retried")?,
        success: row.try_get("success")?,
        created_at: row.try_get("created_at")?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        worker_id: row.try_get("worker_id")?,
        worker_version: row.try_get("worker_version")?,
        failure_reason: row.try_get("failure_reason")?,
    })
}

fn batch_from_row(row: &PgRow) -> Result<Batch, StoreError> {
    let pipeline: String = row.try_get("pipeline_required")?;
    let status: String = row.try_get("status")?;

    Ok(Batch {
        id: row.try_get("id")?,
        source_type: row.try_get("source_type")?,
        name: row.try_get("name")?,
        internal_location: row.try_get("internal_location")?,
        download_url: row.try_get("download_url")?,
        raw_format: row.try_get("raw_format")?,
        processed_format: row.try_get("processed_format")?,
        pipeline_required: PipelineName::from_str(&pipeline)
            .map_err(|_| StoreError::Corrupt(format!("unknown pipeline {}", pipeline)))?,
        size_in_bytes: row.try_get("size_in_bytes")?,
        platform_accession_code: row.try_get("platform_accession_code")?,
        experiment_accession_code: row.try_get("experiment_accession_code")?,
        organism_id: row.try_get("organism_id")?,
        organism_name: row.try_get("organism_name")?,
        status: BatchStatus::from_str(&status)
            .map_err(|_| StoreError::Corrupt(format!("unknown batch status {}", status)))?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

async fn insert_job(
    conn: &mut PgConnection,
    payload: JobPayload,
    num_retries: i32,
) -> Result<Job, StoreError> {
    let kind = payload.kind();
    let t = tables(kind);
    let sql = format!(
        "INSERT INTO {} (id, {}, num_retries) VALUES ($1, $2, $3) RETURNING {}",
        t.jobs,
        t.tag,
        job_projection(kind)
    );

    let row = sqlx::query(&sql)
        .bind(Uuid::new_v4())
        .bind(payload.tag())
        .bind(num_retries)
        .fetch_one(&mut *conn)
        .await?;

    job_from_row(kind, &row)
}

async fn link_batches(
    conn: &mut PgConnection,
    kind: JobKind,
    job_id: JobId,
    batches: &[BatchId],
) -> Result<(), StoreError> {
    let sql = format!(
        "INSERT INTO {} (job_id, batch_id) VALUES ($1, $2)",
        tables(kind).links
    );
    for batch_id in batches {
        sqlx::query(&sql)
            .bind(job_id)
            .bind(batch_id)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

/// Set `retried = true, success = false` on a job that is not yet retried.
async fn latch_retried(conn: &mut PgConnection, kind: JobKind, id: JobId) -> Result<Job, StoreError> {
    let t = tables(kind);
    let sql = format!(
        r#"
        UPDATE {}
        SET retried = TRUE,
            success = FALSE,
            end_time = COALESCE(end_time, NOW())
        WHERE id = $1 AND retried = FALSE
        RETURNING {}
        "#,
        t.jobs,
        job_projection(kind)
    );

    match sqlx::query(&sql).bind(id).fetch_optional(&mut *conn).await? {
        Some(row) => job_from_row(kind, &row),
        None => {
            let exists = sqlx::query(&format!("SELECT 1 FROM {} WHERE id = $1", t.jobs))
                .bind(id)
                .fetch_optional(&mut *conn)
                .await?
                .is_some();
            if exists {
                Err(StoreError::AlreadyRetried { kind, id })
            } else {
                Err(StoreError::JobNotFound { kind, id })
            }
        }
    }
}

/// PostgreSQL-backed job record store.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert_batch(&self, batch: NewBatch) -> Result<Batch, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO batches (id, source_type, name, internal_location, download_url,
                                 raw_format, processed_format, pipeline_required, size_in_bytes,
                                 platform_accession_code, experiment_accession_code,
                                 organism_id, organism_name, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            RETURNING {}
            "#,
            BATCH_FIELDS.join(", ")
        );

        let row = sqlx::query(&sql)
            .bind(Uuid::new_v4())
            .bind(&batch.source_type)
            .bind(&batch.name)
            .bind(&batch.internal_location)
            .bind(&batch.download_url)
            .bind(&batch.raw_format)
            .bind(&batch.processed_format)
            .bind(batch.pipeline_required.as_ref())
            .bind(batch.size_in_bytes)
            .bind(&batch.platform_accession_code)
            .bind(&batch.experiment_accession_code)
            .bind(batch.organism_id)
            .bind(&batch.organism_name)
            .bind(BatchStatus::New.as_ref())
            .fetch_one(&self.pool)
            .await?;

        batch_from_row(&row)
    }

    async fn get_batch(&self, id: BatchId) -> Result<Option<Batch>, StoreError> {
        let sql = format!("SELECT {} FROM batches WHERE id = $1", BATCH_FIELDS.join(", "));
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(batch_from_row).transpose()
    }

    async fn set_batch_status(&self, ids: &[BatchId], status: BatchStatus) -> Result<(), StoreError> {
        sqlx::query("UPDATE batches SET status = $1, updated_at = NOW() WHERE id = ANY($2)")
            .bind(status.as_ref())
            .bind(ids.to_vec())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_job(&self, payload: JobPayload, batches: &[BatchId]) -> Result<Job, StoreError> {
        let mut tx = self.pool.begin().await?;
        let job = insert_job(&mut tx, payload, 0).await?;
        link_batches(&mut tx, job.kind(), job.id, batches).await?;
        tx.commit().await?;
        Ok(job)
    }

    async fn get_job(&self, kind: JobKind, id: JobId) -> Result<Option<Job>, StoreError> {
        let sql = format!(
            "SELECT {} FROM {} WHERE id = $1",
            job_projection(kind),
            tables(kind).jobs
        );
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.map(|r| job_from_row(kind, &r)).transpose()
    }

    async fn job_batches(&self, kind: JobKind, id: JobId) -> Result<Vec<Batch>, StoreError> {
        let sql = format!(
            r#"
            SELECT {}
            FROM batches b
            JOIN {} l ON l.batch_id = b.id
            WHERE l.job_id = $1
            ORDER BY l.id ASC
            "#,
            batch_columns("b"),
            tables(kind).links
        );
        let rows = sqlx::query(&sql).bind(id).fetch_all(&self.pool).await?;
        rows.iter().map(batch_from_row).collect()
    }

    async fn mark_started(
        &self,
        kind: JobKind,
        id: JobId,
        worker: &WorkerIdentity,
    ) -> Result<Job, StoreError> {
        let sql = format!(
            r#"
            UPDATE {}
            SET start_time = NOW(), worker_id = $2, worker_version = $3
            WHERE id = $1
            RETURNING {}
            "#,
            tables(kind).jobs,
            job_projection(kind)
        );

        let row = sqlx::query(&sql)
            .bind(id)
            .bind(&worker.id)
            .bind(&worker.version)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(r) => job_from_row(kind, &r),
            None => Err(StoreError::JobNotFound { kind, id }),
        }
    }

    async fn mark_finished(
        &self,
        kind: JobKind,
        id: JobId,
        success: bool,
        failure_reason: Option<&str>,
    ) -> Result<Job, StoreError> {
        let t = tables(kind);
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "SELECT {} FROM {} WHERE id = $1 FOR UPDATE",
            job_projection(kind),
            t.jobs
        );
        let current = match sqlx::query(&sql).bind(id).fetch_optional(&mut *tx).await? {
            Some(row) => job_from_row(kind, &row)?,
            None => return Err(StoreError::JobNotFound { kind, id }),
        };

        if let Some(recorded) = current.success {
            if recorded == success {
                return Ok(current);
            }
            return Err(StoreError::Consistency {
                kind,
                id,
                recorded,
                requested: success,
            });
        }

        let sql = format!(
            r#"
            UPDATE {}
            SET success = $2,
                end_time = NOW(),
                failure_reason = COALESCE($3, failure_reason)
            WHERE id = $1
            RETURNING {}
            "#,
            t.jobs,
            job_projection(kind)
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(success)
            .bind(failure_reason)
            .fetch_one(&mut *tx)
            .await?;
        let job = job_from_row(kind, &row)?;

        tx.commit().await?;
        Ok(job)
    }

    async fn requeue(&self, kind: JobKind, id: JobId) -> Result<Job, StoreError> {
        let t = tables(kind);
        let mut tx = self.pool.begin().await?;

        let previous = latch_retried(&mut tx, kind, id).await?;
        let successor = insert_job(&mut tx, previous.payload, previous.num_retries + 1).await?;

        let sql = format!(
            r#"
            INSERT INTO {links} (job_id, batch_id)
            SELECT $1, batch_id FROM {links} WHERE job_id = $2 ORDER BY id ASC
            "#,
            links = t.links
        );
        sqlx::query(&sql)
            .bind(successor.id)
            .bind(previous.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(successor)
    }

    async fn give_up(&self, kind: JobKind, id: JobId) -> Result<Job, StoreError> {
        let mut tx = self.pool.begin().await?;

        let job = latch_retried(&mut tx, kind, id).await?;

        let sql = format!(
            r#"
            UPDATE batches
            SET status = $1, updated_at = NOW()
            WHERE id IN (SELECT batch_id FROM {} WHERE job_id = $2)
              AND status = ANY($3)
            "#,
            tables(kind).links
        );
        let owned: Vec<String> = owned_batch_statuses(kind)
            .iter()
            .map(|status| status.to_string())
            .collect();
        sqlx::query(&sql)
            .bind(BatchStatus::Failed.as_ref())
            .bind(id)
            .bind(owned)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(job)
    }

    async fn find_stuck(&self, kind: JobKind, query: StuckQuery) -> Result<Vec<Job>, StoreError> {
        let base = format!(
            "SELECT {} FROM {} WHERE retried = FALSE",
            job_projection(kind),
            tables(kind).jobs
        );

        let rows = match query {
            StuckQuery::Failed => {
                let sql = format!("{} AND success = FALSE ORDER BY created_at ASC", base);
                sqlx::query(&sql).fetch_all(&self.pool).await?
            }
            StuckQuery::Hung { started_before } => {
                let sql = format!(
                    "{} AND success IS NULL AND end_time IS NULL AND start_time < $1 \
                     ORDER BY created_at ASC",
                    base
                );
                sqlx::query(&sql)
                    .bind(started_before)
                    .fetch_all(&self.pool)
                    .await?
            }
            StuckQuery::Lost { created_before } => {
                let sql = format!(
                    "{} AND success IS NULL AND start_time IS NULL AND end_time IS NULL \
                     AND created_at < $1 ORDER BY created_at ASC",
                    base
                );
                sqlx::query(&sql)
                    .bind(created_before)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.iter().map(|r| job_from_row(kind, r)).collect()
    }

    async fn hand_off_batch(
        &self,
        batch_id: BatchId,
        pipeline: PipelineName,
        dispatcher: &dyn Dispatcher,
    ) -> Result<Option<Job>, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Row lock serializes concurrent hand-offs of the same batch.
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM batches WHERE id = $1 FOR UPDATE")
                .bind(batch_id)
                .fetch_optional(&mut *tx)
                .await?;
        match status {
            None => return Err(StoreError::BatchNotFound(batch_id)),
            Some(status) if status != BatchStatus::New.as_ref() => return Ok(None),
            Some(_) => {}
        }

        sqlx::query("UPDATE batches SET status = $1, updated_at = NOW() WHERE id = $2")
            .bind(BatchStatus::Downloaded.as_ref())
            .bind(batch_id)
            .execute(&mut *tx)
            .await?;

        let job = insert_job(&mut tx, JobPayload::Processor { pipeline }, 0).await?;
        link_batches(&mut tx, JobKind::Processor, job.id, &[batch_id]).await?;

        // Dropping the transaction on a failed dispatch rolls everything back.
        dispatch_with_retry(dispatcher, JobKind::Processor, job.id).await?;

        tx.commit().await?;
        Ok(Some(job))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_columns_are_prefixed() {
        let columns = batch_columns("b");
        assert!(columns.starts_with("b.id, b.source_type"));
        assert!(columns.ends_with("b.updated_at"));
    }

    #[test]
    fn test_job_tables_per_kind() {
        assert_eq!(tables(JobKind::Downloader).tag, "downloader_task");
        assert_eq!(tables(JobKind::Processor).links, "processor_jobs_batches");
        assert!(job_projection(JobKind::Processor).ends_with("pipeline_applied AS payload_tag"));
    }
}
