use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use sqlx::{Postgres, Transaction};
use time::OffsetDateTime;
use tokio::time::{Instant, sleep};
use tracing::warn;
use uuid::Uuid;

use crate::{
    application::repos::{
        JobQueue, Nack, NackOutcome, NewJob, RepoError, attempts_exhausted_detail,
        lease_expired_detail,
    },
    domain::{
        entities::{DeadLetterEntry, JobDescriptor, JobId, JobRecord, LeasedJob, WorkerLease},
        types::{JobState, TaskType},
    },
    infra::telemetry::METRIC_JOBS_DEAD_LETTERED,
};

use super::{
    PostgresRepositories, map_sqlx_error,
    util::{from_db_count, to_db_count},
};

const JOB_COLUMNS: &str = "job_id, task_type, payload, state, attempt_count, max_attempts, \
    enqueued_at, visible_at, lease_id, leased_by, last_error, settled_at";

#[derive(sqlx::FromRow)]
struct JobRow {
    job_id: Uuid,
    task_type: String,
    payload: serde_json::Value,
    state: String,
    attempt_count: i32,
    max_attempts: i32,
    enqueued_at: OffsetDateTime,
    visible_at: OffsetDateTime,
    lease_id: Option<Uuid>,
    leased_by: Option<String>,
    last_error: Option<String>,
    settled_at: Option<OffsetDateTime>,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = RepoError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let task_type = TaskType::try_from(row.task_type.as_str()).map_err(|_| {
            RepoError::from_persistence(format!("unknown task type `{}`", row.task_type))
        })?;

        let state = JobState::try_from(row.state.as_str()).map_err(|_| {
            RepoError::from_persistence(format!("unknown job state `{}`", row.state))
        })?;

        Ok(Self {
            descriptor: JobDescriptor {
                job_id: JobId::from_uuid(row.job_id),
                task_type,
                payload: row.payload,
                enqueued_at: row.enqueued_at,
                attempt_count: from_db_count(row.attempt_count, "attempt_count")?,
                max_attempts: from_db_count(row.max_attempts, "max_attempts")?,
            },
            state,
            visible_at: row.visible_at,
            leased_by: row.leased_by,
            last_error: row.last_error,
            settled_at: row.settled_at,
        })
    }
}

/// Row locked for settlement, with the lease check evaluated on database time.
#[derive(sqlx::FromRow)]
struct SettleRow {
    state: String,
    lease_id: Option<Uuid>,
    attempt_count: i32,
    max_attempts: i32,
    lease_current: bool,
}

impl PostgresRepositories {
    async fn expire_final_leases(
        tx: &mut Transaction<'_, Postgres>,
    ) -> Result<Vec<JobId>, RepoError> {
        let expired: Vec<(Uuid, i32, i32)> = sqlx::query_as(
            r#"
            SELECT job_id, attempt_count, max_attempts
              FROM report_jobs
             WHERE state = 'leased'
               AND visible_at <= now()
               AND attempt_count >= max_attempts
             FOR UPDATE SKIP LOCKED
            "#,
        )
        .fetch_all(&mut **tx)
        .await
        .map_err(map_sqlx_error)?;

        let mut dead = Vec::with_capacity(expired.len());
        for (job_id, attempt_count, max_attempts) in expired {
            let detail = lease_expired_detail(
                from_db_count(attempt_count, "attempt_count")?,
                from_db_count(max_attempts, "max_attempts")?,
            );
            sqlx::query(
                r#"
                UPDATE report_jobs
                   SET state = 'dead_lettered',
                       last_error = $2,
                       settled_at = now(),
                       lease_id = NULL,
                       leased_by = NULL
                 WHERE job_id = $1
                "#,
            )
            .bind(job_id)
            .bind(detail)
            .execute(&mut **tx)
            .await
            .map_err(map_sqlx_error)?;
            dead.push(JobId::from_uuid(job_id));
        }

        Ok(dead)
    }

    async fn try_lease(&self, worker_id: &str) -> Result<Option<LeasedJob>, RepoError> {
        let mut tx = self.begin().await.map_err(map_sqlx_error)?;

        for job_id in Self::expire_final_leases(&mut tx).await? {
            counter!(METRIC_JOBS_DEAD_LETTERED, "source" => "lease_expired").increment(1);
            warn!(
                target = "infra::db::jobs",
                job_id = %job_id,
                "lease expired on final attempt; job dead-lettered"
            );
        }

        let lease_id = Uuid::new_v4();
        let sql = format!(
            r#"
            UPDATE report_jobs
               SET state = 'leased',
                   attempt_count = attempt_count + 1,
                   lease_id = $1,
                   leased_by = $2,
                   visible_at = now() + make_interval(secs => $3)
             WHERE job_id = (
                   SELECT job_id
                     FROM report_jobs
                    WHERE state IN ('ready', 'leased')
                      AND visible_at <= now()
                      AND attempt_count < max_attempts
                    ORDER BY visible_at, enqueued_at
                    FOR UPDATE SKIP LOCKED
                    LIMIT 1
             )
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(lease_id)
            .bind(worker_id)
            .bind(self.tuning().visibility_timeout.as_secs_f64())
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(map_sqlx_error)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let record = JobRecord::try_from(row)?;
        let lease = WorkerLease {
            job_id: record.descriptor.job_id,
            lease_id,
            worker_id: worker_id.to_string(),
            attempt: record.descriptor.attempt_count,
            visibility_deadline: record.visible_at,
        };

        Ok(Some(LeasedJob {
            descriptor: record.descriptor,
            lease,
        }))
    }

    async fn lock_for_settlement(
        tx: &mut Transaction<'_, Postgres>,
        lease: &WorkerLease,
    ) -> Result<SettleRow, RepoError> {
        let row: Option<SettleRow> = sqlx::query_as(
            r#"
            SELECT state, lease_id, attempt_count, max_attempts,
                   visible_at > now() AS lease_current
              FROM report_jobs
             WHERE job_id = $1
             FOR UPDATE
            "#,
        )
        .bind(lease.job_id.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(map_sqlx_error)?;

        let row = row.ok_or(RepoError::NotFound)?;
        let held = row.state == JobState::Leased.as_str()
            && row.lease_id == Some(lease.lease_id)
            && row.lease_current;

        if held {
            Ok(row)
        } else {
            Err(RepoError::LeaseLost {
                job_id: lease.job_id,
            })
        }
    }
}

#[async_trait]
impl JobQueue for PostgresRepositories {
    async fn enqueue(&self, job: NewJob) -> Result<JobId, RepoError> {
        if job.max_attempts == 0 {
            return Err(RepoError::invalid_input("max_attempts must be at least 1"));
        }

        let job_id = JobId::new();
        sqlx::query(
            r#"
            INSERT INTO report_jobs (job_id, task_type, payload, max_attempts)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(job.task_type.as_str())
        .bind(&job.payload)
        .bind(to_db_count(job.max_attempts, "max_attempts")?)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(job_id)
    }

    async fn dequeue(
        &self,
        worker_id: &str,
        wait: Duration,
    ) -> Result<Option<LeasedJob>, RepoError> {
        let deadline = Instant::now() + wait;

        loop {
            if let Some(job) = self.try_lease(worker_id).await? {
                return Ok(Some(job));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            sleep((deadline - now).min(self.tuning().poll_interval)).await;
        }
    }

    async fn ack(&self, lease: &WorkerLease) -> Result<(), RepoError> {
        let mut tx = self.begin().await.map_err(map_sqlx_error)?;
        Self::lock_for_settlement(&mut tx, lease).await?;

        sqlx::query(
            r#"
            UPDATE report_jobs
               SET state = 'acked',
                   settled_at = now(),
                   lease_id = NULL,
                   leased_by = NULL
             WHERE job_id = $1
            "#,
        )
        .bind(lease.job_id.as_uuid())
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(map_sqlx_error)
    }

    async fn nack(&self, lease: &WorkerLease, nack: Nack) -> Result<NackOutcome, RepoError> {
        let mut tx = self.begin().await.map_err(map_sqlx_error)?;
        let row = Self::lock_for_settlement(&mut tx, lease).await?;
        let attempt_count = from_db_count(row.attempt_count, "attempt_count")?;
        let max_attempts = from_db_count(row.max_attempts, "max_attempts")?;

        let outcome = if nack.requeue && attempt_count < max_attempts {
            sqlx::query(
                r#"
                UPDATE report_jobs
                   SET state = 'ready',
                       visible_at = now() + make_interval(secs => $2),
                       last_error = $3,
                       lease_id = NULL,
                       leased_by = NULL
                 WHERE job_id = $1
                "#,
            )
            .bind(lease.job_id.as_uuid())
            .bind(nack.retry_after.as_secs_f64())
            .bind(&nack.error)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
            NackOutcome::Requeued { attempt_count }
        } else {
            let detail = if nack.requeue {
                attempts_exhausted_detail(attempt_count, max_attempts, &nack.error)
            } else {
                nack.error
            };
            sqlx::query(
                r#"
                UPDATE report_jobs
                   SET state = 'dead_lettered',
                       last_error = $2,
                       settled_at = now(),
                       lease_id = NULL,
                       leased_by = NULL
                 WHERE job_id = $1
                "#,
            )
            .bind(lease.job_id.as_uuid())
            .bind(detail)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
            NackOutcome::DeadLettered { attempt_count }
        };

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(outcome)
    }

    async fn find(&self, job_id: JobId) -> Result<Option<JobRecord>, RepoError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM report_jobs WHERE job_id = $1");
        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(job_id.as_uuid())
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        row.map(JobRecord::try_from).transpose()
    }

    async fn dead_letters(&self, limit: u32) -> Result<Vec<DeadLetterEntry>, RepoError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM report_jobs \
             WHERE state = 'dead_lettered' \
             ORDER BY settled_at, job_id \
             LIMIT $1"
        );
        let rows: Vec<JobRow> = sqlx::query_as(&sql)
            .bind(i64::from(limit))
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        rows.into_iter()
            .map(|row| {
                let record = JobRecord::try_from(row)?;
                Ok(DeadLetterEntry {
                    job_id: record.descriptor.job_id,
                    task_type: record.descriptor.task_type,
                    payload: record.descriptor.payload,
                    error_detail: record.last_error.unwrap_or_default(),
                    attempt_count: record.descriptor.attempt_count,
                    dead_lettered_at: record.settled_at.unwrap_or(record.visible_at),
                })
            })
            .collect()
    }
}
