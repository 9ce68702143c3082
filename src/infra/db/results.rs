use async_trait::async_trait;
use bytes::Bytes;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    application::repos::{ArtifactStore, RepoError, check_result},
    domain::{
        entities::{JobId, RenderResult},
        types::RenderStatus,
    },
};

use super::{
    PostgresRepositories, map_sqlx_error,
    util::{from_db_count, to_db_count},
};

#[derive(sqlx::FromRow)]
struct ResultRow {
    job_id: Uuid,
    attempt: i32,
    status: String,
    artifact: Option<Vec<u8>>,
    checksum: Option<String>,
    error_detail: Option<String>,
    completed_at: OffsetDateTime,
}

impl TryFrom<ResultRow> for RenderResult {
    type Error = RepoError;

    fn try_from(row: ResultRow) -> Result<Self, Self::Error> {
        let status = RenderStatus::try_from(row.status.as_str()).map_err(|_| {
            RepoError::from_persistence(format!("unknown render status `{}`", row.status))
        })?;

        Ok(Self {
            job_id: JobId::from_uuid(row.job_id),
            attempt: from_db_count(row.attempt, "attempt")?,
            status,
            artifact: row.artifact.map(Bytes::from),
            checksum: row.checksum,
            error_detail: row.error_detail,
            completed_at: row.completed_at,
        })
    }
}

#[async_trait]
impl ArtifactStore for PostgresRepositories {
    async fn upsert_result(&self, result: RenderResult) -> Result<(), RepoError> {
        check_result(&result)?;

        // A stored success wins over anything that arrives later.
        sqlx::query(
            r#"
            INSERT INTO report_results
                (job_id, attempt, status, artifact, checksum, error_detail, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (job_id) DO UPDATE
               SET attempt = EXCLUDED.attempt,
                   status = EXCLUDED.status,
                   artifact = EXCLUDED.artifact,
                   checksum = EXCLUDED.checksum,
                   error_detail = EXCLUDED.error_detail,
                   completed_at = EXCLUDED.completed_at
             WHERE report_results.status <> 'succeeded'
            "#,
        )
        .bind(result.job_id.as_uuid())
        .bind(to_db_count(result.attempt, "attempt")?)
        .bind(result.status.as_str())
        .bind(result.artifact.as_deref())
        .bind(result.checksum.as_deref())
        .bind(result.error_detail.as_deref())
        .bind(result.completed_at)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }

    async fn find_result(&self, job_id: JobId) -> Result<Option<RenderResult>, RepoError> {
        let row: Option<ResultRow> = sqlx::query_as(
            r#"
            SELECT job_id, attempt, status, artifact, checksum, error_detail, completed_at
              FROM report_results
             WHERE job_id = $1
            "#,
        )
        .bind(job_id.as_uuid())
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        row.map(RenderResult::try_from).transpose()
    }
}
