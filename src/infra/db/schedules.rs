use async_trait::async_trait;
use time::OffsetDateTime;

use crate::application::repos::{RepoError, ScheduleState, ScheduleStore};

use super::{PostgresRepositories, map_sqlx_error};

#[async_trait]
impl ScheduleStore for PostgresRepositories {
    async fn load_state(&self, schedule_id: &str) -> Result<ScheduleState, RepoError> {
        let row: Option<(Option<OffsetDateTime>, Option<bool>)> = sqlx::query_as(
            r#"
            SELECT last_fired_at, enabled
              FROM schedule_state
             WHERE schedule_id = $1
            "#,
        )
        .bind(schedule_id)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(row
            .map(|(last_fired_at, enabled)| ScheduleState {
                last_fired_at,
                enabled,
            })
            .unwrap_or_default())
    }

    async fn record_fired(
        &self,
        schedule_id: &str,
        fired_at: OffsetDateTime,
    ) -> Result<(), RepoError> {
        sqlx::query(
            r#"
            INSERT INTO schedule_state (schedule_id, last_fired_at)
            VALUES ($1, $2)
            ON CONFLICT (schedule_id) DO UPDATE
               SET last_fired_at = EXCLUDED.last_fired_at,
                   updated_at = now()
            "#,
        )
        .bind(schedule_id)
        .bind(fired_at)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }

    async fn set_enabled(&self, schedule_id: &str, enabled: bool) -> Result<(), RepoError> {
        sqlx::query(
            r#"
            INSERT INTO schedule_state (schedule_id, enabled)
            VALUES ($1, $2)
            ON CONFLICT (schedule_id) DO UPDATE
               SET enabled = EXCLUDED.enabled,
                   updated_at = now()
            "#,
        )
        .bind(schedule_id)
        .bind(enabled)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }
}
