//! Postgres-backed queue, artifact and schedule state implementations.

mod jobs;
mod results;
mod schedules;
mod util;

pub use util::map_sqlx_error;

use std::{sync::Arc, time::Duration};

use sqlx::{
    Postgres, Transaction,
    postgres::{PgPool, PgPoolOptions},
};

/// Queue timing shared by every lease the repositories hand out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueTuning {
    pub visibility_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for QueueTuning {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_millis(500),
        }
    }
}

#[derive(Clone)]
pub struct PostgresRepositories {
    pool: Arc<PgPool>,
    tuning: QueueTuning,
}

impl PostgresRepositories {
    pub fn new(pool: PgPool, tuning: QueueTuning) -> Self {
        Self {
            pool: Arc::new(pool),
            tuning,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn tuning(&self) -> QueueTuning {
        self.tuning
    }

    pub async fn begin(&self) -> Result<Transaction<'_, Postgres>, sqlx::Error> {
        self.pool.begin().await
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
        PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
    }

    pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(pool).await
    }
}
