//! Exercises the Postgres adapters. Needs `DATABASE_URL` pointing at a server
//! where `sqlx::test` may create scratch databases; run with `--ignored`.

use std::time::Duration;

use bytes::Bytes;
use folio::{
    application::repos::{
        ArtifactStore, JobQueue, Nack, NackOutcome, NewJob, RepoError, ScheduleStore,
    },
    domain::{
        entities::RenderResult,
        types::{JobState, RenderStatus, TaskType},
    },
    infra::db::{PostgresRepositories, QueueTuning},
};
use serde_json::json;
use sqlx::PgPool;
use time::macros::datetime;

const NO_WAIT: Duration = Duration::ZERO;

fn repositories(pool: PgPool, visibility_timeout: Duration) -> PostgresRepositories {
    PostgresRepositories::new(
        pool,
        QueueTuning {
            visibility_timeout,
            poll_interval: Duration::from_millis(20),
        },
    )
}

fn new_job(max_attempts: u32) -> NewJob {
    NewJob {
        task_type: TaskType::RenderReport,
        payload: json!({ "sku": "P-100", "price": 450000 }),
        max_attempts,
    }
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn lease_ack_round_trip(pool: PgPool) {
    let repos = repositories(pool, Duration::from_secs(30));
    let job_id = repos.enqueue(new_job(3)).await.expect("enqueue");

    let leased = repos
        .dequeue("pg-worker", NO_WAIT)
        .await
        .expect("dequeue")
        .expect("job leased");
    assert_eq!(leased.descriptor.job_id, job_id);
    assert_eq!(leased.lease.attempt, 1);
    assert!(
        repos
            .dequeue("other-worker", NO_WAIT)
            .await
            .expect("dequeue")
            .is_none()
    );

    repos.ack(&leased.lease).await.expect("ack");
    let record = repos.find(job_id).await.expect("find").expect("record");
    assert_eq!(record.state, JobState::Acked);
    assert!(record.settled_at.is_some());

    assert!(matches!(
        repos.ack(&leased.lease).await,
        Err(RepoError::LeaseLost { .. })
    ));
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn requeue_then_exhaust_attempts(pool: PgPool) {
    let repos = repositories(pool, Duration::from_secs(30));
    let job_id = repos.enqueue(new_job(2)).await.expect("enqueue");

    let first = repos
        .dequeue("pg-worker", NO_WAIT)
        .await
        .expect("dequeue")
        .expect("first delivery");
    let outcome = repos
        .nack(&first.lease, Nack::retry("render_timeout: slow", Duration::ZERO))
        .await
        .expect("nack");
    assert_eq!(outcome, NackOutcome::Requeued { attempt_count: 1 });

    let second = repos
        .dequeue("pg-worker", Duration::from_secs(2))
        .await
        .expect("dequeue")
        .expect("second delivery");
    assert_eq!(second.lease.attempt, 2);

    let outcome = repos
        .nack(&second.lease, Nack::retry("render_timeout: slow", Duration::ZERO))
        .await
        .expect("nack");
    assert_eq!(outcome, NackOutcome::DeadLettered { attempt_count: 2 });

    let dead = repos.dead_letters(10).await.expect("dead letters");
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].job_id, job_id);
    assert!(dead[0].error_detail.starts_with("attempts_exhausted"));
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn expired_lease_is_redelivered(pool: PgPool) {
    let repos = repositories(pool, Duration::from_millis(200));
    repos.enqueue(new_job(3)).await.expect("enqueue");

    let first = repos
        .dequeue("pg-worker", NO_WAIT)
        .await
        .expect("dequeue")
        .expect("first delivery");
    tokio::time::sleep(Duration::from_millis(400)).await;

    let second = repos
        .dequeue("pg-worker-2", NO_WAIT)
        .await
        .expect("dequeue")
        .expect("redelivery");
    assert_eq!(second.lease.attempt, 2);
    assert!(matches!(
        repos.nack(&first.lease, Nack::dead_letter("late")).await,
        Err(RepoError::LeaseLost { .. })
    ));
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn stored_success_is_never_replaced(pool: PgPool) {
    let repos = repositories(pool, Duration::from_secs(30));
    let job_id = repos.enqueue(new_job(3)).await.expect("enqueue");

    repos
        .upsert_result(RenderResult::failed(job_id, 1, "render_timeout: slow"))
        .await
        .expect("store failure");
    repos
        .upsert_result(RenderResult::succeeded(
            job_id,
            2,
            Bytes::from_static(b"%PDF-1.7 first"),
        ))
        .await
        .expect("store success");
    repos
        .upsert_result(RenderResult::failed(job_id, 3, "late failure"))
        .await
        .expect("late write is ignored");

    let stored = repos
        .find_result(job_id)
        .await
        .expect("find result")
        .expect("result");
    assert_eq!(stored.status, RenderStatus::Succeeded);
    assert_eq!(stored.attempt, 2);

    let artifact = repos.get_artifact(job_id).await.expect("artifact");
    assert_eq!(artifact, Bytes::from_static(b"%PDF-1.7 first"));
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn schedule_state_round_trip(pool: PgPool) {
    let repos = repositories(pool, Duration::from_secs(30));

    let empty = repos.load_state("hourly").await.expect("load");
    assert!(empty.last_fired_at.is_none());
    assert!(empty.enabled.is_none());

    repos
        .record_fired("hourly", datetime!(2026-10-18 09:00:00 UTC))
        .await
        .expect("record fired");
    repos.set_enabled("hourly", false).await.expect("disable");

    let state = repos.load_state("hourly").await.expect("load");
    assert_eq!(state.last_fired_at, Some(datetime!(2026-10-18 09:00:00 UTC)));
    assert_eq!(state.enabled, Some(false));
}
