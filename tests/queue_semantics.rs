use std::{collections::HashSet, sync::Arc, time::Duration};

use folio::{
    application::{
        jobs::{enqueue_job, wait_for_job_completion},
        repos::{JobQueue, Nack, NackOutcome, RepoError},
    },
    domain::types::{JobState, TaskType},
    infra::memory::MemoryJobQueue,
};
use serde_json::json;

const NO_WAIT: Duration = Duration::ZERO;

fn queue_with_visibility(visibility: Duration) -> MemoryJobQueue {
    MemoryJobQueue::new(visibility, Duration::from_millis(5))
}

#[tokio::test]
async fn expired_lease_is_redelivered_with_next_attempt() {
    let queue = queue_with_visibility(Duration::from_millis(50));
    let job_id = enqueue_job(&queue, TaskType::RenderReport, &json!({ "sku": "P-1" }), 3)
        .await
        .expect("enqueue");

    let first = queue
        .dequeue("w1", NO_WAIT)
        .await
        .expect("dequeue")
        .expect("first delivery");
    assert_eq!(first.lease.attempt, 1);

    tokio::time::sleep(Duration::from_millis(80)).await;

    let second = queue
        .dequeue("w2", NO_WAIT)
        .await
        .expect("dequeue")
        .expect("redelivery after expiry");
    assert_eq!(second.descriptor.job_id, job_id);
    assert_eq!(second.lease.attempt, 2);
    assert_ne!(first.lease.lease_id, second.lease.lease_id);

    assert!(matches!(
        queue.ack(&first.lease).await,
        Err(RepoError::LeaseLost { .. })
    ));
    queue.ack(&second.lease).await.expect("current lease acks");

    let record = queue.find(job_id).await.expect("find").expect("record");
    assert_eq!(record.state, JobState::Acked);
    assert_eq!(record.descriptor.attempt_count, 2);
}

#[tokio::test]
async fn lease_expiring_on_final_attempt_dead_letters() {
    let queue = queue_with_visibility(Duration::from_millis(30));
    let job_id = enqueue_job(&queue, TaskType::RenderReport, &json!({ "sku": "P-2" }), 1)
        .await
        .expect("enqueue");

    queue
        .dequeue("w1", NO_WAIT)
        .await
        .expect("dequeue")
        .expect("delivery");
    tokio::time::sleep(Duration::from_millis(60)).await;

    assert!(queue.dequeue("w1", NO_WAIT).await.expect("dequeue").is_none());

    let record = queue.find(job_id).await.expect("find").expect("record");
    assert_eq!(record.state, JobState::DeadLettered);

    let dead = queue.dead_letters(10).await.expect("dead letters");
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempt_count, 1);
    assert!(dead[0].error_detail.starts_with("attempts_exhausted"));
}

#[tokio::test]
async fn settled_lease_cannot_be_nacked() {
    let queue = queue_with_visibility(Duration::from_secs(30));
    enqueue_job(&queue, TaskType::RenderReport, &json!({ "sku": "P-3" }), 2)
        .await
        .expect("enqueue");

    let leased = queue
        .dequeue("w1", NO_WAIT)
        .await
        .expect("dequeue")
        .expect("delivery");
    let outcome = queue
        .nack(&leased.lease, Nack::retry("render_timeout: slow", Duration::ZERO))
        .await
        .expect("nack");
    assert_eq!(outcome, NackOutcome::Requeued { attempt_count: 1 });

    assert!(matches!(
        queue.nack(&leased.lease, Nack::dead_letter("late")).await,
        Err(RepoError::LeaseLost { .. })
    ));
}

#[tokio::test]
async fn concurrent_workers_never_share_a_delivery() {
    let queue = Arc::new(queue_with_visibility(Duration::from_secs(30)));
    let mut expected = HashSet::new();
    for index in 0..20 {
        let job_id = enqueue_job(
            queue.as_ref(),
            TaskType::RenderReport,
            &json!({ "sku": format!("P-{index}") }),
            3,
        )
        .await
        .expect("enqueue");
        expected.insert(job_id);
    }

    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                let worker_id = format!("w{worker}");
                let mut seen = Vec::new();
                while let Some(job) = queue
                    .dequeue(&worker_id, Duration::from_millis(20))
                    .await
                    .expect("dequeue")
                {
                    queue.ack(&job.lease).await.expect("ack");
                    seen.push(job.descriptor.job_id);
                }
                seen
            })
        })
        .collect();

    let mut delivered = Vec::new();
    for handle in handles {
        delivered.extend(handle.await.expect("worker task"));
    }

    let unique: HashSet<_> = delivered.iter().copied().collect();
    assert_eq!(delivered.len(), 20);
    assert_eq!(unique, expected);
}

#[tokio::test]
async fn zero_attempt_budget_is_rejected() {
    let queue = queue_with_visibility(Duration::from_secs(30));
    let err = enqueue_job(&queue, TaskType::RenderReport, &json!({ "sku": "P-4" }), 0)
        .await
        .expect_err("zero attempts");
    assert!(matches!(err, RepoError::InvalidInput { .. }));
}

#[tokio::test]
async fn waiting_on_unsettled_job_times_out() {
    let queue = queue_with_visibility(Duration::from_secs(30));
    let job_id = enqueue_job(&queue, TaskType::RenderReport, &json!({ "sku": "P-5" }), 1)
        .await
        .expect("enqueue");

    let err = wait_for_job_completion(&queue, job_id, Duration::from_millis(60))
        .await
        .expect_err("nothing settles the job");
    assert!(matches!(err, RepoError::Timeout));
}
