use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use async_trait::async_trait;
use metrics::counter;
use time::OffsetDateTime;
use tokio::{
    sync::{Mutex, Notify},
    time::Instant,
};
use tracing::warn;
use uuid::Uuid;

use crate::{
    application::repos::{
        JobQueue, Nack, NackOutcome, NewJob, RepoError, attempts_exhausted_detail,
        lease_expired_detail,
    },
    domain::{
        entities::{DeadLetterEntry, JobDescriptor, JobId, JobRecord, LeasedJob, WorkerLease},
        types::JobState,
    },
    infra::telemetry::METRIC_JOBS_DEAD_LETTERED,
};

/// Process-local broker with the same delivery contract as the Postgres
/// queue. Used by tests and single-process deployments without a database.
///
/// Settled jobs stay inspectable until more than `retention` of them have
/// accumulated; the oldest are then forgotten, dead letters included.
#[derive(Debug)]
pub struct MemoryJobQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    visibility_timeout: Duration,
    poll_interval: Duration,
    retention: Option<usize>,
}

#[derive(Debug, Default)]
struct QueueState {
    jobs: HashMap<JobId, StoredJob>,
    /// Non-terminal jobs in enqueue order.
    pending: Vec<JobId>,
    /// Acked and dead-lettered jobs in settlement order.
    settled: VecDeque<JobId>,
}

impl QueueState {
    fn record_settled(&mut self, job_id: JobId, retention: Option<usize>) {
        self.pending.retain(|pending| *pending != job_id);
        self.settled.push_back(job_id);

        let Some(limit) = retention else {
            return;
        };
        while self.settled.len() > limit {
            if let Some(oldest) = self.settled.pop_front() {
                self.jobs.remove(&oldest);
            }
        }
    }
}

#[derive(Debug)]
struct StoredJob {
    record: JobRecord,
    lease_id: Option<Uuid>,
}

impl MemoryJobQueue {
    pub fn new(visibility_timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            visibility_timeout,
            poll_interval: poll_interval.max(Duration::from_millis(1)),
            retention: None,
        }
    }

    /// Bound how many settled jobs are kept for `find` and `dead_letters`.
    pub fn with_retention(mut self, max_settled: usize) -> Self {
        self.retention = Some(max_settled.max(1));
        self
    }

    fn visibility_deadline(&self, now: OffsetDateTime) -> OffsetDateTime {
        now + self.visibility_timeout
    }

    async fn try_lease(&self, worker_id: &str) -> Option<LeasedJob> {
        let now = OffsetDateTime::now_utc();
        let mut guard = self.state.lock().await;
        let QueueState { jobs, pending, .. } = &mut *guard;

        let mut leased = None;
        let mut missing = Vec::new();
        let mut expired = Vec::new();

        for job_id in pending.iter() {
            let Some(stored) = jobs.get_mut(job_id) else {
                missing.push(*job_id);
                continue;
            };
            let record = &mut stored.record;

            if record.state == JobState::Leased && record.visible_at <= now {
                if record.descriptor.attempts_exhausted() {
                    record.state = JobState::DeadLettered;
                    record.last_error = Some(lease_expired_detail(
                        record.descriptor.attempt_count,
                        record.descriptor.max_attempts,
                    ));
                    record.settled_at = Some(now);
                    record.leased_by = None;
                    stored.lease_id = None;
                    expired.push(*job_id);
                    counter!(METRIC_JOBS_DEAD_LETTERED, "source" => "lease_expired").increment(1);
                    warn!(
                        target = "infra::memory::queue",
                        job_id = %job_id,
                        attempt_count = record.descriptor.attempt_count,
                        "lease expired on final attempt; job dead-lettered"
                    );
                    continue;
                }
                record.state = JobState::Ready;
                record.leased_by = None;
                stored.lease_id = None;
            }

            if record.state != JobState::Ready || record.visible_at > now {
                continue;
            }

            let lease_id = Uuid::new_v4();
            record.descriptor.attempt_count += 1;
            record.state = JobState::Leased;
            record.visible_at = self.visibility_deadline(now);
            record.leased_by = Some(worker_id.to_string());
            stored.lease_id = Some(lease_id);

            leased = Some(LeasedJob {
                descriptor: record.descriptor.clone(),
                lease: WorkerLease {
                    job_id: *job_id,
                    lease_id,
                    worker_id: worker_id.to_string(),
                    attempt: record.descriptor.attempt_count,
                    visibility_deadline: record.visible_at,
                },
            });
            break;
        }

        if !missing.is_empty() {
            pending.retain(|job_id| !missing.contains(job_id));
        }
        for job_id in expired {
            guard.record_settled(job_id, self.retention);
        }

        leased
    }

    /// Resolve the job held by `lease`, failing if the lease is stale.
    fn held<'a>(
        state: &'a mut QueueState,
        lease: &WorkerLease,
        now: OffsetDateTime,
    ) -> Result<&'a mut StoredJob, RepoError> {
        let stored = state.jobs.get_mut(&lease.job_id).ok_or(RepoError::NotFound)?;
        let current = stored.record.state == JobState::Leased
            && stored.lease_id == Some(lease.lease_id)
            && stored.record.visible_at > now;

        if current {
            Ok(stored)
        } else {
            Err(RepoError::LeaseLost {
                job_id: lease.job_id,
            })
        }
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, job: NewJob) -> Result<JobId, RepoError> {
        if job.max_attempts == 0 {
            return Err(RepoError::invalid_input("max_attempts must be at least 1"));
        }

        let now = OffsetDateTime::now_utc();
        let job_id = JobId::new();
        let record = JobRecord {
            descriptor: JobDescriptor {
                job_id,
                task_type: job.task_type,
                payload: job.payload,
                enqueued_at: now,
                attempt_count: 0,
                max_attempts: job.max_attempts,
            },
            state: JobState::Ready,
            visible_at: now,
            leased_by: None,
            last_error: None,
            settled_at: None,
        };

        {
            let mut state = self.state.lock().await;
            state.jobs.insert(
                job_id,
                StoredJob {
                    record,
                    lease_id: None,
                },
            );
            state.pending.push(job_id);
        }
        self.notify.notify_one();

        Ok(job_id)
    }

    async fn dequeue(
        &self,
        worker_id: &str,
        wait: Duration,
    ) -> Result<Option<LeasedJob>, RepoError> {
        let deadline = Instant::now() + wait;

        loop {
            if let Some(job) = self.try_lease(worker_id).await {
                return Ok(Some(job));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            let nap = (deadline - now).min(self.poll_interval);
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }

    async fn ack(&self, lease: &WorkerLease) -> Result<(), RepoError> {
        let now = OffsetDateTime::now_utc();
        let mut state = self.state.lock().await;
        let stored = Self::held(&mut state, lease, now)?;

        stored.record.state = JobState::Acked;
        stored.record.settled_at = Some(now);
        stored.record.leased_by = None;
        stored.lease_id = None;
        state.record_settled(lease.job_id, self.retention);

        Ok(())
    }

    async fn nack(&self, lease: &WorkerLease, nack: Nack) -> Result<NackOutcome, RepoError> {
        let now = OffsetDateTime::now_utc();
        let mut state = self.state.lock().await;
        let stored = Self::held(&mut state, lease, now)?;
        let record = &mut stored.record;
        let attempt_count = record.descriptor.attempt_count;

        stored.lease_id = None;
        record.leased_by = None;

        if nack.requeue && !record.descriptor.attempts_exhausted() {
            record.state = JobState::Ready;
            record.visible_at = now + nack.retry_after;
            record.last_error = Some(nack.error);
            drop(state);
            self.notify.notify_one();
            return Ok(NackOutcome::Requeued { attempt_count });
        }

        let detail = if nack.requeue {
            attempts_exhausted_detail(attempt_count, record.descriptor.max_attempts, &nack.error)
        } else {
            nack.error
        };
        record.state = JobState::DeadLettered;
        record.last_error = Some(detail);
        record.settled_at = Some(now);
        state.record_settled(lease.job_id, self.retention);

        Ok(NackOutcome::DeadLettered { attempt_count })
    }

    async fn find(&self, job_id: JobId) -> Result<Option<JobRecord>, RepoError> {
        let state = self.state.lock().await;
        Ok(state.jobs.get(&job_id).map(|stored| stored.record.clone()))
    }

    async fn dead_letters(&self, limit: u32) -> Result<Vec<DeadLetterEntry>, RepoError> {
        let state = self.state.lock().await;
        let mut entries: Vec<DeadLetterEntry> = state
            .jobs
            .values()
            .filter(|stored| stored.record.state == JobState::DeadLettered)
            .map(|stored| {
                let record = &stored.record;
                DeadLetterEntry {
                    job_id: record.descriptor.job_id,
                    task_type: record.descriptor.task_type,
                    payload: record.descriptor.payload.clone(),
                    error_detail: record.last_error.clone().unwrap_or_default(),
                    attempt_count: record.descriptor.attempt_count,
                    dead_lettered_at: record.settled_at.unwrap_or(record.visible_at),
                }
            })
            .collect();

        entries.sort_by(|a, b| {
            a.dead_lettered_at
                .cmp(&b.dead_lettered_at)
                .then(a.job_id.cmp(&b.job_id))
        });
        entries.truncate(limit as usize);
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::TaskType;
    use serde_json::json;

    const NO_WAIT: Duration = Duration::ZERO;

    fn queue() -> MemoryJobQueue {
        MemoryJobQueue::new(Duration::from_secs(30), Duration::from_millis(5))
    }

    fn new_job(max_attempts: u32) -> NewJob {
        NewJob {
            task_type: TaskType::RenderReport,
            payload: json!({ "sku": "P-1" }),
            max_attempts,
        }
    }

    #[tokio::test]
    async fn lease_hides_job_from_other_workers() {
        let queue = queue();
        queue.enqueue(new_job(3)).await.expect("enqueue");

        let first = queue.dequeue("w1", NO_WAIT).await.expect("dequeue");
        let second = queue.dequeue("w2", NO_WAIT).await.expect("dequeue");

        let first = first.expect("job leased");
        assert_eq!(first.lease.attempt, 1);
        assert_eq!(first.descriptor.attempt_count, 1);
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn ack_is_terminal() {
        let queue = queue();
        let job_id = queue.enqueue(new_job(3)).await.expect("enqueue");
        let leased = queue.dequeue("w1", NO_WAIT).await.expect("dequeue").expect("job");

        queue.ack(&leased.lease).await.expect("ack");

        let record = queue.find(job_id).await.expect("find").expect("record");
        assert_eq!(record.state, JobState::Acked);
        assert!(queue.dequeue("w1", NO_WAIT).await.expect("dequeue").is_none());
        assert!(matches!(
            queue.ack(&leased.lease).await,
            Err(RepoError::LeaseLost { .. })
        ));
    }

    #[tokio::test]
    async fn nack_without_requeue_dead_letters_immediately() {
        let queue = queue();
        let job_id = queue.enqueue(new_job(5)).await.expect("enqueue");
        let leased = queue.dequeue("w1", NO_WAIT).await.expect("dequeue").expect("job");

        let outcome = queue
            .nack(&leased.lease, Nack::dead_letter("missing_field: sku"))
            .await
            .expect("nack");

        assert_eq!(outcome, NackOutcome::DeadLettered { attempt_count: 1 });
        let dead = queue.dead_letters(10).await.expect("dead letters");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].job_id, job_id);
        assert_eq!(dead[0].error_detail, "missing_field: sku");
    }

    #[tokio::test]
    async fn requeue_at_max_attempts_dead_letters() {
        let queue = queue();
        queue.enqueue(new_job(1)).await.expect("enqueue");
        let leased = queue.dequeue("w1", NO_WAIT).await.expect("dequeue").expect("job");

        let outcome = queue
            .nack(&leased.lease, Nack::retry("render_timeout", Duration::ZERO))
            .await
            .expect("nack");

        assert_eq!(outcome, NackOutcome::DeadLettered { attempt_count: 1 });
        let dead = queue.dead_letters(10).await.expect("dead letters");
        assert!(dead[0].error_detail.starts_with("attempts_exhausted"));
    }

    #[tokio::test]
    async fn requeued_job_waits_for_backoff() {
        let queue = queue();
        queue.enqueue(new_job(3)).await.expect("enqueue");
        let leased = queue.dequeue("w1", NO_WAIT).await.expect("dequeue").expect("job");

        queue
            .nack(&leased.lease, Nack::retry("timeout", Duration::from_millis(100)))
            .await
            .expect("nack");

        assert!(queue.dequeue("w1", NO_WAIT).await.expect("dequeue").is_none());
        let redelivered = queue
            .dequeue("w1", Duration::from_secs(2))
            .await
            .expect("dequeue")
            .expect("redelivered after backoff");
        assert_eq!(redelivered.lease.attempt, 2);
        assert_ne!(redelivered.lease.lease_id, leased.lease.lease_id);
    }

    #[tokio::test]
    async fn expired_lease_is_redelivered_and_old_lease_is_stale() {
        let queue = MemoryJobQueue::new(Duration::from_millis(50), Duration::from_millis(5));
        queue.enqueue(new_job(3)).await.expect("enqueue");
        let first = queue.dequeue("w1", NO_WAIT).await.expect("dequeue").expect("job");

        tokio::time::sleep(Duration::from_millis(80)).await;

        let second = queue.dequeue("w2", NO_WAIT).await.expect("dequeue").expect("redelivery");
        assert_eq!(second.lease.attempt, 2);
        assert!(matches!(
            queue.ack(&first.lease).await,
            Err(RepoError::LeaseLost { .. })
        ));
        queue.ack(&second.lease).await.expect("ack with current lease");
    }

    #[tokio::test]
    async fn expired_final_lease_dead_letters_once() {
        let queue = MemoryJobQueue::new(Duration::from_millis(30), Duration::from_millis(5));
        let job_id = queue.enqueue(new_job(1)).await.expect("enqueue");
        queue.dequeue("w1", NO_WAIT).await.expect("dequeue").expect("job");

        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(queue.dequeue("w1", NO_WAIT).await.expect("dequeue").is_none());
        assert!(queue.dequeue("w1", NO_WAIT).await.expect("dequeue").is_none());
        let dead = queue.dead_letters(10).await.expect("dead letters");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].job_id, job_id);
        assert_eq!(dead[0].attempt_count, 1);
    }

    #[tokio::test]
    async fn retention_evicts_oldest_settled_jobs() {
        let queue = queue().with_retention(2);
        let mut settled = Vec::new();
        for _ in 0..3 {
            let job_id = queue.enqueue(new_job(1)).await.expect("enqueue");
            let leased = queue.dequeue("w1", NO_WAIT).await.expect("dequeue").expect("job");
            queue.ack(&leased.lease).await.expect("ack");
            settled.push(job_id);
        }
        let pending = queue.enqueue(new_job(1)).await.expect("enqueue");

        assert!(queue.find(settled[0]).await.expect("find").is_none());
        assert!(queue.find(settled[1]).await.expect("find").is_some());
        assert!(queue.find(settled[2]).await.expect("find").is_some());

        let record = queue.find(pending).await.expect("find").expect("pending kept");
        assert_eq!(record.state, JobState::Ready);
    }

    #[tokio::test]
    async fn dequeue_wakes_on_enqueue() {
        let queue = std::sync::Arc::new(queue());
        let waiter = {
            let queue = std::sync::Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue("w1", Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue(new_job(1)).await.expect("enqueue");

        let leased = waiter.await.expect("join").expect("dequeue");
        assert!(leased.is_some());
    }

    #[tokio::test]
    async fn rejects_zero_max_attempts() {
        assert!(matches!(
            queue().enqueue(new_job(0)).await,
            Err(RepoError::InvalidInput { .. })
        ));
    }
}
