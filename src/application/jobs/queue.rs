use std::time::Duration;

use metrics::counter;
use tokio::time::{Instant, sleep};
use tracing::info;

use crate::{
    application::repos::{JobQueue, NewJob, RepoError},
    domain::{
        entities::{JobId, JobRecord},
        types::TaskType,
    },
    infra::telemetry::METRIC_JOBS_ENQUEUED,
};

const DEFAULT_WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Serialize the payload and enqueue it, returning the assigned job id.
pub async fn enqueue_job<Q, P>(
    queue: &Q,
    task_type: TaskType,
    payload: &P,
    max_attempts: u32,
) -> Result<JobId, RepoError>
where
    Q: JobQueue + ?Sized,
    P: serde::Serialize,
{
    if max_attempts == 0 {
        return Err(RepoError::invalid_input("max_attempts must be at least 1"));
    }

    let payload = serde_json::to_value(payload)
        .map_err(|err| RepoError::invalid_input(format!("payload is not serializable: {err}")))?;

    let job_id = queue
        .enqueue(NewJob {
            task_type,
            payload,
            max_attempts,
        })
        .await?;

    counter!(METRIC_JOBS_ENQUEUED, "task_type" => task_type.as_str()).increment(1);
    info!(
        target = "application::jobs::queue",
        job_id = %job_id,
        task_type = task_type.as_str(),
        max_attempts,
        "job enqueued"
    );

    Ok(job_id)
}

/// Poll until the job is acked or dead-lettered, returning its final snapshot.
pub async fn wait_for_job_completion<Q>(
    queue: &Q,
    job_id: JobId,
    timeout: Duration,
) -> Result<JobRecord, RepoError>
where
    Q: JobQueue + ?Sized,
{
    let deadline = Instant::now() + timeout;

    loop {
        let job = queue.find(job_id).await?.ok_or(RepoError::NotFound)?;

        if job.state.is_terminal() {
            return Ok(job);
        }

        if Instant::now() >= deadline {
            return Err(RepoError::Timeout);
        }

        sleep(DEFAULT_WAIT_POLL_INTERVAL).await;
    }
}
