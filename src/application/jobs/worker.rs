use std::time::Duration;

use metrics::counter;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::{
    application::repos::{Nack, NackOutcome, RepoError},
    domain::{
        entities::{LeasedJob, RenderResult},
        types::TaskType,
    },
    infra::telemetry::{METRIC_JOBS_ACKED, METRIC_JOBS_DEAD_LETTERED, METRIC_JOBS_REQUEUED},
};

use super::{
    context::JobWorkerContext,
    report::{PipelineError, process_render_report_job},
};

/// Tuning for the worker loops.
#[derive(Debug, Clone)]
pub struct WorkerPoolSettings {
    pub concurrency: usize,
    /// Longest a single dequeue call waits before the loop re-checks shutdown.
    pub dequeue_wait: Duration,
    /// Pause after a failing dequeue so a broken broker is not hammered.
    pub error_backoff: Duration,
    pub worker_prefix: String,
}

impl Default for WorkerPoolSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            dequeue_wait: Duration::from_secs(5),
            error_backoff: Duration::from_secs(1),
            worker_prefix: "worker".to_string(),
        }
    }
}

/// A set of independent worker loops sharing one [`JobWorkerContext`].
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(ctx: JobWorkerContext, settings: WorkerPoolSettings) -> Self {
        let (shutdown, receiver) = watch::channel(false);
        let concurrency = settings.concurrency.max(1);

        let handles = (0..concurrency)
            .map(|index| {
                let worker_id = format!("{}-{index}", settings.worker_prefix);
                tokio::spawn(run_worker(
                    worker_id,
                    ctx.clone(),
                    settings.clone(),
                    receiver.clone(),
                ))
            })
            .collect();

        info!(
            target = "application::jobs::worker",
            concurrency, "worker pool started"
        );

        Self { shutdown, handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Signal every loop to stop and wait for in-flight attempts to settle.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(err) = handle.await {
                error!(
                    target = "application::jobs::worker",
                    error = %err,
                    "worker task terminated abnormally"
                );
            }
        }
        info!(target = "application::jobs::worker", "worker pool stopped");
    }
}

async fn run_worker(
    worker_id: String,
    ctx: JobWorkerContext,
    settings: WorkerPoolSettings,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(target = "application::jobs::worker", worker_id, "worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let next = tokio::select! {
            _ = shutdown.changed() => break,
            next = ctx.queue.dequeue(&worker_id, settings.dequeue_wait) => next,
        };

        match next {
            Ok(Some(job)) => handle_job(&ctx, &worker_id, job).await,
            Ok(None) => {}
            Err(err) => {
                warn!(
                    target = "application::jobs::worker",
                    worker_id,
                    error = %err,
                    "dequeue failed"
                );
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(settings.error_backoff) => {}
                }
            }
        }
    }

    debug!(target = "application::jobs::worker", worker_id, "worker stopped");
}

/// Execute one delivery and settle it. Never returns an error: every outcome
/// is translated into an ack or nack.
pub async fn handle_job(ctx: &JobWorkerContext, worker_id: &str, job: LeasedJob) {
    let descriptor = &job.descriptor;
    let outcome = if descriptor.attempt_count > descriptor.max_attempts {
        Err(PipelineError::AttemptsExhausted {
            attempts: descriptor.attempt_count,
            max_attempts: descriptor.max_attempts,
        })
    } else {
        match descriptor.task_type {
            TaskType::RenderReport => process_render_report_job(ctx, &job).await,
        }
    };

    match outcome {
        Ok(()) => settle_success(ctx, worker_id, &job).await,
        Err(err) => settle_failure(ctx, worker_id, &job, err).await,
    }
}

async fn settle_success(ctx: &JobWorkerContext, worker_id: &str, job: &LeasedJob) {
    let job_id = job.descriptor.job_id;
    match ctx.queue.ack(&job.lease).await {
        Ok(()) => {
            counter!(METRIC_JOBS_ACKED).increment(1);
            info!(
                target = "application::jobs::worker",
                worker_id,
                job_id = %job_id,
                attempt = job.lease.attempt,
                "job acked"
            );
        }
        Err(RepoError::LeaseLost { .. }) => {
            warn!(
                target = "application::jobs::worker",
                worker_id,
                job_id = %job_id,
                attempt = job.lease.attempt,
                "lease lost before ack; job may be redelivered"
            );
        }
        Err(err) => {
            warn!(
                target = "application::jobs::worker",
                worker_id,
                job_id = %job_id,
                error = %err,
                "ack failed; job will be redelivered after its lease expires"
            );
        }
    }
}

async fn settle_failure(
    ctx: &JobWorkerContext,
    worker_id: &str,
    job: &LeasedJob,
    err: PipelineError,
) {
    let job_id = job.descriptor.job_id;
    let attempt = job.lease.attempt;
    let detail = format!("{}: {err}", err.kind());

    if let Err(store_err) = ctx
        .artifacts
        .upsert_result(RenderResult::failed(job_id, attempt, detail.clone()))
        .await
    {
        debug!(
            target = "application::jobs::worker",
            job_id = %job_id,
            error = %store_err,
            "failed to record failed attempt"
        );
    }

    let nack = if err.is_transient() {
        Nack::retry(detail, ctx.retry.backoff(attempt))
    } else {
        Nack::dead_letter(detail)
    };
    let retry_after_ms = nack.retry_after.as_millis() as u64;

    match ctx.queue.nack(&job.lease, nack).await {
        Ok(NackOutcome::Requeued { attempt_count }) => {
            counter!(METRIC_JOBS_REQUEUED).increment(1);
            warn!(
                target = "application::jobs::worker",
                worker_id,
                job_id = %job_id,
                attempt_count,
                retry_after_ms,
                error_kind = err.kind(),
                error = %err,
                "attempt failed; job requeued"
            );
        }
        Ok(NackOutcome::DeadLettered { attempt_count }) => {
            counter!(METRIC_JOBS_DEAD_LETTERED, "source" => "nack").increment(1);
            error!(
                target = "application::jobs::worker",
                worker_id,
                job_id = %job_id,
                attempt_count,
                error_kind = err.kind(),
                error = %err,
                "job dead-lettered"
            );
        }
        Err(nack_err) => {
            warn!(
                target = "application::jobs::worker",
                worker_id,
                job_id = %job_id,
                error = %nack_err,
                "nack failed; job will be redelivered after its lease expires"
            );
        }
    }
}
