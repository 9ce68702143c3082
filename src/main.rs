use std::{process, str::FromStr, sync::Arc, time::Duration};

use folio::{
    application::{
        convert::{HeadlessChromeConverter, SessionPool},
        error::AppError,
        jobs::{
            JobWorkerContext, RenderReportPayload, RetryPolicy, WorkerPool, WorkerPoolSettings,
            enqueue_render_report, wait_for_job_completion,
        },
        render::{AskamaTemplateRenderer, TemplateId},
        repos::{ArtifactStore, JobQueue, ScheduleStore},
        scheduler::Scheduler,
    },
    config::{self, QueueBackend},
    domain::{
        entities::JobId,
        schedule::{ScheduleEntry, ScheduleRule},
    },
    infra::{
        db::{PostgresRepositories, QueueTuning},
        error::InfraError,
        memory::{MemoryArtifactStore, MemoryJobQueue, MemoryScheduleStore},
        telemetry,
    },
};
use serde_json::{Value, json};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tokio::sync::watch;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    let report = error.report();
    if dispatcher::has_been_set() {
        error!(error = %report.joined(), "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %report.joined(), "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Run(Box::<config::RunArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Run(_) => run_service(settings).await,
        config::Command::Enqueue(args) => run_enqueue(settings, args).await,
        config::Command::DeadLetters(args) => run_dead_letters(settings, args).await,
        config::Command::Artifact(args) => run_artifact(settings, args).await,
        config::Command::Schedules(args) => run_schedules(settings, args).await,
    }
}

struct Backends {
    queue: Arc<dyn JobQueue>,
    artifacts: Arc<dyn ArtifactStore>,
    schedules: Arc<dyn ScheduleStore>,
}

async fn init_backends(settings: &config::Settings) -> Result<Backends, AppError> {
    match settings.queue.backend {
        QueueBackend::Memory => {
            let retention = settings.queue.memory_retention.get() as usize;
            warn!(
                target = "folio::run",
                retention,
                "memory backend selected; jobs and results are lost on exit"
            );
            Ok(Backends {
                queue: Arc::new(
                    MemoryJobQueue::new(
                        settings.queue.visibility_timeout,
                        settings.queue.poll_interval,
                    )
                    .with_retention(retention),
                ),
                artifacts: Arc::new(MemoryArtifactStore::with_retention(retention)),
                schedules: Arc::new(MemoryScheduleStore::new()),
            })
        }
        QueueBackend::Postgres => {
            let repositories = init_repositories(settings).await?;
            Ok(Backends {
                queue: repositories.clone(),
                artifacts: repositories.clone(),
                schedules: repositories,
            })
        }
    }
}

async fn init_repositories(
    settings: &config::Settings,
) -> Result<Arc<PostgresRepositories>, AppError> {
    if settings.queue.backend == QueueBackend::Memory {
        return Err(AppError::validation(
            "the memory backend only exists inside `folio run`; admin commands need postgres",
        ));
    }

    let database_url = settings
        .database
        .url
        .as_ref()
        .ok_or_else(|| InfraError::configuration("database url is not configured"))?;

    let pool = PostgresRepositories::connect(database_url, settings.database.max_connections.get())
        .await
        .map_err(InfraError::from)?;

    PostgresRepositories::run_migrations(&pool)
        .await
        .map_err(InfraError::from)?;

    let tuning = QueueTuning {
        visibility_timeout: settings.queue.visibility_timeout,
        poll_interval: settings.queue.poll_interval,
    };

    Ok(Arc::new(PostgresRepositories::new(pool, tuning)))
}

async fn run_service(settings: config::Settings) -> Result<(), AppError> {
    let backends = init_backends(&settings).await?;

    let sessions = SessionPool::new(
        settings.converter.pool_size.get() as usize,
        settings.converter.scratch_dir.clone(),
    )
    .map_err(InfraError::from)?;
    let converter = HeadlessChromeConverter::new(
        settings.converter.browser_path.clone(),
        settings.converter.extra_args.clone(),
        settings.converter.timeout,
        sessions,
    );
    let browser_sessions = converter.sessions().size();

    let context = JobWorkerContext {
        queue: backends.queue.clone(),
        artifacts: backends.artifacts.clone(),
        renderer: Arc::new(AskamaTemplateRenderer::new(
            settings.renderer.brand_name.clone(),
        )),
        converter: Arc::new(converter),
        retry: RetryPolicy::new(settings.queue.retry_base, settings.queue.retry_max),
        default_template: settings.renderer.default_template,
        settle_margin: settings.queue.settle_margin(),
    };

    let pool = WorkerPool::spawn(
        context,
        WorkerPoolSettings {
            concurrency: settings.workers.concurrency.get() as usize,
            dequeue_wait: settings.queue.dequeue_wait,
            ..WorkerPoolSettings::default()
        },
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_handle = if settings.scheduler.enabled {
        let scheduler = Scheduler::load(
            settings.scheduler.entries.clone(),
            backends.queue.clone(),
            backends.schedules.clone(),
            OffsetDateTime::now_utc(),
        )
        .await?;
        Some(tokio::spawn(scheduler.run(settings.scheduler.tick, shutdown_rx)))
    } else {
        None
    };

    info!(
        target = "folio::run",
        workers = pool.len(),
        browser_sessions,
        scheduler = scheduler_handle.is_some(),
        "service started"
    );

    tokio::signal::ctrl_c().await.map_err(InfraError::from)?;
    info!(target = "folio::run", "shutdown requested");

    let _ = shutdown_tx.send(true);
    if let Some(handle) = scheduler_handle
        && let Err(err) = handle.await
    {
        warn!(target = "folio::run", error = %err, "scheduler task ended abnormally");
    }
    pool.shutdown().await;

    info!(target = "folio::run", "service stopped");
    Ok(())
}

async fn run_enqueue(settings: config::Settings, args: config::EnqueueArgs) -> Result<(), AppError> {
    let property = match serde_json::from_str::<Value>(&args.payload) {
        Ok(Value::Object(property)) => property,
        Ok(_) => return Err(AppError::validation("payload must be a JSON object")),
        Err(err) => {
            return Err(AppError::validation(format!(
                "payload is not valid JSON: {err}"
            )));
        }
    };

    let mut payload = RenderReportPayload::new(property);
    if let Some(template) = args.template {
        TemplateId::from_str(&template).map_err(|err| AppError::validation(err.to_string()))?;
        payload = payload.with_template(template);
    }

    let max_attempts = args
        .max_attempts
        .unwrap_or(settings.queue.default_max_attempts.get());

    let repositories = init_repositories(&settings).await?;
    let job_id = enqueue_render_report(repositories.as_ref(), &payload, max_attempts).await?;
    println!("{job_id}");

    if let Some(seconds) = args.wait {
        let record =
            wait_for_job_completion(repositories.as_ref(), job_id, Duration::from_secs(seconds))
                .await?;
        println!("{}", to_pretty_json(&record)?);
    }

    Ok(())
}

async fn run_dead_letters(
    settings: config::Settings,
    args: config::DeadLettersArgs,
) -> Result<(), AppError> {
    let repositories = init_repositories(&settings).await?;
    let entries = repositories.dead_letters(args.limit).await?;

    info!(
        target = "folio::dead_letters",
        count = entries.len(),
        "listed dead-lettered jobs"
    );
    println!("{}", to_pretty_json(&entries)?);
    Ok(())
}

async fn run_artifact(settings: config::Settings, args: config::ArtifactArgs) -> Result<(), AppError> {
    let job_id = JobId::from_str(&args.job_id)?;
    let repositories = init_repositories(&settings).await?;
    let artifact = repositories.get_artifact(job_id).await?;

    tokio::fs::write(&args.output, &artifact)
        .await
        .map_err(InfraError::from)?;

    info!(
        target = "folio::artifact",
        job_id = %job_id,
        bytes = artifact.len(),
        path = %args.output.display(),
        "artifact written"
    );
    Ok(())
}

async fn run_schedules(
    settings: config::Settings,
    args: config::SchedulesArgs,
) -> Result<(), AppError> {
    let repositories = init_repositories(&settings).await?;
    let mut scheduler = Scheduler::load(
        settings.scheduler.entries.clone(),
        repositories.clone(),
        repositories,
        OffsetDateTime::now_utc(),
    )
    .await?;

    match args.command {
        config::SchedulesCommand::List => {
            let listing: Vec<Value> = scheduler
                .entries()
                .iter()
                .map(|entry| describe_schedule(&scheduler, entry))
                .collect();
            println!("{}", to_pretty_json(&listing)?);
        }
        config::SchedulesCommand::Enable { id } => {
            toggle_schedule(&mut scheduler, &id, true).await?
        }
        config::SchedulesCommand::Disable { id } => {
            toggle_schedule(&mut scheduler, &id, false).await?
        }
    }

    Ok(())
}

async fn toggle_schedule(
    scheduler: &mut Scheduler,
    schedule_id: &str,
    enabled: bool,
) -> Result<(), AppError> {
    scheduler.set_enabled(schedule_id, enabled).await?;
    info!(
        target = "folio::schedules",
        schedule_id,
        enabled,
        "override stored; a running scheduler applies it on its next restart"
    );
    Ok(())
}

fn describe_schedule(scheduler: &Scheduler, entry: &ScheduleEntry) -> Value {
    let rule = match &entry.rule {
        ScheduleRule::Cron(schedule) => format!("cron {schedule}"),
        ScheduleRule::Interval(interval) => format!("every {}s", interval.whole_seconds()),
    };

    json!({
        "id": entry.schedule_id,
        "rule": rule,
        "enabled": entry.enabled,
        "task_type": entry.task_template.task_type,
        "max_attempts": entry.task_template.max_attempts,
        "last_fired_at": entry.last_fired_at.and_then(|at| at.format(&Rfc3339).ok()),
        "next_fire_at": scheduler
            .next_fire_at(entry)
            .and_then(|at| at.format(&Rfc3339).ok()),
    })
}

fn to_pretty_json<T: serde::Serialize>(value: &T) -> Result<String, AppError> {
    serde_json::to_string_pretty(value)
        .map_err(|err| AppError::unexpected(format!("failed to encode output: {err}")))
}
