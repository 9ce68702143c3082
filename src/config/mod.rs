//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

pub use cli::{
    ArtifactArgs, CliArgs, Command, DatabaseOverride, DeadLettersArgs, EnqueueArgs, RunArgs,
    RunOverrides, SchedulesArgs, SchedulesCommand,
};

use std::{collections::HashSet, num::NonZeroU32, path::PathBuf, str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::{
    application::render::TemplateId,
    domain::{
        schedule::{ScheduleEntry, ScheduleRule, TaskTemplate},
        types::TaskType,
    },
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "folio";
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 8;
const DEFAULT_VISIBILITY_TIMEOUT_SECS: u64 = 300;
const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
const DEFAULT_DEQUEUE_WAIT_SECS: u64 = 5;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_BASE_SECS: u64 = 5;
const DEFAULT_RETRY_MAX_SECS: u64 = 300;
const DEFAULT_WORKER_CONCURRENCY: u32 = 4;
const DEFAULT_BROWSER_PATH: &str = "chromium";
const DEFAULT_CONVERT_TIMEOUT_SECS: u64 = 60;
const DEFAULT_BROWSER_POOL_SIZE: u32 = 2;
const DEFAULT_SCRATCH_DIR: &str = "/tmp/folio-sessions";
const DEFAULT_BRAND_NAME: &str = "Folio";
const DEFAULT_SCHEDULER_TICK_SECS: u64 = 30;
const DEFAULT_MEMORY_RETENTION: u32 = 10_000;
const MAX_SETTLE_MARGIN: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub queue: QueueSettings,
    pub workers: WorkerSettings,
    pub converter: ConverterSettings,
    pub renderer: RendererSettings,
    pub scheduler: SchedulerSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub url: Option<String>,
    pub max_connections: NonZeroU32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub backend: QueueBackend,
    pub visibility_timeout: Duration,
    pub poll_interval: Duration,
    pub dequeue_wait: Duration,
    pub default_max_attempts: NonZeroU32,
    pub retry_base: Duration,
    pub retry_max: Duration,
    /// Settled jobs and results the memory backend keeps before evicting the
    /// oldest.
    pub memory_retention: NonZeroU32,
}

impl QueueSettings {
    /// Lease time reserved for persisting a result and settling the job.
    pub fn settle_margin(&self) -> Duration {
        (self.visibility_timeout / 10).min(MAX_SETTLE_MARGIN)
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub concurrency: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct ConverterSettings {
    pub browser_path: PathBuf,
    pub timeout: Duration,
    pub pool_size: NonZeroU32,
    pub extra_args: Vec<String>,
    pub scratch_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct RendererSettings {
    pub brand_name: String,
    pub default_template: TemplateId,
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub enabled: bool,
    pub tick: Duration,
    pub entries: Vec<ScheduleEntry>,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("FOLIO").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Run(args)) => raw.apply_run_overrides(&args.overrides),
        Some(Command::Enqueue(args)) => raw.apply_database_override(&args.database),
        Some(Command::DeadLetters(args)) => raw.apply_database_override(&args.database),
        Some(Command::Artifact(args)) => raw.apply_database_override(&args.database),
        Some(Command::Schedules(args)) => raw.apply_database_override(&args.database),
        None => raw.apply_run_overrides(&RunOverrides::default()),
    }

    Settings::from_raw(raw)
}

pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    database: RawDatabaseSettings,
    queue: RawQueueSettings,
    workers: RawWorkerSettings,
    converter: RawConverterSettings,
    renderer: RawRendererSettings,
    scheduler: RawSchedulerSettings,
}

impl RawSettings {
    fn apply_run_overrides(&mut self, overrides: &RunOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
        if let Some(backend) = overrides.queue_backend.as_ref() {
            self.queue.backend = Some(backend.clone());
        }
        if let Some(value) = overrides.workers_concurrency {
            self.workers.concurrency = Some(value);
        }
        if let Some(path) = overrides.converter_browser_path.as_ref() {
            self.converter.browser_path = Some(path.clone());
        }
        if let Some(seconds) = overrides.converter_timeout_seconds {
            self.converter.timeout_seconds = Some(seconds);
        }
        if let Some(size) = overrides.converter_pool_size {
            self.converter.pool_size = Some(size);
        }
        if let Some(enabled) = overrides.scheduler_enabled {
            self.scheduler.enabled = Some(enabled);
        }
        if let Some(seconds) = overrides.scheduler_tick_seconds {
            self.scheduler.tick_seconds = Some(seconds);
        }
    }

    fn apply_database_override(&mut self, overrides: &DatabaseOverride) {
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            database,
            queue,
            workers,
            converter,
            renderer,
            scheduler,
        } = raw;

        let logging = build_logging_settings(logging)?;
        let database = build_database_settings(database)?;
        let queue = build_queue_settings(queue)?;
        let workers = build_worker_settings(workers)?;
        let converter = build_converter_settings(converter)?;
        check_attempt_fits_lease(&queue, &converter)?;
        let renderer = build_renderer_settings(renderer)?;
        let scheduler = build_scheduler_settings(scheduler, queue.default_max_attempts)?;

        Ok(Self {
            logging,
            database,
            queue,
            workers,
            converter,
            renderer,
            scheduler,
        })
    }
}

fn check_attempt_fits_lease(
    queue: &QueueSettings,
    converter: &ConverterSettings,
) -> Result<(), LoadError> {
    let usable = queue
        .visibility_timeout
        .saturating_sub(queue.settle_margin());
    if converter.timeout >= usable {
        return Err(LoadError::invalid(
            "converter.timeout_seconds",
            format!(
                "must be shorter than queue.visibility_timeout_seconds minus the {}s settle margin ({}s available)",
                queue.settle_margin().as_secs_f64(),
                usable.as_secs_f64()
            ),
        ));
    }
    Ok(())
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_database_settings(database: RawDatabaseSettings) -> Result<DatabaseSettings, LoadError> {
    let url = database.url.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });

    let max_connections = non_zero_u32(
        database
            .max_connections
            .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS)
            .into(),
        "database.max_connections",
    )?;

    Ok(DatabaseSettings {
        url,
        max_connections,
    })
}

fn build_queue_settings(queue: RawQueueSettings) -> Result<QueueSettings, LoadError> {
    let backend = match queue.backend.as_deref().map(str::trim) {
        None | Some("postgres") => QueueBackend::Postgres,
        Some("memory") => QueueBackend::Memory,
        Some(other) => {
            return Err(LoadError::invalid(
                "queue.backend",
                format!("expected `postgres` or `memory`, got `{other}`"),
            ));
        }
    };

    let visibility_timeout = positive_secs(
        queue
            .visibility_timeout_seconds
            .unwrap_or(DEFAULT_VISIBILITY_TIMEOUT_SECS),
        "queue.visibility_timeout_seconds",
    )?;
    let poll_interval_ms = queue.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS);
    if poll_interval_ms == 0 {
        return Err(LoadError::invalid(
            "queue.poll_interval_ms",
            "must be greater than zero",
        ));
    }
    let dequeue_wait = positive_secs(
        queue
            .dequeue_wait_seconds
            .unwrap_or(DEFAULT_DEQUEUE_WAIT_SECS),
        "queue.dequeue_wait_seconds",
    )?;
    let default_max_attempts = non_zero_u32(
        queue
            .default_max_attempts
            .unwrap_or(DEFAULT_MAX_ATTEMPTS)
            .into(),
        "queue.default_max_attempts",
    )?;
    let retry_base = positive_secs(
        queue.retry_base_seconds.unwrap_or(DEFAULT_RETRY_BASE_SECS),
        "queue.retry_base_seconds",
    )?;
    let retry_max = positive_secs(
        queue.retry_max_seconds.unwrap_or(DEFAULT_RETRY_MAX_SECS),
        "queue.retry_max_seconds",
    )?;
    if retry_max < retry_base {
        return Err(LoadError::invalid(
            "queue.retry_max_seconds",
            "must not be smaller than queue.retry_base_seconds",
        ));
    }

    let memory_retention = non_zero_u32(
        queue
            .memory_retention
            .unwrap_or(DEFAULT_MEMORY_RETENTION)
            .into(),
        "queue.memory_retention",
    )?;

    Ok(QueueSettings {
        backend,
        visibility_timeout,
        poll_interval: Duration::from_millis(poll_interval_ms),
        dequeue_wait,
        default_max_attempts,
        retry_base,
        retry_max,
        memory_retention,
    })
}

fn build_worker_settings(workers: RawWorkerSettings) -> Result<WorkerSettings, LoadError> {
    let concurrency = non_zero_u32(
        workers
            .concurrency
            .unwrap_or(DEFAULT_WORKER_CONCURRENCY)
            .into(),
        "workers.concurrency",
    )?;

    Ok(WorkerSettings { concurrency })
}

fn build_converter_settings(
    converter: RawConverterSettings,
) -> Result<ConverterSettings, LoadError> {
    let browser_path = converter
        .browser_path
        .unwrap_or_else(|| PathBuf::from(DEFAULT_BROWSER_PATH));
    if browser_path.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "converter.browser_path",
            "path must not be empty",
        ));
    }

    let scratch_dir = converter
        .scratch_dir
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SCRATCH_DIR));
    if scratch_dir.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "converter.scratch_dir",
            "path must not be empty",
        ));
    }

    let timeout = positive_secs(
        converter
            .timeout_seconds
            .unwrap_or(DEFAULT_CONVERT_TIMEOUT_SECS),
        "converter.timeout_seconds",
    )?;
    let pool_size = non_zero_u32(
        converter
            .pool_size
            .unwrap_or(DEFAULT_BROWSER_POOL_SIZE)
            .into(),
        "converter.pool_size",
    )?;

    Ok(ConverterSettings {
        browser_path,
        timeout,
        pool_size,
        extra_args: converter.extra_args.unwrap_or_default(),
        scratch_dir,
    })
}

fn build_renderer_settings(renderer: RawRendererSettings) -> Result<RendererSettings, LoadError> {
    let brand_name = renderer
        .brand_name
        .map(|name| name.trim().to_string())
        .unwrap_or_else(|| DEFAULT_BRAND_NAME.to_string());
    if brand_name.is_empty() {
        return Err(LoadError::invalid(
            "renderer.brand_name",
            "must not be empty",
        ));
    }

    let default_template = match renderer.default_template {
        Some(id) => TemplateId::from_str(id.trim())
            .map_err(|err| LoadError::invalid("renderer.default_template", err.to_string()))?,
        None => TemplateId::DEFAULT,
    };

    Ok(RendererSettings {
        brand_name,
        default_template,
    })
}

fn build_scheduler_settings(
    scheduler: RawSchedulerSettings,
    default_max_attempts: NonZeroU32,
) -> Result<SchedulerSettings, LoadError> {
    let tick = positive_secs(
        scheduler.tick_seconds.unwrap_or(DEFAULT_SCHEDULER_TICK_SECS),
        "scheduler.tick_seconds",
    )?;

    let mut seen = HashSet::new();
    let mut entries = Vec::with_capacity(scheduler.entries.len());
    for raw in scheduler.entries {
        let entry = build_schedule_entry(raw, default_max_attempts)?;
        if !seen.insert(entry.schedule_id.clone()) {
            return Err(LoadError::invalid(
                "scheduler.entries",
                format!("duplicate schedule id `{}`", entry.schedule_id),
            ));
        }
        entries.push(entry);
    }

    Ok(SchedulerSettings {
        enabled: scheduler.enabled.unwrap_or(true),
        tick,
        entries,
    })
}

fn build_schedule_entry(
    raw: RawScheduleEntry,
    default_max_attempts: NonZeroU32,
) -> Result<ScheduleEntry, LoadError> {
    const KEY: &str = "scheduler.entries";

    let schedule_id = raw
        .id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| LoadError::invalid(KEY, "every entry needs a non-empty `id`"))?;

    let rule = match (raw.cron, raw.interval_seconds) {
        (Some(expression), None) => ScheduleRule::cron(&schedule_id, &expression),
        (None, Some(seconds)) => ScheduleRule::interval(&schedule_id, seconds),
        _ => {
            return Err(LoadError::invalid(
                KEY,
                format!("schedule `{schedule_id}` needs exactly one of `cron` or `interval_seconds`"),
            ));
        }
    }
    .map_err(|err| LoadError::invalid(KEY, err.to_string()))?;

    let task_type = match raw.task_type.as_deref().map(str::trim) {
        None => TaskType::RenderReport,
        Some(name) => TaskType::try_from(name).map_err(|_| {
            LoadError::invalid(
                KEY,
                format!("schedule `{schedule_id}` has unknown task type `{name}`"),
            )
        })?,
    };

    let payload = raw
        .payload
        .unwrap_or_else(|| serde_json::Value::Object(serde_json::Map::new()));
    if !payload.is_object() {
        return Err(LoadError::invalid(
            KEY,
            format!("schedule `{schedule_id}` payload must be a table"),
        ));
    }

    let max_attempts = match raw.max_attempts {
        Some(value) => non_zero_u32(value.into(), KEY)?,
        None => default_max_attempts,
    };

    Ok(ScheduleEntry {
        schedule_id,
        rule,
        task_template: TaskTemplate {
            task_type,
            payload,
            max_attempts: max_attempts.get(),
        },
        last_fired_at: None,
        enabled: raw.enabled.unwrap_or(true),
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDatabaseSettings {
    url: Option<String>,
    max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawQueueSettings {
    backend: Option<String>,
    visibility_timeout_seconds: Option<u64>,
    poll_interval_ms: Option<u64>,
    dequeue_wait_seconds: Option<u64>,
    default_max_attempts: Option<u32>,
    retry_base_seconds: Option<u64>,
    retry_max_seconds: Option<u64>,
    memory_retention: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawWorkerSettings {
    concurrency: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawConverterSettings {
    browser_path: Option<PathBuf>,
    timeout_seconds: Option<u64>,
    pool_size: Option<u32>,
    extra_args: Option<Vec<String>>,
    scratch_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRendererSettings {
    brand_name: Option<String>,
    default_template: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSchedulerSettings {
    enabled: Option<bool>,
    tick_seconds: Option<u64>,
    entries: Vec<RawScheduleEntry>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawScheduleEntry {
    id: Option<String>,
    cron: Option<String>,
    interval_seconds: Option<u64>,
    task_type: Option<String>,
    payload: Option<serde_json::Value>,
    max_attempts: Option<u32>,
    enabled: Option<bool>,
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn positive_secs(value: u64, key: &'static str) -> Result<Duration, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(Duration::from_secs(value))
}
