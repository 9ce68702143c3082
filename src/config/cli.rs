use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the folio binary.
#[derive(Debug, Parser)]
#[command(name = "folio", version, about = "Property report rendering service")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "FOLIO_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the worker pool and the scheduler.
    Run(Box<RunArgs>),
    /// Enqueue a report job from a JSON property record.
    Enqueue(EnqueueArgs),
    /// List dead-lettered jobs.
    #[command(name = "dead-letters")]
    DeadLetters(DeadLettersArgs),
    /// Write the PDF produced for a job to a file.
    Artifact(ArtifactArgs),
    /// Inspect and toggle configured schedules.
    Schedules(SchedulesArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct DatabaseOverride {
    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub overrides: RunOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct RunOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,

    /// Override the queue backend (postgres|memory).
    #[arg(long = "queue-backend", value_name = "BACKEND")]
    pub queue_backend: Option<String>,

    /// Override the number of worker loops.
    #[arg(long = "workers-concurrency", value_name = "COUNT")]
    pub workers_concurrency: Option<u32>,

    /// Override the headless browser executable.
    #[arg(long = "converter-browser-path", value_name = "PATH")]
    pub converter_browser_path: Option<PathBuf>,

    /// Override the per-conversion timeout.
    #[arg(long = "converter-timeout-seconds", value_name = "SECONDS")]
    pub converter_timeout_seconds: Option<u64>,

    /// Override the number of concurrent browser sessions.
    #[arg(long = "converter-pool-size", value_name = "COUNT")]
    pub converter_pool_size: Option<u32>,

    /// Toggle the scheduler.
    #[arg(
        long = "scheduler-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub scheduler_enabled: Option<bool>,

    /// Override the scheduler tick cadence.
    #[arg(long = "scheduler-tick-seconds", value_name = "SECONDS")]
    pub scheduler_tick_seconds: Option<u64>,
}

#[derive(Debug, Args, Clone)]
pub struct EnqueueArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,

    /// Property record as a JSON object.
    #[arg(long, value_name = "JSON")]
    pub payload: String,

    /// Template to render; defaults to the configured template.
    #[arg(long, value_name = "TEMPLATE")]
    pub template: Option<String>,

    /// Override the configured attempt budget.
    #[arg(long = "max-attempts", value_name = "COUNT")]
    pub max_attempts: Option<u32>,

    /// Wait up to this many seconds for the job to settle.
    #[arg(long, value_name = "SECONDS")]
    pub wait: Option<u64>,
}

#[derive(Debug, Args, Clone)]
pub struct DeadLettersArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,

    /// Maximum number of entries to list.
    #[arg(long, default_value_t = 50)]
    pub limit: u32,
}

#[derive(Debug, Args, Clone)]
pub struct ArtifactArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,

    /// Job identifier returned by `enqueue`.
    #[arg(value_name = "JOB_ID")]
    pub job_id: String,

    /// Destination file for the PDF.
    #[arg(long, short = 'o', value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub output: PathBuf,
}

#[derive(Debug, Args, Clone)]
pub struct SchedulesArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,

    #[command(subcommand)]
    pub command: SchedulesCommand,
}

#[derive(Debug, Subcommand, Clone)]
pub enum SchedulesCommand {
    /// Show configured schedules with their persisted state.
    List,
    /// Enable a schedule. A `folio run` already in progress keeps its old
    /// state until its next restart.
    Enable {
        #[arg(value_name = "SCHEDULE_ID")]
        id: String,
    },
    /// Disable a schedule. A `folio run` already in progress keeps its old
    /// state until its next restart.
    Disable {
        #[arg(value_name = "SCHEDULE_ID")]
        id: String,
    },
}
