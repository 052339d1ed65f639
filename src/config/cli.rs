use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the mathexport binary.
#[derive(Debug, Parser)]
#[command(
    name = "mathexport",
    version,
    about = "Background document exports with cached math typesetting"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "MATHEXPORT_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Submit a question-sheet export job and follow it to completion.
    Export(Box<ExportArgs>),
    /// Typeset one formula through the render cache and print the markup.
    Render(RenderArgs),
    /// Render cache maintenance.
    Cache(CacheArgs),
    /// Run one export in this process and publish its artifact (used by the process backend).
    #[command(hide = true)]
    Worker(WorkerArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct LoggingOverrides {
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
}

#[derive(Debug, Args, Default, Clone)]
pub struct RenderOverrides {
    /// Override the directory holding cached formula renders.
    #[arg(long = "render-cache-dir", value_name = "PATH")]
    pub cache_dir: Option<PathBuf>,

    /// Override how many formulas render in parallel.
    #[arg(long = "render-concurrency", value_name = "COUNT")]
    pub concurrency: Option<u32>,

    /// Override the shared deadline of one render batch.
    #[arg(long = "render-batch-timeout-ms", value_name = "MILLIS")]
    pub batch_timeout_ms: Option<u64>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ExportOverrides {
    #[command(flatten)]
    pub logging: LoggingOverrides,

    #[command(flatten)]
    pub render: RenderOverrides,

    /// Override the result store directory.
    #[arg(long = "export-directory", value_name = "PATH")]
    pub export_directory: Option<PathBuf>,

    /// Override the execution backend (auto|process|thread).
    #[arg(long = "jobs-backend", value_name = "BACKEND")]
    pub jobs_backend: Option<String>,

    /// Override the periodic cache sweep interval; 0 disables it.
    #[arg(long = "cache-sweep-interval-seconds", value_name = "SECONDS")]
    pub cache_sweep_interval_seconds: Option<u64>,
}

#[derive(Debug, Args, Clone)]
pub struct ExportArgs {
    #[command(flatten)]
    pub overrides: ExportOverrides,

    /// JSON file with `{ "title": .., "questions": [..] }`.
    #[arg(long, value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub questions: PathBuf,

    /// Poll the job until it finishes; `--wait false` prints the job id and exits.
    #[arg(
        long,
        value_name = "BOOL",
        default_value_t = true,
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new()
    )]
    pub wait: bool,

    /// Interval between status polls.
    #[arg(long = "poll-ms", value_name = "MILLIS", default_value_t = 200)]
    pub poll_ms: u64,
}

#[derive(Debug, Args, Clone)]
pub struct RenderArgs {
    #[command(flatten)]
    pub logging: LoggingOverrides,

    #[command(flatten)]
    pub render: RenderOverrides,

    /// TeX source of the formula.
    #[arg(value_name = "FORMULA")]
    pub formula: String,

    /// Typeset in display (block) mode instead of inline.
    #[arg(long, action = ArgAction::SetTrue)]
    pub display: bool,
}

#[derive(Debug, Args, Clone)]
pub struct CacheArgs {
    #[command(subcommand)]
    pub command: CacheCommand,
}

#[derive(Debug, Subcommand, Clone)]
pub enum CacheCommand {
    /// Run one eviction sweep and print what it removed.
    Evict(EvictArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct EvictArgs {
    #[command(flatten)]
    pub logging: LoggingOverrides,

    #[command(flatten)]
    pub render: RenderOverrides,

    /// Override the entry-count bound.
    #[arg(long = "max-entries", value_name = "COUNT")]
    pub max_entries: Option<u64>,

    /// Override the total-size bound in bytes.
    #[arg(long = "max-bytes", value_name = "BYTES")]
    pub max_bytes: Option<u64>,

    /// Override the age bound in days.
    #[arg(long = "max-age-days", value_name = "DAYS")]
    pub max_age_days: Option<u64>,
}

#[derive(Debug, Args, Clone)]
pub struct WorkerArgs {
    /// Registered export name.
    #[arg(long, value_name = "NAME")]
    pub export: String,

    /// Export arguments as a JSON document.
    #[arg(long, value_name = "JSON", default_value = "null")]
    pub args: String,

    /// Where to publish the artifact.
    #[arg(long, value_name = "PATH", value_hint = ValueHint::FilePath)]
    pub output: PathBuf,
}
