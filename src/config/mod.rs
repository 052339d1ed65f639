//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    num::{NonZeroU32, NonZeroUsize},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::application::{jobs::BackendPreference, render::EvictionPolicy};

mod cli;

pub use cli::{
    CacheArgs, CacheCommand, CliArgs, Command, EvictArgs, ExportArgs, ExportOverrides,
    LoggingOverrides, RenderArgs, RenderOverrides, WorkerArgs,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "mathexport";
pub const ENV_PREFIX: &str = "MATHEXPORT";
pub const ENV_SEPARATOR: &str = "__";
const DEFAULT_EXPORT_DIR: &str = "exports";
pub(crate) const DEFAULT_RENDER_CACHE_DIR: &str = "/tmp/mathexport-render-cache";
const DEFAULT_RENDER_CONCURRENCY: u32 = 4;
const DEFAULT_RENDER_BATCH_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_CACHE_MAX_ENTRIES: u64 = 5_000;
const DEFAULT_CACHE_MAX_TOTAL_BYTES: u64 = 256 * 1024 * 1024;
const DEFAULT_CACHE_MAX_AGE_DAYS: u64 = 30;

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub export: ExportSettings,
    pub render: RenderSettings,
    pub cache: CacheSettings,
    pub jobs: JobsSettings,
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
pub struct ExportSettings {
    /// Result store for finished artifacts.
    pub directory: PathBuf,
}

#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub cache_dir: PathBuf,
    pub concurrency: NonZeroUsize,
    pub batch_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub max_entries: usize,
    pub max_total_bytes: u64,
    pub max_age_days: u64,
    /// `None` disables the periodic sweep.
    pub sweep_interval: Option<Duration>,
}

impl CacheSettings {
    pub fn policy(&self) -> EvictionPolicy {
        EvictionPolicy::new(self.max_entries, self.max_total_bytes, self.max_age_days)
    }
}

#[derive(Debug, Clone)]
pub struct JobsSettings {
    pub backend: BackendPreference,
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

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator(ENV_SEPARATOR));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match &cli.command {
        Command::Export(args) => raw.apply_export_overrides(&args.overrides),
        Command::Render(args) => {
            raw.apply_logging_overrides(&args.logging);
            raw.apply_render_overrides(&args.render);
        }
        Command::Cache(args) => match &args.command {
            CacheCommand::Evict(evict) => raw.apply_evict_overrides(evict),
        },
        // Spawned workers inherit their parent's resolved settings through the environment.
        Command::Worker(_) => {}
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

/// Environment overrides that reproduce `settings` in a spawned worker process.
pub fn worker_environment(settings: &Settings) -> Vec<(String, String)> {
    let key = |section: &str, name: &str| {
        format!("{ENV_PREFIX}{ENV_SEPARATOR}{section}{ENV_SEPARATOR}{name}").to_uppercase()
    };
    let format = match settings.logging.format {
        LogFormat::Json => "true",
        LogFormat::Compact => "false",
    };

    vec![
        (
            key("logging", "level"),
            settings.logging.level.to_string().to_lowercase(),
        ),
        (key("logging", "json"), format.to_string()),
        (
            key("render", "cache_dir"),
            settings.render.cache_dir.display().to_string(),
        ),
        (
            key("render", "concurrency"),
            settings.render.concurrency.to_string(),
        ),
        (
            key("render", "batch_timeout_ms"),
            settings.render.batch_timeout.as_millis().to_string(),
        ),
    ]
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    export: RawExportSettings,
    render: RawRenderSettings,
    cache: RawCacheSettings,
    jobs: RawJobsSettings,
}

impl RawSettings {
    fn apply_export_overrides(&mut self, overrides: &ExportOverrides) {
        self.apply_logging_overrides(&overrides.logging);
        self.apply_render_overrides(&overrides.render);
        if let Some(directory) = overrides.export_directory.as_ref() {
            self.export.directory = Some(directory.clone());
        }
        if let Some(backend) = overrides.jobs_backend.as_ref() {
            self.jobs.backend = Some(backend.clone());
        }
        if let Some(seconds) = overrides.cache_sweep_interval_seconds {
            self.cache.sweep_interval_seconds = Some(seconds);
        }
    }

    fn apply_evict_overrides(&mut self, overrides: &EvictArgs) {
        self.apply_logging_overrides(&overrides.logging);
        self.apply_render_overrides(&overrides.render);
        if let Some(max) = overrides.max_entries {
            self.cache.max_entries = Some(max);
        }
        if let Some(max) = overrides.max_bytes {
            self.cache.max_total_bytes = Some(max);
        }
        if let Some(days) = overrides.max_age_days {
            self.cache.max_age_days = Some(days);
        }
    }

    fn apply_logging_overrides(&mut self, overrides: &LoggingOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }

    fn apply_render_overrides(&mut self, overrides: &RenderOverrides) {
        if let Some(dir) = overrides.cache_dir.as_ref() {
            self.render.cache_dir = Some(dir.clone());
        }
        if let Some(value) = overrides.concurrency {
            self.render.concurrency = Some(value);
        }
        if let Some(value) = overrides.batch_timeout_ms {
            self.render.batch_timeout_ms = Some(value);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            export,
            render,
            cache,
            jobs,
        } = raw;

        let logging = build_logging_settings(logging)?;
        let export = build_export_settings(export)?;
        let render = build_render_settings(render)?;
        let cache = build_cache_settings(cache)?;
        let jobs = build_jobs_settings(jobs)?;

        Ok(Self {
            logging,
            export,
            render,
            cache,
            jobs,
        })
    }
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

fn build_export_settings(export: RawExportSettings) -> Result<ExportSettings, LoadError> {
    let directory = export
        .directory
        .unwrap_or_else(|| PathBuf::from(DEFAULT_EXPORT_DIR));
    if directory.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "export.directory",
            "path must not be empty",
        ));
    }
    Ok(ExportSettings { directory })
}

fn build_render_settings(render: RawRenderSettings) -> Result<RenderSettings, LoadError> {
    let cache_dir = render
        .cache_dir
        .unwrap_or_else(|| PathBuf::from(DEFAULT_RENDER_CACHE_DIR));
    if cache_dir.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "render.cache_dir",
            "path must not be empty",
        ));
    }

    let concurrency = non_zero_u32(
        render
            .concurrency
            .unwrap_or(DEFAULT_RENDER_CONCURRENCY)
            .into(),
        "render.concurrency",
    )?;
    let concurrency = NonZeroUsize::try_from(concurrency).map_err(|_| {
        LoadError::invalid(
            "render.concurrency",
            "value exceeds supported range for usize",
        )
    })?;

    let timeout_ms = render
        .batch_timeout_ms
        .unwrap_or(DEFAULT_RENDER_BATCH_TIMEOUT_MS);
    if timeout_ms == 0 {
        return Err(LoadError::invalid(
            "render.batch_timeout_ms",
            "must be greater than zero",
        ));
    }

    Ok(RenderSettings {
        cache_dir,
        concurrency,
        batch_timeout: Duration::from_millis(timeout_ms),
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let max_entries = cache.max_entries.unwrap_or(DEFAULT_CACHE_MAX_ENTRIES);
    let max_entries = usize::try_from(max_entries).map_err(|_| {
        LoadError::invalid(
            "cache.max_entries",
            "value exceeds supported range for usize",
        )
    })?;
    let max_total_bytes = cache
        .max_total_bytes
        .unwrap_or(DEFAULT_CACHE_MAX_TOTAL_BYTES);
    let max_age_days = cache.max_age_days.unwrap_or(DEFAULT_CACHE_MAX_AGE_DAYS);
    if max_age_days == 0 {
        return Err(LoadError::invalid(
            "cache.max_age_days",
            "must be greater than zero",
        ));
    }
    let sweep_interval = match cache.sweep_interval_seconds.unwrap_or(0) {
        0 => None,
        seconds => Some(Duration::from_secs(seconds)),
    };

    Ok(CacheSettings {
        max_entries,
        max_total_bytes,
        max_age_days,
        sweep_interval,
    })
}

fn build_jobs_settings(jobs: RawJobsSettings) -> Result<JobsSettings, LoadError> {
    let backend = match jobs.backend {
        Some(value) => BackendPreference::from_str(&value)
            .map_err(|reason| LoadError::invalid("jobs.backend", reason))?,
        None => BackendPreference::default(),
    };
    Ok(JobsSettings { backend })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawExportSettings {
    directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRenderSettings {
    cache_dir: Option<PathBuf>,
    concurrency: Option<u32>,
    batch_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    max_entries: Option<u64>,
    max_total_bytes: Option<u64>,
    max_age_days: Option<u64>,
    sweep_interval_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawJobsSettings {
    backend: Option<String>,
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

#[cfg(test)]
mod tests;
