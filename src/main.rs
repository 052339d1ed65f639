use std::{path::Path, process, time::Duration};

use mathexport::{
    application::{
        error::AppError,
        export::{QUESTION_SHEET_EXPORT, build_export_registry, build_formula_renderer},
        jobs::{
            ExportContext, ExportWorker, JobManager, WorkerEntryPoint, WorkerOutcome,
            register_worker_entry_point,
        },
        render::{RenderCache, RenderRequest},
    },
    config::{self, CacheCommand, Command, ExportArgs, RenderArgs, WorkerArgs},
    domain::jobs::{JobId, JobSnapshot, JobStatus},
    infra::telemetry,
    util::bytes::format_bytes,
};
use serde_json::Value;
use tokio::{runtime::Handle, task::JoinHandle};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(()) => 0,
        Err(error) => {
            report_application_error(&error);
            1
        }
    };
    // Exit without dropping the runtime: renders abandoned at a batch
    // deadline still hold blocking threads the drop would wait on.
    process::exit(code);
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match cli_args.command {
        Command::Export(args) => run_export(settings, *args).await,
        Command::Render(args) => run_render(settings, args).await,
        Command::Cache(args) => match args.command {
            CacheCommand::Evict(_) => run_cache_evict(settings).await,
        },
        Command::Worker(args) => run_worker(settings, args).await,
    }
}

async fn run_export(settings: config::Settings, args: ExportArgs) -> Result<(), AppError> {
    let export_args = read_questions(&args.questions).await?;

    register_current_exe(&settings);
    let registry = build_export_registry(&settings.render)?;
    let manager = JobManager::new(&settings.export.directory, registry, settings.jobs.backend)?;
    let sweeper = spawn_cache_sweeper(&settings);

    let id = manager.submit(QUESTION_SHEET_EXPORT, export_args);
    println!("submitted {id} ({} backend)", manager.backend_kind());

    let result = if args.wait {
        follow_job(&manager, id, Duration::from_millis(args.poll_ms.max(1))).await
    } else {
        Ok(())
    };

    if let Some(handle) = sweeper {
        handle.abort();
        let _ = handle.await;
    }
    result
}

async fn read_questions(path: &Path) -> Result<Value, AppError> {
    let contents = tokio::fs::read_to_string(path).await.map_err(|err| {
        AppError::validation(format!("failed to read `{}`: {err}", path.display()))
    })?;
    serde_json::from_str(&contents).map_err(|err| {
        AppError::validation(format!("`{}` is not valid JSON: {err}", path.display()))
    })
}

/// Let the process backend re-invoke this binary, carrying the resolved settings along.
fn register_current_exe(settings: &config::Settings) {
    match WorkerEntryPoint::current_exe() {
        Ok(entry) => {
            let entry = config::worker_environment(settings)
                .into_iter()
                .fold(entry, |entry, (key, value)| entry.with_env(key, value));
            register_worker_entry_point(entry);
        }
        Err(err) => warn!(
            target = "mathexport::main",
            error = %err,
            "Worker entry point unavailable; exports will run on threads"
        ),
    }
}

async fn follow_job(
    manager: &JobManager,
    id: JobId,
    poll: Duration,
) -> Result<(), AppError> {
    let mut last_line = String::new();
    loop {
        let snapshot = manager
            .status(id)
            .ok_or_else(|| AppError::unexpected(format!("job {id} disappeared")))?;
        let line = status_line(&snapshot);
        if line != last_line {
            println!("{line}");
            last_line = line;
        }

        match snapshot.status {
            JobStatus::Finished => {
                if let Some(path) = snapshot.result.as_ref() {
                    println!("{}", path.display());
                }
                return Ok(());
            }
            JobStatus::Failed => {
                return Err(AppError::unexpected(format!(
                    "export job {id} failed: {}",
                    snapshot.message
                )));
            }
            JobStatus::Queued | JobStatus::Running => tokio::time::sleep(poll).await,
        }
    }
}

fn status_line(snapshot: &JobSnapshot) -> String {
    format!(
        "{} {:>3}% {}",
        snapshot.status, snapshot.progress, snapshot.message
    )
}

fn spawn_cache_sweeper(settings: &config::Settings) -> Option<JoinHandle<()>> {
    let interval = settings.cache.sweep_interval?;
    let cache = match RenderCache::new(&settings.render.cache_dir) {
        Ok(cache) => cache,
        Err(err) => {
            warn!(
                target = "mathexport::main",
                error = %err,
                "Periodic cache sweep disabled"
            );
            return None;
        }
    };
    let policy = settings.cache.policy();

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // Skip the first immediate tick
        loop {
            ticker.tick().await;
            let cache = cache.clone();
            if let Err(err) = tokio::task::spawn_blocking(move || cache.evict(&policy)).await {
                warn!(
                    target = "mathexport::main",
                    error = %err,
                    "Periodic cache sweep aborted"
                );
            }
        }
    }))
}

async fn run_render(settings: config::Settings, args: RenderArgs) -> Result<(), AppError> {
    let renderer = build_formula_renderer(&settings.render)?;
    let request = if args.display {
        RenderRequest::display(args.formula)
    } else {
        RenderRequest::inline(args.formula)
    };

    let rendered = tokio::task::spawn_blocking(move || renderer.render(&request))
        .await
        .map_err(|err| AppError::unexpected(format!("render task failed: {err}")))?;

    info!(
        target = "mathexport::main",
        origin = ?rendered.origin,
        "Formula rendered"
    );
    println!("{}", rendered.html);
    Ok(())
}

async fn run_cache_evict(settings: config::Settings) -> Result<(), AppError> {
    let cache = RenderCache::new(&settings.render.cache_dir)?;
    let policy = settings.cache.policy();

    let report = tokio::task::spawn_blocking(move || cache.evict(&policy))
        .await
        .map_err(|err| AppError::unexpected(format!("eviction task failed: {err}")))?;

    println!("scanned            {}", report.scanned);
    println!("removed (expired)  {}", report.removed_expired);
    println!("removed (bounds)   {}", report.removed_over_bounds);
    println!("already gone       {}", report.already_gone + report.vanished_during_scan);
    println!("failed             {}", report.failed);
    println!("staging cleared    {}", report.removed_staging);
    println!(
        "remaining          {} entries, {}",
        report.remaining_entries,
        format_bytes(report.remaining_bytes)
    );
    Ok(())
}

/// Body of the hidden `worker` subcommand. Failures go to stderr, where the
/// parent's process backend picks them up as the job diagnostic.
async fn run_worker(settings: config::Settings, args: WorkerArgs) -> Result<(), AppError> {
    let result = execute_worker(settings, args).await;
    if let Err(err) = &result {
        eprintln!("{err}");
    }
    result
}

async fn execute_worker(settings: config::Settings, args: WorkerArgs) -> Result<(), AppError> {
    let export_args: Value = serde_json::from_str(&args.args)
        .map_err(|err| AppError::validation(format!("--args is not valid JSON: {err}")))?;
    let registry = build_export_registry(&settings.render)?;
    let worker = ExportWorker::resolve(&registry, &args.export)?;
    let ctx = ExportContext::new(Handle::current());
    let output = args.output;
    info!(
        target = "mathexport::main",
        export = worker.name(),
        output = %output.display(),
        "Worker starting"
    );

    let outcome = tokio::task::spawn_blocking(move || worker.run(&ctx, &export_args, &output))
        .await
        .map_err(|err| AppError::unexpected(format!("export task failed: {err}")))??;

    if let WorkerOutcome::Written { path, bytes } = outcome {
        info!(
            target = "mathexport::main",
            artifact_path = %path.display(),
            artifact_bytes = bytes,
            "Worker finished"
        );
    }
    Ok(())
}
