use std::{
    fs,
    num::NonZeroUsize,
    sync::Arc,
    time::{Duration, Instant},
};

use mathexport::{
    application::{
        export::{QUESTION_SHEET_EXPORT, build_export_registry},
        jobs::{JobManager, ProcessBackend, WorkerEntryPoint},
    },
    config::RenderSettings,
    domain::jobs::{JobId, JobSnapshot, JobStatus},
};
use serde_json::{Value, json};
use tempfile::TempDir;

const BATCH_TIMEOUT_MS: u64 = 1;

fn render_settings(dir: &TempDir, batch_timeout: Duration) -> RenderSettings {
    RenderSettings {
        cache_dir: dir.path().join("render-cache"),
        concurrency: NonZeroUsize::new(2).expect("non-zero"),
        batch_timeout,
    }
}

/// Jobs run by the real `mathexport worker` binary with settings passed through the environment.
fn manager(dir: &TempDir, batch_timeout: Duration) -> JobManager {
    let settings = render_settings(dir, batch_timeout);
    let entry = WorkerEntryPoint::new(env!("CARGO_BIN_EXE_mathexport"))
        .with_env(
            "MATHEXPORT__RENDER__CACHE_DIR",
            settings.cache_dir.display().to_string(),
        )
        .with_env("MATHEXPORT__RENDER__CONCURRENCY", "2")
        .with_env(
            "MATHEXPORT__RENDER__BATCH_TIMEOUT_MS",
            batch_timeout.as_millis().to_string(),
        )
        .with_env("MATHEXPORT__LOGGING__LEVEL", "warn");
    let registry = build_export_registry(&settings).expect("registry");
    JobManager::with_backend(
        dir.path().join("exports"),
        registry,
        Arc::new(ProcessBackend::new(entry)),
    )
    .expect("manager")
}

async fn settle(manager: &JobManager, id: JobId, limit: Duration) -> JobSnapshot {
    tokio::time::timeout(limit, manager.wait(id, Duration::from_millis(20)))
        .await
        .expect("job did not settle")
        .expect("job known")
}

fn sheet(prompt: String) -> Value {
    json!({
        "title": "Worker run",
        "questions": [{ "prompt": prompt }]
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn worker_binary_publishes_rendered_sheet() {
    let dir = TempDir::new().expect("temp dir");
    let manager = manager(&dir, Duration::from_secs(30));

    let id = manager.submit(
        QUESTION_SHEET_EXPORT,
        sheet("Solve $x^2 = 4$.".to_string()),
    );
    let done = settle(&manager, id, Duration::from_secs(60)).await;

    assert_eq!(done.status, JobStatus::Finished, "{}", done.message);
    let path = done.result.expect("artifact path");
    assert!(path.starts_with(manager.result_dir()));
    let html = fs::read_to_string(path).expect("artifact");
    assert!(html.contains("katex"));
    assert!(!html.contains("math-error"));
    let cached = fs::read_dir(dir.path().join("render-cache"))
        .expect("cache dir")
        .filter_map(Result::ok)
        .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "html"))
        .count();
    assert_eq!(cached, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn worker_exits_while_abandoned_render_is_still_running() {
    let dir = TempDir::new().expect("temp dir");
    let manager = manager(&dir, Duration::from_millis(BATCH_TIMEOUT_MS));
    // Thousands of radicals keep the engine busy far past the batch deadline.
    let heavy = format!("Quick $a$ and heavy ${}1$.", "\\sqrt{x}+".repeat(8_000));

    let started = Instant::now();
    let id = manager.submit(QUESTION_SHEET_EXPORT, sheet(heavy));
    let done = settle(&manager, id, Duration::from_secs(30)).await;

    assert_eq!(done.status, JobStatus::Finished, "{}", done.message);
    assert!(
        started.elapsed() < Duration::from_secs(20),
        "worker outlived its batch deadline: {:?}",
        started.elapsed()
    );
    let html = fs::read_to_string(done.result.expect("artifact")).expect("artifact");
    assert!(html.contains("render timed out"));
    assert!(html.contains("could not be typeset"));
}
