use std::{
    collections::HashSet,
    fs,
    num::NonZeroUsize,
    sync::Arc,
    thread,
    time::Duration,
};

use mathexport::{
    application::{
        jobs::{ExportRegistry, JobManager, ThreadBackend},
        render::{
            EvictionPolicy, FormulaRenderer, MathEngine, ParallelRenderBatch, RenderCache,
            RenderError, RenderRequest,
        },
    },
    domain::jobs::JobStatus,
};
use metrics_util::debugging::DebuggingRecorder;
use serial_test::serial;
use tempfile::TempDir;

/// Fails on `bad`, stalls on `slow`, and echoes everything else.
struct ScriptedEngine;

impl MathEngine for ScriptedEngine {
    fn render(&self, fragment: &str, _display_mode: bool) -> Result<String, RenderError> {
        if fragment.contains("bad") {
            return Err(RenderError::Engine {
                message: "undefined control sequence".to_string(),
            });
        }
        if fragment.contains("slow") {
            thread::sleep(Duration::from_millis(500));
        }
        Ok(format!("<span class=\"stub\">{fragment}</span>"))
    }
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn render_and_job_paths_emit_metrics() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");

    let dir = TempDir::new().expect("temp dir");
    let cache = RenderCache::new(dir.path().join("cache")).expect("cache");
    let renderer = Arc::new(FormulaRenderer::new(Arc::new(ScriptedEngine), cache.clone()));

    // Miss then hit on the same fingerprint, then an engine failure.
    {
        let renderer = renderer.clone();
        tokio::task::spawn_blocking(move || {
            renderer.render(&RenderRequest::inline("a+b"));
            renderer.render(&RenderRequest::inline("a+b"));
            renderer.render(&RenderRequest::inline("\\bad"));
        })
        .await
        .expect("render task");
    }

    let batch = ParallelRenderBatch::new(renderer, NonZeroUsize::new(2).expect("non-zero"));
    let outcome = batch
        .render_all(
            vec![RenderRequest::inline("c"), RenderRequest::display("slow-bad")],
            Duration::from_millis(50),
        )
        .await;
    assert_eq!(outcome.timed_out, 1);

    assert!(fs::read_dir(cache.dir()).expect("cache dir").count() >= 2);
    tokio::time::sleep(Duration::from_millis(20)).await;
    let report = cache.evict(&EvictionPolicy::new(0, u64::MAX, 30));
    assert!(report.removed() >= 2);

    let mut registry = ExportRegistry::new();
    registry
        .register_fn("ok", "txt", |_ctx, _args| Ok(Some(b"done".to_vec())))
        .register_fn("empty", "txt", |_ctx, _args| Ok(None));
    let manager = JobManager::with_backend(
        dir.path().join("exports"),
        registry.clone(),
        Arc::new(ThreadBackend::new(registry)),
    )
    .expect("manager");

    let ok = manager.submit("ok", serde_json::Value::Null);
    let empty = manager.submit("empty", serde_json::Value::Null);
    for id in [ok, empty] {
        tokio::time::timeout(
            Duration::from_secs(10),
            manager.wait(id, Duration::from_millis(10)),
        )
        .await
        .expect("job settles")
        .expect("job known");
    }
    assert_eq!(manager.status(ok).map(|s| s.status), Some(JobStatus::Finished));
    assert_eq!(manager.status(empty).map(|s| s.status), Some(JobStatus::Failed));

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "mathexport_render_cache_hit_total",
        "mathexport_render_cache_miss_total",
        "mathexport_render_fragment_error_total",
        "mathexport_render_batch_ms",
        "mathexport_render_batch_timeout_total",
        "mathexport_render_cache_evict_total",
        "mathexport_jobs_submitted_total",
        "mathexport_jobs_finished_total",
        "mathexport_jobs_failed_total",
    ];
    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
