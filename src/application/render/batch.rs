use std::{
    collections::BTreeMap,
    num::NonZeroUsize,
    sync::Arc,
    time::{Duration, Instant},
};

use futures::{StreamExt, stream};
use metrics::{counter, histogram};
use tracing::{info, warn};

use super::{
    formula::{FormulaRenderer, error_placeholder},
    types::{RenderOrigin, RenderRequest, RenderedFormula},
};

/// Best-effort result of one batch: every input index maps to renderable output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub outputs: BTreeMap<usize, String>,
    /// Fragments with real output (engine or cache).
    pub rendered: usize,
    /// Fragments the engine rejected.
    pub failed: usize,
    /// Fragments still unresolved when the batch deadline passed.
    pub timed_out: usize,
}

/// Renders many fragments on a bounded pool of blocking workers under one shared deadline.
#[derive(Clone)]
pub struct ParallelRenderBatch {
    renderer: Arc<FormulaRenderer>,
    concurrency: NonZeroUsize,
}

impl ParallelRenderBatch {
    pub fn new(renderer: Arc<FormulaRenderer>, concurrency: NonZeroUsize) -> Self {
        Self {
            renderer,
            concurrency,
        }
    }

    /// Render `fragments`, returning within roughly `total_timeout`.
    ///
    /// Fragments that finish before the deadline keep their output; the rest
    /// get the error marker. Renders still in flight at the deadline are
    /// detached, not cancelled, and may still populate the cache afterwards.
    pub async fn render_all(
        &self,
        fragments: Vec<RenderRequest>,
        total_timeout: Duration,
    ) -> BatchOutcome {
        let started_at = Instant::now();
        let total = fragments.len();
        let mut outcome = BatchOutcome::default();
        if total == 0 {
            return outcome;
        }

        let sources = fragments.clone();
        let mut pending = stream::iter(fragments.into_iter().enumerate())
            .map(|(index, request)| {
                let renderer = Arc::clone(&self.renderer);
                async move {
                    let joined = tokio::task::spawn_blocking(move || renderer.render(&request)).await;
                    (index, joined)
                }
            })
            .buffer_unordered(self.concurrency.get());

        let deadline = tokio::time::sleep(total_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;
                next = pending.next() => {
                    let Some((index, joined)) = next else {
                        break;
                    };
                    let formula = match joined {
                        Ok(formula) => formula,
                        Err(err) => {
                            warn!(
                                target = "application::render::batch",
                                op = "batch::render_all",
                                index,
                                error = %err,
                                "Render worker aborted; substituting error marker"
                            );
                            RenderedFormula {
                                html: error_placeholder(&sources[index], "render worker aborted"),
                                origin: RenderOrigin::Placeholder,
                            }
                        }
                    };
                    if formula.is_placeholder() {
                        outcome.failed += 1;
                    } else {
                        outcome.rendered += 1;
                    }
                    outcome.outputs.insert(index, formula.html);
                }
                _ = &mut deadline => {
                    break;
                }
            }
        }
        drop(pending);

        for (index, request) in sources.iter().enumerate() {
            outcome
                .outputs
                .entry(index)
                .or_insert_with(|| error_placeholder(request, "render timed out"));
        }
        outcome.timed_out = total - outcome.rendered - outcome.failed;

        let elapsed_ms = started_at.elapsed().as_millis() as u64;
        histogram!("mathexport_render_batch_ms").record(elapsed_ms as f64);
        if outcome.timed_out > 0 {
            counter!("mathexport_render_batch_timeout_total").increment(1);
            warn!(
                target = "application::render::batch",
                op = "batch::render_all",
                result = "deadline_expired",
                total,
                rendered = outcome.rendered,
                failed = outcome.failed,
                unresolved = outcome.timed_out,
                timeout_ms = total_timeout.as_millis() as u64,
                elapsed_ms,
                "Render batch deadline expired"
            );
        } else {
            info!(
                target = "application::render::batch",
                op = "batch::render_all",
                result = "complete",
                total,
                rendered = outcome.rendered,
                failed = outcome.failed,
                elapsed_ms,
                "Render batch completed"
            );
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        thread,
    };

    use tempfile::TempDir;

    use super::*;
    use crate::application::render::{
        cache::RenderCache,
        types::{MathEngine, RenderError},
    };

    /// Sleeps for `hang` on fragments containing "hang"; rejects ones containing "bad".
    struct StubEngine {
        hang: Duration,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl StubEngine {
        fn new(hang: Duration) -> Self {
            Self {
                hang,
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    impl MathEngine for StubEngine {
        fn render(&self, fragment: &str, _display_mode: bool) -> Result<String, RenderError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if fragment.contains("hang") {
                thread::sleep(self.hang);
            } else {
                thread::sleep(Duration::from_millis(10));
            }
            self.active.fetch_sub(1, Ordering::SeqCst);
            if fragment.contains("bad") {
                return Err(RenderError::Engine {
                    message: "rejected".to_string(),
                });
            }
            Ok(format!("<span>{fragment}</span>"))
        }
    }

    fn batch(dir: &TempDir, engine: Arc<StubEngine>, concurrency: usize) -> ParallelRenderBatch {
        let cache = RenderCache::new(dir.path().join("cache")).expect("cache");
        let renderer = Arc::new(FormulaRenderer::new(engine, cache));
        ParallelRenderBatch::new(renderer, NonZeroUsize::new(concurrency).expect("non-zero"))
    }

    #[tokio::test]
    async fn one_hung_fragment_only_costs_its_own_output() {
        let dir = TempDir::new().expect("temp dir");
        let engine = Arc::new(StubEngine::new(Duration::from_millis(1500)));
        let batch = batch(&dir, engine, 4);
        let fragments = vec![
            RenderRequest::inline("a"),
            RenderRequest::inline("b"),
            RenderRequest::inline("hang-bad"),
            RenderRequest::display("c"),
            RenderRequest::inline("d"),
        ];

        let started = Instant::now();
        let outcome = batch.render_all(fragments, Duration::from_millis(200)).await;
        let elapsed = started.elapsed();

        assert!(elapsed < Duration::from_millis(800), "took {elapsed:?}");
        assert_eq!(outcome.outputs.len(), 5);
        assert_eq!(outcome.rendered, 4);
        assert_eq!(outcome.timed_out, 1);
        assert!(outcome.outputs[&2].contains("math-error"));
        for index in [0, 1, 3, 4] {
            assert!(outcome.outputs[&index].starts_with("<span>"), "index {index}");
        }
    }

    #[tokio::test]
    async fn engine_failures_do_not_abort_the_batch() {
        let dir = TempDir::new().expect("temp dir");
        let engine = Arc::new(StubEngine::new(Duration::ZERO));
        let batch = batch(&dir, engine, 2);

        let outcome = batch
            .render_all(
                vec![
                    RenderRequest::inline("ok"),
                    RenderRequest::inline("bad"),
                    RenderRequest::inline("fine"),
                ],
                Duration::from_secs(5),
            )
            .await;

        assert_eq!(outcome.rendered, 2);
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.timed_out, 0);
        assert!(outcome.outputs[&1].contains("math-error"));
    }

    #[tokio::test]
    async fn parallelism_is_bounded() {
        let dir = TempDir::new().expect("temp dir");
        let engine = Arc::new(StubEngine::new(Duration::ZERO));
        let batch = batch(&dir, engine.clone(), 3);
        let fragments = (0..12)
            .map(|i| RenderRequest::inline(format!("x_{i}")))
            .collect();

        let outcome = batch.render_all(fragments, Duration::from_secs(5)).await;

        assert_eq!(outcome.rendered, 12);
        assert!(engine.peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn empty_batch_returns_immediately() {
        let dir = TempDir::new().expect("temp dir");
        let batch = batch(&dir, Arc::new(StubEngine::new(Duration::ZERO)), 1);
        let outcome = batch.render_all(Vec::new(), Duration::from_millis(1)).await;
        assert_eq!(outcome, BatchOutcome::default());
    }
}
