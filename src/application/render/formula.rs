use std::{sync::Arc, time::Instant};

use metrics::counter;
use tracing::{debug, warn};

use super::{
    cache::RenderCache,
    types::{MathEngine, RenderOrigin, RenderRequest, RenderedFormula},
};

/// Typesets single fragments through the on-disk cache.
///
/// `render` never fails: engine errors become an inline error marker so one
/// bad formula cannot blank a whole document.
pub struct FormulaRenderer {
    engine: Arc<dyn MathEngine>,
    cache: RenderCache,
}

impl FormulaRenderer {
    pub fn new(engine: Arc<dyn MathEngine>, cache: RenderCache) -> Self {
        Self { engine, cache }
    }

    pub fn cache(&self) -> &RenderCache {
        &self.cache
    }

    pub fn render(&self, request: &RenderRequest) -> RenderedFormula {
        let started_at = Instant::now();
        let key = request.fingerprint();

        if let Some(html) = self.cache.get(&key) {
            debug!(
                target = "application::render::formula",
                op = "formula::render",
                result = "cache_hit",
                fingerprint = %key,
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                "Formula served from cache"
            );
            return RenderedFormula {
                html,
                origin: RenderOrigin::Cache,
            };
        }

        let html = match self.engine.render(&request.fragment, request.display_mode) {
            Ok(html) => html,
            Err(err) => {
                counter!("mathexport_render_fragment_error_total").increment(1);
                warn!(
                    target = "application::render::formula",
                    op = "formula::render",
                    result = "engine_error",
                    fingerprint = %key,
                    display_mode = request.display_mode,
                    elapsed_ms = started_at.elapsed().as_millis() as u64,
                    error = %err,
                    "Typesetting failed; substituting error marker"
                );
                return RenderedFormula {
                    html: error_placeholder(request, &err.to_string()),
                    origin: RenderOrigin::Placeholder,
                };
            }
        };

        if let Err(err) = self.cache.put(&key, &html) {
            warn!(
                target = "application::render::formula",
                op = "formula::render",
                result = "cache_write_error",
                fingerprint = %key,
                cache_path = %self.cache.entry_path(&key).display(),
                error = %err,
                "Failed to cache rendered formula; continuing uncached"
            );
        }

        debug!(
            target = "application::render::formula",
            op = "formula::render",
            result = "cache_miss",
            fingerprint = %key,
            html_bytes = html.len(),
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "Formula rendered by engine"
        );

        RenderedFormula {
            html,
            origin: RenderOrigin::Engine,
        }
    }
}

/// Renderable marker standing in for a formula that could not be typeset.
pub fn error_placeholder(request: &RenderRequest, reason: &str) -> String {
    let style = if request.display_mode { "display" } else { "inline" };
    format!(
        "<code class=\"math-error\" data-math-style=\"{style}\" title=\"{}\">{}</code>",
        ammonia::clean_text(reason),
        ammonia::clean_text(&request.fragment),
    )
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tempfile::TempDir;

    use super::*;
    use crate::application::render::types::RenderError;

    #[derive(Default)]
    struct CountingEngine {
        calls: AtomicUsize,
    }

    impl MathEngine for CountingEngine {
        fn render(&self, fragment: &str, display_mode: bool) -> Result<String, RenderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if fragment.contains("bad") {
                return Err(RenderError::Engine {
                    message: "unexpected token".to_string(),
                });
            }
            Ok(format!("<span data-display=\"{display_mode}\">{fragment}</span>"))
        }
    }

    fn renderer(dir: &TempDir) -> (Arc<CountingEngine>, FormulaRenderer) {
        let engine = Arc::new(CountingEngine::default());
        let cache = RenderCache::new(dir.path().join("cache")).expect("cache");
        (engine.clone(), FormulaRenderer::new(engine, cache))
    }

    #[test]
    fn identical_requests_hit_the_engine_once() {
        let dir = TempDir::new().expect("temp dir");
        let (engine, renderer) = renderer(&dir);
        let request = RenderRequest::display("e^{i\\pi}");

        let first = renderer.render(&request);
        let second = renderer.render(&request);

        assert_eq!(first.origin, RenderOrigin::Engine);
        assert_eq!(second.origin, RenderOrigin::Cache);
        assert_eq!(first.html.as_bytes(), second.html.as_bytes());
        assert_eq!(engine.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn display_mode_is_part_of_the_cache_key() {
        let dir = TempDir::new().expect("temp dir");
        let (engine, renderer) = renderer(&dir);

        renderer.render(&RenderRequest::inline("x"));
        renderer.render(&RenderRequest::display("x"));

        assert_eq!(engine.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn engine_failure_yields_escaped_placeholder_and_is_not_cached() {
        let dir = TempDir::new().expect("temp dir");
        let (engine, renderer) = renderer(&dir);
        let request = RenderRequest::inline("bad <script>");

        let rendered = renderer.render(&request);
        assert!(rendered.is_placeholder());
        assert!(rendered.html.contains("math-error"));
        assert!(!rendered.html.contains("<script>"));

        renderer.render(&request);
        assert_eq!(engine.calls.load(Ordering::SeqCst), 2);
        assert_eq!(renderer.cache().get(&request.fingerprint()), None);
    }

    #[cfg(unix)]
    #[test]
    fn unwritable_cache_still_renders() {
        use std::{fs, os::unix::fs::PermissionsExt};

        let dir = TempDir::new().expect("temp dir");
        let (_engine, renderer) = renderer(&dir);
        let cache_dir = renderer.cache().dir().to_path_buf();
        fs::set_permissions(&cache_dir, fs::Permissions::from_mode(0o500)).expect("chmod");

        let rendered = renderer.render(&RenderRequest::inline("y"));

        fs::set_permissions(&cache_dir, fs::Permissions::from_mode(0o755)).expect("chmod");
        assert_eq!(rendered.origin, RenderOrigin::Engine);
        assert!(rendered.html.contains('y'));
    }
}
