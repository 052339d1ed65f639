//! Built-in export functions and the registry both the parent process and
//! spawned workers build from the same settings.

mod question_sheet;

use std::sync::Arc;

pub use question_sheet::{QUESTION_SHEET_EXPORT, QuestionSheetExport};

use crate::{
    application::{
        jobs::ExportRegistry,
        render::{FormulaRenderer, KatexEngine, ParallelRenderBatch, RenderCache, RenderCacheError},
    },
    config::RenderSettings,
};

/// The KaTeX-backed renderer over the configured cache directory.
pub fn build_formula_renderer(settings: &RenderSettings) -> Result<FormulaRenderer, RenderCacheError> {
    let cache = RenderCache::new(&settings.cache_dir)?;
    Ok(FormulaRenderer::new(Arc::new(KatexEngine), cache))
}

pub fn build_export_registry(settings: &RenderSettings) -> Result<ExportRegistry, RenderCacheError> {
    let renderer = Arc::new(build_formula_renderer(settings)?);
    let batch = ParallelRenderBatch::new(renderer, settings.concurrency);

    let mut registry = ExportRegistry::new();
    registry.register(
        QUESTION_SHEET_EXPORT,
        Arc::new(QuestionSheetExport::new(batch, settings.batch_timeout)),
    );
    Ok(registry)
}
