//! Formula rendering: a cached single-fragment renderer and a deadline-bounded
//! parallel batch on top of it.
//!
//! Rendering is deterministic for identical input, which is what lets the
//! on-disk cache be shared without locking: concurrent writers of the same
//! fingerprint always write the same bytes.

mod batch;
mod cache;
mod formula;
mod math;
mod types;

pub use batch::{BatchOutcome, ParallelRenderBatch};
pub use cache::{CACHE_EXTENSION, EvictionPolicy, EvictionReport, RenderCache, RenderCacheError};
pub use formula::{FormulaRenderer, error_placeholder};
pub use math::KatexEngine;
pub use types::{
    Fingerprint, MathEngine, RenderError, RenderOrigin, RenderRequest, RenderedFormula,
};
