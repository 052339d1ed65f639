use std::{collections::BTreeMap, fmt, future::Future, io, sync::Arc};

use serde_json::Value;
use thiserror::Error;
use tokio::runtime::Handle;

use crate::application::render::RenderCacheError;

/// Errors an export function may report. Any of them fails the job.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("invalid export arguments: {0}")]
    InvalidArguments(String),
    #[error("formula renderer unavailable: {0}")]
    Render(#[from] RenderCacheError),
    #[error("document template failed: {0}")]
    Template(String),
    #[error("export failed: {0}")]
    Failed(String),
    #[error("artifact i/o failed: {0}")]
    Io(#[from] io::Error),
}

impl ExportError {
    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        Self::InvalidArguments(message.into())
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Ambient capabilities handed to an export while it runs on a worker.
///
/// Exports execute on a plain OS thread (the in-process backend) or on the
/// blocking pool of a worker process, so async helpers are driven through
/// [`ExportContext::block_on`] rather than awaited.
#[derive(Debug, Clone)]
pub struct ExportContext {
    runtime: Handle,
}

impl ExportContext {
    pub fn new(runtime: Handle) -> Self {
        Self { runtime }
    }

    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }
}

/// A named document producer. Returns the artifact bytes, or `None` when it
/// produced nothing (which the job manager reports as `no_result_file`).
pub trait ExportFn: Send + Sync {
    /// Extension of the artifact file in the result store.
    fn file_extension(&self) -> &str {
        "bin"
    }

    fn export(&self, ctx: &ExportContext, args: &Value) -> Result<Option<Vec<u8>>, ExportError>;
}

struct FnExport<F> {
    extension: String,
    run: F,
}

impl<F> ExportFn for FnExport<F>
where
    F: Fn(&ExportContext, &Value) -> Result<Option<Vec<u8>>, ExportError> + Send + Sync,
{
    fn file_extension(&self) -> &str {
        &self.extension
    }

    fn export(&self, ctx: &ExportContext, args: &Value) -> Result<Option<Vec<u8>>, ExportError> {
        (self.run)(ctx, args)
    }
}

/// Exports addressable by name.
///
/// A worker process cannot receive a closure from its parent, so both sides
/// build the same registry and refer to exports by name.
#[derive(Default, Clone)]
pub struct ExportRegistry {
    exports: BTreeMap<String, Arc<dyn ExportFn>>,
}

impl ExportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, export: Arc<dyn ExportFn>) -> &mut Self {
        self.exports.insert(name.into(), export);
        self
    }

    pub fn register_fn<F>(
        &mut self,
        name: impl Into<String>,
        extension: impl Into<String>,
        run: F,
    ) -> &mut Self
    where
        F: Fn(&ExportContext, &Value) -> Result<Option<Vec<u8>>, ExportError>
            + Send
            + Sync
            + 'static,
    {
        let export = FnExport {
            extension: extension.into(),
            run,
        };
        self.register(name, Arc::new(export))
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ExportFn>> {
        self.exports.get(name).cloned()
    }
}

impl fmt::Debug for ExportRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportRegistry")
            .field("exports", &self.exports.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_closures_are_found_by_name() {
        let mut registry = ExportRegistry::new();
        registry
            .register_fn("csv", "csv", |_, _| Ok(Some(b"a,b".to_vec())))
            .register_fn("nothing", "txt", |_, _| Ok(None));

        let csv = registry.get("csv").expect("csv export");
        assert_eq!(csv.file_extension(), "csv");
        assert_eq!(registry.get("nothing").expect("nothing export").file_extension(), "txt");
        assert!(registry.get("missing").is_none());
    }
}
