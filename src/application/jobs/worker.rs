use std::{
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};

use serde_json::Value;
use tracing::info;

use super::{
    backend::BackendError,
    registry::{ExportContext, ExportError, ExportFn, ExportRegistry},
};

/// What a worker left in the result store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    Written { path: PathBuf, bytes: u64 },
    Empty,
}

/// Runs one export to completion and publishes its artifact.
///
/// The same worker runs inside a spawned worker process and on an in-process
/// thread; the result always travels through the filesystem, never through
/// the return value.
pub struct ExportWorker {
    name: String,
    export: Arc<dyn ExportFn>,
}

impl ExportWorker {
    pub fn resolve(registry: &ExportRegistry, name: &str) -> Result<Self, BackendError> {
        let export = registry
            .get(name)
            .ok_or_else(|| BackendError::UnknownExport(name.to_string()))?;
        Ok(Self {
            name: name.to_string(),
            export,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn file_extension(&self) -> &str {
        self.export.file_extension()
    }

    pub fn run(
        &self,
        ctx: &ExportContext,
        args: &Value,
        output: &Path,
    ) -> Result<WorkerOutcome, ExportError> {
        let started_at = Instant::now();
        let Some(artifact) = self.export.export(ctx, args)? else {
            info!(
                target = "application::jobs::worker",
                op = "worker::run",
                export = %self.name,
                result = "empty",
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                "Export produced no artifact"
            );
            return Ok(WorkerOutcome::Empty);
        };

        publish_artifact(output, &artifact)?;
        info!(
            target = "application::jobs::worker",
            op = "worker::run",
            export = %self.name,
            result = "written",
            artifact_path = %output.display(),
            artifact_bytes = artifact.len(),
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "Export artifact published"
        );

        Ok(WorkerOutcome::Written {
            path: output.to_path_buf(),
            bytes: artifact.len() as u64,
        })
    }
}

/// Write `bytes` next to `output` and rename into place once flushed and synced,
/// so the artifact is never observable half-written.
pub(crate) fn publish_artifact(output: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = match output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut staged = tempfile::Builder::new()
        .prefix(".artifact-")
        .suffix(".partial")
        .tempfile_in(parent)?;
    staged.write_all(bytes)?;
    staged.flush()?;
    staged.as_file().sync_all()?;
    staged.persist(output).map(|_| ()).map_err(|err| err.error)
}
