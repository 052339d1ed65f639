use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
    time::Duration,
};

use metrics::counter;
use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use super::{
    backend::{
        BackendError, BackendKind, BackendPreference, ExecutionBackend, ExitInfo,
        WorkerInvocation, registered_worker_entry_point, select_backend,
    },
    registry::ExportRegistry,
};
use crate::{
    domain::jobs::{JobId, JobSnapshot, JobStatus, NO_RESULT_FILE},
    util::lock::{rw_read, rw_write},
};

const LOCK_TARGET: &str = "application::jobs::manager";
const PROGRESS_LAUNCHED: u8 = 10;
const PROGRESS_DONE: u8 = 100;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("job `{0}` not found")]
    NotFound(JobId),
    #[error("failed to prepare result store `{}`: {source}", path.display())]
    ResultStore {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("job manager must be created inside a Tokio runtime: {0}")]
    Runtime(String),
}

struct JobRecord {
    snapshot: JobSnapshot,
    /// Set by the monitor once it commits to starting the backend; cancellation is refused from then on.
    launched: bool,
    execution: Option<String>,
}

struct Inner {
    jobs: RwLock<HashMap<JobId, JobRecord>>,
    result_dir: PathBuf,
    registry: ExportRegistry,
    backend: Arc<dyn ExecutionBackend>,
    runtime: Handle,
}

/// Owns the in-memory job table and starts one monitor task per submission.
///
/// The table lives as long as the manager; only artifacts in the result
/// store outlive the process. Cloning is cheap and shares the same table.
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<Inner>,
}

impl JobManager {
    /// Build a manager whose backend is chosen from `preference` and the
    /// registered worker entry point.
    pub fn new(
        result_dir: impl Into<PathBuf>,
        registry: ExportRegistry,
        preference: BackendPreference,
    ) -> Result<Self, JobError> {
        let backend = select_backend(preference, registered_worker_entry_point(), &registry);
        Self::with_backend(result_dir, registry, backend)
    }

    pub fn with_backend(
        result_dir: impl Into<PathBuf>,
        registry: ExportRegistry,
        backend: Arc<dyn ExecutionBackend>,
    ) -> Result<Self, JobError> {
        let result_dir = result_dir.into();
        fs::create_dir_all(&result_dir).map_err(|source| JobError::ResultStore {
            path: result_dir.clone(),
            source,
        })?;
        // Worker processes resolve the output path themselves, so hand them an absolute one.
        let result_dir = fs::canonicalize(&result_dir).map_err(|source| JobError::ResultStore {
            path: result_dir.clone(),
            source,
        })?;
        let runtime = Handle::try_current().map_err(|err| JobError::Runtime(err.to_string()))?;

        Ok(Self {
            inner: Arc::new(Inner {
                jobs: RwLock::new(HashMap::new()),
                result_dir,
                registry,
                backend,
                runtime,
            }),
        })
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.inner.backend.kind()
    }

    pub fn result_dir(&self) -> &Path {
        &self.inner.result_dir
    }

    pub fn registry(&self) -> &ExportRegistry {
        &self.inner.registry
    }

    /// Register a job, move it to `running` and hand it to a monitor task.
    ///
    /// Returns without waiting for the export. Failures of the export itself
    /// only ever surface through [`JobManager::status`].
    pub fn submit(&self, export: &str, args: Value) -> JobId {
        let id = JobId::new();
        let snapshot = JobSnapshot {
            id,
            export: export.to_string(),
            status: JobStatus::Queued,
            progress: 0,
            message: "queued".to_string(),
            result: None,
            created_at: OffsetDateTime::now_utc(),
            finished_at: None,
        };

        {
            let mut jobs = rw_write(&self.inner.jobs, LOCK_TARGET, "jobs::submit");
            let record = jobs.entry(id).or_insert(JobRecord {
                snapshot,
                launched: false,
                execution: None,
            });
            record.snapshot.status = JobStatus::Running;
            record.snapshot.message = "dispatching".to_string();
        }

        counter!("mathexport_jobs_submitted_total").increment(1);
        info!(
            target = "application::jobs::manager",
            op = "jobs::submit",
            job_id = %id,
            export,
            backend = %self.backend_kind(),
            "Export job submitted"
        );

        self.inner
            .runtime
            .spawn(monitor(Arc::clone(&self.inner), id, export.to_string(), args));
        id
    }

    pub fn status(&self, id: JobId) -> Option<JobSnapshot> {
        let jobs = rw_read(&self.inner.jobs, LOCK_TARGET, "jobs::status");
        jobs.get(&id).map(|record| record.snapshot.clone())
    }

    /// Withdraw a job whose backend has not started yet.
    ///
    /// Returns `false` once execution has begun; running exports are never
    /// interrupted and finish normally.
    pub fn cancel(&self, id: JobId) -> bool {
        let mut jobs = rw_write(&self.inner.jobs, LOCK_TARGET, "jobs::cancel");
        let cancellable = jobs
            .get(&id)
            .is_some_and(|record| !record.launched && !record.snapshot.is_terminal());
        if cancellable {
            jobs.remove(&id);
            info!(
                target = "application::jobs::manager",
                op = "jobs::cancel",
                job_id = %id,
                result = "cancelled",
                "Export job cancelled before launch"
            );
        } else {
            debug!(
                target = "application::jobs::manager",
                op = "jobs::cancel",
                job_id = %id,
                result = "refused",
                "Export job not cancellable"
            );
        }
        cancellable
    }

    /// All known jobs, oldest first.
    pub fn list(&self) -> Vec<JobSnapshot> {
        let jobs = rw_read(&self.inner.jobs, LOCK_TARGET, "jobs::list");
        let mut snapshots: Vec<_> = jobs.values().map(|record| record.snapshot.clone()).collect();
        drop(jobs);
        snapshots.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.to_string().cmp(&b.id.to_string()))
        });
        snapshots
    }

    /// Poll until the job reaches a terminal state.
    pub async fn wait(&self, id: JobId, poll: Duration) -> Result<JobSnapshot, JobError> {
        loop {
            match self.status(id) {
                None => return Err(JobError::NotFound(id)),
                Some(snapshot) if snapshot.is_terminal() => return Ok(snapshot),
                Some(_) => tokio::time::sleep(poll).await,
            }
        }
    }
}

async fn monitor(inner: Arc<Inner>, id: JobId, export: String, args: Value) {
    if !inner.claim_launch(id) {
        debug!(
            target = "application::jobs::manager",
            op = "jobs::monitor",
            job_id = %id,
            "Job withdrawn before launch"
        );
        return;
    }

    let Some(export_fn) = inner.registry.get(&export) else {
        let err = BackendError::UnknownExport(export);
        inner.complete(id, ExitInfo::failed(err.to_string()), None);
        return;
    };
    let output = inner
        .result_dir
        .join(id.artifact_file_name(export_fn.file_extension()));

    let invocation = WorkerInvocation {
        job_id: id,
        export,
        args,
        output: output.clone(),
    };
    let handle = match inner.backend.start(invocation) {
        Ok(handle) => handle,
        Err(err) => {
            inner.complete(id, ExitInfo::failed(err.to_string()), None);
            return;
        }
    };
    inner.mark_started(id, handle.label());

    let exit = handle.wait().await;
    let artifact = match tokio::fs::metadata(&output).await {
        Ok(metadata) if metadata.is_file() => Some(output),
        Ok(_) => None,
        Err(err) if err.kind() == io::ErrorKind::NotFound => None,
        Err(err) => {
            warn!(
                target = "application::jobs::manager",
                op = "jobs::monitor",
                job_id = %id,
                artifact_path = %output.display(),
                error = %err,
                "Failed to inspect job artifact"
            );
            None
        }
    };
    inner.complete(id, exit, artifact);
}

impl Inner {
    fn claim_launch(&self, id: JobId) -> bool {
        let mut jobs = rw_write(&self.jobs, LOCK_TARGET, "jobs::claim_launch");
        match jobs.get_mut(&id) {
            Some(record) => {
                record.launched = true;
                true
            }
            None => false,
        }
    }

    fn mark_started(&self, id: JobId, label: &str) {
        let mut jobs = rw_write(&self.jobs, LOCK_TARGET, "jobs::mark_started");
        let Some(record) = jobs.get_mut(&id) else {
            return;
        };
        if record.snapshot.is_terminal() {
            return;
        }
        record.execution = Some(label.to_string());
        record.snapshot.progress = record.snapshot.progress.max(PROGRESS_LAUNCHED);
        record.snapshot.message = format!("running ({})", self.backend.kind());
    }

    /// The single terminal write for a job.
    fn complete(&self, id: JobId, exit: ExitInfo, artifact: Option<PathBuf>) {
        let (status, message, result) = match (exit.success, artifact) {
            (true, Some(path)) => (JobStatus::Finished, "finished".to_string(), Some(path)),
            (true, None) => (JobStatus::Failed, NO_RESULT_FILE.to_string(), None),
            (false, _) => (
                JobStatus::Failed,
                exit.diagnostic
                    .unwrap_or_else(|| "worker failed without a diagnostic".to_string()),
                None,
            ),
        };

        let mut jobs = rw_write(&self.jobs, LOCK_TARGET, "jobs::complete");
        let Some(record) = jobs.get_mut(&id) else {
            return;
        };
        if !record.snapshot.status.can_transition_to(status) {
            warn!(
                target = "application::jobs::manager",
                op = "jobs::complete",
                job_id = %id,
                from = %record.snapshot.status,
                to = %status,
                "Ignoring transition out of a terminal state"
            );
            return;
        }

        let now = OffsetDateTime::now_utc();
        let elapsed_ms = (now - record.snapshot.created_at).whole_milliseconds().max(0) as u64;
        record.snapshot.status = status;
        record.snapshot.finished_at = Some(now);
        record.snapshot.result = result;
        record.snapshot.message = message;
        if status == JobStatus::Finished {
            record.snapshot.progress = PROGRESS_DONE;
        }
        let snapshot = record.snapshot.clone();
        let execution = record.execution.clone().unwrap_or_default();
        drop(jobs);

        match snapshot.status {
            JobStatus::Finished => {
                counter!("mathexport_jobs_finished_total").increment(1);
                info!(
                    target = "application::jobs::manager",
                    op = "jobs::complete",
                    job_id = %id,
                    export = %snapshot.export,
                    execution = %execution,
                    result = "finished",
                    artifact_path = ?snapshot.result,
                    elapsed_ms,
                    "Export job finished"
                );
            }
            _ => {
                counter!("mathexport_jobs_failed_total").increment(1);
                warn!(
                    target = "application::jobs::manager",
                    op = "jobs::complete",
                    job_id = %id,
                    export = %snapshot.export,
                    execution = %execution,
                    result = "failed",
                    reason = %snapshot.message,
                    elapsed_ms,
                    "Export job failed"
                );
            }
        }
    }
}
