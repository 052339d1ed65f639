//! Interchangeable execution backends for export workers.
//!
//! Both backends take the same [`WorkerInvocation`] and report completion as
//! an [`ExitInfo`]; neither carries the artifact itself. The worker publishes
//! to the result store and the job monitor reads it back from there.

use std::{
    any::Any,
    fmt, io,
    panic::{self, AssertUnwindSafe},
    path::{Path, PathBuf},
    process::Stdio,
    str::FromStr,
    sync::Arc,
    thread,
};

use futures::{FutureExt, future::BoxFuture};
use once_cell::sync::OnceCell;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::{process::Command, runtime::Handle, sync::oneshot};
use tracing::{debug, info, warn};

use super::{
    registry::{ExportContext, ExportRegistry},
    worker::ExportWorker,
};
use crate::domain::jobs::JobId;

const STDERR_TAIL_CHARS: usize = 1024;

static WORKER_ENTRY_POINT: OnceCell<WorkerEntryPoint> = OnceCell::new();

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to spawn worker process `{}`: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to start export thread: {0}")]
    Thread(#[source] io::Error),
    #[error("unknown export `{0}`")]
    UnknownExport(String),
    #[error("worker entry point unavailable: {0}")]
    EntryPoint(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Process,
    Thread,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Process => "process",
            BackendKind::Thread => "thread",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configured backend choice; `Auto` prefers a worker process when one can be launched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendPreference {
    #[default]
    Auto,
    Process,
    Thread,
}

impl FromStr for BackendPreference {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(BackendPreference::Auto),
            "process" => Ok(BackendPreference::Process),
            "thread" => Ok(BackendPreference::Thread),
            other => Err(format!("expected auto, process or thread, got `{other}`")),
        }
    }
}

/// Everything a backend needs to run one export.
#[derive(Debug, Clone)]
pub struct WorkerInvocation {
    pub job_id: JobId,
    pub export: String,
    pub args: Value,
    /// Where the worker must publish the artifact, if it produces one.
    pub output: PathBuf,
}

/// How an execution unit ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    pub success: bool,
    pub diagnostic: Option<String>,
}

impl ExitInfo {
    pub fn clean() -> Self {
        Self {
            success: true,
            diagnostic: None,
        }
    }

    pub fn failed(diagnostic: impl Into<String>) -> Self {
        Self {
            success: false,
            diagnostic: Some(diagnostic.into()),
        }
    }
}

/// A started execution unit. Used to wait for completion, never to fetch results.
pub struct ExecutionHandle {
    label: String,
    completion: BoxFuture<'static, ExitInfo>,
}

impl ExecutionHandle {
    pub fn new(label: impl Into<String>, completion: BoxFuture<'static, ExitInfo>) -> Self {
        Self {
            label: label.into(),
            completion,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub async fn wait(self) -> ExitInfo {
        self.completion.await
    }
}

impl fmt::Debug for ExecutionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionHandle")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

pub trait ExecutionBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Launch the export detached. Must be called from within a Tokio runtime.
    fn start(&self, invocation: WorkerInvocation) -> Result<ExecutionHandle, BackendError>;
}

/// A program that accepts the `worker` subcommand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEntryPoint {
    program: PathBuf,
    env: Vec<(String, String)>,
}

impl WorkerEntryPoint {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            env: Vec::new(),
        }
    }

    /// The running executable, when the OS can tell us where it lives.
    pub fn current_exe() -> Result<Self, BackendError> {
        let program =
            std::env::current_exe().map_err(|err| BackendError::EntryPoint(err.to_string()))?;
        Ok(Self::new(program))
    }

    /// Extra environment for spawned workers, e.g. configuration overrides from the CLI.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn is_available(&self) -> bool {
        self.program.is_file()
    }
}

/// Record the executable that can serve `worker` invocations. Only the first call wins.
pub fn register_worker_entry_point(entry: WorkerEntryPoint) -> bool {
    WORKER_ENTRY_POINT.set(entry).is_ok()
}

/// The registered entry point, if one was registered and still exists on disk.
pub fn registered_worker_entry_point() -> Option<WorkerEntryPoint> {
    WORKER_ENTRY_POINT
        .get()
        .filter(|entry| entry.is_available())
        .cloned()
}

/// Runs each export in a fresh child process via the `worker` subcommand.
#[derive(Debug, Clone)]
pub struct ProcessBackend {
    entry: WorkerEntryPoint,
}

impl ProcessBackend {
    pub fn new(entry: WorkerEntryPoint) -> Self {
        Self { entry }
    }
}

impl ExecutionBackend for ProcessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Process
    }

    fn start(&self, invocation: WorkerInvocation) -> Result<ExecutionHandle, BackendError> {
        let mut command = Command::new(self.entry.program());
        command
            .arg("worker")
            .arg("--export")
            .arg(&invocation.export)
            .arg("--args")
            .arg(invocation.args.to_string())
            .arg("--output")
            .arg(&invocation.output)
            .envs(self.entry.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let child = command.spawn().map_err(|source| BackendError::Spawn {
            program: self.entry.program().to_path_buf(),
            source,
        })?;
        let label = match child.id() {
            Some(pid) => format!("process:{pid}"),
            None => "process".to_string(),
        };

        debug!(
            target = "application::jobs::backend",
            op = "process::start",
            job_id = %invocation.job_id,
            export = %invocation.export,
            execution = %label,
            "Worker process spawned"
        );

        let completion = async move {
            match child.wait_with_output().await {
                Ok(output) if output.status.success() => ExitInfo::clean(),
                Ok(output) => {
                    let status = match output.status.code() {
                        Some(code) => format!("worker exited with code {code}"),
                        None => "worker terminated by signal".to_string(),
                    };
                    let stderr = stderr_tail(&output.stderr);
                    if stderr.is_empty() {
                        ExitInfo::failed(status)
                    } else {
                        ExitInfo::failed(format!("{status}: {stderr}"))
                    }
                }
                Err(err) => ExitInfo::failed(format!("failed to wait for worker: {err}")),
            }
        }
        .boxed();

        Ok(ExecutionHandle::new(label, completion))
    }
}

/// Runs each export on a dedicated OS thread inside this process.
#[derive(Debug, Clone)]
pub struct ThreadBackend {
    registry: ExportRegistry,
}

impl ThreadBackend {
    pub fn new(registry: ExportRegistry) -> Self {
        Self { registry }
    }
}

impl ExecutionBackend for ThreadBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Thread
    }

    fn start(&self, invocation: WorkerInvocation) -> Result<ExecutionHandle, BackendError> {
        let worker = ExportWorker::resolve(&self.registry, &invocation.export)?;
        let runtime = Handle::try_current()
            .map_err(|err| BackendError::Thread(io::Error::other(err.to_string())))?;
        let (done_tx, done_rx) = oneshot::channel();
        let thread_name = format!("export-{}", invocation.job_id);
        let label = format!("thread:{thread_name}");

        thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                let ctx = ExportContext::new(runtime);
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    worker.run(&ctx, &invocation.args, &invocation.output)
                }));
                let exit = match outcome {
                    Ok(Ok(_)) => ExitInfo::clean(),
                    Ok(Err(err)) => ExitInfo::failed(err.to_string()),
                    Err(payload) => {
                        ExitInfo::failed(format!("export panicked: {}", panic_message(&*payload)))
                    }
                };
                let _ = done_tx.send(exit);
            })
            .map_err(BackendError::Thread)?;

        let completion = async move {
            done_rx
                .await
                .unwrap_or_else(|_| ExitInfo::failed("export thread exited without reporting"))
        }
        .boxed();

        Ok(ExecutionHandle::new(label, completion))
    }
}

/// Pick the backend once, at manager construction.
///
/// `Auto` and `Process` use the worker process when `entry` points at an
/// executable; otherwise they fall back to threads.
pub fn select_backend(
    preference: BackendPreference,
    entry: Option<WorkerEntryPoint>,
    registry: &ExportRegistry,
) -> Arc<dyn ExecutionBackend> {
    let entry = entry.filter(WorkerEntryPoint::is_available);
    let backend: Arc<dyn ExecutionBackend> = match (preference, entry) {
        (BackendPreference::Thread, _) => Arc::new(ThreadBackend::new(registry.clone())),
        (_, Some(entry)) => Arc::new(ProcessBackend::new(entry)),
        (preference, None) => {
            if preference == BackendPreference::Process {
                warn!(
                    target = "application::jobs::backend",
                    op = "select_backend",
                    preference = ?preference,
                    "Worker process requested but no entry point is available; using threads"
                );
            }
            Arc::new(ThreadBackend::new(registry.clone()))
        }
    };

    info!(
        target = "application::jobs::backend",
        op = "select_backend",
        preference = ?preference,
        backend = %backend.kind(),
        "Execution backend selected"
    );
    backend
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    let count = text.chars().count();
    if count <= STDERR_TAIL_CHARS {
        return text.to_string();
    }
    let tail: String = text.chars().skip(count - STDERR_TAIL_CHARS).collect();
    format!("...{tail}")
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
