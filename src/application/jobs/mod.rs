//! Background export jobs: the job table, execution backends and the worker
//! that publishes artifacts into the result store.

mod backend;
mod manager;
mod registry;
mod worker;

pub use backend::{
    BackendError, BackendKind, BackendPreference, ExecutionBackend, ExecutionHandle, ExitInfo,
    ProcessBackend, ThreadBackend, WorkerEntryPoint, WorkerInvocation,
    register_worker_entry_point, registered_worker_entry_point, select_backend,
};
pub use manager::{JobError, JobManager};
pub use registry::{ExportContext, ExportError, ExportFn, ExportRegistry};
pub use worker::{ExportWorker, WorkerOutcome};
