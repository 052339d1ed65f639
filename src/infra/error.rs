use thiserror::Error;
use tracing_subscriber::util::TryInitError;

/// Failures while wiring process-wide infrastructure.
#[derive(Debug, Error)]
pub enum InfraError {
    /// A global tracing subscriber was already installed, or the `log` bridge was.
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(#[from] TryInitError),
}
