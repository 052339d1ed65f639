use thiserror::Error;

use crate::{
    application::{
        jobs::{BackendError, ExportError, JobError},
        render::RenderCacheError,
    },
    config::LoadError,
    infra::error::InfraError,
};

/// Top-level failure of a CLI command.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error(transparent)]
    Export(#[from] ExportError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    RenderCache(#[from] RenderCacheError),
    #[error("failed to load configuration: {0}")]
    Config(#[from] LoadError),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }
}
