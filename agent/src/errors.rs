//! Error types for Dockyard

use thiserror::Error;

/// Main error type for Dockyard
#[derive(Error, Debug)]
pub enum DockyardError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Runtime error: {0}")]
    RuntimeError(String),

    #[error("Build failed: {0}")]
    BuildError(String),

    #[error("Container error: {0}")]
    ContainerError(String),

    #[error("Health check failed: {0}")]
    HealthCheckError(String),

    #[error("Project busy: {0}")]
    Busy(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for DockyardError {
    fn from(err: anyhow::Error) -> Self {
        DockyardError::Internal(err.to_string())
    }
}
