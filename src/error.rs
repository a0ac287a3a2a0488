//! Domain error taxonomy shared by the queue, workers and API layer.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// Another non-terminal deployment exists for the app.
    #[error("a deployment is already in progress for this app")]
    DeployInProgress,

    /// Rollback requested but the app has no previous successful deploy.
    #[error("no previous deployment available")]
    NoDeployAvailable,

    #[error("health check failed: {0}")]
    HealthCheckFailed(String),

    #[error("build failed: {0}")]
    BuildFailed(String),

    #[error("git sync failed: {0}")]
    GitSyncFailed(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Retryable blip (database hiccup, transient I/O). Monitors retry these
    /// a bounded number of times.
    #[error("transient error: {0}")]
    Transient(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Whether a bounded retry is worthwhile.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
