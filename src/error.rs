use std::io;
use std::time::Duration;

/// Errors raised by the workspace layer. These never escape as panics: every
/// workspace operation hands one of these back to the dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("Git operation failed: {operation}\n{message}")]
    GitOperationFailed { operation: String, message: String },

    #[error("Git operation timed out after {timeout:?}: {operation}")]
    Timeout { operation: String, timeout: Duration },

    #[error("Invalid revision: {0:?}")]
    InvalidRevision(String),

    #[error("Workspace has not been cloned yet")]
    NotCloned,

    #[error("Repository error: {0}")]
    Repository(#[from] git2::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Custom error type for deploy_hook operations
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Workspace setup failed: {0}")]
    Workspace(#[from] WorkspaceError),

    #[error("Failed to spawn rebuild script: {0}")]
    SpawnFailed(String),

    #[error("Dispatch task failed: {0}")]
    TaskFailed(String),

    #[error("Invalid webhook payload: {0}")]
    PayloadError(String),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

/// Helper type for Results that use DeployError
pub type Result<T> = std::result::Result<T, DeployError>;
