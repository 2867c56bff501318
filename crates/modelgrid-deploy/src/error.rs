//! Deployment orchestrator error types.

use thiserror::Error;

use modelgrid_state::StateError;

/// Result type alias for deployment operations.
pub type DeployResult<T> = Result<T, DeployError>;

/// Errors surfaced synchronously to the deploy caller.
///
/// Backend provisioning failures are not here: they are reported
/// asynchronously through the deployment record's status.
#[derive(Debug, Error)]
pub enum DeployError {
    /// Another deployment holds the workspace lock.
    #[error("deployment already in progress for workspace {0}")]
    InProgress(String),

    /// The registry has no matching model version for the workspace.
    #[error("no registered model for workspace {0}")]
    ModelNotFound(String),

    /// The registered model's framework maps to no serving workload.
    #[error("unsupported framework: {0}")]
    UnsupportedFramework(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}
