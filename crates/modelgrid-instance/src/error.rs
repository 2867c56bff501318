//! Instance lifecycle error types.

use thiserror::Error;

use modelgrid_provider::ProviderError;
use modelgrid_state::StateError;

/// Result type alias for instance operations.
pub type InstanceResult<T> = Result<T, InstanceError>;

/// Errors that can occur in instance lifecycle flows.
#[derive(Debug, Error)]
pub enum InstanceError {
    #[error("instance not found: {0}")]
    NotFound(String),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}
