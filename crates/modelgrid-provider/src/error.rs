//! Provider error types.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Errors that can occur while driving a compute backend.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// A backend call failed (transport, non-2xx, or malformed response).
    #[error("backend request failed: {0}")]
    Backend(String),

    /// The named resource does not exist on the backend.
    ///
    /// Adapters swallow this for stop/delete (idempotent teardown) and map
    /// it to `ServiceState::Unknown` in `get_state`; it only surfaces for
    /// operations that genuinely need the resource, like log reads.
    #[error("backend resource not found: {0}")]
    NotFound(String),

    /// The active backend does not implement this capability.
    #[error("operation not supported by this backend: {0}")]
    Unsupported(&'static str),

    /// The bounded wait elapsed before the condition held.
    #[error("condition not met within {0:?}")]
    ConvergenceTimeout(Duration),

    /// The descriptor carries a different backend's native fields.
    #[error("descriptor mismatch: {0}")]
    Descriptor(String),

    #[error("serialization error: {0}")]
    Serialize(String),
}
