//! Fleet error types.

use thiserror::Error;

/// Result type alias for fleet and provider operations.
pub type FleetResult<T> = Result<T, FleetError>;

/// Errors raised by instance providers and fleet bookkeeping.
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("provider error: {0}")]
    Provider(String),

    #[error("no capacity left to start a worker")]
    CapacityExhausted,

    #[error("unknown instance: {0}")]
    UnknownInstance(String),

    #[error("instance {0} did not become ready in time")]
    ProvisionTimeout(String),

    #[error("instance {id} entered terminal state {state} while starting")]
    StartFailed { id: String, state: String },
}
