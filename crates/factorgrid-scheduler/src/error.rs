//! Dispatcher error types.

use thiserror::Error;

use factorgrid_fleet::FleetError;

/// Errors that make a job impossible to admit.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("could not provision a worker: {0}")]
    Provisioning(#[from] FleetError),

    #[error("dispatcher is shutting down")]
    ShuttingDown,
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Why a job could not be handed to its worker.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("connect to {0} timed out")]
    Timeout(String),

    #[error("connect to {authority}: {source}")]
    Connect {
        authority: String,
        #[source]
        source: std::io::Error,
    },

    #[error("http: {0}")]
    Hyper(#[from] hyper::Error),

    #[error("invalid request: {0}")]
    Http(#[from] http::Error),
}
