//! Typed error taxonomy for the sandbox manager. The HTTP layer matches on
//! variant to pick a status code; it never sees an opaque `anyhow::Error`.

use hypervisor::{ApiError, DriverError, OverlayError};

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("missing artifact: {0}")]
    MissingArtifact(String),

    #[error("hypervisor error: {0}")]
    HypervisorError(String),

    #[error("guest unreachable: {0}")]
    GuestUnreachable(String),

    #[error("sandbox not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("io error: {0}")]
    Io(String),
}

impl From<DriverError> for ManagerError {
    fn from(e: DriverError) -> Self {
        ManagerError::HypervisorError(e.to_string())
    }
}

impl From<ApiError> for ManagerError {
    fn from(e: ApiError) -> Self {
        ManagerError::HypervisorError(e.to_string())
    }
}

impl From<OverlayError> for ManagerError {
    fn from(e: OverlayError) -> Self {
        ManagerError::HypervisorError(e.to_string())
    }
}

impl From<std::io::Error> for ManagerError {
    fn from(e: std::io::Error) -> Self {
        ManagerError::Io(e.to_string())
    }
}

pub type ManagerResult<T> = Result<T, ManagerError>;
