//! Errors surfaced by migration requests.

use thiserror::Error;

use super::store::StoreError;
use crate::directory::DirectoryError;
use crate::jobs::JobEngineError;
use crate::placement::PlacementError;

/// Error returned by migration operations.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// A required request parameter is missing.
    #[error("{0}")]
    MalformedRequest(String),

    /// A request parameter has an unrecognized or unusable value.
    #[error("{0}")]
    InvalidArgument(String),

    /// Parameters that cannot be combined.
    #[error("{0}")]
    Conflict(String),

    /// No such instance, or no migration record for it.
    #[error("{0}")]
    NotFound(String),

    /// The action is not allowed in the current migration state.
    #[error("{0}")]
    PreconditionFailed(String),

    #[error("record store error: {0}")]
    Store(#[from] StoreError),

    #[error("job engine error: {0}")]
    JobEngine(#[from] JobEngineError),

    #[error("placement error: {0}")]
    Placement(#[from] PlacementError),

    #[error("directory error: {0}")]
    Directory(#[from] DirectoryError),
}

impl MigrationError {
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::PreconditionFailed(message.into())
    }

    /// HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::MalformedRequest(_) | Self::InvalidArgument(_) | Self::Conflict(_) => 409,
            Self::NotFound(_) => 404,
            Self::PreconditionFailed(_) => 412,
            Self::Store(_) => 500,
            Self::JobEngine(_) | Self::Placement(_) | Self::Directory(_) => 503,
        }
    }

    /// Stable error code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MalformedRequest(_) => "MalformedRequest",
            Self::InvalidArgument(_) => "InvalidArgument",
            Self::Conflict(_) => "Conflict",
            Self::NotFound(_) => "ResourceNotFound",
            Self::PreconditionFailed(_) => "PreconditionFailed",
            Self::Store(_) => "InternalError",
            Self::JobEngine(_) | Self::Placement(_) | Self::Directory(_) => "ServiceUnavailable",
        }
    }
}
