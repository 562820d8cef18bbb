//! Types for the placement service boundary.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from the placement service.
#[derive(Debug, Error)]
pub enum PlacementError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Request timeout")]
    Timeout,
}

/// What to place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacementRequest {
    /// The instance being moved.
    pub vm_uuid: String,
    /// Memory the target must have free.
    pub ram_mb: u64,
    /// Disk space the target must have free.
    pub disk_mb: u64,
    /// Servers that must not be chosen.
    #[serde(default)]
    pub exclude_servers: Vec<String>,
}

/// Picks a target server for a migration.
#[async_trait]
pub trait PlacementService: Send + Sync {
    /// Choose a server. `Ok(None)` means no server fits.
    async fn choose(&self, request: &PlacementRequest) -> Result<Option<String>, PlacementError>;
}
