//! Types for the instance directory boundary.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from the instance directory.
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Request timeout")]
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskInfo {
    #[serde(default)]
    pub size_mb: u64,
}

/// Directory view of one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub uuid: String,
    #[serde(default)]
    pub alias: Option<String>,
    /// Server the instance currently lives on.
    pub server_uuid: String,
    /// Lifecycle state, e.g. "running", "stopped", "destroyed".
    pub state: String,
    #[serde(default)]
    pub ram_mb: u64,
    /// Zone quota in GiB, used when the instance has no disk list.
    #[serde(default)]
    pub quota_gb: Option<u64>,
    #[serde(default)]
    pub disks: Vec<DiskInfo>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub internal_metadata: BTreeMap<String, String>,
}

/// Authoritative registry of instances.
#[async_trait]
pub trait InstanceDirectory: Send + Sync {
    /// Look up an instance. `Ok(None)` when it does not exist.
    async fn get_instance(&self, uuid: &str) -> Result<Option<InstanceInfo>, DirectoryError>;
}
