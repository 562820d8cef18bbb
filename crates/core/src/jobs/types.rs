//! Types for the job engine boundary.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::migration::Phase;

/// Errors that can occur while talking to the job engine.
#[derive(Debug, Error)]
pub enum JobEngineError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job rejected: {0}")]
    Rejected(String),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Request timeout")]
    Timeout,
}

/// Description of one job to run on the job engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Task name, e.g. "migrate-sync".
    pub task: String,
    pub phase: Phase,
    pub vm_uuid: String,
    pub source_server_uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_server_uuid: Option<String>,
    pub target_vm_uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_alias: Option<String>,
    pub automatic: bool,
}

impl JobSpec {
    pub fn task_name(phase: Phase) -> String {
        format!("migrate-{}", phase.as_str())
    }
}

/// Handle of a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub job_uuid: String,
}

impl JobHandle {
    pub fn new(job_uuid: impl Into<String>) -> Self {
        Self {
            job_uuid: job_uuid.into(),
        }
    }
}

/// Progress tick reported by a running job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub current_progress: u32,
    pub total_progress: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_bytes_per_second: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_ms: Option<u64>,
    #[serde(default)]
    pub message: String,
}

/// Lifecycle signal of a job. Everything except `Progress` is terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobSignal {
    Progress(JobProgress),
    Succeeded {
        #[serde(default)]
        message: String,
    },
    Failed {
        error: String,
    },
    /// The job stopped early because it was asked to (pause).
    Stopped {
        #[serde(default)]
        message: String,
    },
}

impl JobSignal {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobSignal::Progress(_))
    }
}

/// Ordered lifecycle signals of one job.
pub type JobSignalStream = BoxStream<'static, JobSignal>;

/// Asynchronous task execution engine that performs the actual data transfer
/// and cut-over.
#[async_trait]
pub trait JobEngine: Send + Sync {
    /// Submit a job. Returns as soon as the job is queued.
    async fn submit(&self, spec: JobSpec) -> Result<JobHandle, JobEngineError>;

    /// Subscribe to a job's lifecycle signals.
    async fn subscribe(&self, job: &JobHandle) -> Result<JobSignalStream, JobEngineError>;

    /// Ask a running job to stop at the next safe point. The job answers with
    /// a `Stopped` (or another terminal) signal on its stream.
    async fn stop(&self, job: &JobHandle) -> Result<(), JobEngineError>;

    /// Name of this engine, for logs.
    fn name(&self) -> &'static str;
}
