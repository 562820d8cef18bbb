//! Types for the migration orchestrator.

use serde::Serialize;

use crate::jobs::JobHandle;
use crate::migration::{InFlight, MigrationRecord};

/// A migrate request as received from a client. Parameters are kept raw so
/// that missing and unrecognized values can be told apart.
#[derive(Debug, Clone, Default)]
pub struct ActionRequest {
    pub instance_id: String,
    /// Must be "migrate".
    pub action: Option<String>,
    /// Sub-action: begin, sync, switch, abort, pause or estimate.
    pub migration_action: Option<String>,
    pub override_uuid: Option<String>,
    pub override_alias: Option<String>,
    pub automatic: bool,
}

impl ActionRequest {
    /// Request for `migration_action` on an instance, with `action=migrate`.
    pub fn migrate(instance_id: impl Into<String>, migration_action: &str) -> Self {
        Self {
            instance_id: instance_id.into(),
            action: Some("migrate".to_string()),
            migration_action: Some(migration_action.to_string()),
            ..Self::default()
        }
    }

    pub fn with_automatic(mut self, automatic: bool) -> Self {
        self.automatic = automatic;
        self
    }

    pub fn with_override_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.override_uuid = Some(uuid.into());
        self
    }

    pub fn with_override_alias(mut self, alias: impl Into<String>) -> Self {
        self.override_alias = Some(alias.into());
        self
    }
}

/// Result of an accepted request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ActionOutcome {
    /// A job was dispatched (or, for pause, the running job was asked to
    /// stop). `job_uuid` identifies that job.
    Dispatched {
        job_uuid: String,
        migration: MigrationRecord,
    },
    /// Size estimate in bytes.
    Estimated { size: u64 },
}

impl ActionOutcome {
    pub fn job_uuid(&self) -> Option<&str> {
        match self {
            ActionOutcome::Dispatched { job_uuid, .. } => Some(job_uuid),
            ActionOutcome::Estimated { .. } => None,
        }
    }
}

/// An action the orchestrator is following.
#[derive(Debug, Clone)]
pub(crate) struct ActiveAction {
    pub job: JobHandle,
    pub in_flight: InFlight,
}
