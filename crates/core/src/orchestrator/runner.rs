//! Migration orchestrator implementation.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::MigrationConfig;
use crate::directory::{InstanceDirectory, InstanceInfo};
use crate::jobs::{JobEngine, JobEngineError, JobHandle};
use crate::metrics::ACTION_REQUESTS;
use crate::migration::{
    plan, EventBroadcaster, InstanceLease, InstanceLocks, MigrationAction, MigrationError,
    MigrationFilter, MigrationRecord, MigrationState, MigrationStore, Phase, Transition,
    WatchStream,
};
use crate::placement::{PlacementRequest, PlacementService};
use crate::policy::{self, MIB};

use super::monitor::Shared;
use super::types::{ActionOutcome, ActionRequest};

/// Drives migrations through the phase state machine.
#[derive(Clone)]
pub struct MigrationOrchestrator {
    shared: Arc<Shared>,
}

impl MigrationOrchestrator {
    /// Create a new orchestrator.
    pub fn new(
        config: MigrationConfig,
        store: Arc<dyn MigrationStore>,
        engine: Arc<dyn JobEngine>,
        placement: Arc<dyn PlacementService>,
        directory: Arc<dyn InstanceDirectory>,
    ) -> Self {
        let broadcaster = EventBroadcaster::new(config.watch_buffer);
        Self {
            shared: Arc::new(Shared {
                config,
                store,
                engine,
                placement,
                directory,
                broadcaster,
                locks: InstanceLocks::new(),
                active: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Handle a migrate request.
    pub async fn request(&self, request: ActionRequest) -> Result<ActionOutcome, MigrationError> {
        let action = match parse_action(&request) {
            Ok(action) => action,
            Err(e) => {
                ACTION_REQUESTS.with_label_values(&["invalid", "rejected"]).inc();
                return Err(e);
            }
        };

        let result = self.handle(&request, action).await;

        let label = match &result {
            Ok(_) => "accepted",
            Err(e) if e.status_code() < 500 => "rejected",
            Err(_) => "error",
        };
        ACTION_REQUESTS
            .with_label_values(&[action.as_str(), label])
            .inc();

        match &result {
            Ok(_) => {}
            Err(e) if e.status_code() < 500 => {
                debug!("Rejected {} for {}: {}", action, request.instance_id, e)
            }
            Err(e) => warn!("Failed to {} {}: {}", action, request.instance_id, e),
        }
        result
    }

    async fn handle(
        &self,
        request: &ActionRequest,
        action: MigrationAction,
    ) -> Result<ActionOutcome, MigrationError> {
        validate_overrides(request)?;

        let instance = self
            .shared
            .directory
            .get_instance(&request.instance_id)
            .await?
            .ok_or_else(|| {
                MigrationError::NotFound(format!("VM {} not found", request.instance_id))
            })?;
        policy::check_protected(&instance, &self.shared.config)?;

        if action == MigrationAction::Estimate {
            plan(None, None, action, request.automatic)?;
            return Ok(ActionOutcome::Estimated {
                size: policy::estimate_size(&instance),
            });
        }

        let lease = self.shared.locks.acquire(&request.instance_id).await;
        let record = self.shared.store.get(&request.instance_id)?;
        let in_flight = self
            .shared
            .active
            .read()
            .await
            .get(&request.instance_id)
            .map(|a| a.in_flight);

        match plan(record.as_ref(), in_flight.as_ref(), action, request.automatic)? {
            Transition::Dispatch {
                phase: Phase::Begin,
                restart,
            } => {
                if restart {
                    info!("Restarting aborted migration of {}", instance.uuid);
                }
                let record = self.prepare_begin(&instance, request, record).await?;
                if request.automatic {
                    self.shared.start_automatic(lease, record).await
                } else {
                    self.shared.start_manual(lease, record, Phase::Begin).await
                }
            }
            Transition::Dispatch { phase, .. } => {
                let record = require(record, &request.instance_id)?;
                self.shared.start_manual(lease, record, phase).await
            }
            Transition::Pause { job_id } => {
                let record = require(record, &request.instance_id)?;
                self.pause(lease, record, job_id).await
            }
            Transition::Abort { stop_job_id } => {
                let record = require(record, &request.instance_id)?;
                self.abort(lease, record, stop_job_id).await
            }
            Transition::Estimate => Ok(ActionOutcome::Estimated {
                size: policy::estimate_size(&instance),
            }),
        }
    }

    /// Build the record for a new (or restarted) migration, choosing the
    /// target server and instance.
    async fn prepare_begin(
        &self,
        instance: &InstanceInfo,
        request: &ActionRequest,
        existing: Option<MigrationRecord>,
    ) -> Result<MigrationRecord, MigrationError> {
        let has_overrides = request.override_uuid.is_some() || request.override_alias.is_some();

        let target_instance_id = match &request.override_uuid {
            Some(uuid) if uuid.eq_ignore_ascii_case(&instance.uuid) => {
                return Err(MigrationError::InvalidArgument(
                    "override_uuid must differ from the source VM uuid".to_string(),
                ));
            }
            Some(uuid) => uuid.to_lowercase(),
            None if has_overrides => Uuid::new_v4().to_string(),
            None => instance.uuid.clone(),
        };

        // With override identifiers the copy is a separate instance, so it may
        // land on the source server.
        let placement_request = PlacementRequest {
            vm_uuid: instance.uuid.clone(),
            ram_mb: instance.ram_mb,
            disk_mb: policy::disk_footprint(instance) / MIB,
            exclude_servers: if has_overrides {
                Vec::new()
            } else {
                vec![instance.server_uuid.clone()]
            },
        };
        let target_server = match self.shared.placement.choose(&placement_request).await? {
            Some(server) if server == instance.server_uuid && !has_overrides => {
                return Err(MigrationError::precondition(
                    "placement returned the source server as target",
                ));
            }
            Some(server) => server,
            None if has_overrides => instance.server_uuid.clone(),
            None => {
                return Err(MigrationError::precondition(
                    "no server available to receive the VM",
                ));
            }
        };

        let now = Utc::now();
        let (created_at, progress_history) = match existing {
            Some(record) => (record.created_at, record.progress_history),
            None => (now, Vec::new()),
        };

        Ok(MigrationRecord {
            instance_id: instance.uuid.clone(),
            source_server_id: instance.server_uuid.clone(),
            target_server_id: Some(target_server),
            target_instance_id,
            phase: Phase::Begin,
            state: MigrationState::Running,
            automatic: request.automatic,
            override_instance_id: request.override_uuid.as_deref().map(str::to_lowercase),
            override_alias: request.override_alias.clone(),
            job_id: None,
            progress_history,
            created_at,
            updated_at: now,
        })
    }

    async fn pause(
        &self,
        _lease: InstanceLease,
        record: MigrationRecord,
        job_id: Option<String>,
    ) -> Result<ActionOutcome, MigrationError> {
        let job = self
            .current_job(&record.instance_id, job_id)
            .await
            .ok_or_else(|| MigrationError::precondition("no running job to pause"))?;

        match self.shared.engine.stop(&job).await {
            // Already finished; the monitor settles it.
            Ok(()) | Err(JobEngineError::JobNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        if let Some(active) = self.shared.active.write().await.get_mut(&record.instance_id) {
            active.in_flight.pause_requested = true;
        }
        info!(
            "Pause requested for migration of {} (job {})",
            record.instance_id, job.job_uuid
        );

        Ok(ActionOutcome::Dispatched {
            job_uuid: job.job_uuid,
            migration: record,
        })
    }

    async fn abort(
        &self,
        lease: InstanceLease,
        record: MigrationRecord,
        stop_job_id: Option<String>,
    ) -> Result<ActionOutcome, MigrationError> {
        if stop_job_id.is_some() {
            if let Some(job) = self.current_job(&record.instance_id, stop_job_id).await {
                if let Some(active) = self.shared.active.write().await.get_mut(&record.instance_id)
                {
                    active.in_flight.abort_requested = true;
                }
                if let Err(e) = self.shared.engine.stop(&job).await {
                    warn!(
                        "Failed to stop job {} before aborting {}: {}",
                        job.job_uuid, record.instance_id, e
                    );
                }
            }
        }

        info!("Aborting migration of {}", record.instance_id);
        self.shared.start_manual(lease, record, Phase::Abort).await
    }

    /// Job of the action in flight, falling back to the one on the record.
    async fn current_job(&self, instance_id: &str, job_id: Option<String>) -> Option<JobHandle> {
        let active = self.shared.active.read().await;
        active
            .get(instance_id)
            .map(|a| a.job.clone())
            .or_else(|| job_id.map(JobHandle::new))
    }

    /// Get the migration record of an instance.
    pub fn get(&self, instance_id: &str) -> Result<MigrationRecord, MigrationError> {
        self.shared.store.get(instance_id)?.ok_or_else(|| {
            MigrationError::NotFound(format!("no migration found for VM {}", instance_id))
        })
    }

    /// List migration records.
    pub fn list(&self, filter: &MigrationFilter) -> Result<Vec<MigrationRecord>, MigrationError> {
        Ok(self.shared.store.list(filter)?)
    }

    /// Stream the events of the action in flight for an instance. The stream
    /// is empty when nothing is running.
    pub fn watch(&self, instance_id: &str) -> WatchStream {
        self.shared.broadcaster.subscribe(instance_id)
    }

    /// Number of actions being followed.
    pub async fn active_count(&self) -> usize {
        self.shared.active.read().await.len()
    }

    /// Resume following the jobs of migrations that were running when the
    /// service stopped. Returns how many were resumed.
    pub async fn recover(&self) -> usize {
        let filter = MigrationFilter::new().with_state(MigrationState::Running);
        let records = match self.shared.store.list(&filter) {
            Ok(records) => records,
            Err(e) => {
                error!("Failed to recover running migrations: {}", e);
                return 0;
            }
        };

        let mut recovered = 0;
        for record in records {
            let instance_id = record.instance_id.clone();
            match self.shared.resume(record).await {
                Ok(true) => {
                    info!("Recovered running migration: {}", instance_id);
                    recovered += 1;
                }
                Ok(false) => {}
                Err(e) => error!("Failed to recover migration {}: {}", instance_id, e),
            }
        }
        if recovered > 0 {
            info!("Recovered {} running migrations", recovered);
        }
        recovered
    }
}

fn parse_action(request: &ActionRequest) -> Result<MigrationAction, MigrationError> {
    let action = request.action.as_deref().ok_or_else(|| {
        MigrationError::MalformedRequest("missing required parameter: action".to_string())
    })?;
    if action != "migrate" {
        return Err(MigrationError::InvalidArgument(format!(
            "unsupported action: {}",
            action
        )));
    }

    request
        .migration_action
        .as_deref()
        .ok_or_else(|| {
            MigrationError::MalformedRequest(
                "missing required parameter: migration_action".to_string(),
            )
        })?
        .parse::<MigrationAction>()
        .map_err(MigrationError::InvalidArgument)
}

fn validate_overrides(request: &ActionRequest) -> Result<(), MigrationError> {
    if let Some(uuid) = &request.override_uuid {
        Uuid::parse_str(uuid).map_err(|_| {
            MigrationError::InvalidArgument(format!("override_uuid is not a valid UUID: {}", uuid))
        })?;
    }
    if request.override_alias.as_deref().is_some_and(|a| a.trim().is_empty()) {
        return Err(MigrationError::InvalidArgument(
            "override_alias must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn require(
    record: Option<MigrationRecord>,
    instance_id: &str,
) -> Result<MigrationRecord, MigrationError> {
    record.ok_or_else(|| {
        MigrationError::NotFound(format!("no migration found for VM {}", instance_id))
    })
}
