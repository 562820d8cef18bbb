//! Job dispatch and monitoring.
//!
//! Every accepted action gets one job. A task follows the job's signals,
//! republishes progress to watchers and, once the job settles, appends the
//! single history entry for the action under the instance lease.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::config::MigrationConfig;
use crate::directory::InstanceDirectory;
use crate::jobs::{JobEngine, JobHandle, JobProgress, JobSignal, JobSignalStream, JobSpec};
use crate::metrics::{
    ACTIONS_COMPLETED, ACTIONS_RUNNING, ACTION_DURATION, AUTOMATIC_MIGRATIONS, SETTLE_RETRIES,
};
use crate::migration::{
    plan, AppendProgress, EventBroadcaster, InFlight, InstanceLease, InstanceLocks,
    MigrationAction, MigrationError, MigrationRecord, MigrationState, MigrationStore, Phase,
    ProgressEntry, WatchEvent, PROGRESS_COMPLETE,
};
use crate::placement::PlacementService;

use super::types::{ActionOutcome, ActiveAction};

/// State shared between request handlers and monitor tasks.
pub(super) struct Shared {
    pub config: MigrationConfig,
    pub store: Arc<dyn MigrationStore>,
    pub engine: Arc<dyn JobEngine>,
    pub placement: Arc<dyn PlacementService>,
    pub directory: Arc<dyn InstanceDirectory>,
    pub broadcaster: EventBroadcaster,
    pub locks: InstanceLocks,
    pub active: RwLock<HashMap<String, ActiveAction>>,
}

/// How a job ended.
#[derive(Debug, Clone, PartialEq)]
enum Terminal {
    Succeeded(String),
    Failed(String),
    Stopped(String),
}

/// What the monitor saw of a job.
#[derive(Debug, Clone, PartialEq)]
struct Observed {
    terminal: Terminal,
    /// Last progress published, in percent.
    current_progress: u32,
    /// Last transfer rate and ETA published.
    transfer: Option<(u64, u64)>,
}

enum Settled {
    Finished(MigrationRecord),
    /// The record moved on to another job (e.g. an abort).
    Superseded,
}

impl Shared {
    /// Submit the job for `phase` and commit the record as running. The
    /// caller holds the instance lease.
    async fn launch(
        &self,
        mut record: MigrationRecord,
        phase: Phase,
        automatic: bool,
    ) -> Result<(JobHandle, JobSignalStream, MigrationRecord), MigrationError> {
        let spec = JobSpec {
            task: JobSpec::task_name(phase),
            phase,
            vm_uuid: record.instance_id.clone(),
            source_server_uuid: record.source_server_id.clone(),
            target_server_uuid: record.target_server_id.clone(),
            target_vm_uuid: record.target_instance_id.clone(),
            override_uuid: record.override_instance_id.clone(),
            override_alias: record.override_alias.clone(),
            automatic,
        };

        let job = self.engine.submit(spec).await?;
        let signals = match self.engine.subscribe(&job).await {
            Ok(signals) => signals,
            Err(e) => {
                self.stop_quietly(&job).await;
                return Err(e.into());
            }
        };

        record.phase = phase;
        record.state = MigrationState::Running;
        record.automatic = automatic;
        record.job_id = Some(job.job_uuid.clone());
        record.updated_at = Utc::now();
        if let Err(e) = self.store.put(&record) {
            self.stop_quietly(&job).await;
            return Err(e.into());
        }

        info!(
            "Dispatched {} job {} for migration of {} via {} engine",
            phase,
            job.job_uuid,
            record.instance_id,
            self.engine.name()
        );
        Ok((job, signals, record))
    }

    async fn stop_quietly(&self, job: &JobHandle) {
        if let Err(e) = self.engine.stop(job).await {
            warn!("Failed to stop orphaned job {}: {}", job.job_uuid, e);
        }
    }

    async fn set_active(&self, instance_id: &str, job: JobHandle, phase: Phase, automatic: bool) {
        let mut active = self.active.write().await;
        active.insert(
            instance_id.to_string(),
            ActiveAction {
                job,
                in_flight: InFlight {
                    phase,
                    automatic,
                    pause_requested: false,
                    abort_requested: false,
                },
            },
        );
        ACTIONS_RUNNING.set(active.len() as i64);
    }

    /// Forget the action in flight, unless another job took it over.
    async fn clear_active(&self, instance_id: &str, job: &JobHandle) {
        let mut active = self.active.write().await;
        if active.get(instance_id).is_some_and(|a| &a.job == job) {
            active.remove(instance_id);
        }
        ACTIONS_RUNNING.set(active.len() as i64);
    }

    /// Close out an action: forget it and publish the final event.
    async fn finish(&self, instance_id: &str, job: &JobHandle, end: WatchEvent) {
        self.clear_active(instance_id, job).await;
        self.broadcaster.publish(instance_id, end);
    }

    /// Dispatch a single action and follow it in the background.
    pub(super) async fn start_manual(
        self: &Arc<Self>,
        lease: InstanceLease,
        record: MigrationRecord,
        phase: Phase,
    ) -> Result<ActionOutcome, MigrationError> {
        let (job, signals, record) = self.launch(record, phase, false).await?;
        let instance_id = record.instance_id.clone();

        self.broadcaster.open(&instance_id);
        self.set_active(&instance_id, job.clone(), phase, false).await;

        let shared = Arc::clone(self);
        let followed = job.clone();
        tokio::spawn(async move {
            shared.run_manual(instance_id, phase, followed, signals).await;
        });

        drop(lease);
        Ok(ActionOutcome::Dispatched {
            job_uuid: job.job_uuid,
            migration: record,
        })
    }

    /// Dispatch `begin` of an automatic migration; the chain continues with
    /// sync and switch in the background.
    pub(super) async fn start_automatic(
        self: &Arc<Self>,
        lease: InstanceLease,
        record: MigrationRecord,
    ) -> Result<ActionOutcome, MigrationError> {
        let (job, signals, record) = self.launch(record, Phase::Begin, true).await?;
        let instance_id = record.instance_id.clone();

        self.broadcaster.open(&instance_id);
        self.set_active(&instance_id, job.clone(), Phase::Begin, true).await;

        let shared = Arc::clone(self);
        let followed = job.clone();
        tokio::spawn(async move {
            shared.run_automatic(instance_id, followed, signals).await;
        });

        drop(lease);
        Ok(ActionOutcome::Dispatched {
            job_uuid: job.job_uuid,
            migration: record,
        })
    }

    async fn run_manual(
        self: Arc<Self>,
        instance_id: String,
        phase: Phase,
        job: JobHandle,
        signals: JobSignalStream,
    ) {
        let started = Instant::now();
        let observed = self.follow(&instance_id, phase, signals).await;
        ACTION_DURATION
            .with_label_values(&[phase.as_str()])
            .observe(started.elapsed().as_secs_f64());

        let (_lease, settled) = self.settle_retrying(&instance_id, phase, &job, observed).await;
        match settled {
            Settled::Finished(record) => {
                self.finish(&instance_id, &job, WatchEvent::end(&record)).await;
            }
            Settled::Superseded => self.clear_active(&instance_id, &job).await,
        }
    }

    /// Chain begin, sync and switch, stopping at the first sub-action that
    /// does not succeed. Watchers see one stream and one `end`.
    async fn run_automatic(
        self: Arc<Self>,
        instance_id: String,
        mut job: JobHandle,
        mut signals: JobSignalStream,
    ) {
        let mut phase = Phase::Begin;

        loop {
            let started = Instant::now();
            let observed = self.follow(&instance_id, phase, signals).await;
            ACTION_DURATION
                .with_label_values(&[phase.as_str()])
                .observe(started.elapsed().as_secs_f64());

            let (_lease, settled) = self.settle_retrying(&instance_id, phase, &job, observed).await;
            let record = match settled {
                Settled::Finished(record) => record,
                Settled::Superseded => {
                    self.clear_active(&instance_id, &job).await;
                    info!("Automatic migration of {} was superseded", instance_id);
                    AUTOMATIC_MIGRATIONS.with_label_values(&["superseded"]).inc();
                    return;
                }
            };

            let interrupted = self
                .active
                .read()
                .await
                .get(&instance_id)
                .map_or(true, |a| a.in_flight.pause_requested || a.in_flight.abort_requested);

            let next = match next_phase(&record) {
                Some(next) if !interrupted => next,
                _ => {
                    info!(
                        "Automatic migration of {} ended at {} ({})",
                        instance_id, record.phase, record.state
                    );
                    AUTOMATIC_MIGRATIONS
                        .with_label_values(&[record.state.as_str()])
                        .inc();
                    self.finish(&instance_id, &job, WatchEvent::end(&record)).await;
                    return;
                }
            };

            // Same checks as a manual request for the next sub-action.
            let mut end = WatchEvent::end(&record);
            let launched = match plan(Some(&record), None, MigrationAction::from(next), false) {
                Ok(_) => self.launch(record, next, true).await,
                Err(e) => Err(e),
            };
            match launched {
                Ok((next_job, next_signals, _)) => {
                    if let Some(active) = self.active.write().await.get_mut(&instance_id) {
                        active.job = next_job.clone();
                        active.in_flight.phase = next;
                    }
                    job = next_job;
                    signals = next_signals;
                    phase = next;
                }
                Err(e) => {
                    warn!(
                        "Automatic migration of {} could not start {}: {}",
                        instance_id, next, e
                    );
                    AUTOMATIC_MIGRATIONS.with_label_values(&["failed"]).inc();
                    end.message = format!(
                        "automatic migration stopped, could not start {}: {}",
                        next, e
                    );
                    self.finish(&instance_id, &job, end).await;
                    return;
                }
            }
        }
    }

    /// Republish progress until the job reports a result.
    async fn follow(
        &self,
        instance_id: &str,
        phase: Phase,
        mut signals: JobSignalStream,
    ) -> Observed {
        let mut current_progress = 0;
        let mut transfer = None;

        while let Some(signal) = signals.next().await {
            let terminal = match signal {
                JobSignal::Progress(progress) => {
                    let event = progress_event(phase, &progress, current_progress);
                    current_progress = event.current_progress;
                    if let (Some(rate), Some(eta)) =
                        (event.transfer_bytes_per_second, event.eta_ms)
                    {
                        transfer = Some((rate, eta));
                    }
                    self.broadcaster.publish(instance_id, event);
                    continue;
                }
                JobSignal::Succeeded { message } => Terminal::Succeeded(message),
                JobSignal::Failed { error } => Terminal::Failed(error),
                JobSignal::Stopped { message } => Terminal::Stopped(message),
            };
            return Observed {
                terminal,
                current_progress,
                transfer,
            };
        }

        warn!(
            "Signal stream of {} job for {} ended without a result",
            phase, instance_id
        );
        Observed {
            terminal: Terminal::Failed(format!("{} job ended without reporting a result", phase)),
            current_progress,
            transfer,
        }
    }

    /// Settle the job under the instance lease, retrying with capped
    /// exponential backoff while the store fails. The lease is released
    /// between attempts so an abort can take the instance over meanwhile.
    /// Returns with the lease held.
    async fn settle_retrying(
        &self,
        instance_id: &str,
        phase: Phase,
        job: &JobHandle,
        observed: Observed,
    ) -> (InstanceLease, Settled) {
        let max_delay = Duration::from_millis(self.config.settle_retry_max_ms);
        let mut delay = Duration::from_millis(self.config.settle_retry_initial_ms);
        let mut attempt = 1u32;

        loop {
            let lease = self.locks.acquire(instance_id).await;
            match self.settle(instance_id, phase, job, observed.clone()) {
                Ok(settled) => return (lease, settled),
                Err(e) => {
                    SETTLE_RETRIES.with_label_values(&[phase.as_str()]).inc();
                    error!(
                        "Failed to record the result of {} job {} for {} (attempt {}), retrying in {:?}: {}",
                        phase,
                        job.job_uuid,
                        lease.instance_id(),
                        attempt,
                        delay,
                        e
                    );
                }
            }
            drop(lease);

            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(max_delay);
            attempt += 1;
        }
    }

    /// Append the action's history entry, unless the record moved on to
    /// another job. The caller holds the instance lease.
    fn settle(
        &self,
        instance_id: &str,
        phase: Phase,
        job: &JobHandle,
        observed: Observed,
    ) -> Result<Settled, MigrationError> {
        let Some(record) = self.store.get(instance_id)? else {
            warn!(
                "Migration record of {} is gone, dropping result of {} job {}",
                instance_id, phase, job.job_uuid
            );
            return Ok(Settled::Superseded);
        };

        if record.job_id.as_deref() != Some(job.job_uuid.as_str()) {
            info!(
                "Ignoring result of superseded {} job {} for {}",
                phase, job.job_uuid, instance_id
            );
            return Ok(Settled::Superseded);
        }

        let update = completion(phase, observed);
        let state = update.state;
        let record = self.store.append_progress(instance_id, update)?;

        ACTIONS_COMPLETED
            .with_label_values(&[phase.as_str(), state.as_str()])
            .inc();
        info!(
            "Migration {} of {} finished: {}",
            phase, instance_id, state
        );
        Ok(Settled::Finished(record))
    }

    /// Follow the job of a record that was running before a restart.
    pub(super) async fn resume(
        self: &Arc<Self>,
        record: MigrationRecord,
    ) -> Result<bool, MigrationError> {
        let lease = self.locks.acquire(&record.instance_id).await;

        let Some(job_id) = record.job_id.clone() else {
            self.abandon(&record, format!("{} was interrupted by a restart", record.phase))?;
            return Ok(false);
        };
        let job = JobHandle::new(job_id);

        let signals = match self.engine.subscribe(&job).await {
            Ok(signals) => signals,
            Err(e) => {
                warn!(
                    "Could not resume job {} for {}: {}",
                    job.job_uuid, record.instance_id, e
                );
                self.abandon(&record, format!("lost track of {} job: {}", record.phase, e))?;
                return Ok(false);
            }
        };

        let instance_id = record.instance_id.clone();
        let phase = record.phase;
        self.broadcaster.open(&instance_id);
        self.set_active(&instance_id, job.clone(), phase, false).await;

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            shared.run_manual(instance_id, phase, job, signals).await;
        });

        drop(lease);
        Ok(true)
    }

    fn abandon(&self, record: &MigrationRecord, message: String) -> Result<(), MigrationError> {
        debug!("Marking migration of {} failed: {}", record.instance_id, message);
        self.store.append_progress(
            &record.instance_id,
            AppendProgress {
                phase: record.phase,
                state: MigrationState::Failed,
                entry: ProgressEntry::failed(record.phase, 0, message),
            },
        )?;
        Ok(())
    }
}

/// Phase an automatic migration continues with after `record` settled.
fn next_phase(record: &MigrationRecord) -> Option<Phase> {
    if record.state != MigrationState::Paused {
        return None;
    }
    let last_succeeded = record
        .last_entry_for(record.phase)
        .is_some_and(|e| e.is_successful());
    match record.phase {
        Phase::Begin if last_succeeded => Some(Phase::Sync),
        Phase::Sync if last_succeeded => Some(Phase::Switch),
        _ => None,
    }
}

/// Watch event for a progress tick. Progress is reported in percent, never
/// goes backwards and stays below completion until the job succeeds. Only
/// sync reports a transfer rate, and only together with an ETA.
fn progress_event(phase: Phase, progress: &JobProgress, previous: u32) -> WatchEvent {
    let percent = if progress.total_progress == 0 {
        0
    } else {
        let scaled = u64::from(progress.current_progress) * u64::from(PROGRESS_COMPLETE)
            / u64::from(progress.total_progress);
        scaled.min(u64::from(PROGRESS_COMPLETE - 1)) as u32
    };

    let message = if progress.message.is_empty() {
        format!("{} running", phase)
    } else {
        progress.message.clone()
    };

    let mut event = WatchEvent::progress(phase, percent.max(previous), PROGRESS_COMPLETE, message);
    if phase == Phase::Sync {
        if let (Some(rate), Some(eta)) = (progress.transfer_bytes_per_second, progress.eta_ms) {
            event.transfer_bytes_per_second = Some(rate);
            event.eta_ms = Some(eta);
        }
    }
    event
}

/// History entry and resulting record phase/state for a settled job.
fn completion(phase: Phase, observed: Observed) -> AppendProgress {
    let current = observed.current_progress;
    match observed.terminal {
        Terminal::Succeeded(message) => {
            let message = if message.is_empty() {
                format!("{} completed", phase)
            } else {
                message
            };
            let mut entry = ProgressEntry::successful(phase, message);
            if phase == Phase::Sync {
                let (rate, eta) = observed.transfer.unzip();
                entry = entry.with_transfer(rate, eta);
            }
            let state = match phase {
                Phase::Begin | Phase::Sync => MigrationState::Paused,
                Phase::Switch => MigrationState::Successful,
                Phase::Abort => MigrationState::Failed,
            };
            AppendProgress {
                phase,
                state,
                entry,
            }
        }
        Terminal::Failed(error) => AppendProgress {
            phase,
            state: MigrationState::Failed,
            entry: ProgressEntry::failed(phase, current, error),
        },
        Terminal::Stopped(message) => {
            let message = if message.is_empty() {
                format!("{} paused", phase)
            } else {
                format!("{} paused: {}", phase, message)
            };
            let state = match phase {
                Phase::Begin | Phase::Sync => MigrationState::Paused,
                Phase::Switch | Phase::Abort => MigrationState::Failed,
            };
            AppendProgress {
                phase,
                state,
                entry: ProgressEntry::failed(phase, current, message),
            }
        }
    }
}
