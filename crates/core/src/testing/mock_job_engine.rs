//! Mock job engine for testing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::channel::mpsc;
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};

use crate::jobs::{
    JobEngine, JobEngineError, JobHandle, JobProgress, JobSignal, JobSignalStream, JobSpec,
};
use crate::migration::Phase;

use super::MockInstanceDirectory;

/// A recorded job submission for test assertions.
#[derive(Debug, Clone)]
pub struct RecordedJob {
    pub job_uuid: String,
    pub spec: JobSpec,
    pub timestamp: DateTime<Utc>,
}

struct MockJob {
    spec: JobSpec,
    stop: watch::Sender<bool>,
}

/// Mock implementation of the JobEngine trait.
///
/// Each job plays a short script once subscribed to:
/// - begin: one progress tick, then success
/// - sync: three progress ticks with distinct messages, a transfer rate and
///   an ETA, then success
/// - switch and abort: one progress tick, then success
///
/// Phases can be made to fail ([`fail_phase`](Self::fail_phase)) or to wait
/// before reporting a result until released
/// ([`hold_phase`](Self::hold_phase)). A stopped job answers with `Stopped`.
///
/// # Example
///
/// ```rust,ignore
/// let engine = MockJobEngine::new();
/// engine.hold_phase(Phase::Sync).await;
///
/// // ... dispatch sync, observe it running ...
///
/// engine.release_phase(Phase::Sync).await;
/// ```
pub struct MockJobEngine {
    submitted: Arc<RwLock<Vec<RecordedJob>>>,
    jobs: Arc<RwLock<HashMap<String, MockJob>>>,
    failing: Arc<RwLock<HashMap<Phase, String>>>,
    held: watch::Sender<HashSet<Phase>>,
    /// If set, the next submit will fail with this error.
    next_error: Arc<RwLock<Option<JobEngineError>>>,
    counter: AtomicU32,
    directory: Option<MockInstanceDirectory>,
}

impl Default for MockJobEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockJobEngine {
    pub fn new() -> Self {
        let (held, _) = watch::channel(HashSet::new());
        Self {
            submitted: Arc::new(RwLock::new(Vec::new())),
            jobs: Arc::new(RwLock::new(HashMap::new())),
            failing: Arc::new(RwLock::new(HashMap::new())),
            held,
            next_error: Arc::new(RwLock::new(None)),
            counter: AtomicU32::new(0),
            directory: None,
        }
    }

    /// Mock engine whose successful switch jobs update the directory:
    /// with override identifiers the source is destroyed and the target
    /// instance created, otherwise the source moves to the target server.
    pub fn with_directory(directory: MockInstanceDirectory) -> Self {
        Self {
            directory: Some(directory),
            ..Self::new()
        }
    }

    /// All submitted jobs, in order.
    pub async fn submitted_jobs(&self) -> Vec<RecordedJob> {
        self.submitted.read().await.clone()
    }

    /// Phases of all submitted jobs, in order.
    pub async fn submitted_phases(&self) -> Vec<Phase> {
        self.submitted
            .read()
            .await
            .iter()
            .map(|j| j.spec.phase)
            .collect()
    }

    /// Make jobs of `phase` fail with `error`.
    pub async fn fail_phase(&self, phase: Phase, error: impl Into<String>) {
        self.failing.write().await.insert(phase, error.into());
    }

    /// Make jobs of `phase` wait before reporting a result.
    pub async fn hold_phase(&self, phase: Phase) {
        self.held.send_modify(|held| {
            held.insert(phase);
        });
    }

    /// Let held jobs of `phase` finish.
    pub async fn release_phase(&self, phase: Phase) {
        self.held.send_modify(|held| {
            held.remove(&phase);
        });
    }

    pub async fn set_next_error(&self, error: JobEngineError) {
        *self.next_error.write().await = Some(error);
    }

    /// Register a job as if it had been submitted by an earlier process.
    pub async fn adopt_job(&self, job_uuid: &str, spec: JobSpec) {
        let (stop, _) = watch::channel(false);
        self.jobs
            .write()
            .await
            .insert(job_uuid.to_string(), MockJob { spec, stop });
    }

    /// Whether `stop` was called for a job.
    pub async fn was_stopped(&self, job_uuid: &str) -> bool {
        self.jobs
            .read()
            .await
            .get(job_uuid)
            .is_some_and(|job| *job.stop.borrow())
    }

    fn script(spec: &JobSpec) -> Vec<JobProgress> {
        match spec.phase {
            Phase::Sync => (1..=3u32)
                .map(|pass| JobProgress {
                    current_progress: pass * 25,
                    total_progress: 100,
                    transfer_bytes_per_second: Some(u64::from(pass) * 8 * 1024 * 1024),
                    eta_ms: Some(u64::from(4 - pass) * 1000),
                    message: format!("syncing pass {} of 3", pass),
                })
                .collect(),
            phase => vec![JobProgress {
                current_progress: 50,
                total_progress: 100,
                transfer_bytes_per_second: None,
                eta_ms: None,
                message: format!("{} in progress", phase),
            }],
        }
    }
}

/// Plays one job's script into its signal channel.
async fn feed(
    spec: JobSpec,
    failure: Option<String>,
    tx: mpsc::UnboundedSender<JobSignal>,
    mut stop: watch::Receiver<bool>,
    mut held: watch::Receiver<HashSet<Phase>>,
    directory: Option<MockInstanceDirectory>,
) {
    let stopped = JobSignal::Stopped {
        message: String::new(),
    };

    for tick in MockJobEngine::script(&spec) {
        if *stop.borrow() {
            let _ = tx.unbounded_send(stopped);
            return;
        }
        if tx.unbounded_send(JobSignal::Progress(tick)).is_err() {
            return;
        }
        tokio::task::yield_now().await;
    }

    loop {
        if *stop.borrow() {
            let _ = tx.unbounded_send(stopped);
            return;
        }
        if !held.borrow().contains(&spec.phase) {
            break;
        }
        tokio::select! {
            changed = stop.changed() => if changed.is_err() { return },
            changed = held.changed() => if changed.is_err() { return },
        }
    }

    let signal = match failure {
        Some(error) => JobSignal::Failed { error },
        None => {
            if spec.phase == Phase::Switch {
                if let Some(directory) = &directory {
                    apply_switch(directory, &spec).await;
                }
            }
            JobSignal::Succeeded {
                message: format!("{} completed", spec.phase),
            }
        }
    };
    let _ = tx.unbounded_send(signal);
}

async fn apply_switch(directory: &MockInstanceDirectory, spec: &JobSpec) {
    let target_server = spec
        .target_server_uuid
        .clone()
        .unwrap_or_else(|| spec.source_server_uuid.clone());

    if spec.override_uuid.is_some() || spec.override_alias.is_some() {
        if let Some(mut target) = directory.instance(&spec.vm_uuid).await {
            target.uuid = spec.target_vm_uuid.clone();
            target.server_uuid = target_server;
            target.state = "running".to_string();
            if let Some(alias) = &spec.override_alias {
                target.alias = Some(alias.clone());
            }
            directory.add_instance(target).await;
        }
        directory.destroy(&spec.vm_uuid).await;
    } else {
        directory.relocate(&spec.vm_uuid, &target_server).await;
    }
}

#[async_trait]
impl JobEngine for MockJobEngine {
    async fn submit(&self, spec: JobSpec) -> Result<JobHandle, JobEngineError> {
        if let Some(error) = self.next_error.write().await.take() {
            return Err(error);
        }

        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let job_uuid = format!("job-{:04}", n);

        self.submitted.write().await.push(RecordedJob {
            job_uuid: job_uuid.clone(),
            spec: spec.clone(),
            timestamp: Utc::now(),
        });
        let (stop, _) = watch::channel(false);
        self.jobs
            .write()
            .await
            .insert(job_uuid.clone(), MockJob { spec, stop });

        Ok(JobHandle::new(job_uuid))
    }

    async fn subscribe(&self, job: &JobHandle) -> Result<JobSignalStream, JobEngineError> {
        let (spec, stop) = {
            let jobs = self.jobs.read().await;
            let mock = jobs
                .get(&job.job_uuid)
                .ok_or_else(|| JobEngineError::JobNotFound(job.job_uuid.clone()))?;
            (mock.spec.clone(), mock.stop.subscribe())
        };
        let failure = self.failing.read().await.get(&spec.phase).cloned();

        let (tx, rx) = mpsc::unbounded();
        tokio::spawn(feed(
            spec,
            failure,
            tx,
            stop,
            self.held.subscribe(),
            self.directory.clone(),
        ));

        Ok(rx.boxed())
    }

    async fn stop(&self, job: &JobHandle) -> Result<(), JobEngineError> {
        let jobs = self.jobs.read().await;
        let mock = jobs
            .get(&job.job_uuid)
            .ok_or_else(|| JobEngineError::JobNotFound(job.job_uuid.clone()))?;
        mock.stop.send_replace(true);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
