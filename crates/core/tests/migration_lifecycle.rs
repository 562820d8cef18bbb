//! Migration lifecycle integration tests.
//!
//! These tests drive migrations through the orchestrator against mock
//! services: begin -> sync* -> switch, plus pause, abort, automatic
//! migrations and recovery after a restart.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tempfile::TempDir;

use migrator_core::jobs::{JobEngineError, JobSpec};
use migrator_core::migration::{AppendProgress, MigrationFilter, MigrationStore, StoreError};
use migrator_core::testing::{fixtures, MockInstanceDirectory, MockJobEngine, MockPlacementService};
use migrator_core::{
    ActionOutcome, ActionRequest, InstanceDirectory, JobEngine, MigrationConfig, MigrationError,
    MigrationOrchestrator, MigrationRecord, MigrationState, Phase, PlacementService,
    ProgressEntry, ProgressState, SqliteMigrationStore, WatchEvent,
};

const VM: &str = "vm-1";
const OVERRIDE_UUID: &str = "5f2e1a3c-8a5d-4b7e-9c1f-2d3e4f5a6b7c";
const TIMEOUT: Duration = Duration::from_secs(5);

/// Test helper wiring an orchestrator to mock services and a file-backed
/// store.
struct TestHarness {
    store: Arc<SqliteMigrationStore>,
    directory: MockInstanceDirectory,
    engine: Arc<MockJobEngine>,
    placement: Arc<MockPlacementService>,
    orchestrator: MigrationOrchestrator,
    _temp_dir: TempDir,
}

impl TestHarness {
    async fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = Arc::new(
            SqliteMigrationStore::new(&temp_dir.path().join("test.db"))
                .expect("Failed to create store"),
        );

        let directory = MockInstanceDirectory::new();
        directory.add_instance(fixtures::instance(VM, "cn-1")).await;
        let engine = Arc::new(MockJobEngine::with_directory(directory.clone()));
        let placement = Arc::new(MockPlacementService::with_servers(["cn-1", "cn-2"]));

        let orchestrator = Self::orchestrator(&store, &directory, &engine, &placement);

        Self {
            store,
            directory,
            engine,
            placement,
            orchestrator,
            _temp_dir: temp_dir,
        }
    }

    fn orchestrator(
        store: &Arc<SqliteMigrationStore>,
        directory: &MockInstanceDirectory,
        engine: &Arc<MockJobEngine>,
        placement: &Arc<MockPlacementService>,
    ) -> MigrationOrchestrator {
        MigrationOrchestrator::new(
            MigrationConfig::default(),
            Arc::clone(store) as Arc<dyn MigrationStore>,
            Arc::clone(engine) as Arc<dyn JobEngine>,
            Arc::clone(placement) as Arc<dyn PlacementService>,
            Arc::new(directory.clone()) as Arc<dyn InstanceDirectory>,
        )
    }

    async fn act(&self, action: &str) -> Result<ActionOutcome, MigrationError> {
        self.orchestrator
            .request(ActionRequest::migrate(VM, action))
            .await
    }

    /// Run an action and wait until its result is recorded.
    async fn act_and_wait(&self, action: &str) -> MigrationRecord {
        let before = self.history_len();
        self.act(action).await.expect("action should be accepted");
        self.wait_for(|r| r.state != MigrationState::Running && r.progress_history.len() > before)
            .await
    }

    fn history_len(&self) -> usize {
        self.store
            .get(VM)
            .unwrap()
            .map_or(0, |r| r.progress_history.len())
    }

    async fn wait_for<F>(&self, predicate: F) -> MigrationRecord
    where
        F: Fn(&MigrationRecord) -> bool,
    {
        let start = std::time::Instant::now();
        loop {
            if let Some(record) = self.store.get(VM).unwrap() {
                if predicate(&record) {
                    // Let the monitor release the instance.
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    return record;
                }
            }
            if start.elapsed() > TIMEOUT {
                panic!("timed out waiting for record: {:?}", self.store.get(VM));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Collect a watch stream until it closes.
    async fn collect_watch(&self) -> Vec<WatchEvent> {
        tokio::time::timeout(TIMEOUT, self.orchestrator.watch(VM).collect::<Vec<_>>())
            .await
            .expect("watch stream should close")
    }
}

/// Store whose next `append_progress` calls fail, as a locked or full disk
/// would make them.
struct FlakyStore {
    inner: Arc<SqliteMigrationStore>,
    failures: AtomicUsize,
}

impl FlakyStore {
    fn new(inner: &Arc<SqliteMigrationStore>, failures: usize) -> Self {
        Self {
            inner: Arc::clone(inner),
            failures: AtomicUsize::new(failures),
        }
    }

    fn remaining_failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }
}

impl MigrationStore for FlakyStore {
    fn get(&self, instance_id: &str) -> Result<Option<MigrationRecord>, StoreError> {
        self.inner.get(instance_id)
    }

    fn list(&self, filter: &MigrationFilter) -> Result<Vec<MigrationRecord>, StoreError> {
        self.inner.list(filter)
    }

    fn put(&self, record: &MigrationRecord) -> Result<(), StoreError> {
        self.inner.put(record)
    }

    fn append_progress(
        &self,
        instance_id: &str,
        update: AppendProgress,
    ) -> Result<MigrationRecord, StoreError> {
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(StoreError::Database("database is locked".to_string()));
        }
        self.inner.append_progress(instance_id, update)
    }
}

/// Orchestrator over `harness`'s mocks whose store fails `failures` times.
fn flaky_orchestrator(
    harness: &TestHarness,
    failures: usize,
    retry_initial_ms: u64,
) -> (MigrationOrchestrator, Arc<FlakyStore>) {
    let store = Arc::new(FlakyStore::new(&harness.store, failures));
    let config = MigrationConfig {
        settle_retry_initial_ms: retry_initial_ms,
        ..MigrationConfig::default()
    };
    let orchestrator = MigrationOrchestrator::new(
        config,
        Arc::clone(&store) as Arc<dyn MigrationStore>,
        Arc::clone(&harness.engine) as Arc<dyn JobEngine>,
        Arc::clone(&harness.placement) as Arc<dyn PlacementService>,
        Arc::new(harness.directory.clone()) as Arc<dyn InstanceDirectory>,
    );
    (orchestrator, store)
}

fn assert_precondition(result: Result<ActionOutcome, MigrationError>) {
    match result {
        Err(MigrationError::PreconditionFailed(_)) => {}
        other => panic!("expected PreconditionFailed, got {:?}", other),
    }
}

fn assert_sync_entries_have_eta(record: &MigrationRecord) {
    for entry in &record.progress_history {
        if entry.transfer_bytes_per_second.is_some() {
            assert!(entry.eta_ms.is_some(), "rate without eta: {:?}", entry);
        }
    }
}

#[tokio::test]
async fn test_no_record_only_begin_and_estimate() {
    let harness = TestHarness::new().await;

    for action in ["sync", "switch", "abort", "pause"] {
        match harness.act(action).await {
            Err(MigrationError::NotFound(_)) => {}
            other => panic!("{}: expected NotFound, got {:?}", action, other),
        }
    }

    match harness.act("estimate").await.unwrap() {
        ActionOutcome::Estimated { size } => assert!(size > 0),
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert!(harness.store.get(VM).unwrap().is_none());
    assert!(harness.engine.submitted_jobs().await.is_empty());
}

#[tokio::test]
async fn test_unknown_instance_not_found() {
    let harness = TestHarness::new().await;
    let result = harness
        .orchestrator
        .request(ActionRequest::migrate("vm-missing", "begin"))
        .await;
    assert!(matches!(result, Err(MigrationError::NotFound(_))));
}

#[tokio::test]
async fn test_begin() {
    let harness = TestHarness::new().await;

    let outcome = harness.act("begin").await.unwrap();
    let job_uuid = outcome.job_uuid().unwrap().to_string();
    match &outcome {
        ActionOutcome::Dispatched { migration, .. } => {
            assert_eq!(migration.state, MigrationState::Running);
            assert_eq!(migration.phase, Phase::Begin);
            assert_eq!(migration.job_id.as_deref(), Some(job_uuid.as_str()));
        }
        other => panic!("unexpected outcome: {:?}", other),
    }

    let record = harness
        .wait_for(|r| r.state == MigrationState::Paused)
        .await;
    assert_eq!(record.phase, Phase::Begin);
    assert_eq!(record.progress_history.len(), 1);
    assert_eq!(record.source_server_id, "cn-1");
    assert_eq!(record.target_server_id.as_deref(), Some("cn-2"));
    assert_eq!(record.target_instance_id, VM);

    let entry = &record.progress_history[0];
    assert_eq!(entry.state, ProgressState::Successful);
    assert_eq!(entry.current_progress, 100);
    assert_eq!(entry.total_progress, 100);

    // Placement was asked to avoid the source server.
    let requests = harness.placement.recorded_requests().await;
    assert_eq!(requests[0].exclude_servers, vec!["cn-1".to_string()]);
}

#[tokio::test]
async fn test_full_manual_migration() {
    let harness = TestHarness::new().await;

    harness.act_and_wait("begin").await;
    for _ in 0..3 {
        let record = harness.act_and_wait("sync").await;
        assert_eq!(record.phase, Phase::Sync);
        assert_eq!(record.state, MigrationState::Paused);
        assert!(record.last_sync_succeeded());
    }
    let record = harness.act_and_wait("switch").await;

    assert_eq!(record.phase, Phase::Switch);
    assert_eq!(record.state, MigrationState::Successful);
    assert!(record.progress_history.len() >= 5);
    assert!(record
        .progress_history
        .iter()
        .all(|e| e.state == ProgressState::Successful && e.current_progress == e.total_progress));
    assert_sync_entries_have_eta(&record);

    let vm = harness.directory.instance(VM).await.unwrap();
    assert_eq!(vm.server_uuid, "cn-2");
    assert_eq!(vm.state, "running");

    assert_eq!(
        harness.engine.submitted_phases().await,
        vec![Phase::Begin, Phase::Sync, Phase::Sync, Phase::Sync, Phase::Switch]
    );

    // A switched migration cannot be touched again.
    for action in ["begin", "sync", "switch", "abort", "pause"] {
        assert_precondition(harness.act(action).await);
    }
}

#[tokio::test]
async fn test_migration_with_overrides() {
    let harness = TestHarness::new().await;

    harness
        .orchestrator
        .request(
            ActionRequest::migrate(VM, "begin")
                .with_override_uuid(OVERRIDE_UUID)
                .with_override_alias("copy-of-vm-1"),
        )
        .await
        .unwrap();
    let record = harness
        .wait_for(|r| r.state == MigrationState::Paused)
        .await;
    assert_eq!(record.target_instance_id, OVERRIDE_UUID);
    assert_eq!(record.override_alias.as_deref(), Some("copy-of-vm-1"));
    // The copy may land next to the source.
    assert_eq!(record.target_server_id.as_deref(), Some("cn-1"));

    harness.act_and_wait("sync").await;
    let record = harness.act_and_wait("switch").await;
    assert_eq!(record.state, MigrationState::Successful);

    let source = harness.directory.instance(VM).await.unwrap();
    assert_eq!(source.state, "destroyed");
    let target = harness.directory.instance(OVERRIDE_UUID).await.unwrap();
    assert_eq!(target.state, "running");
    assert_eq!(target.alias.as_deref(), Some("copy-of-vm-1"));
}

#[tokio::test]
async fn test_override_uuid_must_differ_from_source() {
    let harness = TestHarness::new().await;
    harness
        .directory
        .add_instance(fixtures::instance(OVERRIDE_UUID, "cn-1"))
        .await;

    let result = harness
        .orchestrator
        .request(ActionRequest::migrate(OVERRIDE_UUID, "begin").with_override_uuid(OVERRIDE_UUID))
        .await;
    assert!(matches!(result, Err(MigrationError::InvalidArgument(_))));
}

#[tokio::test]
async fn test_no_target_server() {
    let harness = TestHarness::new().await;
    harness.placement.set_servers(vec!["cn-1".to_string()]).await;

    assert_precondition(harness.act("begin").await);
    assert!(harness.store.get(VM).unwrap().is_none());
}

#[tokio::test]
async fn test_phase_order_enforced() {
    let harness = TestHarness::new().await;
    harness.act_and_wait("begin").await;

    // switch needs a successful sync, begin cannot repeat, nothing to pause.
    assert_precondition(harness.act("switch").await);
    assert_precondition(harness.act("begin").await);
    assert_precondition(harness.act("pause").await);

    harness.act_and_wait("sync").await;
    assert_precondition(harness.act("begin").await);
    assert_precondition(harness.act("pause").await);
}

#[tokio::test]
async fn test_running_action_blocks_others() {
    let harness = TestHarness::new().await;
    harness.act_and_wait("begin").await;

    harness.engine.hold_phase(Phase::Sync).await;
    harness.act("sync").await.unwrap();

    for action in ["begin", "sync", "switch"] {
        assert_precondition(harness.act(action).await);
    }
    // Estimate is read-only and always allowed.
    assert!(harness.act("estimate").await.is_ok());

    harness.engine.release_phase(Phase::Sync).await;
    let record = harness
        .wait_for(|r| r.state == MigrationState::Paused && r.phase == Phase::Sync)
        .await;
    assert_eq!(record.progress_history.len(), 2);
}

#[tokio::test]
async fn test_concurrent_requests_one_wins() {
    let harness = TestHarness::new().await;
    harness.act_and_wait("begin").await;
    harness.engine.hold_phase(Phase::Sync).await;

    let first = harness.orchestrator.clone();
    let second = harness.orchestrator.clone();
    let (a, b) = tokio::join!(
        first.request(ActionRequest::migrate(VM, "sync")),
        second.request(ActionRequest::migrate(VM, "sync")),
    );

    let results = [a, b];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(
        results
            .iter()
            .filter(|r| matches!(r, Err(MigrationError::PreconditionFailed(_))))
            .count(),
        1
    );
    assert_eq!(
        harness.engine.submitted_phases().await,
        vec![Phase::Begin, Phase::Sync]
    );

    harness.engine.release_phase(Phase::Sync).await;
    harness
        .wait_for(|r| r.state == MigrationState::Paused && r.phase == Phase::Sync)
        .await;
}

#[tokio::test]
async fn test_pause_running_sync() {
    let harness = TestHarness::new().await;
    harness.act_and_wait("begin").await;

    harness.engine.hold_phase(Phase::Sync).await;
    let sync_job = harness.act("sync").await.unwrap().job_uuid().unwrap().to_string();

    let paused = harness.act("pause").await.unwrap();
    assert_eq!(paused.job_uuid(), Some(sync_job.as_str()));
    assert!(harness.engine.was_stopped(&sync_job).await);

    let record = harness
        .wait_for(|r| r.state == MigrationState::Paused && r.phase == Phase::Sync)
        .await;
    assert_eq!(record.progress_history.len(), 2);
    let last = record.progress_history.last().unwrap();
    assert_eq!(last.state, ProgressState::Failed);
    assert!(last.message.contains("paused"));
    assert!(last.current_progress < last.total_progress);

    // Pausing again, or switching after an interrupted sync, is refused.
    assert_precondition(harness.act("pause").await);
    assert_precondition(harness.act("switch").await);

    harness.engine.release_phase(Phase::Sync).await;
    let record = harness.act_and_wait("sync").await;
    assert!(record.last_sync_succeeded());
    let record = harness.act_and_wait("switch").await;
    assert_eq!(record.state, MigrationState::Successful);
}

#[tokio::test]
async fn test_abort_running_sync() {
    let harness = TestHarness::new().await;
    harness.act_and_wait("begin").await;

    harness.engine.hold_phase(Phase::Sync).await;
    let sync_job = harness.act("sync").await.unwrap().job_uuid().unwrap().to_string();

    let abort = harness.act("abort").await.unwrap();
    assert_ne!(abort.job_uuid(), Some(sync_job.as_str()));
    assert!(harness.engine.was_stopped(&sync_job).await);

    let record = harness
        .wait_for(|r| r.phase == Phase::Abort && r.state == MigrationState::Failed)
        .await;
    // The stopped sync was superseded and left no entry of its own.
    let phases: Vec<Phase> = record.progress_history.iter().map(|e| e.phase).collect();
    assert_eq!(phases, vec![Phase::Begin, Phase::Abort]);
    assert_eq!(
        record.progress_history.last().unwrap().state,
        ProgressState::Successful
    );

    for action in ["sync", "switch", "abort", "pause"] {
        assert_precondition(harness.act(action).await);
    }

    // An aborted migration can start over.
    harness.engine.release_phase(Phase::Sync).await;
    let record = harness.act_and_wait("begin").await;
    assert_eq!(record.phase, Phase::Begin);
    assert_eq!(record.state, MigrationState::Paused);
    assert_eq!(record.progress_history.len(), 3);
}

#[tokio::test]
async fn test_failed_sync_only_allows_abort() {
    let harness = TestHarness::new().await;
    harness.engine.fail_phase(Phase::Sync, "source disk unreadable").await;

    harness.act_and_wait("begin").await;
    let record = harness.act_and_wait("sync").await;
    assert_eq!(record.state, MigrationState::Failed);
    assert_eq!(record.phase, Phase::Sync);
    let last = record.progress_history.last().unwrap();
    assert_eq!(last.state, ProgressState::Failed);
    assert_eq!(last.message, "source disk unreadable");

    for action in ["begin", "sync", "switch", "pause"] {
        assert_precondition(harness.act(action).await);
    }

    let record = harness.act_and_wait("abort").await;
    assert_eq!(record.phase, Phase::Abort);
    assert_eq!(record.state, MigrationState::Failed);
}

#[tokio::test]
async fn test_submit_failure_leaves_no_record() {
    let harness = TestHarness::new().await;
    harness
        .engine
        .set_next_error(JobEngineError::ConnectionFailed("refused".to_string()))
        .await;

    let result = harness.act("begin").await;
    match result {
        Err(e @ MigrationError::JobEngine(_)) => assert_eq!(e.status_code(), 503),
        other => panic!("expected job engine error, got {:?}", other),
    }
    assert!(harness.store.get(VM).unwrap().is_none());

    // The next attempt goes through.
    harness.act_and_wait("begin").await;
}

#[tokio::test]
async fn test_watch_manual_sync() {
    let harness = TestHarness::new().await;
    harness.act_and_wait("begin").await;

    // Nothing in flight: the stream closes right away.
    assert!(harness.collect_watch().await.is_empty());

    harness.engine.hold_phase(Phase::Sync).await;
    harness.act("sync").await.unwrap();
    let watch = tokio::spawn({
        let stream = harness.orchestrator.watch(VM);
        async move { stream.collect::<Vec<_>>().await }
    });
    harness.engine.release_phase(Phase::Sync).await;

    let events = tokio::time::timeout(TIMEOUT, watch)
        .await
        .expect("watch stream should close")
        .unwrap();

    let ends: Vec<&WatchEvent> = events.iter().filter(|e| e.is_end()).collect();
    assert_eq!(ends.len(), 1);
    let end = events.last().unwrap();
    assert!(end.is_end());
    assert_eq!(end.phase, Phase::Sync);
    assert_eq!(end.state, MigrationState::Paused);

    let progress: Vec<&WatchEvent> = events.iter().filter(|e| !e.is_end()).collect();
    assert_eq!(progress.len(), 3);
    let mut last = 0;
    for event in progress {
        assert!(event.current_progress < event.total_progress);
        assert!(event.current_progress >= last);
        last = event.current_progress;
        if event.transfer_bytes_per_second.is_some() {
            assert!(event.eta_ms.is_some());
        }
    }
}

#[tokio::test]
async fn test_automatic_migration() {
    let harness = TestHarness::new().await;
    harness.engine.hold_phase(Phase::Begin).await;

    let outcome = harness
        .orchestrator
        .request(ActionRequest::migrate(VM, "begin").with_automatic(true))
        .await
        .unwrap();
    assert!(outcome.job_uuid().is_some());

    let watch = tokio::spawn({
        let stream = harness.orchestrator.watch(VM);
        async move { stream.collect::<Vec<_>>().await }
    });
    harness.engine.release_phase(Phase::Begin).await;

    let events = tokio::time::timeout(TIMEOUT, watch)
        .await
        .expect("watch stream should close")
        .unwrap();

    assert!(events.iter().any(|e| e.phase == Phase::Begin));
    let syncing: HashSet<&str> = events
        .iter()
        .filter(|e| e.phase == Phase::Sync && !e.is_end() && e.message.contains("syncing"))
        .map(|e| e.message.as_str())
        .collect();
    assert!(syncing.len() >= 3);

    assert_eq!(events.iter().filter(|e| e.is_end()).count(), 1);
    let end = events.last().unwrap();
    assert!(end.is_end());
    assert_eq!(end.phase, Phase::Switch);
    assert_eq!(end.state, MigrationState::Successful);

    let record = harness
        .wait_for(|r| r.state == MigrationState::Successful)
        .await;
    assert!(record.automatic);
    let phases: Vec<Phase> = record.progress_history.iter().map(|e| e.phase).collect();
    assert_eq!(phases, vec![Phase::Begin, Phase::Sync, Phase::Switch]);
    assert_sync_entries_have_eta(&record);

    let vm = harness.directory.instance(VM).await.unwrap();
    assert_eq!(vm.server_uuid, "cn-2");
}

#[tokio::test]
async fn test_automatic_migration_stops_at_failure() {
    let harness = TestHarness::new().await;
    harness.engine.fail_phase(Phase::Sync, "link down").await;

    harness
        .orchestrator
        .request(ActionRequest::migrate(VM, "begin").with_automatic(true))
        .await
        .unwrap();

    let record = harness
        .wait_for(|r| r.state == MigrationState::Failed)
        .await;
    assert_eq!(record.phase, Phase::Sync);
    assert_eq!(
        harness.engine.submitted_phases().await,
        vec![Phase::Begin, Phase::Sync]
    );
    assert_eq!(harness.orchestrator.active_count().await, 0);
}

#[tokio::test]
async fn test_automatic_only_with_begin() {
    let harness = TestHarness::new().await;
    harness.act_and_wait("begin").await;

    let result = harness
        .orchestrator
        .request(ActionRequest::migrate(VM, "sync").with_automatic(true))
        .await;
    assert!(matches!(result, Err(MigrationError::Conflict(_))));
}

#[tokio::test]
async fn test_protected_instances() {
    let harness = TestHarness::new().await;
    harness
        .directory
        .add_instance(fixtures::core_instance("vm-core", "cn-1"))
        .await;
    harness
        .directory
        .add_instance(fixtures::nat_instance("vm-nat", "cn-1"))
        .await;

    // Even with a record in place, nothing is allowed.
    let mut record = fixtures::record("vm-core", "cn-1");
    record.state = MigrationState::Paused;
    harness.store.put(&record).unwrap();

    for vm in ["vm-core", "vm-nat"] {
        for action in ["begin", "sync", "switch", "abort", "pause", "estimate"] {
            let result = harness
                .orchestrator
                .request(ActionRequest::migrate(vm, action))
                .await;
            assert!(
                matches!(result, Err(MigrationError::PreconditionFailed(_))),
                "{} {}: {:?}",
                vm,
                action,
                result
            );
        }
    }
    assert!(harness.engine.submitted_jobs().await.is_empty());
}

#[tokio::test]
async fn test_recover_running_migrations() {
    let harness = TestHarness::new().await;
    for vm in ["vm-2", "vm-3"] {
        harness.directory.add_instance(fixtures::instance(vm, "cn-1")).await;
    }

    // vm-1: sync job still known to the engine.
    let mut record = fixtures::record(VM, "cn-1");
    harness.store.put(&record).unwrap();
    harness
        .store
        .append_progress(
            VM,
            AppendProgress {
                phase: Phase::Begin,
                state: MigrationState::Paused,
                entry: ProgressEntry::successful(Phase::Begin, "begin completed"),
            },
        )
        .unwrap();
    record.phase = Phase::Sync;
    record.state = MigrationState::Running;
    record.job_id = Some("job-old".to_string());
    harness.store.put(&record).unwrap();
    harness
        .engine
        .adopt_job(
            "job-old",
            JobSpec {
                task: JobSpec::task_name(Phase::Sync),
                phase: Phase::Sync,
                vm_uuid: VM.to_string(),
                source_server_uuid: "cn-1".to_string(),
                target_server_uuid: Some("cn-target".to_string()),
                target_vm_uuid: VM.to_string(),
                override_uuid: None,
                override_alias: None,
                automatic: false,
            },
        )
        .await;

    // vm-2: no job recorded. vm-3: job unknown to the engine.
    harness.store.put(&fixtures::record("vm-2", "cn-1")).unwrap();
    let mut lost = fixtures::record("vm-3", "cn-1");
    lost.job_id = Some("job-gone".to_string());
    harness.store.put(&lost).unwrap();

    let restarted = TestHarness::orchestrator(
        &harness.store,
        &harness.directory,
        &harness.engine,
        &harness.placement,
    );
    assert_eq!(restarted.recover().await, 1);

    let record = harness
        .wait_for(|r| r.state == MigrationState::Paused && r.phase == Phase::Sync)
        .await;
    assert!(record.last_sync_succeeded());

    for vm in ["vm-2", "vm-3"] {
        let record = harness.store.get(vm).unwrap().unwrap();
        assert_eq!(record.state, MigrationState::Failed);
        assert_eq!(record.progress_history.len(), 1);
        assert_eq!(record.progress_history[0].state, ProgressState::Failed);
    }
}

#[tokio::test]
async fn test_result_recorded_after_store_failures() {
    let harness = TestHarness::new().await;
    let (orchestrator, store) = flaky_orchestrator(&harness, 2, 10);

    harness.engine.hold_phase(Phase::Begin).await;
    orchestrator
        .request(ActionRequest::migrate(VM, "begin"))
        .await
        .unwrap();
    let watch = tokio::spawn({
        let stream = orchestrator.watch(VM);
        async move { stream.collect::<Vec<_>>().await }
    });
    harness.engine.release_phase(Phase::Begin).await;

    let record = harness
        .wait_for(|r| r.state != MigrationState::Running)
        .await;
    assert_eq!(store.remaining_failures(), 0);
    assert_eq!(record.phase, Phase::Begin);
    assert_eq!(record.state, MigrationState::Paused);
    assert_eq!(record.progress_history.len(), 1);
    assert_eq!(record.progress_history[0].state, ProgressState::Successful);

    // Watchers only hear about the result once it is stored.
    let events = tokio::time::timeout(TIMEOUT, watch)
        .await
        .expect("watch stream should close")
        .unwrap();
    assert_eq!(events.iter().filter(|e| e.is_end()).count(), 1);
    let end = events.last().unwrap();
    assert_eq!(end.phase, Phase::Begin);
    assert_eq!(end.state, MigrationState::Paused);
    assert_eq!(orchestrator.active_count().await, 0);

    // The migration carries on normally.
    orchestrator
        .request(ActionRequest::migrate(VM, "sync"))
        .await
        .unwrap();
    let record = harness
        .wait_for(|r| r.phase == Phase::Sync && r.state == MigrationState::Paused)
        .await;
    assert!(record.last_sync_succeeded());
}

#[tokio::test]
async fn test_abort_while_result_cannot_be_stored() {
    let harness = TestHarness::new().await;
    let (orchestrator, store) = flaky_orchestrator(&harness, 1, 500);

    let begin_job = orchestrator
        .request(ActionRequest::migrate(VM, "begin"))
        .await
        .unwrap()
        .job_uuid()
        .unwrap()
        .to_string();

    // The begin result failed to store; its monitor still owns the action.
    let start = std::time::Instant::now();
    while store.remaining_failures() > 0 {
        assert!(start.elapsed() < TIMEOUT, "begin never settled");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(orchestrator.active_count().await, 1);
    assert_eq!(harness.store.get(VM).unwrap().unwrap().state, MigrationState::Running);

    // Abort gets the instance between two attempts and supersedes begin.
    let abort_job = orchestrator
        .request(ActionRequest::migrate(VM, "abort"))
        .await
        .unwrap()
        .job_uuid()
        .unwrap()
        .to_string();
    assert_ne!(abort_job, begin_job);

    let record = harness
        .wait_for(|r| r.phase == Phase::Abort && r.state == MigrationState::Failed)
        .await;
    let phases: Vec<Phase> = record.progress_history.iter().map(|e| e.phase).collect();
    assert_eq!(phases, vec![Phase::Abort]);

    // The retried begin result is dropped once it runs.
    tokio::time::sleep(Duration::from_millis(700)).await;
    let record = harness.store.get(VM).unwrap().unwrap();
    assert_eq!(record.phase, Phase::Abort);
    assert_eq!(record.progress_history.len(), 1);
    assert_eq!(orchestrator.active_count().await, 0);
}

#[tokio::test]
async fn test_pause_refused_without_monitor() {
    let harness = TestHarness::new().await;

    // Running record left behind with nobody following its job.
    let mut record = fixtures::record(VM, "cn-1");
    record.job_id = Some("job-orphan".to_string());
    harness.store.put(&record).unwrap();

    match harness.act("pause").await {
        Err(MigrationError::PreconditionFailed(message)) => {
            assert!(message.contains("no task is following"), "{}", message)
        }
        other => panic!("expected PreconditionFailed, got {:?}", other),
    }
    assert!(harness.engine.submitted_jobs().await.is_empty());

    // Abort still cleans it up.
    let record = harness.act_and_wait("abort").await;
    assert_eq!(record.phase, Phase::Abort);
    assert_eq!(record.state, MigrationState::Failed);
    assert_eq!(
        record.progress_history.last().unwrap().state,
        ProgressState::Successful
    );
}

#[tokio::test]
async fn test_automatic_migration_reports_launch_failure() {
    let harness = TestHarness::new().await;
    harness.engine.hold_phase(Phase::Begin).await;

    harness
        .orchestrator
        .request(ActionRequest::migrate(VM, "begin").with_automatic(true))
        .await
        .unwrap();
    let watch = tokio::spawn({
        let stream = harness.orchestrator.watch(VM);
        async move { stream.collect::<Vec<_>>().await }
    });

    // Begin succeeds, submitting sync does not.
    harness
        .engine
        .set_next_error(JobEngineError::ConnectionFailed("refused".to_string()))
        .await;
    harness.engine.release_phase(Phase::Begin).await;

    let events = tokio::time::timeout(TIMEOUT, watch)
        .await
        .expect("watch stream should close")
        .unwrap();
    assert_eq!(events.iter().filter(|e| e.is_end()).count(), 1);
    let end = events.last().unwrap();
    assert!(end.is_end());
    assert_eq!(end.phase, Phase::Begin);
    assert_eq!(end.state, MigrationState::Paused);
    assert!(
        end.message.contains("could not start sync"),
        "{}",
        end.message
    );
    assert!(end.message.contains("refused"), "{}", end.message);

    let record = harness
        .wait_for(|r| r.state == MigrationState::Paused)
        .await;
    assert_eq!(record.phase, Phase::Begin);
    assert_eq!(record.progress_history.len(), 1);
    assert_eq!(harness.engine.submitted_phases().await, vec![Phase::Begin]);
    assert_eq!(harness.orchestrator.active_count().await, 0);
}
