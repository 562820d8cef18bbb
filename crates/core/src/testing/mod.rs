//! Testing utilities and mock implementations of the external services.
//!
//! # Example
//!
//! ```rust,ignore
//! use migrator_core::testing::{fixtures, MockInstanceDirectory, MockJobEngine, MockPlacementService};
//!
//! let directory = MockInstanceDirectory::new();
//! directory.add_instance(fixtures::instance("vm-1", "cn-1")).await;
//! let engine = MockJobEngine::with_directory(directory.clone());
//! let placement = MockPlacementService::with_servers(["cn-1", "cn-2"]);
//! ```

mod mock_directory;
mod mock_job_engine;
mod mock_placement;

pub use mock_directory::MockInstanceDirectory;
pub use mock_job_engine::{MockJobEngine, RecordedJob};
pub use mock_placement::MockPlacementService;

/// Test fixtures and helper functions.
pub mod fixtures {
    use std::collections::BTreeMap;

    use chrono::Utc;

    use crate::directory::{DiskInfo, InstanceInfo};
    use crate::migration::{MigrationRecord, MigrationState, Phase};

    /// A running instance with 1 GiB of RAM and one 10 GiB disk.
    pub fn instance(uuid: &str, server_uuid: &str) -> InstanceInfo {
        InstanceInfo {
            uuid: uuid.to_string(),
            alias: Some(format!("alias-{}", uuid)),
            server_uuid: server_uuid.to_string(),
            state: "running".to_string(),
            ram_mb: 1024,
            quota_gb: Some(10),
            disks: vec![DiskInfo { size_mb: 10240 }],
            tags: BTreeMap::new(),
            internal_metadata: BTreeMap::new(),
        }
    }

    /// A core infrastructure instance (`smartdc_type=core`).
    pub fn core_instance(uuid: &str, server_uuid: &str) -> InstanceInfo {
        let mut vm = instance(uuid, server_uuid);
        vm.tags.insert("smartdc_type".to_string(), "core".to_string());
        vm
    }

    /// A NAT instance (`smartdc_role=nat`).
    pub fn nat_instance(uuid: &str, server_uuid: &str) -> InstanceInfo {
        let mut vm = instance(uuid, server_uuid);
        vm.tags.insert("smartdc_role".to_string(), "nat".to_string());
        vm
    }

    /// A record whose begin is running toward `cn-target`.
    pub fn record(instance_id: &str, source_server_id: &str) -> MigrationRecord {
        let now = Utc::now();
        MigrationRecord {
            instance_id: instance_id.to_string(),
            source_server_id: source_server_id.to_string(),
            target_server_id: Some("cn-target".to_string()),
            target_instance_id: instance_id.to_string(),
            phase: Phase::Begin,
            state: MigrationState::Running,
            automatic: false,
            override_instance_id: None,
            override_alias: None,
            job_id: None,
            progress_history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}
