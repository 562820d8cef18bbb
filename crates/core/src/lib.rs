pub mod config;
pub mod directory;
pub mod jobs;
pub mod metrics;
pub mod migration;
pub mod orchestrator;
pub mod placement;
pub mod policy;
pub mod testing;

pub use config::{
    load_config, load_config_from_str, validate_config, Config, ConfigError, MigrationConfig,
    SanitizedConfig, ServiceConfig,
};
pub use directory::{HttpInstanceDirectory, InstanceDirectory, InstanceInfo};
pub use jobs::{HttpJobEngine, JobEngine, JobHandle, JobSignal, JobSpec};
pub use migration::{
    EventBroadcaster, MigrationAction, MigrationError, MigrationFilter, MigrationRecord,
    MigrationState, MigrationStore, Phase, ProgressEntry, ProgressState, SqliteMigrationStore,
    WatchEvent, WatchEventKind,
};
pub use orchestrator::{ActionOutcome, ActionRequest, MigrationOrchestrator};
pub use placement::{HttpPlacementService, PlacementService};
