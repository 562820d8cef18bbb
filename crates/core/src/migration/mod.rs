//! Migration records, their storage, the phase state machine and the watch
//! event fan-out.

mod broadcast;
mod error;
mod locks;
pub mod machine;
mod sqlite_store;
mod store;
mod types;

pub use broadcast::{EventBroadcaster, WatchStream};
pub use error::MigrationError;
pub use locks::{InstanceLease, InstanceLocks};
pub use machine::{plan, InFlight, Position, Transition};
pub use sqlite_store::SqliteMigrationStore;
pub use store::{AppendProgress, MigrationFilter, MigrationStore, StoreError};
pub use types::{
    MigrationAction, MigrationRecord, MigrationState, Phase, ProgressEntry, ProgressState,
    WatchEvent, WatchEventKind, PROGRESS_COMPLETE,
};
