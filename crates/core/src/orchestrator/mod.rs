//! Migration orchestrator.
//!
//! Validates migrate requests against the phase state machine, dispatches one
//! job per accepted action, and follows each job's signals until it settles:
//! - **Requests**: serialized per instance through the lease table
//! - **Monitoring**: one task per running action, driven by job signals
//! - **Automatic migrations**: one task chaining begin, sync and switch

mod monitor;
mod runner;
mod types;

pub use runner::MigrationOrchestrator;
pub use types::{ActionOutcome, ActionRequest};
