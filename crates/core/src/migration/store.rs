//! Migration record storage trait and types.

use thiserror::Error;

use super::{MigrationRecord, MigrationState, Phase, ProgressEntry};

/// Error type for record store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No record exists for the instance.
    #[error("migration record not found: {0}")]
    NotFound(String),

    /// Database error.
    #[error("database error: {0}")]
    Database(String),
}

/// Completion of one action: the history entry to append and the
/// phase/state the record ends up in.
#[derive(Debug, Clone)]
pub struct AppendProgress {
    pub phase: Phase,
    pub state: MigrationState,
    pub entry: ProgressEntry,
}

/// Filter for listing migration records.
#[derive(Debug, Clone, Default)]
pub struct MigrationFilter {
    /// Only the record of this source instance.
    pub instance_id: Option<String>,
    /// Only records in this state.
    pub state: Option<MigrationState>,
    /// Maximum number of results.
    pub limit: i64,
    /// Offset for pagination.
    pub offset: i64,
}

impl MigrationFilter {
    /// Create a new filter with defaults.
    pub fn new() -> Self {
        Self {
            instance_id: None,
            state: None,
            limit: 1000,
            offset: 0,
        }
    }

    pub fn with_instance(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    pub fn with_state(mut self, state: MigrationState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }
}

/// Trait for migration record storage backends.
///
/// Every write is atomic: readers see either the previous committed record or
/// the new one, never a mix.
pub trait MigrationStore: Send + Sync {
    /// Get the record for a source instance.
    fn get(&self, instance_id: &str) -> Result<Option<MigrationRecord>, StoreError>;

    /// List records matching the filter, oldest first.
    fn list(&self, filter: &MigrationFilter) -> Result<Vec<MigrationRecord>, StoreError>;

    /// Insert or replace the record header (everything except history, which
    /// is append-only).
    fn put(&self, record: &MigrationRecord) -> Result<(), StoreError>;

    /// Append one history entry and set the resulting phase/state in a single
    /// transaction. Returns the committed record.
    fn append_progress(
        &self,
        instance_id: &str,
        update: AppendProgress,
    ) -> Result<MigrationRecord, StoreError>;
}
