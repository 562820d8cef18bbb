//! Migration records, progress entries and watch events.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Progress value reported when an action completes.
pub const PROGRESS_COMPLETE: u32 = 100;

/// The migration stage last attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Provision the target instance.
    Begin,
    /// Copy disk and memory state to the target. May repeat.
    Sync,
    /// Final sync and cut-over. Irreversible once dispatched.
    Switch,
    /// Tear down the target and give up the migration.
    Abort,
}

impl Phase {
    /// Returns the string representation for API responses and storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Begin => "begin",
            Phase::Sync => "sync",
            Phase::Switch => "switch",
            Phase::Abort => "abort",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "begin" => Ok(Phase::Begin),
            "sync" => Ok(Phase::Sync),
            "switch" => Ok(Phase::Switch),
            "abort" => Ok(Phase::Abort),
            other => Err(format!("unknown migration phase: {}", other)),
        }
    }
}

/// Execution status of the current phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    Running,
    Paused,
    Successful,
    Failed,
}

impl MigrationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationState::Running => "running",
            MigrationState::Paused => "paused",
            MigrationState::Successful => "successful",
            MigrationState::Failed => "failed",
        }
    }
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(MigrationState::Running),
            "paused" => Ok(MigrationState::Paused),
            "successful" => Ok(MigrationState::Successful),
            "failed" => Ok(MigrationState::Failed),
            other => Err(format!("unknown migration state: {}", other)),
        }
    }
}

/// Outcome recorded in a progress entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressState {
    Running,
    Successful,
    Failed,
}

impl ProgressState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressState::Running => "running",
            ProgressState::Successful => "successful",
            ProgressState::Failed => "failed",
        }
    }
}

impl FromStr for ProgressState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(ProgressState::Running),
            "successful" => Ok(ProgressState::Successful),
            "failed" => Ok(ProgressState::Failed),
            other => Err(format!("unknown progress state: {}", other)),
        }
    }
}

/// Sub-action requested through the action endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationAction {
    Begin,
    Sync,
    Switch,
    Abort,
    Pause,
    Estimate,
}

impl MigrationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationAction::Begin => "begin",
            MigrationAction::Sync => "sync",
            MigrationAction::Switch => "switch",
            MigrationAction::Abort => "abort",
            MigrationAction::Pause => "pause",
            MigrationAction::Estimate => "estimate",
        }
    }
}

impl From<Phase> for MigrationAction {
    fn from(phase: Phase) -> Self {
        match phase {
            Phase::Begin => MigrationAction::Begin,
            Phase::Sync => MigrationAction::Sync,
            Phase::Switch => MigrationAction::Switch,
            Phase::Abort => MigrationAction::Abort,
        }
    }
}

impl fmt::Display for MigrationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "begin" => Ok(MigrationAction::Begin),
            "sync" => Ok(MigrationAction::Sync),
            "switch" => Ok(MigrationAction::Switch),
            "abort" => Ok(MigrationAction::Abort),
            "pause" => Ok(MigrationAction::Pause),
            "estimate" => Ok(MigrationAction::Estimate),
            other => Err(format!("unknown migration action: {}", other)),
        }
    }
}

/// One completed action in a record's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub phase: Phase,
    pub state: ProgressState,
    pub current_progress: u32,
    pub total_progress: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_bytes_per_second: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_ms: Option<u64>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEntry {
    /// Entry for an action that finished successfully.
    pub fn successful(phase: Phase, message: impl Into<String>) -> Self {
        Self {
            phase,
            state: ProgressState::Successful,
            current_progress: PROGRESS_COMPLETE,
            total_progress: PROGRESS_COMPLETE,
            transfer_bytes_per_second: None,
            eta_ms: None,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// Entry for an action that did not finish. `current_progress` is the
    /// last progress observed and stays below the total.
    pub fn failed(phase: Phase, current_progress: u32, message: impl Into<String>) -> Self {
        Self {
            phase,
            state: ProgressState::Failed,
            current_progress: current_progress.min(PROGRESS_COMPLETE - 1),
            total_progress: PROGRESS_COMPLETE,
            transfer_bytes_per_second: None,
            eta_ms: None,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn is_successful(&self) -> bool {
        self.state == ProgressState::Successful
    }

    /// Attach a transfer rate. The rate is only kept together with an ETA.
    pub fn with_transfer(mut self, bytes_per_second: Option<u64>, eta_ms: Option<u64>) -> Self {
        if let (Some(rate), Some(eta)) = (bytes_per_second, eta_ms) {
            self.transfer_bytes_per_second = Some(rate);
            self.eta_ms = Some(eta);
        }
        self
    }
}

/// Per-source-instance migration record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub instance_id: String,
    pub source_server_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_server_id: Option<String>,
    pub target_instance_id: String,
    pub phase: Phase,
    pub state: MigrationState,
    pub automatic: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_instance_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_alias: Option<String>,
    /// Last job dispatched for this record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default)]
    pub progress_history: Vec<ProgressEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MigrationRecord {
    /// The most recent history entry for `phase`, if any.
    pub fn last_entry_for(&self, phase: Phase) -> Option<&ProgressEntry> {
        self.progress_history.iter().rev().find(|e| e.phase == phase)
    }

    /// Returns true if the most recent sync finished successfully.
    pub fn last_sync_succeeded(&self) -> bool {
        self.last_entry_for(Phase::Sync)
            .is_some_and(|e| e.state == ProgressState::Successful)
    }
}

/// Kind of watch event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchEventKind {
    Progress,
    End,
}

/// Event streamed to watchers while an action runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchEvent {
    #[serde(rename = "type")]
    pub kind: WatchEventKind,
    pub phase: Phase,
    pub state: MigrationState,
    pub current_progress: u32,
    pub total_progress: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_bytes_per_second: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_ms: Option<u64>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl WatchEvent {
    /// Progress tick for a running action.
    pub fn progress(
        phase: Phase,
        current_progress: u32,
        total_progress: u32,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind: WatchEventKind::Progress,
            phase,
            state: MigrationState::Running,
            current_progress,
            total_progress,
            transfer_bytes_per_second: None,
            eta_ms: None,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// Final event of an action, carrying the phase and state reached.
    pub fn end(record: &MigrationRecord) -> Self {
        let last = record.progress_history.last();
        Self {
            kind: WatchEventKind::End,
            phase: record.phase,
            state: record.state,
            current_progress: last.map(|e| e.current_progress).unwrap_or(0),
            total_progress: last.map(|e| e.total_progress).unwrap_or(PROGRESS_COMPLETE),
            transfer_bytes_per_second: None,
            eta_ms: None,
            message: last.map(|e| e.message.clone()).unwrap_or_default(),
            timestamp: Utc::now(),
        }
    }

    pub fn is_end(&self) -> bool {
        self.kind == WatchEventKind::End
    }
}
