//! Phase state machine.
//!
//! `plan` decides what a migrate sub-action does given the committed record
//! and the in-flight action, without side effects. The orchestrator executes
//! the returned [`Transition`].

use super::{MigrationAction, MigrationError, MigrationRecord, MigrationState, Phase};

/// What is known about the action currently in flight for an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InFlight {
    /// Phase of the running (or next, for an automatic chain) sub-action.
    pub phase: Phase,
    /// Part of an automatic chain.
    pub automatic: bool,
    /// A pause has been requested and the job has not stopped yet.
    pub pause_requested: bool,
    /// An abort has been requested.
    pub abort_requested: bool,
}

/// Outcome of validating a sub-action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Dispatch a job for `phase`. `restart` is set when `begin` starts over
    /// on a record that was aborted.
    Dispatch { phase: Phase, restart: bool },
    /// Ask the running job to stop; the record becomes paused when it does.
    Pause { job_id: Option<String> },
    /// Stop the running job if there is one, then dispatch the abort job.
    Abort { stop_job_id: Option<String> },
    /// Read-only size estimate.
    Estimate,
}

/// Coarse position of a record in the phase state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    None,
    Running(Phase),
    /// `begin` or `sync` finished (or was stopped) and waits for the next
    /// action.
    Paused(Phase),
    SwitchDone,
    Failed(Phase),
}

impl Position {
    /// Position of a record, taking the in-flight action into account. An
    /// automatic chain between two sub-actions counts as running.
    pub fn of(record: Option<&MigrationRecord>, in_flight: Option<&InFlight>) -> Self {
        if let Some(in_flight) = in_flight {
            return Position::Running(in_flight.phase);
        }
        let Some(record) = record else {
            return Position::None;
        };
        match record.state {
            MigrationState::Running => Position::Running(record.phase),
            MigrationState::Paused => Position::Paused(record.phase),
            MigrationState::Successful => Position::SwitchDone,
            MigrationState::Failed => Position::Failed(record.phase),
        }
    }

    fn describe(&self) -> String {
        match self {
            Position::None => "no migration".to_string(),
            Position::Running(phase) => format!("migration {} is running", phase),
            Position::Paused(phase) => format!("migration is paused after {}", phase),
            Position::SwitchDone => "migration has already switched".to_string(),
            Position::Failed(phase) => format!("migration failed during {}", phase),
        }
    }
}

/// Validate `action` against the current record and in-flight action.
pub fn plan(
    record: Option<&MigrationRecord>,
    in_flight: Option<&InFlight>,
    action: MigrationAction,
    automatic: bool,
) -> Result<Transition, MigrationError> {
    if automatic && action != MigrationAction::Begin {
        return Err(MigrationError::Conflict(format!(
            "migration_automatic can only be used with begin, not {}",
            action
        )));
    }

    if action == MigrationAction::Estimate {
        return Ok(Transition::Estimate);
    }

    let position = Position::of(record, in_flight);
    let chain = if in_flight.is_some_and(|f| f.automatic) {
        "automatic "
    } else {
        ""
    };
    let denied = |what: &str| {
        Err(MigrationError::precondition(format!(
            "cannot {}: {}{}",
            what,
            chain,
            position.describe()
        )))
    };

    let Some(record) = record else {
        return match action {
            _ if in_flight.is_some() => denied(action.as_str()),
            MigrationAction::Begin => Ok(Transition::Dispatch {
                phase: Phase::Begin,
                restart: false,
            }),
            _ => Err(MigrationError::NotFound(format!(
                "no migration found for this instance, cannot {}",
                action
            ))),
        };
    };

    match (position, action) {
        // Only a followed job can be paused: its monitor records the stop.
        (Position::Running(phase), MigrationAction::Pause) => match in_flight {
            None => denied("pause, no task is following the running job"),
            Some(f) if f.pause_requested => denied("pause, a pause is already pending"),
            Some(f) if f.abort_requested => denied("pause"),
            _ if matches!(phase, Phase::Begin | Phase::Sync) => Ok(Transition::Pause {
                job_id: record.job_id.clone(),
            }),
            _ => denied("pause"),
        },
        (Position::Running(phase), MigrationAction::Abort) => match in_flight {
            Some(f) if f.abort_requested => denied("abort"),
            _ if matches!(phase, Phase::Begin | Phase::Sync) => Ok(Transition::Abort {
                stop_job_id: record.job_id.clone(),
            }),
            _ => denied("abort, switch cannot be undone"),
        },
        (Position::Running(_), other) => denied(other.as_str()),

        (Position::Paused(Phase::Begin), MigrationAction::Begin) => {
            // A begin that was paused before it finished is resumed.
            if record.last_entry_for(Phase::Begin).is_some_and(|e| e.is_successful()) {
                denied("begin")
            } else {
                Ok(Transition::Dispatch {
                    phase: Phase::Begin,
                    restart: false,
                })
            }
        }
        (Position::Paused(Phase::Begin), MigrationAction::Sync) => {
            if record.last_entry_for(Phase::Begin).is_some_and(|e| e.is_successful()) {
                Ok(Transition::Dispatch {
                    phase: Phase::Sync,
                    restart: false,
                })
            } else {
                denied("sync before begin has completed")
            }
        }
        (Position::Paused(Phase::Sync), MigrationAction::Sync) => Ok(Transition::Dispatch {
            phase: Phase::Sync,
            restart: false,
        }),
        (Position::Paused(Phase::Sync), MigrationAction::Switch) => {
            if record.last_sync_succeeded() {
                Ok(Transition::Dispatch {
                    phase: Phase::Switch,
                    restart: false,
                })
            } else {
                denied("switch without a successful sync")
            }
        }
        (Position::Paused(_), MigrationAction::Abort) => Ok(Transition::Abort { stop_job_id: None }),
        (Position::Paused(Phase::Begin), MigrationAction::Switch) => {
            denied("switch without a successful sync")
        }
        (Position::Paused(_), other) => denied(other.as_str()),

        (Position::Failed(Phase::Begin | Phase::Sync), MigrationAction::Abort) => {
            Ok(Transition::Abort { stop_job_id: None })
        }
        (Position::Failed(Phase::Abort), MigrationAction::Begin) => {
            if record.last_entry_for(Phase::Abort).is_some_and(|e| e.is_successful()) {
                Ok(Transition::Dispatch {
                    phase: Phase::Begin,
                    restart: true,
                })
            } else {
                denied("begin, the previous abort did not complete")
            }
        }
        (Position::Failed(Phase::Abort), MigrationAction::Abort) => {
            // Retry of an abort that failed.
            if record.last_entry_for(Phase::Abort).is_some_and(|e| e.is_successful()) {
                denied("abort")
            } else {
                Ok(Transition::Abort { stop_job_id: None })
            }
        }
        (Position::Failed(_), other) => denied(other.as_str()),

        (Position::SwitchDone, other) => denied(other.as_str()),

        (Position::None, other) => denied(other.as_str()),
    }
}
