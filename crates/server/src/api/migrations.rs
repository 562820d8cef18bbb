//! Migration action and record endpoints.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error};
use migrator_core::{
    ActionOutcome, ActionRequest, MigrationError, MigrationFilter, MigrationRecord,
    MigrationState, Phase, ProgressEntry,
};

use crate::state::AppState;

/// Error body returned by every migration endpoint.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: &'static str,
    pub message: String,
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);

pub(crate) fn error_response(e: MigrationError) -> ApiError {
    let status =
        StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        error!("Migration request failed: {}", e);
    } else {
        debug!("Migration request rejected: {}", e);
    }
    (
        status,
        Json(ErrorResponse {
            code: e.code(),
            message: e.to_string(),
        }),
    )
}

/// Query parameters of `POST /vms/{uuid}`.
#[derive(Debug, Default, Deserialize)]
pub struct ActionParams {
    pub action: Option<String>,
    pub migration_action: Option<String>,
    pub override_uuid: Option<String>,
    pub override_alias: Option<String>,
    pub migration_automatic: Option<String>,
}

/// Migration record as presented to API clients.
#[derive(Debug, Serialize)]
pub struct MigrationView {
    pub vm_uuid: String,
    pub source_server_uuid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_server_uuid: Option<String>,
    pub target_vm_uuid: String,
    pub phase: Phase,
    pub state: MigrationState,
    pub automatic: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub override_uuid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub override_alias: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_uuid: Option<String>,
    pub progress_history: Vec<ProgressEntry>,
    pub created_timestamp: DateTime<Utc>,
    pub updated_timestamp: DateTime<Utc>,
}

impl From<MigrationRecord> for MigrationView {
    fn from(record: MigrationRecord) -> Self {
        Self {
            vm_uuid: record.instance_id,
            source_server_uuid: record.source_server_id,
            target_server_uuid: record.target_server_id,
            target_vm_uuid: record.target_instance_id,
            phase: record.phase,
            state: record.state,
            automatic: record.automatic,
            override_uuid: record.override_instance_id,
            override_alias: record.override_alias,
            job_uuid: record.job_id,
            progress_history: record.progress_history,
            created_timestamp: record.created_at,
            updated_timestamp: record.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ActionResponse {
    pub job_uuid: String,
    pub migration: MigrationView,
}

#[derive(Debug, Serialize)]
pub struct EstimateResponse {
    pub size: u64,
}

/// Run a migrate sub-action on a VM.
///
/// Dispatched actions answer 202 with the job id; `estimate` answers 200
/// with the size in bytes.
pub async fn vm_action(
    State(state): State<Arc<AppState>>,
    Path(uuid): Path<String>,
    Query(params): Query<ActionParams>,
) -> Result<Response, ApiError> {
    let automatic = parse_flag("migration_automatic", params.migration_automatic.as_deref())
        .map_err(error_response)?;

    let request = ActionRequest {
        instance_id: uuid,
        action: params.action,
        migration_action: params.migration_action,
        override_uuid: params.override_uuid,
        override_alias: params.override_alias,
        automatic,
    };

    let outcome = state
        .orchestrator()
        .request(request)
        .await
        .map_err(error_response)?;

    Ok(match outcome {
        ActionOutcome::Dispatched {
            job_uuid,
            migration,
        } => (
            StatusCode::ACCEPTED,
            Json(ActionResponse {
                job_uuid,
                migration: migration.into(),
            }),
        )
            .into_response(),
        ActionOutcome::Estimated { size } => Json(EstimateResponse { size }).into_response(),
    })
}

/// Query parameters of `GET /vms/{uuid}/migrate`.
#[derive(Debug, Default, Deserialize)]
pub struct GetParams {
    pub format: Option<String>,
}

/// Get the migration record of a VM.
pub async fn get_migration(
    State(state): State<Arc<AppState>>,
    Path(uuid): Path<String>,
    Query(params): Query<GetParams>,
) -> Result<Response, ApiError> {
    let raw = is_raw(params.format.as_deref()).map_err(error_response)?;
    let record = state.orchestrator().get(&uuid).map_err(error_response)?;

    Ok(if raw {
        Json(record).into_response()
    } else {
        Json(MigrationView::from(record)).into_response()
    })
}

/// Query parameters of `GET /migrations`.
#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub format: Option<String>,
    pub source_vm_uuid: Option<String>,
    pub state: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// List migration records.
pub async fn list_migrations(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Result<Response, ApiError> {
    let raw = is_raw(params.format.as_deref()).map_err(error_response)?;
    let filter = build_filter(&params).map_err(error_response)?;
    let records = state.orchestrator().list(&filter).map_err(error_response)?;

    Ok(if raw {
        Json(records).into_response()
    } else {
        let views: Vec<MigrationView> = records.into_iter().map(MigrationView::from).collect();
        Json(views).into_response()
    })
}

fn build_filter(params: &ListParams) -> Result<MigrationFilter, MigrationError> {
    let mut filter = MigrationFilter::new();

    if let Some(ref uuid) = params.source_vm_uuid {
        filter = filter.with_instance(uuid.clone());
    }
    if let Some(ref state) = params.state {
        let state = state
            .parse::<MigrationState>()
            .map_err(MigrationError::InvalidArgument)?;
        filter = filter.with_state(state);
    }
    if let Some(limit) = params.limit {
        if !(1..=1000).contains(&limit) {
            return Err(MigrationError::InvalidArgument(format!(
                "limit must be between 1 and 1000, got {}",
                limit
            )));
        }
        filter = filter.with_limit(limit);
    }
    if let Some(offset) = params.offset {
        if offset < 0 {
            return Err(MigrationError::InvalidArgument(format!(
                "offset must not be negative, got {}",
                offset
            )));
        }
        filter = filter.with_offset(offset);
    }

    Ok(filter)
}

fn is_raw(format: Option<&str>) -> Result<bool, MigrationError> {
    match format {
        None => Ok(false),
        Some("raw") => Ok(true),
        Some(other) => Err(MigrationError::InvalidArgument(format!(
            "unsupported format: {}",
            other
        ))),
    }
}

fn parse_flag(name: &str, value: Option<&str>) -> Result<bool, MigrationError> {
    match value {
        None | Some("false") | Some("0") => Ok(false),
        Some("true") | Some("1") => Ok(true),
        Some(other) => Err(MigrationError::InvalidArgument(format!(
            "{} must be a boolean, got {:?}",
            name, other
        ))),
    }
}
