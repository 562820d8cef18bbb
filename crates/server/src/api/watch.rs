//! Newline-delimited JSON stream of migration progress.

use axum::{
    body::Body,
    extract::{Path, State},
    http::header,
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::metrics::WATCH_STREAMS_OPENED;
use crate::state::AppState;

/// Stream the events of the action running on a VM, one JSON object per
/// line. The response ends after the `end` event, or right away when no
/// action is running.
pub async fn watch_migration(
    State(state): State<Arc<AppState>>,
    Path(uuid): Path<String>,
) -> Response {
    debug!("Watch opened for {}", uuid);
    WATCH_STREAMS_OPENED.inc();

    let lines = state
        .orchestrator()
        .watch(&uuid)
        .filter_map(|event| async move {
            match serde_json::to_string(&event) {
                Ok(mut line) => {
                    line.push('\n');
                    Some(Ok::<_, Infallible>(line))
                }
                Err(e) => {
                    warn!("Failed to encode watch event: {}", e);
                    None
                }
            }
        });

    (
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(lines),
    )
        .into_response()
}
