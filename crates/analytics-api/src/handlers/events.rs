use axum::{Extension, Json, extract::State, response::IntoResponse};
use serde::{Deserialize, Serialize};

use funnelcast_common::error::AppError;
use funnelcast_common::event::{EventRecord, validate_event_record};
use funnelcast_common::tenant::TenantContext;

use crate::state::AppState;

/// Maximum number of events in a single batch.
const MAX_BATCH_SIZE: usize = 100;

#[derive(Debug, Deserialize)]
pub struct EventBatch {
    pub events: Vec<EventRecord>,
}

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub accepted: usize,
    pub rejected: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// Contract with the upstream ingestion pipeline: already-normalized event
/// records are queued for the realtime tracker. Acceptance is per event;
/// tracker processing itself is best-effort and never reports back here.
pub async fn ingest_events(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Json(batch): Json<EventBatch>,
) -> Result<impl IntoResponse, AppError> {
    if batch.events.is_empty() {
        return Err(AppError::Validation("Batch must contain at least 1 event".to_string()));
    }
    if batch.events.len() > MAX_BATCH_SIZE {
        return Err(AppError::PayloadTooLarge(format!(
            "Batch must contain at most {MAX_BATCH_SIZE} events, got {}",
            batch.events.len()
        )));
    }

    let mut accepted = 0;
    let mut errors: Vec<String> = Vec::new();

    for event in batch.events {
        if event.tenant_id != ctx.tenant_id || event.workspace_id != ctx.workspace_id {
            errors.push(format!("event {}: tenant scope mismatch", event.event_id));
            continue;
        }
        if let Err(validation_errors) = validate_event_record(&event) {
            errors.push(format!("event {}: {}", event.event_id, validation_errors.join("; ")));
            continue;
        }
        match state.tracker.submit(event) {
            Ok(()) => accepted += 1,
            Err(e) => errors.push(e.to_string()),
        }
    }

    let rejected = errors.len();
    Ok((
        axum::http::StatusCode::ACCEPTED,
        Json(IngestResponse { accepted, rejected, errors }),
    ))
}
