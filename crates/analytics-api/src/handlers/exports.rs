use axum::{
    Extension, Json,
    extract::{Path, State},
    response::IntoResponse,
};

use funnelcast_common::error::AppError;
use funnelcast_common::ids::{IdKind, parse_id};
use funnelcast_common::tenant::TenantContext;

use crate::export::ExportRequest;
use crate::state::AppState;

pub async fn create_export(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Path(funnel_id): Path<String>,
    Json(request): Json<ExportRequest>,
) -> Result<impl IntoResponse, AppError> {
    let funnel_id = parse_id(IdKind::Funnel, &funnel_id)?;
    let created = state.export_manager.create_export(ctx, funnel_id, &request).await?;
    Ok((axum::http::StatusCode::ACCEPTED, Json(created)))
}

pub async fn export_status(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Path(export_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let export_id = parse_id(IdKind::Export, &export_id)?;
    let status = state.export_manager.export_status(ctx, export_id)?;
    Ok(Json(status))
}
