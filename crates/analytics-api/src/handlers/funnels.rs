use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use funnelcast_common::cache::{AnalyticsCache, CacheClass};
use funnelcast_common::error::AppError;
use funnelcast_common::funnel::{StepDefinition, StepMatchRule, VersionState};
use funnelcast_common::ids::{IdKind, format_id, parse_id};
use funnelcast_common::tenant::TenantContext;

use crate::db::funnels as db;
use crate::state::AppState;

// ── Response types ──────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct FunnelResponse {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<DateTime<Utc>>,
    pub versions: Vec<VersionResponse>,
    pub publications: Vec<PublicationResponse>,
}

#[derive(Debug, Serialize)]
pub struct VersionResponse {
    pub id: String,
    pub version: i32,
    pub state: String,
    pub created_at: DateTime<Utc>,
    pub steps: Vec<StepResponse>,
}

#[derive(Debug, Serialize)]
pub struct StepResponse {
    pub id: String,
    pub order_index: i32,
    pub step_type: String,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub matches: Vec<StepMatchRule>,
}

#[derive(Debug, Serialize)]
pub struct PublicationResponse {
    pub id: String,
    pub version: i32,
    pub published_at: DateTime<Utc>,
    pub window_days: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub snapshot_data: serde_json::Value,
}

impl From<db::FunnelDetail> for FunnelResponse {
    fn from(detail: db::FunnelDetail) -> Self {
        Self {
            id: format_id(IdKind::Funnel, detail.funnel.id),
            name: detail.funnel.name,
            description: detail.funnel.description,
            created_at: detail.funnel.created_at,
            updated_at: detail.funnel.updated_at,
            archived_at: detail.funnel.archived_at,
            versions: detail
                .versions
                .into_iter()
                .map(|version| VersionResponse {
                    id: format_id(IdKind::FunnelVersion, version.row.id),
                    version: version.row.version,
                    state: version.row.state,
                    created_at: version.row.created_at,
                    steps: version
                        .steps
                        .into_iter()
                        .map(|step| StepResponse {
                            id: format_id(IdKind::Step, step.id),
                            order_index: step.definition.order_index,
                            step_type: step.definition.step_type.as_str().to_string(),
                            label: step.definition.label,
                            metadata: step.definition.metadata,
                            matches: step.definition.matches,
                        })
                        .collect(),
                })
                .collect(),
            publications: detail
                .publications
                .into_iter()
                .map(|publication| PublicationResponse {
                    id: format_id(IdKind::Publication, publication.id),
                    version: publication.version,
                    published_at: publication.published_at,
                    window_days: publication.window_days,
                    notes: publication.notes,
                    snapshot_data: publication.snapshot_data,
                })
                .collect(),
        }
    }
}

// ── Inputs ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateFunnelInput {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub steps: Vec<StepDefinition>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateFunnelInput {
    pub name: Option<String>,
    pub description: Option<String>,
    pub steps: Option<Vec<StepDefinition>>,
}

#[derive(Debug, Deserialize)]
pub struct ListFunnelsQuery {
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
    pub search: Option<String>,
    pub state: Option<String>,
    #[serde(default)]
    pub include_archived: bool,
}

fn default_page() -> i64 {
    1
}

fn default_limit() -> i64 {
    20
}

#[derive(Debug, Deserialize)]
pub struct PublishQuery {
    pub version: i32,
}

#[derive(Debug, Deserialize)]
pub struct PublishInput {
    #[serde(default = "default_window_days")]
    pub window_days: i32,
    #[serde(default)]
    pub notes: Option<String>,
}

impl Default for PublishInput {
    fn default() -> Self {
        Self { window_days: default_window_days(), notes: None }
    }
}

fn default_window_days() -> i32 {
    30
}

#[derive(Debug, Serialize)]
pub struct ListFunnelsResponse {
    pub items: Vec<FunnelResponse>,
    pub total_count: i64,
    pub page: i64,
    pub limit: i64,
    pub summary: db::FunnelSummary,
}

// ── Handlers ────────────────────────────────────────────────────────

async fn invalidate(state: &AppState, ctx: TenantContext, funnel_id: i64) {
    state.cache.invalidate_funnel(funnel_id, ctx.tenant_id, ctx.workspace_id);
    state.tracker.invalidate_definitions(ctx).await;
}

pub async fn create_funnel(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Json(input): Json<CreateFunnelInput>,
) -> Result<impl IntoResponse, AppError> {
    let detail = db::create_funnel(
        &state.db_pool,
        ctx,
        db::NewFunnelInput {
            name: input.name,
            description: input.description,
            steps: input.steps,
        },
    )?;

    invalidate(&state, ctx, detail.funnel.id).await;
    Ok((
        axum::http::StatusCode::CREATED,
        Json(FunnelResponse::from(detail)),
    ))
}

pub async fn list_funnels(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Query(query): Query<ListFunnelsQuery>,
) -> Result<impl IntoResponse, AppError> {
    let key = AnalyticsCache::workspace_scoped_key(
        "funnel:list",
        ctx.tenant_id,
        ctx.workspace_id,
        &[
            ("includeArchived", query.include_archived.to_string()),
            ("limit", query.limit.to_string()),
            ("page", query.page.to_string()),
            ("search", query.search.clone().unwrap_or_default()),
            ("state", query.state.clone().unwrap_or_default()),
        ],
    );
    if let Some(cached) = state.cache.get::<serde_json::Value>(&key) {
        return Ok(Json(cached));
    }

    let state_filter = query
        .state
        .as_deref()
        .map(VersionState::parse)
        .transpose()?;

    let list = db::list_funnels(
        &state.db_pool,
        ctx,
        &db::ListFunnelsParams {
            page: query.page,
            limit: query.limit,
            search: query.search,
            state: state_filter,
            include_archived: query.include_archived,
        },
    )?;

    let response = serde_json::to_value(ListFunnelsResponse {
        items: list.items.into_iter().map(FunnelResponse::from).collect(),
        total_count: list.total_count,
        page: query.page.max(1),
        limit: query.limit,
        summary: list.summary,
    })
    .map_err(|e| AppError::Internal(format!("failed to serialise funnel list: {e}")))?;

    state.cache.set(&key, &response, CacheClass::FunnelList);
    Ok(Json(response))
}

pub async fn get_funnel(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Path(funnel_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let funnel_id = parse_id(IdKind::Funnel, &funnel_id)?;

    let key = AnalyticsCache::funnel_scoped_key(
        "funnel:config",
        funnel_id,
        ctx.tenant_id,
        ctx.workspace_id,
        &[],
    );
    if let Some(cached) = state.cache.get::<serde_json::Value>(&key) {
        return Ok(Json(cached));
    }

    let detail = db::get_funnel(&state.db_pool, ctx, funnel_id)?;
    let response = serde_json::to_value(FunnelResponse::from(detail))
        .map_err(|e| AppError::Internal(format!("failed to serialise funnel: {e}")))?;

    state.cache.set(&key, &response, CacheClass::FunnelConfig);
    Ok(Json(response))
}

pub async fn update_funnel(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Path(funnel_id): Path<String>,
    Json(input): Json<UpdateFunnelInput>,
) -> Result<impl IntoResponse, AppError> {
    let funnel_id = parse_id(IdKind::Funnel, &funnel_id)?;
    let detail = db::update_funnel(
        &state.db_pool,
        ctx,
        funnel_id,
        db::UpdateFunnelInput {
            name: input.name,
            description: input.description,
            steps: input.steps,
        },
    )?;

    invalidate(&state, ctx, funnel_id).await;
    Ok(Json(FunnelResponse::from(detail)))
}

pub async fn archive_funnel(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Path(funnel_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let funnel_id = parse_id(IdKind::Funnel, &funnel_id)?;
    let detail = db::archive_funnel(&state.db_pool, ctx, funnel_id)?;

    invalidate(&state, ctx, funnel_id).await;
    Ok(Json(FunnelResponse::from(detail)))
}

pub async fn publish_funnel(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Path(funnel_id): Path<String>,
    Query(query): Query<PublishQuery>,
    input: Option<Json<PublishInput>>,
) -> Result<impl IntoResponse, AppError> {
    let funnel_id = parse_id(IdKind::Funnel, &funnel_id)?;
    let Json(input) = input.unwrap_or_default();

    let publication = db::publish_funnel(
        &state.db_pool,
        ctx,
        funnel_id,
        query.version,
        input.window_days,
        input.notes,
    )?;

    invalidate(&state, ctx, funnel_id).await;
    Ok((
        axum::http::StatusCode::CREATED,
        Json(PublicationResponse {
            id: format_id(IdKind::Publication, publication.id),
            version: publication.version,
            published_at: publication.published_at,
            window_days: publication.window_days,
            notes: publication.notes,
            snapshot_data: publication.snapshot_data,
        }),
    ))
}

pub async fn funnel_summary(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
) -> Result<impl IntoResponse, AppError> {
    let summary = db::funnel_summary(&state.db_pool, ctx)?;
    Ok(Json(summary))
}
