use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    response::IntoResponse,
};
use serde::Deserialize;

use funnelcast_common::error::AppError;
use funnelcast_common::ids::{IdKind, parse_id};
use funnelcast_common::tenant::TenantContext;

use crate::analytics::attribution::{AttributionModel, AttributionRequest, PositionWeights};
use crate::analytics::bottleneck::{BottleneckRequest, Sensitivity};
use crate::analytics::cohort::CohortRequest;
use crate::analytics::comparison::{AbTestConfig, ComparisonRequest};
use crate::analytics::conversion::ConversionRequest;
use crate::analytics::dropoff::DropoffRequest;
use crate::analytics::engine::RequestedRange;
use crate::analytics::path::PathRequest;
use crate::analytics::timing::TimingRequest;
use crate::orchestrator::AnalyticsRequest;
use crate::repository::{CohortPeriod, Granularity};
use crate::state::AppState;

// Query structs stay flat: axum's query deserializer handles plain typed
// fields, so every handler assembles its engine request explicitly.

fn default_granularity() -> Granularity {
    Granularity::Daily
}

// ── Conversion ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ConversionQuery {
    pub start_date: String,
    pub end_date: String,
    #[serde(default)]
    pub include_segments: bool,
    #[serde(default)]
    pub include_time_series: bool,
    #[serde(default = "default_granularity")]
    pub granularity: Granularity,
    #[serde(default)]
    pub include_significance: bool,
    #[serde(default)]
    pub include_peer_comparison: bool,
}

pub async fn conversion(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Path(funnel_id): Path<String>,
    Query(query): Query<ConversionQuery>,
) -> Result<impl IntoResponse, AppError> {
    let funnel_id = parse_id(IdKind::Funnel, &funnel_id)?;
    let request = AnalyticsRequest::Conversion {
        funnel_id,
        request: ConversionRequest {
            range: RequestedRange {
                start_date: query.start_date,
                end_date: query.end_date,
            },
            include_segments: query.include_segments,
            include_time_series: query.include_time_series,
            time_series_granularity: query.granularity,
            include_significance: query.include_significance,
            include_peer_comparison: query.include_peer_comparison,
        },
    };
    Ok(Json(state.orchestrator.dispatch(ctx, request).await?))
}

// ── Drop-off ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct DropoffQuery {
    pub start_date: String,
    pub end_date: String,
    #[serde(default)]
    pub include_exit_paths: bool,
    #[serde(default)]
    pub include_recommendations: bool,
}

pub async fn dropoff(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Path(funnel_id): Path<String>,
    Query(query): Query<DropoffQuery>,
) -> Result<impl IntoResponse, AppError> {
    let funnel_id = parse_id(IdKind::Funnel, &funnel_id)?;
    let request = AnalyticsRequest::Dropoff {
        funnel_id,
        request: DropoffRequest {
            range: RequestedRange {
                start_date: query.start_date,
                end_date: query.end_date,
            },
            include_exit_paths: query.include_exit_paths,
            include_recommendations: query.include_recommendations,
        },
    };
    Ok(Json(state.orchestrator.dispatch(ctx, request).await?))
}

// ── Cohorts ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CohortQuery {
    pub start_date: String,
    pub end_date: String,
    #[serde(default = "default_period")]
    pub period: CohortPeriod,
    #[serde(default)]
    pub include_segments: bool,
    #[serde(default)]
    pub include_comparisons: bool,
}

fn default_period() -> CohortPeriod {
    CohortPeriod::Weekly
}

pub async fn cohorts(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Path(funnel_id): Path<String>,
    Query(query): Query<CohortQuery>,
) -> Result<impl IntoResponse, AppError> {
    let funnel_id = parse_id(IdKind::Funnel, &funnel_id)?;
    let request = AnalyticsRequest::Cohorts {
        funnel_id,
        request: CohortRequest {
            range: RequestedRange {
                start_date: query.start_date,
                end_date: query.end_date,
            },
            period: query.period,
            include_segments: query.include_segments,
            include_comparisons: query.include_comparisons,
        },
    };
    Ok(Json(state.orchestrator.dispatch(ctx, request).await?))
}

// ── Timing ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct TimingQuery {
    pub start_date: String,
    pub end_date: String,
    #[serde(default = "default_granularity")]
    pub granularity: Granularity,
}

pub async fn timing(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Path(funnel_id): Path<String>,
    Query(query): Query<TimingQuery>,
) -> Result<impl IntoResponse, AppError> {
    let funnel_id = parse_id(IdKind::Funnel, &funnel_id)?;
    let request = AnalyticsRequest::Timing {
        funnel_id,
        request: TimingRequest {
            range: RequestedRange {
                start_date: query.start_date,
                end_date: query.end_date,
            },
            trend_granularity: query.granularity,
        },
    };
    Ok(Json(state.orchestrator.dispatch(ctx, request).await?))
}

// ── Bottlenecks ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct BottleneckQuery {
    #[serde(default = "default_window_hours")]
    pub time_window_hours: i64,
    #[serde(default = "default_comparison_days")]
    pub comparison_period_days: i64,
    #[serde(default = "default_sensitivity")]
    pub sensitivity: Sensitivity,
}

fn default_window_hours() -> i64 {
    24
}

fn default_comparison_days() -> i64 {
    7
}

fn default_sensitivity() -> Sensitivity {
    Sensitivity::Medium
}

pub async fn bottlenecks(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Path(funnel_id): Path<String>,
    Query(query): Query<BottleneckQuery>,
) -> Result<impl IntoResponse, AppError> {
    let funnel_id = parse_id(IdKind::Funnel, &funnel_id)?;
    let request = AnalyticsRequest::Bottlenecks {
        funnel_id,
        request: BottleneckRequest {
            time_window_hours: query.time_window_hours,
            comparison_period_days: query.comparison_period_days,
            sensitivity: query.sensitivity,
        },
    };
    Ok(Json(state.orchestrator.dispatch(ctx, request).await?))
}

// ── Paths ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct PathQuery {
    pub start_date: String,
    pub end_date: String,
    #[serde(default = "default_max_path_length")]
    pub max_path_length: usize,
    #[serde(default = "default_min_path_volume")]
    pub min_path_volume: usize,
}

fn default_max_path_length() -> usize {
    20
}

fn default_min_path_volume() -> usize {
    10
}

pub async fn paths(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Path(funnel_id): Path<String>,
    Query(query): Query<PathQuery>,
) -> Result<impl IntoResponse, AppError> {
    let funnel_id = parse_id(IdKind::Funnel, &funnel_id)?;
    let request = AnalyticsRequest::Paths {
        funnel_id,
        request: PathRequest {
            range: RequestedRange {
                start_date: query.start_date,
                end_date: query.end_date,
            },
            max_path_length: query.max_path_length,
            min_path_volume: query.min_path_volume,
        },
    };
    Ok(Json(state.orchestrator.dispatch(ctx, request).await?))
}

// ── Attribution ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct AttributionQuery {
    pub start_date: String,
    pub end_date: String,
    #[serde(default)]
    pub model: Option<AttributionModel>,
    #[serde(default = "default_lookback_days")]
    pub lookback_days: i32,
    #[serde(default = "default_half_life_days")]
    pub half_life_days: f64,
    #[serde(default = "default_top_n")]
    pub top_n: usize,
}

fn default_lookback_days() -> i32 {
    90
}

fn default_half_life_days() -> f64 {
    7.0
}

fn default_top_n() -> usize {
    10
}

pub async fn attribution(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Path(funnel_id): Path<String>,
    Query(query): Query<AttributionQuery>,
) -> Result<impl IntoResponse, AppError> {
    let funnel_id = parse_id(IdKind::Funnel, &funnel_id)?;

    let models = match query.model {
        Some(model) => vec![model],
        None => vec![
            AttributionModel::FirstTouch,
            AttributionModel::LastTouch,
            AttributionModel::Linear,
            AttributionModel::TimeDecay,
            AttributionModel::PositionBased,
        ],
    };

    let request = AnalyticsRequest::Attribution {
        funnel_id,
        request: AttributionRequest {
            range: RequestedRange {
                start_date: query.start_date,
                end_date: query.end_date,
            },
            models,
            lookback_days: query.lookback_days,
            half_life_days: query.half_life_days,
            position_weights: None::<PositionWeights>,
            custom_weights: None,
            top_n: query.top_n,
        },
    };
    Ok(Json(state.orchestrator.dispatch(ctx, request).await?))
}

// ── Live & user progression ─────────────────────────────────────────

pub async fn live(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Path(funnel_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let funnel_id = parse_id(IdKind::Funnel, &funnel_id)?;
    let request = AnalyticsRequest::Live { funnel_id };
    Ok(Json(state.orchestrator.dispatch(ctx, request).await?))
}

pub async fn user_progression(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Path((funnel_id, user_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    let funnel_id = parse_id(IdKind::Funnel, &funnel_id)?;
    let request = AnalyticsRequest::UserProgression { funnel_id, anonymous_id: user_id };
    Ok(Json(state.orchestrator.dispatch(ctx, request).await?))
}

// ── Comparison ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CompareInput {
    pub funnel_ids: Vec<String>,
    pub start_date: String,
    pub end_date: String,
    #[serde(default)]
    pub baseline_funnel_id: Option<String>,
    #[serde(default)]
    pub ab_test_configuration: Option<AbTestConfig>,
}

pub async fn compare(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Json(input): Json<CompareInput>,
) -> Result<impl IntoResponse, AppError> {
    let funnel_ids = input
        .funnel_ids
        .iter()
        .map(|id| parse_id(IdKind::Funnel, id))
        .collect::<Result<Vec<_>, _>>()?;

    if let Some(baseline) = &input.baseline_funnel_id {
        let baseline_id = parse_id(IdKind::Funnel, baseline)?;
        if !funnel_ids.contains(&baseline_id) {
            return Err(AppError::Validation(
                "baseline_funnel_id must be one of funnel_ids".to_string(),
            ));
        }
    }

    let request = AnalyticsRequest::Compare {
        funnel_ids,
        request: ComparisonRequest {
            range: RequestedRange {
                start_date: input.start_date,
                end_date: input.end_date,
            },
            baseline_funnel_id: input.baseline_funnel_id,
            ab_test_configuration: input.ab_test_configuration,
        },
    };
    Ok(Json(state.orchestrator.dispatch(ctx, request).await?))
}
