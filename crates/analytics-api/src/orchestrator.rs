//! Request orchestration.
//!
//! The HTTP layer builds one [`AnalyticsRequest`] per call; a single
//! dispatch match validates, enforces the deadline, runs the analysis on a
//! blocking worker, and returns the serialized result. No analytics logic
//! lives here.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use funnelcast_common::db::DbPool;
use funnelcast_common::error::AppError;
use funnelcast_common::ids::{IdKind, format_id};
use funnelcast_common::tenant::TenantContext;

use crate::analytics::AnalyticsEngine;
use crate::analytics::attribution::AttributionRequest;
use crate::analytics::bottleneck::BottleneckRequest;
use crate::analytics::cohort::CohortRequest;
use crate::analytics::comparison::ComparisonRequest;
use crate::analytics::conversion::ConversionRequest;
use crate::analytics::dropoff::DropoffRequest;
use crate::analytics::path::PathRequest;
use crate::analytics::timing::TimingRequest;
use crate::db::user_states;

/// Every analytics call the core answers, as one tagged request.
#[derive(Debug)]
pub enum AnalyticsRequest {
    Conversion { funnel_id: i64, request: ConversionRequest },
    Dropoff { funnel_id: i64, request: DropoffRequest },
    Cohorts { funnel_id: i64, request: CohortRequest },
    Timing { funnel_id: i64, request: TimingRequest },
    Bottlenecks { funnel_id: i64, request: BottleneckRequest },
    Paths { funnel_id: i64, request: PathRequest },
    Attribution { funnel_id: i64, request: AttributionRequest },
    Live { funnel_id: i64 },
    UserProgression { funnel_id: i64, anonymous_id: String },
    Compare { funnel_ids: Vec<i64>, request: ComparisonRequest },
}

#[derive(Debug, Serialize)]
pub struct UserProgressionResponse {
    pub funnel_id: String,
    pub funnel_version_id: String,
    pub anonymous_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lead_id: Option<String>,
    pub current_step_index: i32,
    pub status: String,
    pub entered_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exited_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct Orchestrator {
    engine: AnalyticsEngine,
    pool: DbPool,
    timeout: Duration,
}

impl Orchestrator {
    pub fn new(engine: AnalyticsEngine, pool: DbPool, timeout: Duration) -> Self {
        Self { engine, pool, timeout }
    }

    /// Runs one analytics request to completion on a blocking worker under
    /// the configured deadline. On expiry the caller gets `timeout` and the
    /// in-flight computation abandons its cache write.
    pub async fn dispatch(
        &self,
        ctx: TenantContext,
        request: AnalyticsRequest,
    ) -> Result<serde_json::Value, AppError> {
        let deadline = Instant::now() + self.timeout;
        let engine = self.engine.with_deadline(deadline);
        let pool = self.pool.clone();

        let task = tokio::task::spawn_blocking(move || -> Result<serde_json::Value, AppError> {
            match request {
                AnalyticsRequest::Conversion { funnel_id, request } => {
                    to_value(&engine.conversion(ctx, funnel_id, &request)?)
                }
                AnalyticsRequest::Dropoff { funnel_id, request } => {
                    to_value(&engine.dropoff(ctx, funnel_id, &request)?)
                }
                AnalyticsRequest::Cohorts { funnel_id, request } => {
                    to_value(&engine.cohorts(ctx, funnel_id, &request)?)
                }
                AnalyticsRequest::Timing { funnel_id, request } => {
                    to_value(&engine.timing(ctx, funnel_id, &request)?)
                }
                AnalyticsRequest::Bottlenecks { funnel_id, request } => {
                    to_value(&engine.bottlenecks(ctx, funnel_id, &request)?)
                }
                AnalyticsRequest::Paths { funnel_id, request } => {
                    to_value(&engine.paths(ctx, funnel_id, &request)?)
                }
                AnalyticsRequest::Attribution { funnel_id, request } => {
                    to_value(&engine.attribution(ctx, funnel_id, &request)?)
                }
                AnalyticsRequest::Live { funnel_id } => to_value(&engine.live(ctx, funnel_id)?),
                AnalyticsRequest::UserProgression { funnel_id, anonymous_id } => {
                    let state = user_states::find_user_state(&pool, ctx, funnel_id, &anonymous_id)?;
                    to_value(&UserProgressionResponse {
                        funnel_id: format_id(IdKind::Funnel, state.funnel_id),
                        funnel_version_id: format_id(IdKind::FunnelVersion, state.funnel_version_id),
                        anonymous_id: state.anonymous_id,
                        lead_id: state.lead_id,
                        current_step_index: state.current_step_index,
                        status: state.status,
                        entered_at: state.entered_at,
                        last_activity_at: state.last_activity_at,
                        completed_at: state.completed_at,
                        exited_at: state.exited_at,
                    })
                }
                AnalyticsRequest::Compare { funnel_ids, request } => {
                    to_value(&engine.compare(ctx, &funnel_ids, &request)?)
                }
            }
        });

        match tokio::time::timeout(self.timeout, task).await {
            Err(_) => Err(AppError::Timeout(
                "analysis did not complete within the request deadline".to_string(),
            )),
            Ok(Err(join_err)) => Err(AppError::Internal(format!("analysis task failed: {join_err}"))),
            Ok(Ok(result)) => result,
        }
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<serde_json::Value, AppError> {
    serde_json::to_value(value)
        .map_err(|e| AppError::Internal(format!("failed to serialise analysis result: {e}")))
}
