//! Ordered event streams for path and attribution analyses.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Integer, Nullable, Text, Timestamptz};

use funnelcast_common::db::{DbPool, run_with_statement_retry};
use funnelcast_common::error::AppError;
use funnelcast_common::tenant::TenantContext;

use super::DateRange;

/// Hard cap on journeys returned for path analysis.
pub const MAX_PATH_JOURNEYS: i64 = 1000;

/// Hard cap on journeys returned for attribution.
pub const MAX_TOUCHPOINT_JOURNEYS: i64 = 5000;

#[derive(Debug, QueryableByName)]
pub struct JourneyEventRow {
    #[diesel(sql_type = Text)]
    pub anonymous_id: String,
    #[diesel(sql_type = Text)]
    pub event_name: String,
    #[diesel(sql_type = Timestamptz)]
    pub occurred_at: DateTime<Utc>,
    #[diesel(sql_type = Nullable<Text>)]
    pub page_url: Option<String>,
    #[diesel(sql_type = Text)]
    pub user_status: String,
}

/// Ordered event stream per funnel user within the window, for up to
/// [`MAX_PATH_JOURNEYS`] users. The per-journey length cap and time-spent
/// derivation happen during assembly in the engine.
pub fn user_journey_events(
    pool: &DbPool,
    ctx: TenantContext,
    funnel_id: i64,
    range: DateRange,
) -> Result<Vec<JourneyEventRow>, AppError> {
    run_with_statement_retry(pool, |conn| {
        diesel::sql_query(
            "WITH sample AS ( \
                 SELECT anonymous_id, status \
                 FROM funnel_user_states \
                 WHERE tenant_id = $1 AND workspace_id = $2 AND funnel_id = $3 \
                   AND entered_at BETWEEN $4 AND $5 \
                 ORDER BY entered_at DESC \
                 LIMIT $6 \
             ) \
             SELECT e.anonymous_id AS anonymous_id, \
                    e.event_name AS event_name, \
                    e.\"timestamp\" AS occurred_at, \
                    e.page_url AS page_url, \
                    s.status AS user_status \
             FROM events e \
             JOIN sample s ON s.anonymous_id = e.anonymous_id \
             WHERE e.tenant_id = $1 AND e.workspace_id = $2 \
               AND e.\"timestamp\" BETWEEN $4 AND $5 \
             ORDER BY e.anonymous_id, e.\"timestamp\"",
        )
        .bind::<BigInt, _>(ctx.tenant_id)
        .bind::<BigInt, _>(ctx.workspace_id)
        .bind::<BigInt, _>(funnel_id)
        .bind::<Timestamptz, _>(range.start)
        .bind::<Timestamptz, _>(range.end)
        .bind::<BigInt, _>(MAX_PATH_JOURNEYS)
        .load(conn)
        .map_err(AppError::from)
    })
}

#[derive(Debug, QueryableByName)]
pub struct TouchpointEventRow {
    #[diesel(sql_type = Text)]
    pub anonymous_id: String,
    #[diesel(sql_type = Timestamptz)]
    pub converted_at: DateTime<Utc>,
    #[diesel(sql_type = Timestamptz)]
    pub occurred_at: DateTime<Utc>,
    #[diesel(sql_type = Nullable<Text>)]
    pub utm_source: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub utm_medium: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub referrer: Option<String>,
}

/// Pre-conversion touchpoint events inside the lookback window for users who
/// converted in the analysis window, up to [`MAX_TOUCHPOINT_JOURNEYS`]
/// journeys. Channel labelling and the per-journey touchpoint cap happen in
/// the engine.
pub fn touchpoint_events(
    pool: &DbPool,
    ctx: TenantContext,
    funnel_id: i64,
    range: DateRange,
    lookback_days: i32,
) -> Result<Vec<TouchpointEventRow>, AppError> {
    run_with_statement_retry(pool, |conn| {
        diesel::sql_query(
            "WITH converters AS ( \
                 SELECT anonymous_id, completed_at \
                 FROM funnel_user_states \
                 WHERE tenant_id = $1 AND workspace_id = $2 AND funnel_id = $3 \
                   AND status = 'completed' AND completed_at BETWEEN $4 AND $5 \
                 ORDER BY completed_at DESC \
                 LIMIT $7 \
             ) \
             SELECT c.anonymous_id AS anonymous_id, \
                    c.completed_at AS converted_at, \
                    e.\"timestamp\" AS occurred_at, \
                    e.utm_source AS utm_source, \
                    e.utm_medium AS utm_medium, \
                    e.referrer AS referrer \
             FROM converters c \
             JOIN events e ON e.tenant_id = $1 AND e.workspace_id = $2 \
               AND e.anonymous_id = c.anonymous_id \
             WHERE e.\"timestamp\" >= c.completed_at - make_interval(days => $6) \
               AND e.\"timestamp\" <= c.completed_at \
             ORDER BY c.anonymous_id, e.\"timestamp\"",
        )
        .bind::<BigInt, _>(ctx.tenant_id)
        .bind::<BigInt, _>(ctx.workspace_id)
        .bind::<BigInt, _>(funnel_id)
        .bind::<Timestamptz, _>(range.start)
        .bind::<Timestamptz, _>(range.end)
        .bind::<Integer, _>(lookback_days)
        .bind::<BigInt, _>(MAX_TOUCHPOINT_JOURNEYS)
        .load(conn)
        .map_err(AppError::from)
    })
}
