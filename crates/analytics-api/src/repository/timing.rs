//! Timing queries: journey durations, step transitions, velocity trends and
//! segment timing.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Double, Integer, Text, Timestamptz};

use funnelcast_common::db::{DbPool, run_with_statement_retry};
use funnelcast_common::error::AppError;
use funnelcast_common::tenant::TenantContext;

use super::{DateRange, Granularity, SegmentDimension};

#[derive(Debug, QueryableByName)]
pub struct DurationRow {
    #[diesel(sql_type = Double)]
    pub seconds: f64,
}

/// Raw full-conversion journey durations for the window, capped at 10k rows.
/// Percentiles are computed in process, which yields true percentiles rather
/// than ratio estimates.
pub fn journey_durations(
    pool: &DbPool,
    ctx: TenantContext,
    funnel_id: i64,
    range: DateRange,
) -> Result<Vec<f64>, AppError> {
    let rows: Vec<DurationRow> = run_with_statement_retry(pool, |conn| {
        diesel::sql_query(
            "SELECT EXTRACT(EPOCH FROM completed_at - entered_at)::float8 AS seconds \
             FROM funnel_user_states \
             WHERE tenant_id = $1 AND workspace_id = $2 AND funnel_id = $3 \
               AND status = 'completed' AND completed_at BETWEEN $4 AND $5 \
             ORDER BY completed_at \
             LIMIT 10000",
        )
        .bind::<BigInt, _>(ctx.tenant_id)
        .bind::<BigInt, _>(ctx.workspace_id)
        .bind::<BigInt, _>(funnel_id)
        .bind::<Timestamptz, _>(range.start)
        .bind::<Timestamptz, _>(range.end)
        .load(conn)
        .map_err(AppError::from)
    })?;

    Ok(rows.into_iter().map(|r| r.seconds).collect())
}

#[derive(Debug, QueryableByName)]
pub struct StepTransitionRow {
    #[diesel(sql_type = Integer)]
    pub step_order: i32,
    #[diesel(sql_type = BigInt)]
    pub moved: i64,
    #[diesel(sql_type = Double)]
    pub avg_seconds: f64,
    #[diesel(sql_type = Double)]
    pub median_seconds: f64,
    #[diesel(sql_type = Double)]
    pub p90_seconds: f64,
}

/// Time from each step to the next, derived from step-annotated events
/// (first sighting per user per step).
pub fn step_transitions(
    pool: &DbPool,
    ctx: TenantContext,
    funnel_id: i64,
    range: DateRange,
) -> Result<Vec<StepTransitionRow>, AppError> {
    run_with_statement_retry(pool, |conn| {
        diesel::sql_query(
            "WITH step_events AS ( \
                 SELECT anonymous_id, funnel_step_order AS step_order, MIN(\"timestamp\") AS first_at \
                 FROM events \
                 WHERE tenant_id = $1 AND workspace_id = $2 AND funnel_id = $3 \
                   AND funnel_step_order IS NOT NULL \
                   AND \"timestamp\" BETWEEN $4 AND $5 \
                 GROUP BY 1, 2 \
             ) \
             SELECT a.step_order AS step_order, \
                    COUNT(*) AS moved, \
                    COALESCE(AVG(EXTRACT(EPOCH FROM b.first_at - a.first_at)), 0)::float8 AS avg_seconds, \
                    COALESCE(percentile_cont(0.5) WITHIN GROUP \
                        (ORDER BY EXTRACT(EPOCH FROM b.first_at - a.first_at)), 0)::float8 AS median_seconds, \
                    COALESCE(percentile_cont(0.9) WITHIN GROUP \
                        (ORDER BY EXTRACT(EPOCH FROM b.first_at - a.first_at)), 0)::float8 AS p90_seconds \
             FROM step_events a \
             JOIN step_events b ON b.anonymous_id = a.anonymous_id AND b.step_order = a.step_order + 1 \
             WHERE b.first_at >= a.first_at \
             GROUP BY a.step_order \
             ORDER BY a.step_order",
        )
        .bind::<BigInt, _>(ctx.tenant_id)
        .bind::<BigInt, _>(ctx.workspace_id)
        .bind::<BigInt, _>(funnel_id)
        .bind::<Timestamptz, _>(range.start)
        .bind::<Timestamptz, _>(range.end)
        .load(conn)
        .map_err(AppError::from)
    })
}

#[derive(Debug, Clone, QueryableByName)]
pub struct VelocityRow {
    #[diesel(sql_type = Timestamptz)]
    pub period: DateTime<Utc>,
    #[diesel(sql_type = BigInt)]
    pub conversions: i64,
    #[diesel(sql_type = Double)]
    pub avg_seconds: f64,
    #[diesel(sql_type = Double)]
    pub median_seconds: f64,
}

/// Conversion-time trend per calendar period.
pub fn velocity_trend(
    pool: &DbPool,
    ctx: TenantContext,
    funnel_id: i64,
    granularity: Granularity,
    range: DateRange,
) -> Result<Vec<VelocityRow>, AppError> {
    run_with_statement_retry(pool, |conn| {
        diesel::sql_query(
            "SELECT date_trunc($4, completed_at) AS period, \
                    COUNT(*) AS conversions, \
                    COALESCE(EXTRACT(EPOCH FROM AVG(completed_at - entered_at)), 0)::float8 AS avg_seconds, \
                    COALESCE(percentile_cont(0.5) WITHIN GROUP \
                        (ORDER BY EXTRACT(EPOCH FROM completed_at - entered_at)), 0)::float8 AS median_seconds \
             FROM funnel_user_states \
             WHERE tenant_id = $1 AND workspace_id = $2 AND funnel_id = $3 \
               AND status = 'completed' AND completed_at BETWEEN $5 AND $6 \
             GROUP BY 1 \
             ORDER BY 1",
        )
        .bind::<BigInt, _>(ctx.tenant_id)
        .bind::<BigInt, _>(ctx.workspace_id)
        .bind::<BigInt, _>(funnel_id)
        .bind::<Text, _>(granularity.pg_unit())
        .bind::<Timestamptz, _>(range.start)
        .bind::<Timestamptz, _>(range.end)
        .load(conn)
        .map_err(AppError::from)
    })
}

#[derive(Debug, QueryableByName)]
pub struct SegmentTimingRow {
    #[diesel(sql_type = Text)]
    pub segment: String,
    #[diesel(sql_type = BigInt)]
    pub users: i64,
    #[diesel(sql_type = Double)]
    pub avg_seconds: f64,
}

/// Average conversion time per segment value, segments with ≥10 converters
/// only.
pub fn segment_timing(
    pool: &DbPool,
    ctx: TenantContext,
    funnel_id: i64,
    dimension: SegmentDimension,
    range: DateRange,
) -> Result<Vec<SegmentTimingRow>, AppError> {
    let sql = format!(
        "WITH conv AS ( \
             SELECT anonymous_id, EXTRACT(EPOCH FROM completed_at - entered_at)::float8 AS seconds \
             FROM funnel_user_states \
             WHERE tenant_id = $1 AND workspace_id = $2 AND funnel_id = $3 \
               AND status = 'completed' AND completed_at BETWEEN $4 AND $5 \
         ), \
         seg AS ( \
             SELECT DISTINCT ON (e.anonymous_id) e.anonymous_id, {dim} AS segment \
             FROM events e \
             WHERE e.tenant_id = $1 AND e.workspace_id = $2 \
               AND e.\"timestamp\" BETWEEN $4 AND $5 \
             ORDER BY e.anonymous_id, e.\"timestamp\" ASC \
         ) \
         SELECT seg.segment AS segment, COUNT(*) AS users, AVG(conv.seconds)::float8 AS avg_seconds \
         FROM conv \
         JOIN seg ON seg.anonymous_id = conv.anonymous_id \
         GROUP BY 1 \
         HAVING COUNT(*) >= 10 \
         ORDER BY avg_seconds ASC",
        dim = dimension.column_expr(),
    );

    run_with_statement_retry(pool, |conn| {
        diesel::sql_query(&sql)
            .bind::<BigInt, _>(ctx.tenant_id)
            .bind::<BigInt, _>(ctx.workspace_id)
            .bind::<BigInt, _>(funnel_id)
            .bind::<Timestamptz, _>(range.start)
            .bind::<Timestamptz, _>(range.end)
            .load(conn)
            .map_err(AppError::from)
    })
}
