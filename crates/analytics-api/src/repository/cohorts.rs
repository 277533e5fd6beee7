//! Cohort grouping, progression, retention and enrichment queries.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Double, Integer, Text, Timestamptz};

use funnelcast_common::db::{DbPool, run_with_statement_retry};
use funnelcast_common::error::AppError;
use funnelcast_common::tenant::TenantContext;

use super::{CohortPeriod, DateRange, SegmentDimension};

#[derive(Debug, Clone, QueryableByName)]
pub struct CohortRow {
    #[diesel(sql_type = Timestamptz)]
    pub cohort_start: DateTime<Utc>,
    #[diesel(sql_type = BigInt)]
    pub cohort_size: i64,
    #[diesel(sql_type = BigInt)]
    pub conversions: i64,
    #[diesel(sql_type = Double)]
    pub avg_minutes_to_convert: f64,
}

/// Users grouped by the calendar period they entered the funnel in.
pub fn cohorts_by_period(
    pool: &DbPool,
    ctx: TenantContext,
    funnel_id: i64,
    period: CohortPeriod,
    range: DateRange,
) -> Result<Vec<CohortRow>, AppError> {
    run_with_statement_retry(pool, |conn| {
        diesel::sql_query(
            "SELECT date_trunc($4, entered_at) AS cohort_start, \
                    COUNT(*) AS cohort_size, \
                    COUNT(*) FILTER (WHERE status = 'completed') AS conversions, \
                    COALESCE(EXTRACT(EPOCH FROM AVG(completed_at - entered_at) \
                        FILTER (WHERE status = 'completed')) / 60.0, 0)::float8 AS avg_minutes_to_convert \
             FROM funnel_user_states \
             WHERE tenant_id = $1 AND workspace_id = $2 AND funnel_id = $3 \
               AND entered_at BETWEEN $5 AND $6 \
             GROUP BY 1 \
             ORDER BY 1",
        )
        .bind::<BigInt, _>(ctx.tenant_id)
        .bind::<BigInt, _>(ctx.workspace_id)
        .bind::<BigInt, _>(funnel_id)
        .bind::<Text, _>(period.pg_unit())
        .bind::<Timestamptz, _>(range.start)
        .bind::<Timestamptz, _>(range.end)
        .load(conn)
        .map_err(AppError::from)
    })
}

#[derive(Debug, QueryableByName)]
pub struct CohortStepRow {
    #[diesel(sql_type = Timestamptz)]
    pub cohort_start: DateTime<Utc>,
    #[diesel(sql_type = Integer)]
    pub step_order: i32,
    #[diesel(sql_type = BigInt)]
    pub reached: i64,
}

/// Per cohort and per step: how many members progressed at least that far.
pub fn cohort_progression(
    pool: &DbPool,
    ctx: TenantContext,
    funnel_id: i64,
    period: CohortPeriod,
    total_steps: i32,
    range: DateRange,
) -> Result<Vec<CohortStepRow>, AppError> {
    run_with_statement_retry(pool, |conn| {
        diesel::sql_query(
            "SELECT date_trunc($4, us.entered_at) AS cohort_start, \
                    gs::int AS step_order, \
                    COUNT(*) FILTER (WHERE us.current_step_index >= gs) AS reached \
             FROM funnel_user_states us \
             CROSS JOIN generate_series(0, $7::int - 1) gs \
             WHERE us.tenant_id = $1 AND us.workspace_id = $2 AND us.funnel_id = $3 \
               AND us.entered_at BETWEEN $5 AND $6 \
             GROUP BY 1, 2 \
             ORDER BY 1, 2",
        )
        .bind::<BigInt, _>(ctx.tenant_id)
        .bind::<BigInt, _>(ctx.workspace_id)
        .bind::<BigInt, _>(funnel_id)
        .bind::<Text, _>(period.pg_unit())
        .bind::<Timestamptz, _>(range.start)
        .bind::<Timestamptz, _>(range.end)
        .bind::<Integer, _>(total_steps)
        .load(conn)
        .map_err(AppError::from)
    })
}

#[derive(Debug, QueryableByName)]
pub struct RetentionRow {
    #[diesel(sql_type = Timestamptz)]
    pub cohort_start: DateTime<Utc>,
    #[diesel(sql_type = Integer)]
    pub period_index: i32,
    #[diesel(sql_type = BigInt)]
    pub retained: i64,
}

/// Retention curve: for periods 0..4 after the cohort start, members whose
/// last funnel activity falls at or beyond that offset. Funnel activity is
/// the liveness signal here, which understates out-of-funnel activity.
pub fn retention_curves(
    pool: &DbPool,
    ctx: TenantContext,
    funnel_id: i64,
    period: CohortPeriod,
    range: DateRange,
) -> Result<Vec<RetentionRow>, AppError> {
    run_with_statement_retry(pool, |conn| {
        diesel::sql_query(
            "SELECT date_trunc($4, us.entered_at) AS cohort_start, \
                    k::int AS period_index, \
                    COUNT(*) FILTER (WHERE us.last_activity_at >= \
                        date_trunc($4, us.entered_at) + k * ('1 ' || $4)::interval) AS retained \
             FROM funnel_user_states us \
             CROSS JOIN generate_series(0, 4) k \
             WHERE us.tenant_id = $1 AND us.workspace_id = $2 AND us.funnel_id = $3 \
               AND us.entered_at BETWEEN $5 AND $6 \
             GROUP BY 1, 2 \
             ORDER BY 1, 2",
        )
        .bind::<BigInt, _>(ctx.tenant_id)
        .bind::<BigInt, _>(ctx.workspace_id)
        .bind::<BigInt, _>(funnel_id)
        .bind::<Text, _>(period.pg_unit())
        .bind::<Timestamptz, _>(range.start)
        .bind::<Timestamptz, _>(range.end)
        .load(conn)
        .map_err(AppError::from)
    })
}

#[derive(Debug, QueryableByName)]
pub struct CohortBreakdownRow {
    #[diesel(sql_type = Timestamptz)]
    pub cohort_start: DateTime<Utc>,
    #[diesel(sql_type = Text)]
    pub dimension_value: String,
    #[diesel(sql_type = BigInt)]
    pub users: i64,
}

/// Enriches cohorts with the given dimension of each member's first event
/// within 24 hours of entering the funnel.
pub fn cohort_breakdown(
    pool: &DbPool,
    ctx: TenantContext,
    funnel_id: i64,
    period: CohortPeriod,
    dimension: SegmentDimension,
    range: DateRange,
) -> Result<Vec<CohortBreakdownRow>, AppError> {
    let sql = format!(
        "WITH members AS ( \
             SELECT anonymous_id, date_trunc($4, entered_at) AS cohort_start, entered_at \
             FROM funnel_user_states \
             WHERE tenant_id = $1 AND workspace_id = $2 AND funnel_id = $3 \
               AND entered_at BETWEEN $5 AND $6 \
         ), \
         first_events AS ( \
             SELECT DISTINCT ON (m.anonymous_id) m.anonymous_id, m.cohort_start, {dim} AS dimension_value \
             FROM members m \
             JOIN events e ON e.tenant_id = $1 AND e.workspace_id = $2 \
               AND e.anonymous_id = m.anonymous_id \
               AND e.\"timestamp\" >= m.entered_at \
               AND e.\"timestamp\" < m.entered_at + interval '24 hours' \
             ORDER BY m.anonymous_id, e.\"timestamp\" ASC \
         ) \
         SELECT cohort_start, dimension_value, COUNT(*) AS users \
         FROM first_events \
         GROUP BY 1, 2 \
         ORDER BY 1, 2",
        dim = dimension.column_expr(),
    );

    run_with_statement_retry(pool, |conn| {
        diesel::sql_query(&sql)
            .bind::<BigInt, _>(ctx.tenant_id)
            .bind::<BigInt, _>(ctx.workspace_id)
            .bind::<BigInt, _>(funnel_id)
            .bind::<Text, _>(period.pg_unit())
            .bind::<Timestamptz, _>(range.start)
            .bind::<Timestamptz, _>(range.end)
            .load(conn)
            .map_err(AppError::from)
    })
}
