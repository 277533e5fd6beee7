//! Per-step completion and drop-off counts derived from user funnel states.

use diesel::prelude::*;
use diesel::sql_types::{BigInt, Double, Integer, Timestamptz};

use funnelcast_common::db::{DbPool, run_with_statement_retry};
use funnelcast_common::error::AppError;
use funnelcast_common::tenant::TenantContext;

use super::DateRange;

#[derive(Debug, QueryableByName)]
pub struct StepCountRow {
    #[diesel(sql_type = Integer)]
    pub step_order: i32,
    #[diesel(sql_type = BigInt)]
    pub users: i64,
}

/// Distinct users whose progression reached at least each step, for users who
/// entered the funnel inside the window.
pub fn step_completions(
    pool: &DbPool,
    ctx: TenantContext,
    funnel_id: i64,
    total_steps: i32,
    range: DateRange,
) -> Result<Vec<StepCountRow>, AppError> {
    run_with_statement_retry(pool, |conn| {
        diesel::sql_query(
            "SELECT gs::int AS step_order, \
                    COUNT(us.id) FILTER (WHERE us.current_step_index >= gs) AS users \
             FROM generate_series(0, $4::int - 1) gs \
             LEFT JOIN funnel_user_states us \
               ON us.tenant_id = $1 AND us.workspace_id = $2 AND us.funnel_id = $3 \
              AND us.entered_at BETWEEN $5 AND $6 \
             GROUP BY gs \
             ORDER BY gs",
        )
        .bind::<BigInt, _>(ctx.tenant_id)
        .bind::<BigInt, _>(ctx.workspace_id)
        .bind::<BigInt, _>(funnel_id)
        .bind::<Integer, _>(total_steps)
        .bind::<Timestamptz, _>(range.start)
        .bind::<Timestamptz, _>(range.end)
        .load(conn)
        .map_err(AppError::from)
    })
}

#[derive(Debug, QueryableByName)]
pub struct DropoffRow {
    #[diesel(sql_type = Integer)]
    pub step_order: i32,
    #[diesel(sql_type = BigInt)]
    pub entries: i64,
    #[diesel(sql_type = BigInt)]
    pub exits: i64,
    #[diesel(sql_type = Double)]
    pub avg_seconds_before_exit: f64,
    #[diesel(sql_type = BigInt)]
    pub immediate_bounces: i64,
}

impl DropoffRow {
    pub fn delayed_exits(&self) -> i64 {
        (self.exits - self.immediate_bounces).max(0)
    }
}

/// Per-step entries, exits (reached the step, never completed), time on the
/// exit step, and the immediate-bounce split (`last_activity_at ==
/// entered_at`).
pub fn dropoff_rows(
    pool: &DbPool,
    ctx: TenantContext,
    funnel_id: i64,
    total_steps: i32,
    range: DateRange,
) -> Result<Vec<DropoffRow>, AppError> {
    run_with_statement_retry(pool, |conn| {
        diesel::sql_query(
            "SELECT gs::int AS step_order, \
                    COUNT(us.id) FILTER (WHERE us.current_step_index >= gs) AS entries, \
                    COUNT(us.id) FILTER (WHERE us.current_step_index = gs AND us.status <> 'completed') AS exits, \
                    COALESCE(EXTRACT(EPOCH FROM AVG(us.last_activity_at - us.entered_at) \
                        FILTER (WHERE us.current_step_index = gs AND us.status <> 'completed')), 0)::float8 \
                        AS avg_seconds_before_exit, \
                    COUNT(us.id) FILTER (WHERE us.current_step_index = gs AND us.status <> 'completed' \
                        AND us.last_activity_at = us.entered_at) AS immediate_bounces \
             FROM generate_series(0, $4::int - 1) gs \
             LEFT JOIN funnel_user_states us \
               ON us.tenant_id = $1 AND us.workspace_id = $2 AND us.funnel_id = $3 \
              AND us.entered_at BETWEEN $5 AND $6 \
             GROUP BY gs \
             ORDER BY gs",
        )
        .bind::<BigInt, _>(ctx.tenant_id)
        .bind::<BigInt, _>(ctx.workspace_id)
        .bind::<BigInt, _>(funnel_id)
        .bind::<Integer, _>(total_steps)
        .bind::<Timestamptz, _>(range.start)
        .bind::<Timestamptz, _>(range.end)
        .load(conn)
        .map_err(AppError::from)
    })
}

#[derive(Debug, QueryableByName)]
pub struct FunnelTotalsRow {
    #[diesel(sql_type = BigInt)]
    pub entries: i64,
    #[diesel(sql_type = BigInt)]
    pub conversions: i64,
    #[diesel(sql_type = Double)]
    pub avg_seconds_to_convert: f64,
    #[diesel(sql_type = Double)]
    pub median_seconds_to_convert: f64,
}

/// Window totals: entries bucketed on entry, conversions on completion, plus
/// average and median time to convert.
pub fn funnel_totals(
    pool: &DbPool,
    ctx: TenantContext,
    funnel_id: i64,
    range: DateRange,
) -> Result<FunnelTotalsRow, AppError> {
    run_with_statement_retry(pool, |conn| {
        diesel::sql_query(
            "SELECT COUNT(*) FILTER (WHERE entered_at BETWEEN $4 AND $5) AS entries, \
                    COUNT(*) FILTER (WHERE status = 'completed' AND completed_at BETWEEN $4 AND $5) AS conversions, \
                    COALESCE(EXTRACT(EPOCH FROM AVG(completed_at - entered_at) \
                        FILTER (WHERE status = 'completed' AND completed_at BETWEEN $4 AND $5)), 0)::float8 \
                        AS avg_seconds_to_convert, \
                    COALESCE(percentile_cont(0.5) WITHIN GROUP (ORDER BY EXTRACT(EPOCH FROM completed_at - entered_at)) \
                        FILTER (WHERE status = 'completed' AND completed_at BETWEEN $4 AND $5), 0)::float8 \
                        AS median_seconds_to_convert \
             FROM funnel_user_states \
             WHERE tenant_id = $1 AND workspace_id = $2 AND funnel_id = $3",
        )
        .bind::<BigInt, _>(ctx.tenant_id)
        .bind::<BigInt, _>(ctx.workspace_id)
        .bind::<BigInt, _>(funnel_id)
        .bind::<Timestamptz, _>(range.start)
        .bind::<Timestamptz, _>(range.end)
        .get_result(conn)
        .map_err(AppError::from)
    })
}

#[derive(Debug, QueryableByName)]
pub struct PeerFunnelRow {
    #[diesel(sql_type = BigInt)]
    pub funnel_id: i64,
    #[diesel(sql_type = BigInt)]
    pub entries: i64,
    #[diesel(sql_type = BigInt)]
    pub conversions: i64,
}

/// Conversion volume of every non-archived funnel in the workspace over the
/// trailing 30 days, restricted to funnels with at least 100 entries.
pub fn peer_funnel_metrics(
    pool: &DbPool,
    ctx: TenantContext,
    since: chrono::DateTime<chrono::Utc>,
) -> Result<Vec<PeerFunnelRow>, AppError> {
    run_with_statement_retry(pool, |conn| {
        diesel::sql_query(
            "SELECT us.funnel_id AS funnel_id, \
                    COUNT(*) AS entries, \
                    COUNT(*) FILTER (WHERE us.status = 'completed') AS conversions \
             FROM funnel_user_states us \
             JOIN funnels f ON f.id = us.funnel_id AND f.archived_at IS NULL \
             WHERE us.tenant_id = $1 AND us.workspace_id = $2 AND us.entered_at >= $3 \
             GROUP BY us.funnel_id \
             HAVING COUNT(*) >= 100",
        )
        .bind::<BigInt, _>(ctx.tenant_id)
        .bind::<BigInt, _>(ctx.workspace_id)
        .bind::<Timestamptz, _>(since)
        .load(conn)
        .map_err(AppError::from)
    })
}
