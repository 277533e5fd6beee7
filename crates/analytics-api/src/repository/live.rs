//! Live counters and realtime anomaly signals.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Integer, Timestamptz};

use funnelcast_common::db::{DbPool, run_with_statement_retry};
use funnelcast_common::error::AppError;
use funnelcast_common::tenant::TenantContext;

#[derive(Debug, QueryableByName)]
pub struct LiveBasicRow {
    #[diesel(sql_type = BigInt)]
    pub active_sessions: i64,
    #[diesel(sql_type = BigInt)]
    pub entries_last_hour: i64,
    #[diesel(sql_type = BigInt)]
    pub conversions_last_hour: i64,
}

/// Active sessions (activity in the last 30 minutes) and entry/conversion
/// counts over the trailing hour. `now` is passed in so deadlines and tests
/// control the clock.
pub fn live_basic(
    pool: &DbPool,
    ctx: TenantContext,
    funnel_id: i64,
    now: DateTime<Utc>,
) -> Result<LiveBasicRow, AppError> {
    let half_hour_ago = now - chrono::Duration::minutes(30);
    let hour_ago = now - chrono::Duration::hours(1);

    run_with_statement_retry(pool, |conn| {
        diesel::sql_query(
            "SELECT COUNT(*) FILTER (WHERE status = 'active' AND last_activity_at >= $4) AS active_sessions, \
                    COUNT(*) FILTER (WHERE entered_at >= $5) AS entries_last_hour, \
                    COUNT(*) FILTER (WHERE status = 'completed' AND completed_at >= $5) AS conversions_last_hour \
             FROM funnel_user_states \
             WHERE tenant_id = $1 AND workspace_id = $2 AND funnel_id = $3",
        )
        .bind::<BigInt, _>(ctx.tenant_id)
        .bind::<BigInt, _>(ctx.workspace_id)
        .bind::<BigInt, _>(funnel_id)
        .bind::<Timestamptz, _>(half_hour_ago)
        .bind::<Timestamptz, _>(hour_ago)
        .get_result(conn)
        .map_err(AppError::from)
    })
}

#[derive(Debug, QueryableByName)]
pub struct StepDistributionRow {
    #[diesel(sql_type = Integer)]
    pub step_order: i32,
    #[diesel(sql_type = BigInt)]
    pub users: i64,
}

/// Where currently-active users sit in the funnel.
pub fn active_step_distribution(
    pool: &DbPool,
    ctx: TenantContext,
    funnel_id: i64,
    now: DateTime<Utc>,
) -> Result<Vec<StepDistributionRow>, AppError> {
    let half_hour_ago = now - chrono::Duration::minutes(30);

    run_with_statement_retry(pool, |conn| {
        diesel::sql_query(
            "SELECT current_step_index AS step_order, COUNT(*) AS users \
             FROM funnel_user_states \
             WHERE tenant_id = $1 AND workspace_id = $2 AND funnel_id = $3 \
               AND status = 'active' AND last_activity_at >= $4 \
             GROUP BY 1 \
             ORDER BY 1",
        )
        .bind::<BigInt, _>(ctx.tenant_id)
        .bind::<BigInt, _>(ctx.workspace_id)
        .bind::<BigInt, _>(funnel_id)
        .bind::<Timestamptz, _>(half_hour_ago)
        .load(conn)
        .map_err(AppError::from)
    })
}

#[derive(Debug, QueryableByName)]
pub struct MinuteTrendRow {
    #[diesel(sql_type = Timestamptz)]
    pub bucket: DateTime<Utc>,
    #[diesel(sql_type = BigInt)]
    pub entries: i64,
    #[diesel(sql_type = BigInt)]
    pub conversions: i64,
}

/// Per-minute entries and conversions for the trailing 30 minutes,
/// zero-filled.
pub fn minute_trend(
    pool: &DbPool,
    ctx: TenantContext,
    funnel_id: i64,
    now: DateTime<Utc>,
) -> Result<Vec<MinuteTrendRow>, AppError> {
    let window_start = now - chrono::Duration::minutes(30);

    run_with_statement_retry(pool, |conn| {
        diesel::sql_query(
            "WITH buckets AS ( \
                 SELECT generate_series( \
                     date_trunc('minute', $4::timestamptz), \
                     date_trunc('minute', $5::timestamptz), \
                     interval '1 minute') AS bucket \
             ), \
             ent AS ( \
                 SELECT date_trunc('minute', entered_at) AS bucket, COUNT(*) AS n \
                 FROM funnel_user_states \
                 WHERE tenant_id = $1 AND workspace_id = $2 AND funnel_id = $3 AND entered_at >= $4 \
                 GROUP BY 1 \
             ), \
             conv AS ( \
                 SELECT date_trunc('minute', completed_at) AS bucket, COUNT(*) AS n \
                 FROM funnel_user_states \
                 WHERE tenant_id = $1 AND workspace_id = $2 AND funnel_id = $3 \
                   AND status = 'completed' AND completed_at >= $4 \
                 GROUP BY 1 \
             ) \
             SELECT b.bucket AS bucket, \
                    COALESCE(ent.n, 0) AS entries, \
                    COALESCE(conv.n, 0) AS conversions \
             FROM buckets b \
             LEFT JOIN ent ON ent.bucket = b.bucket \
             LEFT JOIN conv ON conv.bucket = b.bucket \
             ORDER BY b.bucket",
        )
        .bind::<BigInt, _>(ctx.tenant_id)
        .bind::<BigInt, _>(ctx.workspace_id)
        .bind::<BigInt, _>(funnel_id)
        .bind::<Timestamptz, _>(window_start)
        .bind::<Timestamptz, _>(now)
        .load(conn)
        .map_err(AppError::from)
    })
}

#[derive(Debug, QueryableByName)]
pub struct StuckStepRow {
    #[diesel(sql_type = Integer)]
    pub step_order: i32,
    #[diesel(sql_type = BigInt)]
    pub stuck_users: i64,
}

/// Active users idle for more than 10 minutes, grouped by step; only steps
/// with at least 5 stuck users are reported.
pub fn stuck_users_by_step(
    pool: &DbPool,
    ctx: TenantContext,
    funnel_id: i64,
    now: DateTime<Utc>,
) -> Result<Vec<StuckStepRow>, AppError> {
    let idle_cutoff = now - chrono::Duration::minutes(10);
    let horizon = now - chrono::Duration::hours(24);

    run_with_statement_retry(pool, |conn| {
        diesel::sql_query(
            "SELECT current_step_index AS step_order, COUNT(*) AS stuck_users \
             FROM funnel_user_states \
             WHERE tenant_id = $1 AND workspace_id = $2 AND funnel_id = $3 \
               AND status = 'active' \
               AND last_activity_at < $4 AND last_activity_at >= $5 \
             GROUP BY 1 \
             HAVING COUNT(*) >= 5 \
             ORDER BY stuck_users DESC",
        )
        .bind::<BigInt, _>(ctx.tenant_id)
        .bind::<BigInt, _>(ctx.workspace_id)
        .bind::<BigInt, _>(funnel_id)
        .bind::<Timestamptz, _>(idle_cutoff)
        .bind::<Timestamptz, _>(horizon)
        .load(conn)
        .map_err(AppError::from)
    })
}
