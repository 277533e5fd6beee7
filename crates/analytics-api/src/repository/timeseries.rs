//! Zero-filled conversion time-series.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Text, Timestamptz};

use funnelcast_common::db::{DbPool, run_with_statement_retry};
use funnelcast_common::error::AppError;
use funnelcast_common::tenant::TenantContext;

use super::{DateRange, Granularity};

#[derive(Debug, Clone, QueryableByName)]
pub struct TimeBucketRow {
    #[diesel(sql_type = Timestamptz)]
    pub bucket: DateTime<Utc>,
    #[diesel(sql_type = BigInt)]
    pub entries: i64,
    #[diesel(sql_type = BigInt)]
    pub conversions: i64,
}

/// Continuous bucket series over the window. Entries bucket on entry time,
/// conversions on completion time; missing buckets appear with zeros so the
/// series has exactly one row per bucket in `[start, end]`.
pub fn conversion_series(
    pool: &DbPool,
    ctx: TenantContext,
    funnel_id: i64,
    granularity: Granularity,
    range: DateRange,
) -> Result<Vec<TimeBucketRow>, AppError> {
    run_with_statement_retry(pool, |conn| {
        diesel::sql_query(
            "WITH buckets AS ( \
                 SELECT generate_series( \
                     date_trunc($4, $5::timestamptz), \
                     date_trunc($4, $6::timestamptz), \
                     ('1 ' || $4)::interval) AS bucket \
             ), \
             ent AS ( \
                 SELECT date_trunc($4, entered_at) AS bucket, COUNT(*) AS n \
                 FROM funnel_user_states \
                 WHERE tenant_id = $1 AND workspace_id = $2 AND funnel_id = $3 \
                   AND entered_at BETWEEN $5 AND $6 \
                 GROUP BY 1 \
             ), \
             conv AS ( \
                 SELECT date_trunc($4, completed_at) AS bucket, COUNT(*) AS n \
                 FROM funnel_user_states \
                 WHERE tenant_id = $1 AND workspace_id = $2 AND funnel_id = $3 \
                   AND status = 'completed' AND completed_at BETWEEN $5 AND $6 \
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
        .bind::<Text, _>(granularity.pg_unit())
        .bind::<Timestamptz, _>(range.start)
        .bind::<Timestamptz, _>(range.end)
        .load(conn)
        .map_err(AppError::from)
    })
}
