//! Segment-level entry and conversion counts.

use diesel::prelude::*;
use diesel::sql_types::{BigInt, Text, Timestamptz};

use funnelcast_common::db::{DbPool, run_with_statement_retry};
use funnelcast_common::error::AppError;
use funnelcast_common::tenant::TenantContext;

use super::{DateRange, SegmentDimension};

#[derive(Debug, QueryableByName)]
pub struct SegmentRow {
    #[diesel(sql_type = Text)]
    pub segment: String,
    #[diesel(sql_type = BigInt)]
    pub entries: i64,
    #[diesel(sql_type = BigInt)]
    pub conversions: i64,
}

/// Entries and conversions per segment value. Users are attributed to the
/// segment of their first event in the window. The outer join keeps segments
/// that show activity on only one side, reporting 0 on the other.
pub fn segment_conversions(
    pool: &DbPool,
    ctx: TenantContext,
    funnel_id: i64,
    dimension: SegmentDimension,
    range: DateRange,
) -> Result<Vec<SegmentRow>, AppError> {
    let sql = format!(
        "WITH seg AS ( \
             SELECT DISTINCT ON (e.anonymous_id) e.anonymous_id, {dim} AS segment \
             FROM events e \
             WHERE e.tenant_id = $1 AND e.workspace_id = $2 \
               AND e.\"timestamp\" BETWEEN $4 AND $5 \
             ORDER BY e.anonymous_id, e.\"timestamp\" ASC \
         ), \
         ent AS ( \
             SELECT us.anonymous_id, us.status \
             FROM funnel_user_states us \
             WHERE us.tenant_id = $1 AND us.workspace_id = $2 AND us.funnel_id = $3 \
               AND us.entered_at BETWEEN $4 AND $5 \
         ) \
         SELECT COALESCE(seg.segment, 'unknown') AS segment, \
                COUNT(ent.anonymous_id) AS entries, \
                COUNT(ent.anonymous_id) FILTER (WHERE ent.status = 'completed') AS conversions \
         FROM ent \
         FULL OUTER JOIN seg ON seg.anonymous_id = ent.anonymous_id \
         GROUP BY 1 \
         ORDER BY entries DESC",
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
