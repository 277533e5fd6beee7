//! Raw event pages for `raw_events` exports.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Nullable, Text, Timestamptz};
use serde::{Deserialize, Serialize};

use funnelcast_common::db::{DbPool, run_with_statement_retry};
use funnelcast_common::error::AppError;
use funnelcast_common::tenant::TenantContext;

use super::DateRange;

#[derive(Debug, Clone, QueryableByName, Serialize, Deserialize)]
pub struct RawEventRow {
    #[diesel(sql_type = Text)]
    pub event_id: String,
    #[diesel(sql_type = Text)]
    pub anonymous_id: String,
    #[diesel(sql_type = Text)]
    pub session_id: String,
    #[diesel(sql_type = Text)]
    pub event_name: String,
    #[diesel(sql_type = Timestamptz)]
    pub occurred_at: DateTime<Utc>,
    #[diesel(sql_type = Nullable<Text>)]
    pub page_url: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub utm_source: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub utm_medium: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub device_type: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub geo_country: Option<String>,
}

const FUNNEL_EVENTS_FILTER: &str =
    "FROM events e \
     WHERE e.tenant_id = $1 AND e.workspace_id = $2 \
       AND e.\"timestamp\" BETWEEN $4 AND $5 \
       AND EXISTS ( \
           SELECT 1 FROM funnel_user_states us \
           WHERE us.tenant_id = $1 AND us.workspace_id = $2 \
             AND us.funnel_id = $3 AND us.anonymous_id = e.anonymous_id)";

/// Total number of raw events an export will stream.
pub fn count_funnel_events(
    pool: &DbPool,
    ctx: TenantContext,
    funnel_id: i64,
    range: DateRange,
) -> Result<i64, AppError> {
    #[derive(QueryableByName)]
    struct CountRow {
        #[diesel(sql_type = BigInt)]
        total: i64,
    }

    let sql = format!("SELECT COUNT(*) AS total {FUNNEL_EVENTS_FILTER}");

    let row: CountRow = run_with_statement_retry(pool, |conn| {
        diesel::sql_query(&sql)
            .bind::<BigInt, _>(ctx.tenant_id)
            .bind::<BigInt, _>(ctx.workspace_id)
            .bind::<BigInt, _>(funnel_id)
            .bind::<Timestamptz, _>(range.start)
            .bind::<Timestamptz, _>(range.end)
            .get_result(conn)
            .map_err(AppError::from)
    })?;

    Ok(row.total)
}

/// One page of the raw event stream for users who entered the funnel.
pub fn funnel_events_page(
    pool: &DbPool,
    ctx: TenantContext,
    funnel_id: i64,
    range: DateRange,
    limit: i64,
    offset: i64,
) -> Result<Vec<RawEventRow>, AppError> {
    let sql = format!(
        "SELECT e.event_id::text AS event_id, \
                e.anonymous_id AS anonymous_id, \
                e.session_id AS session_id, \
                e.event_name AS event_name, \
                e.\"timestamp\" AS occurred_at, \
                e.page_url AS page_url, \
                e.utm_source AS utm_source, \
                e.utm_medium AS utm_medium, \
                e.device_type AS device_type, \
                e.geo_country AS geo_country \
         {FUNNEL_EVENTS_FILTER} \
         ORDER BY e.\"timestamp\", e.id \
         LIMIT $6 OFFSET $7"
    );

    run_with_statement_retry(pool, |conn| {
        diesel::sql_query(&sql)
            .bind::<BigInt, _>(ctx.tenant_id)
            .bind::<BigInt, _>(ctx.workspace_id)
            .bind::<BigInt, _>(funnel_id)
            .bind::<Timestamptz, _>(range.start)
            .bind::<Timestamptz, _>(range.end)
            .bind::<BigInt, _>(limit)
            .bind::<BigInt, _>(offset)
            .load(conn)
            .map_err(AppError::from)
    })
}
