//! Tracker-side persistence: loading the active definitions and upserting
//! user states.
//!
//! The upsert encodes the progression invariants in SQL, so duplicate or
//! out-of-order delivery can only repeat a state, never regress it:
//! `current_step_index` only grows, `entered_at` only shrinks, completion
//! is sticky.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Integer, Nullable, Text, Timestamptz};

use funnelcast_common::db::{DbPool, run_with_statement_retry};
use funnelcast_common::error::AppError;
use funnelcast_common::funnel::{FunnelDefinition, UserFunnelState};
use funnelcast_common::schema::{funnel_publications, funnel_user_states, funnels};
use funnelcast_common::tenant::TenantContext;

/// Latest publication snapshot of every active funnel in the workspace.
/// Active = non-archived with at least one publication.
pub fn load_active_definitions(
    pool: &DbPool,
    ctx: TenantContext,
) -> Result<Vec<FunnelDefinition>, AppError> {
    run_with_statement_retry(pool, |conn| {
        let funnel_ids: Vec<i64> = funnels::table
            .filter(funnels::tenant_id.eq(ctx.tenant_id))
            .filter(funnels::workspace_id.eq(ctx.workspace_id))
            .filter(funnels::archived_at.is_null())
            .select(funnels::id)
            .load(conn)?;

        if funnel_ids.is_empty() {
            return Ok(Vec::new());
        }

        let snapshots: Vec<(i64, serde_json::Value)> = funnel_publications::table
            .filter(funnel_publications::funnel_id.eq_any(&funnel_ids))
            .order((
                funnel_publications::funnel_id.asc(),
                funnel_publications::published_at.desc(),
            ))
            .distinct_on(funnel_publications::funnel_id)
            .select((funnel_publications::funnel_id, funnel_publications::snapshot_data))
            .load(conn)?;

        snapshots
            .into_iter()
            .map(|(funnel_id, snapshot)| {
                serde_json::from_value(snapshot).map_err(|e| {
                    AppError::Internal(format!("corrupt publication snapshot for funnel {funnel_id}: {e}"))
                })
            })
            .collect()
    })
}

pub fn load_user_state(
    pool: &DbPool,
    ctx: TenantContext,
    funnel_id: i64,
    anonymous_id: &str,
) -> Result<Option<UserFunnelState>, AppError> {
    run_with_statement_retry(pool, |conn| {
        funnel_user_states::table
            .filter(funnel_user_states::tenant_id.eq(ctx.tenant_id))
            .filter(funnel_user_states::workspace_id.eq(ctx.workspace_id))
            .filter(funnel_user_states::funnel_id.eq(funnel_id))
            .filter(funnel_user_states::anonymous_id.eq(anonymous_id))
            .select(UserFunnelState::as_select())
            .first(conn)
            .optional()
            .map_err(AppError::from)
    })
}

/// Values the processor wants persisted for one user/funnel pair.
#[derive(Debug, Clone)]
pub struct StateUpsert {
    pub funnel_version_id: i64,
    pub anonymous_id: String,
    pub lead_id: Option<String>,
    pub current_step_index: i32,
    pub entered_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: String,
}

/// Upsert on the `(tenant, workspace, funnel, anonymous_id)` key. The
/// `GREATEST`/`LEAST`/`COALESCE` combinators make the write idempotent and
/// monotonic regardless of delivery order.
pub fn upsert_user_state(
    pool: &DbPool,
    ctx: TenantContext,
    funnel_id: i64,
    upsert: &StateUpsert,
) -> Result<UserFunnelState, AppError> {
    run_with_statement_retry(pool, |conn| {
        diesel::sql_query(
            "INSERT INTO funnel_user_states \
                 (tenant_id, workspace_id, funnel_id, funnel_version_id, anonymous_id, lead_id, \
                  current_step_index, entered_at, last_activity_at, completed_at, status) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             ON CONFLICT (tenant_id, workspace_id, funnel_id, anonymous_id) DO UPDATE SET \
                 current_step_index = GREATEST(funnel_user_states.current_step_index, EXCLUDED.current_step_index), \
                 last_activity_at = GREATEST(funnel_user_states.last_activity_at, EXCLUDED.last_activity_at), \
                 entered_at = LEAST(funnel_user_states.entered_at, EXCLUDED.entered_at), \
                 completed_at = COALESCE(funnel_user_states.completed_at, EXCLUDED.completed_at), \
                 lead_id = COALESCE(EXCLUDED.lead_id, funnel_user_states.lead_id), \
                 funnel_version_id = EXCLUDED.funnel_version_id, \
                 status = CASE \
                     WHEN funnel_user_states.status = 'completed' OR EXCLUDED.status = 'completed' \
                         THEN 'completed' \
                     ELSE EXCLUDED.status \
                 END \
             RETURNING *",
        )
        .bind::<BigInt, _>(ctx.tenant_id)
        .bind::<BigInt, _>(ctx.workspace_id)
        .bind::<BigInt, _>(funnel_id)
        .bind::<BigInt, _>(upsert.funnel_version_id)
        .bind::<Text, _>(&upsert.anonymous_id)
        .bind::<Nullable<Text>, _>(&upsert.lead_id)
        .bind::<Integer, _>(upsert.current_step_index)
        .bind::<Timestamptz, _>(upsert.entered_at)
        .bind::<Timestamptz, _>(upsert.last_activity_at)
        .bind::<Nullable<Timestamptz>, _>(upsert.completed_at)
        .bind::<Text, _>(&upsert.status)
        .get_result(conn)
        .map_err(AppError::from)
    })
}

/// Marks states idle beyond their funnel's published window as abandoned.
/// Returns how many rows transitioned.
pub fn sweep_abandoned(pool: &DbPool, now: DateTime<Utc>) -> Result<usize, AppError> {
    run_with_statement_retry(pool, |conn| {
        diesel::sql_query(
            "UPDATE funnel_user_states us \
             SET status = 'abandoned', exited_at = $1 \
             FROM ( \
                 SELECT DISTINCT ON (funnel_id) funnel_id, window_days \
                 FROM funnel_publications \
                 ORDER BY funnel_id, published_at DESC \
             ) p \
             WHERE p.funnel_id = us.funnel_id \
               AND us.status = 'active' \
               AND us.last_activity_at < $1 - make_interval(days => p.window_days)",
        )
        .bind::<Timestamptz, _>(now)
        .execute(conn)
        .map_err(AppError::from)
    })
}
