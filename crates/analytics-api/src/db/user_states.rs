use diesel::prelude::*;
use diesel::result::Error as DieselError;

use funnelcast_common::db::{DbPool, run_with_statement_retry};
use funnelcast_common::error::AppError;
use funnelcast_common::funnel::UserFunnelState;
use funnelcast_common::schema::funnel_user_states;
use funnelcast_common::tenant::TenantContext;

/// Loads one user's progression through a funnel.
pub fn find_user_state(
    pool: &DbPool,
    ctx: TenantContext,
    funnel_id: i64,
    anonymous_id: &str,
) -> Result<UserFunnelState, AppError> {
    run_with_statement_retry(pool, |conn| {
        funnel_user_states::table
            .filter(funnel_user_states::tenant_id.eq(ctx.tenant_id))
            .filter(funnel_user_states::workspace_id.eq(ctx.workspace_id))
            .filter(funnel_user_states::funnel_id.eq(funnel_id))
            .filter(funnel_user_states::anonymous_id.eq(anonymous_id))
            .select(UserFunnelState::as_select())
            .first(conn)
            .map_err(|e| match e {
                DieselError::NotFound => {
                    AppError::NotFound("No funnel progression for this user".to_string())
                }
                _ => AppError::from(e),
            })
    })
}
