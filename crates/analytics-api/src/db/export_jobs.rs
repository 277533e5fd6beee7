use chrono::Utc;
use diesel::prelude::*;
use diesel::result::Error as DieselError;

use funnelcast_common::db::{DbPool, run_with_statement_retry};
use funnelcast_common::error::AppError;
use funnelcast_common::schema::export_jobs;
use funnelcast_common::tenant::TenantContext;

use crate::db::models::{ExportJobRow, NewExportJobRow};

pub const STATUS_PENDING: &str = "pending";
pub const STATUS_PROCESSING: &str = "processing";
pub const STATUS_COMPLETED: &str = "completed";
pub const STATUS_FAILED: &str = "failed";

pub fn is_terminal(status: &str) -> bool {
    status == STATUS_COMPLETED || status == STATUS_FAILED
}

pub fn insert_job(
    pool: &DbPool,
    ctx: TenantContext,
    funnel_id: i64,
    config: serde_json::Value,
    total_records: i64,
) -> Result<ExportJobRow, AppError> {
    run_with_statement_retry(pool, |conn| {
        diesel::insert_into(export_jobs::table)
            .values(NewExportJobRow {
                tenant_id: ctx.tenant_id,
                workspace_id: ctx.workspace_id,
                funnel_id,
                config: config.clone(),
                status: STATUS_PENDING.to_string(),
                total_records,
                processed_records: 0,
            })
            .get_result(conn)
            .map_err(AppError::from)
    })
}

pub fn find_job(pool: &DbPool, ctx: TenantContext, job_id: i64) -> Result<ExportJobRow, AppError> {
    run_with_statement_retry(pool, |conn| {
        export_jobs::table
            .filter(export_jobs::tenant_id.eq(ctx.tenant_id))
            .filter(export_jobs::workspace_id.eq(ctx.workspace_id))
            .filter(export_jobs::id.eq(job_id))
            .select(ExportJobRow::as_select())
            .first(conn)
            .map_err(|e| match e {
                DieselError::NotFound => AppError::NotFound("Export not found".to_string()),
                _ => AppError::from(e),
            })
    })
}

/// Worker-side lookup by id. The worker re-derives the tenant scope from
/// the row itself; callers facing the API use [`find_job`].
pub fn find_job_for_worker(pool: &DbPool, job_id: i64) -> Result<ExportJobRow, AppError> {
    run_with_statement_retry(pool, |conn| {
        export_jobs::table
            .filter(export_jobs::id.eq(job_id))
            .select(ExportJobRow::as_select())
            .first(conn)
            .map_err(|e| match e {
                DieselError::NotFound => AppError::NotFound("Export not found".to_string()),
                _ => AppError::from(e),
            })
    })
}

/// Moves a pending job to `processing`. Returns false when the job is no
/// longer pending (another worker claimed it, or it reached a terminal
/// state), so workers never double-process.
pub fn claim_job(pool: &DbPool, job_id: i64) -> Result<bool, AppError> {
    run_with_statement_retry(pool, |conn| {
        let updated = diesel::update(
            export_jobs::table
                .filter(export_jobs::id.eq(job_id))
                .filter(export_jobs::status.eq(STATUS_PENDING)),
        )
        .set((
            export_jobs::status.eq(STATUS_PROCESSING),
            export_jobs::started_at.eq(Some(Utc::now())),
        ))
        .execute(conn)?;
        Ok(updated == 1)
    })
}

pub fn update_progress(pool: &DbPool, job_id: i64, processed: i64, total: i64) -> Result<(), AppError> {
    run_with_statement_retry(pool, |conn| {
        diesel::update(
            export_jobs::table
                .filter(export_jobs::id.eq(job_id))
                .filter(export_jobs::status.eq(STATUS_PROCESSING)),
        )
        .set((
            export_jobs::processed_records.eq(processed.min(total)),
            export_jobs::total_records.eq(total),
        ))
        .execute(conn)?;
        Ok(())
    })
}

/// Terminal transition to `completed`. Guarded so a terminal row is never
/// rewritten.
pub fn complete_job(pool: &DbPool, job_id: i64, file_ref: &str, processed: i64) -> Result<(), AppError> {
    run_with_statement_retry(pool, |conn| {
        diesel::update(
            export_jobs::table
                .filter(export_jobs::id.eq(job_id))
                .filter(export_jobs::status.eq(STATUS_PROCESSING)),
        )
        .set((
            export_jobs::status.eq(STATUS_COMPLETED),
            export_jobs::file_ref.eq(Some(file_ref.to_string())),
            export_jobs::processed_records.eq(processed),
            export_jobs::completed_at.eq(Some(Utc::now())),
        ))
        .execute(conn)?;
        Ok(())
    })
}

/// Terminal transition to `failed`; failure of one job never touches others.
pub fn fail_job(pool: &DbPool, job_id: i64, error: &str) -> Result<(), AppError> {
    run_with_statement_retry(pool, |conn| {
        diesel::update(
            export_jobs::table
                .filter(export_jobs::id.eq(job_id))
                .filter(export_jobs::status.ne(STATUS_COMPLETED))
                .filter(export_jobs::status.ne(STATUS_FAILED)),
        )
        .set((
            export_jobs::status.eq(STATUS_FAILED),
            export_jobs::error.eq(Some(error.to_string())),
            export_jobs::completed_at.eq(Some(Utc::now())),
        ))
        .execute(conn)?;
        Ok(())
    })
}
