use chrono::Utc;
use diesel::prelude::*;
use diesel::result::Error as DieselError;

use funnelcast_common::db::{DbPool, run_with_statement_retry};
use funnelcast_common::error::AppError;
use funnelcast_common::funnel::{
    FunnelDefinition, StepDefinition, VersionState, validate_step_definitions,
};
use funnelcast_common::schema::{
    funnel_publications, funnel_step_matches, funnel_steps, funnel_versions, funnels,
};
use funnelcast_common::tenant::TenantContext;

use crate::db::models::{
    FunnelPublicationRow, FunnelRow, FunnelStepMatchRow, FunnelStepRow, FunnelVersionRow,
    NewFunnelPublicationRow, NewFunnelRow, NewFunnelStepMatchRow, NewFunnelStepRow,
    NewFunnelVersionRow,
};

// ── Inputs ──────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct NewFunnelInput {
    pub name: String,
    pub description: Option<String>,
    pub steps: Vec<StepDefinition>,
}

#[derive(Debug, Default)]
pub struct UpdateFunnelInput {
    pub name: Option<String>,
    pub description: Option<String>,
    pub steps: Option<Vec<StepDefinition>>,
}

#[derive(Debug)]
pub struct ListFunnelsParams {
    pub page: i64,
    pub limit: i64,
    pub search: Option<String>,
    pub state: Option<VersionState>,
    pub include_archived: bool,
}

// ── Outputs ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct StepDetail {
    pub id: i64,
    pub definition: StepDefinition,
}

#[derive(Debug)]
pub struct VersionDetail {
    pub row: FunnelVersionRow,
    pub steps: Vec<StepDetail>,
}

#[derive(Debug)]
pub struct FunnelDetail {
    pub funnel: FunnelRow,
    pub versions: Vec<VersionDetail>,
    pub publications: Vec<FunnelPublicationRow>,
}

#[derive(Debug)]
pub struct FunnelList {
    pub items: Vec<FunnelDetail>,
    pub total_count: i64,
    pub summary: FunnelSummary,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct FunnelSummary {
    pub total_funnels: i64,
    pub draft_funnels: i64,
    pub published_funnels: i64,
    pub archived_funnels: i64,
}

fn conflict_on_unique(err: AppError, message: &str) -> AppError {
    match err {
        AppError::Database(ref msg) if msg.contains("duplicate key") => {
            AppError::Conflict(message.to_string())
        }
        other => other,
    }
}

// ── Create ──────────────────────────────────────────────────────────

/// Atomically persists a funnel with version 1 (draft), its steps, and their
/// match rules. Structural violations surface as `invalid_schema`; a
/// duplicate name among non-archived funnels is a `conflict`.
pub fn create_funnel(
    pool: &DbPool,
    ctx: TenantContext,
    input: NewFunnelInput,
) -> Result<FunnelDetail, AppError> {
    validate_step_definitions(&input.steps).map_err(AppError::SchemaViolations)?;
    validate_name(&input.name)?;

    let result = run_with_statement_retry(pool, |conn| {
        conn.transaction::<_, AppError, _>(|conn| {
            ensure_name_available(conn, ctx, &input.name, None)?;

            let funnel: FunnelRow = diesel::insert_into(funnels::table)
                .values(NewFunnelRow {
                    tenant_id: ctx.tenant_id,
                    workspace_id: ctx.workspace_id,
                    name: input.name.clone(),
                    description: input.description.clone(),
                })
                .get_result(conn)?;

            let version: FunnelVersionRow = diesel::insert_into(funnel_versions::table)
                .values(NewFunnelVersionRow {
                    funnel_id: funnel.id,
                    version: 1,
                    state: VersionState::Draft.as_str().to_string(),
                })
                .get_result(conn)?;

            insert_steps(conn, version.id, &input.steps)?;

            load_detail(conn, funnel)
        })
    });

    result.map_err(|e| conflict_on_unique(e, "A funnel with this name already exists"))
}

fn validate_name(name: &str) -> Result<(), AppError> {
    if name.is_empty() || name.len() > 255 {
        return Err(AppError::Validation(
            "Funnel name must be between 1 and 255 characters".to_string(),
        ));
    }
    Ok(())
}

fn ensure_name_available(
    conn: &mut PgConnection,
    ctx: TenantContext,
    name: &str,
    exclude_funnel: Option<i64>,
) -> Result<(), AppError> {
    let mut query = funnels::table
        .filter(funnels::tenant_id.eq(ctx.tenant_id))
        .filter(funnels::workspace_id.eq(ctx.workspace_id))
        .filter(funnels::name.eq(name))
        .filter(funnels::archived_at.is_null())
        .into_boxed();

    if let Some(id) = exclude_funnel {
        query = query.filter(funnels::id.ne(id));
    }

    let count: i64 = query.count().get_result(conn)?;
    if count > 0 {
        return Err(AppError::Conflict(
            "A funnel with this name already exists".to_string(),
        ));
    }
    Ok(())
}

fn insert_steps(
    conn: &mut PgConnection,
    version_id: i64,
    steps: &[StepDefinition],
) -> Result<(), AppError> {
    for step in steps {
        let row: FunnelStepRow = diesel::insert_into(funnel_steps::table)
            .values(NewFunnelStepRow {
                funnel_version_id: version_id,
                order_index: step.order_index,
                step_type: step.step_type.as_str().to_string(),
                label: step.label.clone(),
                metadata: step.metadata.clone(),
            })
            .get_result(conn)?;

        let match_rows: Vec<NewFunnelStepMatchRow> = step
            .matches
            .iter()
            .map(|rule| {
                serde_json::to_value(rule)
                    .map(|rules| NewFunnelStepMatchRow {
                        funnel_step_id: row.id,
                        kind: rule.kind().to_string(),
                        rules,
                    })
                    .map_err(|e| AppError::Internal(format!("failed to serialise match rule: {e}")))
            })
            .collect::<Result<_, _>>()?;

        diesel::insert_into(funnel_step_matches::table)
            .values(&match_rows)
            .execute(conn)?;
    }
    Ok(())
}

// ── Read ────────────────────────────────────────────────────────────

fn find_scoped(
    conn: &mut PgConnection,
    ctx: TenantContext,
    funnel_id: i64,
    include_archived: bool,
) -> Result<FunnelRow, AppError> {
    let mut query = funnels::table
        .filter(funnels::tenant_id.eq(ctx.tenant_id))
        .filter(funnels::workspace_id.eq(ctx.workspace_id))
        .filter(funnels::id.eq(funnel_id))
        .into_boxed();

    if !include_archived {
        query = query.filter(funnels::archived_at.is_null());
    }

    query
        .select(FunnelRow::as_select())
        .first::<FunnelRow>(conn)
        .map_err(|e| match e {
            DieselError::NotFound => AppError::NotFound("Funnel not found".into()),
            _ => AppError::from(e),
        })
}

fn load_detail(conn: &mut PgConnection, funnel: FunnelRow) -> Result<FunnelDetail, AppError> {
    let versions: Vec<FunnelVersionRow> = funnel_versions::table
        .filter(funnel_versions::funnel_id.eq(funnel.id))
        .order(funnel_versions::version.desc())
        .select(FunnelVersionRow::as_select())
        .load(conn)?;

    let version_ids: Vec<i64> = versions.iter().map(|v| v.id).collect();

    let step_rows: Vec<FunnelStepRow> = funnel_steps::table
        .filter(funnel_steps::funnel_version_id.eq_any(&version_ids))
        .order((funnel_steps::funnel_version_id.asc(), funnel_steps::order_index.asc()))
        .select(FunnelStepRow::as_select())
        .load(conn)?;

    let step_ids: Vec<i64> = step_rows.iter().map(|s| s.id).collect();

    let match_rows: Vec<FunnelStepMatchRow> = funnel_step_matches::table
        .filter(funnel_step_matches::funnel_step_id.eq_any(&step_ids))
        .select(FunnelStepMatchRow::as_select())
        .load(conn)?;

    let mut details: Vec<VersionDetail> = versions
        .into_iter()
        .map(|row| VersionDetail { row, steps: Vec::new() })
        .collect();

    for step_row in step_rows {
        let matches = match_rows
            .iter()
            .filter(|m| m.funnel_step_id == step_row.id)
            .map(|m| serde_json::from_value(m.rules.clone()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| AppError::Internal(format!("corrupt match rule row: {e}")))?;

        let step_type = funnelcast_common::funnel::StepType::parse(&step_row.step_type)?;

        if let Some(detail) = details
            .iter_mut()
            .find(|d| d.row.id == step_row.funnel_version_id)
        {
            detail.steps.push(StepDetail {
                id: step_row.id,
                definition: StepDefinition {
                    order_index: step_row.order_index,
                    step_type,
                    label: step_row.label,
                    metadata: step_row.metadata,
                    matches,
                },
            });
        }
    }

    let publications: Vec<FunnelPublicationRow> = funnel_publications::table
        .filter(funnel_publications::funnel_id.eq(funnel.id))
        .order(funnel_publications::published_at.desc())
        .select(FunnelPublicationRow::as_select())
        .load(conn)?;

    Ok(FunnelDetail { funnel, versions: details, publications })
}

/// Returns a non-archived funnel with its versions (descending), steps,
/// matches and publications.
pub fn get_funnel(pool: &DbPool, ctx: TenantContext, funnel_id: i64) -> Result<FunnelDetail, AppError> {
    run_with_statement_retry(pool, |conn| {
        let funnel = find_scoped(conn, ctx, funnel_id, false)?;
        load_detail(conn, funnel)
    })
}

/// Page-based listing with case-insensitive search over name/description and
/// an any-version state filter.
pub fn list_funnels(
    pool: &DbPool,
    ctx: TenantContext,
    params: &ListFunnelsParams,
) -> Result<FunnelList, AppError> {
    if !(1..=1000).contains(&params.limit) {
        return Err(AppError::Validation("limit must be between 1 and 1000".to_string()));
    }
    let page = params.page.max(1);
    let offset = (page - 1) * params.limit;

    run_with_statement_retry(pool, |conn| {
        let build_filter = || {
            let mut query = funnels::table
                .filter(funnels::tenant_id.eq(ctx.tenant_id))
                .filter(funnels::workspace_id.eq(ctx.workspace_id))
                .into_boxed();

            if !params.include_archived {
                query = query.filter(funnels::archived_at.is_null());
            }

            if let Some(ref search) = params.search {
                let pattern = format!("%{}%", search);
                query = query.filter(
                    funnels::name
                        .ilike(pattern.clone())
                        .or(funnels::description.ilike(pattern)),
                );
            }

            if let Some(state) = params.state {
                query = query.filter(diesel::dsl::exists(
                    funnel_versions::table
                        .filter(funnel_versions::funnel_id.eq(funnels::id))
                        .filter(funnel_versions::state.eq(state.as_str())),
                ));
            }

            query
        };

        let total_count: i64 = build_filter().count().get_result(conn)?;

        let rows: Vec<FunnelRow> = build_filter()
            .order(funnels::created_at.desc())
            .limit(params.limit)
            .offset(offset)
            .select(FunnelRow::as_select())
            .load(conn)?;

        let items = rows
            .into_iter()
            .map(|row| load_detail(conn, row))
            .collect::<Result<Vec<_>, _>>()?;

        let summary = summary_counts(conn, ctx)?;

        Ok(FunnelList { items, total_count, summary })
    })
}

fn summary_counts(conn: &mut PgConnection, ctx: TenantContext) -> Result<FunnelSummary, AppError> {
    let scoped = || {
        funnels::table
            .filter(funnels::tenant_id.eq(ctx.tenant_id))
            .filter(funnels::workspace_id.eq(ctx.workspace_id))
    };

    let total_funnels: i64 = scoped()
        .filter(funnels::archived_at.is_null())
        .count()
        .get_result(conn)?;

    let archived_funnels: i64 = scoped()
        .filter(funnels::archived_at.is_not_null())
        .count()
        .get_result(conn)?;

    let with_state = |state: VersionState, conn: &mut PgConnection| -> Result<i64, AppError> {
        scoped()
            .filter(funnels::archived_at.is_null())
            .filter(diesel::dsl::exists(
                funnel_versions::table
                    .filter(funnel_versions::funnel_id.eq(funnels::id))
                    .filter(funnel_versions::state.eq(state.as_str())),
            ))
            .count()
            .get_result(conn)
            .map_err(AppError::from)
    };

    Ok(FunnelSummary {
        total_funnels,
        draft_funnels: with_state(VersionState::Draft, conn)?,
        published_funnels: with_state(VersionState::Published, conn)?,
        archived_funnels,
    })
}

/// Workspace-level funnel counts.
pub fn funnel_summary(pool: &DbPool, ctx: TenantContext) -> Result<FunnelSummary, AppError> {
    run_with_statement_retry(pool, |conn| summary_counts(conn, ctx))
}

// ── Update ──────────────────────────────────────────────────────────

/// Updates name/description in place. When steps are supplied a NEW draft
/// version (max+1) is created with them; an existing draft is superseded
/// (archived) so at most one draft exists per funnel. Published versions are
/// never touched.
pub fn update_funnel(
    pool: &DbPool,
    ctx: TenantContext,
    funnel_id: i64,
    input: UpdateFunnelInput,
) -> Result<FunnelDetail, AppError> {
    if let Some(ref steps) = input.steps {
        validate_step_definitions(steps).map_err(AppError::SchemaViolations)?;
    }
    if let Some(ref name) = input.name {
        validate_name(name)?;
    }

    let result = run_with_statement_retry(pool, |conn| {
        conn.transaction::<_, AppError, _>(|conn| {
            let funnel = find_scoped(conn, ctx, funnel_id, false)?;

            if let Some(ref name) = input.name
                && *name != funnel.name
            {
                ensure_name_available(conn, ctx, name, Some(funnel.id))?;
            }

            let funnel: FunnelRow = diesel::update(funnels::table.filter(funnels::id.eq(funnel.id)))
                .set((
                    funnels::name.eq(input.name.clone().unwrap_or(funnel.name)),
                    funnels::description.eq(input.description.clone().or(funnel.description)),
                    funnels::updated_at.eq(Utc::now()),
                ))
                .get_result(conn)?;

            if let Some(ref steps) = input.steps {
                // Supersede the current draft, if any; published versions stay.
                diesel::update(
                    funnel_versions::table
                        .filter(funnel_versions::funnel_id.eq(funnel.id))
                        .filter(funnel_versions::state.eq(VersionState::Draft.as_str())),
                )
                .set(funnel_versions::state.eq(VersionState::Archived.as_str()))
                .execute(conn)?;

                let max_version: Option<i32> = funnel_versions::table
                    .filter(funnel_versions::funnel_id.eq(funnel.id))
                    .select(diesel::dsl::max(funnel_versions::version))
                    .first(conn)?;

                let version: FunnelVersionRow = diesel::insert_into(funnel_versions::table)
                    .values(NewFunnelVersionRow {
                        funnel_id: funnel.id,
                        version: max_version.unwrap_or(0) + 1,
                        state: VersionState::Draft.as_str().to_string(),
                    })
                    .get_result(conn)?;

                insert_steps(conn, version.id, steps)?;
            }

            load_detail(conn, funnel)
        })
    });

    result.map_err(|e| conflict_on_unique(e, "A funnel with this name already exists"))
}

// ── Archive ─────────────────────────────────────────────────────────

/// Soft-archives a funnel. Idempotent: archiving an archived funnel is a
/// no-op that returns the current record.
pub fn archive_funnel(pool: &DbPool, ctx: TenantContext, funnel_id: i64) -> Result<FunnelDetail, AppError> {
    run_with_statement_retry(pool, |conn| {
        conn.transaction::<_, AppError, _>(|conn| {
            let funnel = find_scoped(conn, ctx, funnel_id, true)?;

            let funnel = if funnel.archived_at.is_none() {
                diesel::update(funnels::table.filter(funnels::id.eq(funnel.id)))
                    .set((
                        funnels::archived_at.eq(Some(Utc::now())),
                        funnels::updated_at.eq(Utc::now()),
                    ))
                    .get_result(conn)?
            } else {
                funnel
            };

            load_detail(conn, funnel)
        })
    })
}

// ── Publish ─────────────────────────────────────────────────────────

/// Publishes a version: the version must currently be `draft` or `published`
/// (re-publish refreshes the snapshot). Inserts an immutable publication row
/// carrying the full definition by value.
pub fn publish_funnel(
    pool: &DbPool,
    ctx: TenantContext,
    funnel_id: i64,
    version: i32,
    window_days: i32,
    notes: Option<String>,
) -> Result<FunnelPublicationRow, AppError> {
    if window_days <= 0 {
        return Err(AppError::Validation("window_days must be positive".to_string()));
    }

    run_with_statement_retry(pool, |conn| {
        conn.transaction::<_, AppError, _>(|conn| {
            let funnel = find_scoped(conn, ctx, funnel_id, false)?;

            let version_row: FunnelVersionRow = funnel_versions::table
                .filter(funnel_versions::funnel_id.eq(funnel.id))
                .filter(funnel_versions::version.eq(version))
                .select(FunnelVersionRow::as_select())
                .first(conn)
                .map_err(|e| match e {
                    DieselError::NotFound => {
                        AppError::Conflict(format!("Version {version} not found"))
                    }
                    _ => AppError::from(e),
                })?;

            match VersionState::parse(&version_row.state)? {
                VersionState::Draft | VersionState::Published => {}
                VersionState::Archived => {
                    return Err(AppError::Conflict(format!(
                        "Version {version} has been archived and cannot be published"
                    )));
                }
            }

            diesel::update(funnel_versions::table.filter(funnel_versions::id.eq(version_row.id)))
                .set(funnel_versions::state.eq(VersionState::Published.as_str()))
                .execute(conn)?;

            let definition = load_definition_for_version(conn, &funnel, &version_row, window_days)?;
            let snapshot = serde_json::to_value(&definition)
                .map_err(|e| AppError::Internal(format!("failed to serialise snapshot: {e}")))?;

            let publication: FunnelPublicationRow =
                diesel::insert_into(funnel_publications::table)
                    .values(NewFunnelPublicationRow {
                        funnel_id: funnel.id,
                        version,
                        window_days,
                        notes: notes.clone(),
                        snapshot_data: snapshot,
                    })
                    .get_result(conn)?;

            Ok(publication)
        })
    })
}

fn load_definition_for_version(
    conn: &mut PgConnection,
    funnel: &FunnelRow,
    version: &FunnelVersionRow,
    window_days: i32,
) -> Result<FunnelDefinition, AppError> {
    let step_rows: Vec<FunnelStepRow> = funnel_steps::table
        .filter(funnel_steps::funnel_version_id.eq(version.id))
        .order(funnel_steps::order_index.asc())
        .select(FunnelStepRow::as_select())
        .load(conn)?;

    let step_ids: Vec<i64> = step_rows.iter().map(|s| s.id).collect();
    let match_rows: Vec<FunnelStepMatchRow> = funnel_step_matches::table
        .filter(funnel_step_matches::funnel_step_id.eq_any(&step_ids))
        .select(FunnelStepMatchRow::as_select())
        .load(conn)?;

    let steps = step_rows
        .into_iter()
        .map(|row| {
            let matches = match_rows
                .iter()
                .filter(|m| m.funnel_step_id == row.id)
                .map(|m| serde_json::from_value(m.rules.clone()))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| AppError::Internal(format!("corrupt match rule row: {e}")))?;
            Ok(StepDefinition {
                order_index: row.order_index,
                step_type: funnelcast_common::funnel::StepType::parse(&row.step_type)?,
                label: row.label,
                metadata: row.metadata,
                matches,
            })
        })
        .collect::<Result<Vec<_>, AppError>>()?;

    Ok(FunnelDefinition {
        funnel_id: funnel.id,
        funnel_version_id: version.id,
        version: version.version,
        window_days,
        steps,
    })
}

// ── Analytics resolution ────────────────────────────────────────────

/// Resolves the definition analytics run against: the latest publication
/// snapshot of a non-archived, tenant-scoped funnel.
pub fn resolve_published(
    pool: &DbPool,
    ctx: TenantContext,
    funnel_id: i64,
) -> Result<(FunnelRow, FunnelDefinition), AppError> {
    run_with_statement_retry(pool, |conn| {
        let funnel = find_scoped(conn, ctx, funnel_id, false)?;

        let publication: FunnelPublicationRow = funnel_publications::table
            .filter(funnel_publications::funnel_id.eq(funnel.id))
            .order(funnel_publications::published_at.desc())
            .select(FunnelPublicationRow::as_select())
            .first(conn)
            .map_err(|e| match e {
                DieselError::NotFound => {
                    AppError::Conflict("Funnel has no published version".to_string())
                }
                _ => AppError::from(e),
            })?;

        let definition: FunnelDefinition = serde_json::from_value(publication.snapshot_data)
            .map_err(|e| AppError::Internal(format!("corrupt publication snapshot: {e}")))?;

        Ok((funnel, definition))
    })
}
