use chrono::{DateTime, Utc};
use diesel::prelude::*;

use funnelcast_common::schema::{
    export_jobs, funnel_publications, funnel_step_matches, funnel_steps, funnel_versions, funnels,
};

// ── Funnels ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = funnels)]
pub struct FunnelRow {
    pub id: i64,
    pub tenant_id: i64,
    pub workspace_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = funnels)]
pub struct NewFunnelRow {
    pub tenant_id: i64,
    pub workspace_id: i64,
    pub name: String,
    pub description: Option<String>,
}

// ── Versions ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = funnel_versions)]
pub struct FunnelVersionRow {
    pub id: i64,
    pub funnel_id: i64,
    pub version: i32,
    pub state: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = funnel_versions)]
pub struct NewFunnelVersionRow {
    pub funnel_id: i64,
    pub version: i32,
    pub state: String,
}

// ── Steps ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = funnel_steps)]
pub struct FunnelStepRow {
    pub id: i64,
    pub funnel_version_id: i64,
    pub order_index: i32,
    pub step_type: String,
    pub label: String,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = funnel_steps)]
pub struct NewFunnelStepRow {
    pub funnel_version_id: i64,
    pub order_index: i32,
    pub step_type: String,
    pub label: String,
    pub metadata: Option<serde_json::Value>,
}

// ── Step matches ────────────────────────────────────────────────────

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = funnel_step_matches)]
pub struct FunnelStepMatchRow {
    pub id: i64,
    pub funnel_step_id: i64,
    pub kind: String,
    pub rules: serde_json::Value,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = funnel_step_matches)]
pub struct NewFunnelStepMatchRow {
    pub funnel_step_id: i64,
    pub kind: String,
    pub rules: serde_json::Value,
}

// ── Publications ────────────────────────────────────────────────────

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = funnel_publications)]
pub struct FunnelPublicationRow {
    pub id: i64,
    pub funnel_id: i64,
    pub version: i32,
    pub published_at: DateTime<Utc>,
    pub window_days: i32,
    pub notes: Option<String>,
    pub snapshot_data: serde_json::Value,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = funnel_publications)]
pub struct NewFunnelPublicationRow {
    pub funnel_id: i64,
    pub version: i32,
    pub window_days: i32,
    pub notes: Option<String>,
    pub snapshot_data: serde_json::Value,
}

// ── Export jobs ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = export_jobs)]
pub struct ExportJobRow {
    pub id: i64,
    pub tenant_id: i64,
    pub workspace_id: i64,
    pub funnel_id: i64,
    pub config: serde_json::Value,
    pub status: String,
    pub total_records: i64,
    pub processed_records: i64,
    pub file_ref: Option<String>,
    pub error: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = export_jobs)]
pub struct NewExportJobRow {
    pub tenant_id: i64,
    pub workspace_id: i64,
    pub funnel_id: i64,
    pub config: serde_json::Value,
    pub status: String,
    pub total_records: i64,
    pub processed_records: i64,
}
