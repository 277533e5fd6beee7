//! Export job intake: validation, size estimation, persistence and enqueue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use funnelcast_common::db::DbPool;
use funnelcast_common::error::AppError;
use funnelcast_common::ids::{IdKind, format_id};
use funnelcast_common::tenant::TenantContext;

use crate::analytics::engine::{MAX_EXTENDED_WINDOW_DAYS, RequestedRange, parse_range};
use crate::db::export_jobs;
use crate::db::funnels as funnel_store;

// ── Request ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportRequest {
    pub format: ExportFormat,
    pub export_type: ExportType,
    #[serde(flatten)]
    pub range: RequestedRange,
    #[serde(default = "default_delivery")]
    pub delivery: DeliveryMethod,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub anonymize: bool,
    #[serde(default)]
    pub include_cohorts: bool,
    #[serde(default)]
    pub include_attribution: bool,
}

fn default_delivery() -> DeliveryMethod {
    DeliveryMethod::Download
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Csv,
    Json,
    Excel,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Json => "json",
            ExportFormat::Excel => "xlsx",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportType {
    Summary,
    Detailed,
    RawEvents,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMethod {
    Download,
    Email,
}

// ── Responses ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ExportCreated {
    pub export_id: String,
    pub status: String,
    pub metadata: ExportEstimate,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ExportEstimate {
    pub estimated_records: i64,
    pub estimated_bytes: i64,
    pub estimated_duration_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportStatus {
    pub export_id: String,
    pub status: String,
    pub progress_percent: i64,
    pub total_records: i64,
    pub processed_records: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub requested_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

// ── Delivery contract ───────────────────────────────────────────────

/// Host-provided delivery hook for email exports. The core hands over the
/// artifact reference; transport is external.
pub trait Notifier: Send + Sync {
    fn export_ready(&self, email: &str, download_url: &str);
}

/// Default notifier used until the host wires a real sink.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn export_ready(&self, email: &str, download_url: &str) {
        tracing::info!(email, download_url, "export ready notification");
    }
}

// ── Manager ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ExportConfig {
    pub directory: String,
    pub download_base_url: String,
}

#[derive(Clone)]
pub struct ExportManager {
    pool: DbPool,
    sender: mpsc::Sender<i64>,
    config: ExportConfig,
}

impl ExportManager {
    /// Creates the manager plus the receiving end the worker consumes.
    pub fn new(pool: DbPool, config: ExportConfig) -> (Self, mpsc::Receiver<i64>) {
        let (sender, receiver) = mpsc::channel(256);
        (Self { pool, sender, config }, receiver)
    }

    /// Validates the request, persists a pending job, enqueues it and
    /// returns immediately.
    pub async fn create_export(
        &self,
        ctx: TenantContext,
        funnel_id: i64,
        request: &ExportRequest,
    ) -> Result<ExportCreated, AppError> {
        validate_request(request)?;

        // The funnel must resolve before we accept work for it.
        let (_, definition) = funnel_store::resolve_published(&self.pool, ctx, funnel_id)?;
        let estimate = estimate(request, definition.total_steps());

        let config = serde_json::to_value(request)
            .map_err(|e| AppError::Internal(format!("failed to serialise export config: {e}")))?;

        let job = export_jobs::insert_job(&self.pool, ctx, funnel_id, config, estimate.estimated_records)?;

        self.sender
            .send(job.id)
            .await
            .map_err(|_| AppError::Internal("export worker is not running".to_string()))?;

        tracing::info!(
            export_id = job.id,
            funnel_id,
            tenant_id = ctx.tenant_id,
            workspace_id = ctx.workspace_id,
            "export job enqueued"
        );

        Ok(ExportCreated {
            export_id: format_id(IdKind::Export, job.id),
            status: export_jobs::STATUS_PENDING.to_string(),
            metadata: estimate,
        })
    }

    /// Current job state with progress and, once completed, the download
    /// reference valid for 24 hours.
    pub fn export_status(&self, ctx: TenantContext, job_id: i64) -> Result<ExportStatus, AppError> {
        let job = export_jobs::find_job(&self.pool, ctx, job_id)?;

        let progress_percent = if job.total_records > 0 {
            ((job.processed_records as f64 / job.total_records as f64) * 100.0).round() as i64
        } else if job.status == export_jobs::STATUS_COMPLETED {
            100
        } else {
            0
        };

        let (download_url, download_expires_at) = match (&job.file_ref, job.completed_at) {
            (Some(file_ref), Some(completed_at)) if job.status == export_jobs::STATUS_COMPLETED => {
                let expires_at = completed_at + chrono::Duration::hours(24);
                if Utc::now() < expires_at {
                    (
                        Some(format!(
                            "{}/{}",
                            self.config.download_base_url.trim_end_matches('/'),
                            file_ref
                        )),
                        Some(expires_at),
                    )
                } else {
                    (None, Some(expires_at))
                }
            }
            _ => (None, None),
        };

        Ok(ExportStatus {
            export_id: format_id(IdKind::Export, job.id),
            status: job.status,
            progress_percent: progress_percent.min(100),
            total_records: job.total_records,
            processed_records: job.processed_records,
            download_url,
            download_expires_at,
            error: job.error,
            requested_at: job.requested_at,
            completed_at: job.completed_at,
        })
    }

    pub fn config(&self) -> &ExportConfig {
        &self.config
    }
}

// ── Validation & estimation ─────────────────────────────────────────

pub(crate) fn validate_request(request: &ExportRequest) -> Result<(), AppError> {
    parse_range(&request.range, MAX_EXTENDED_WINDOW_DAYS)?;

    if request.delivery == DeliveryMethod::Email {
        match &request.email {
            Some(email) if email.contains('@') && email.len() >= 5 => {}
            _ => {
                return Err(AppError::Validation(
                    "email delivery requires a valid email address".to_string(),
                ));
            }
        }
    }

    Ok(())
}

/// Size estimate from the step count and type/format multipliers. The
/// numbers steer progress reporting and worker scheduling; the worker
/// replaces them with exact counts once it knows them.
pub(crate) fn estimate(request: &ExportRequest, total_steps: usize) -> ExportEstimate {
    let base = total_steps.max(1) as i64;

    let mut records = match request.export_type {
        ExportType::Summary => base,
        ExportType::Detailed => base * 5,
        ExportType::RawEvents => base * 1000,
    };
    if request.include_cohorts {
        records += base * 4;
    }
    if request.include_attribution {
        records += base * 2;
    }

    let bytes_per_record = match request.format {
        ExportFormat::Csv => 120,
        ExportFormat::Json => 320,
        ExportFormat::Excel => 180,
    };

    ExportEstimate {
        estimated_records: records,
        estimated_bytes: records * bytes_per_record,
        estimated_duration_ms: 500 + records * 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(delivery: DeliveryMethod, email: Option<&str>) -> ExportRequest {
        ExportRequest {
            format: ExportFormat::Csv,
            export_type: ExportType::Summary,
            range: RequestedRange {
                start_date: "2025-03-01".to_string(),
                end_date: "2025-03-31".to_string(),
            },
            delivery,
            email: email.map(str::to_string),
            anonymize: false,
            include_cohorts: false,
            include_attribution: false,
        }
    }

    #[test]
    fn email_delivery_requires_email() {
        assert!(validate_request(&request(DeliveryMethod::Download, None)).is_ok());
        assert!(validate_request(&request(DeliveryMethod::Email, None)).is_err());
        assert!(validate_request(&request(DeliveryMethod::Email, Some("x"))).is_err());
        assert!(validate_request(&request(DeliveryMethod::Email, Some("a@b.co"))).is_ok());
    }

    #[test]
    fn inverted_range_is_rejected() {
        let mut bad = request(DeliveryMethod::Download, None);
        bad.range.start_date = "2025-04-01".to_string();
        assert!(validate_request(&bad).is_err());
    }

    #[test]
    fn estimates_scale_with_type_and_format() {
        let summary = estimate(&request(DeliveryMethod::Download, None), 3);
        assert_eq!(summary.estimated_records, 3);

        let mut detailed = request(DeliveryMethod::Download, None);
        detailed.export_type = ExportType::Detailed;
        detailed.include_cohorts = true;
        let detailed_estimate = estimate(&detailed, 3);
        assert_eq!(detailed_estimate.estimated_records, 3 * 5 + 3 * 4);

        let mut raw = request(DeliveryMethod::Download, None);
        raw.export_type = ExportType::RawEvents;
        raw.format = ExportFormat::Json;
        let raw_estimate = estimate(&raw, 3);
        assert_eq!(raw_estimate.estimated_records, 3000);
        assert_eq!(raw_estimate.estimated_bytes, 3000 * 320);
    }
}
