//! Export worker loop.
//!
//! Consumes job ids from the manager's channel, claims each job so it is
//! processed at most once, builds the artifact, and records the terminal
//! state. A failure is terminal for that job only; the loop keeps serving
//! the queue.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, watch};

use funnelcast_common::cache::CacheClass;
use funnelcast_common::db::DbPool;
use funnelcast_common::error::AppError;
use funnelcast_common::ids::{IdKind, format_id};
use funnelcast_common::tenant::TenantContext;

use crate::analytics::AnalyticsEngine;
use crate::analytics::attribution::AttributionRequest;
use crate::analytics::cohort::CohortRequest;
use crate::analytics::conversion::ConversionRequest;
use crate::analytics::dropoff::DropoffRequest;
use crate::analytics::engine::parse_range;
use crate::analytics::timing::TimingRequest;
use crate::db::export_jobs;
use crate::export::anonymize;
use crate::export::formats::{self, ExportData, ExportMetadata};
use crate::export::manager::{DeliveryMethod, ExportConfig, ExportFormat, ExportRequest, ExportType, Notifier};
use crate::repository::events;

const RAW_EVENTS_PAGE_SIZE: i64 = 1000;

pub struct ExportWorker {
    pool: DbPool,
    engine: AnalyticsEngine,
    receiver: mpsc::Receiver<i64>,
    config: ExportConfig,
    notifier: Arc<dyn Notifier>,
}

impl ExportWorker {
    pub fn new(
        pool: DbPool,
        engine: AnalyticsEngine,
        receiver: mpsc::Receiver<i64>,
        config: ExportConfig,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self { pool, engine, receiver, config, notifier }
    }

    /// Runs until the channel closes or shutdown is signalled. Jobs still
    /// queued at shutdown stay `pending` and are picked up on restart.
    pub async fn run(mut self, mut cancel: watch::Receiver<bool>) {
        tracing::info!(directory = %self.config.directory, "export worker started");

        if let Err(e) = std::fs::create_dir_all(&self.config.directory) {
            tracing::error!(error = %e, directory = %self.config.directory, "failed to create export directory");
        }

        loop {
            tokio::select! {
                maybe_job = self.receiver.recv() => {
                    match maybe_job {
                        Some(job_id) => self.handle(job_id).await,
                        None => break,
                    }
                }
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        tracing::info!("export worker received shutdown signal");
                        break;
                    }
                }
            }
        }

        tracing::info!("export worker shut down");
    }

    async fn handle(&self, job_id: i64) {
        match export_jobs::claim_job(&self.pool, job_id) {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(export_id = job_id, "export job no longer pending, skipping");
                return;
            }
            Err(e) => {
                tracing::error!(export_id = job_id, error = %e, "failed to claim export job");
                return;
            }
        }

        if let Err(e) = self.process(job_id).await {
            tracing::error!(export_id = job_id, error = %e, "export job failed");
            if let Err(mark_err) = export_jobs::fail_job(&self.pool, job_id, &e.to_string()) {
                tracing::error!(export_id = job_id, error = %mark_err, "failed to record export failure");
            }
        }
    }

    async fn process(&self, job_id: i64) -> Result<(), AppError> {
        let job = export_jobs::find_job_for_worker(&self.pool, job_id)?;
        let ctx = TenantContext::new(job.tenant_id, job.workspace_id);

        let request: ExportRequest = serde_json::from_value(job.config.clone())
            .map_err(|e| AppError::Internal(format!("corrupt export config: {e}")))?;

        let data = self.build_data(ctx, job.funnel_id, &request, job_id).await?;

        let file_name = format!(
            "export_{}_{}.{}",
            job_id,
            export_type_slug(request.export_type),
            request.format.extension()
        );
        let path = PathBuf::from(&self.config.directory).join(&file_name);

        let records = match request.format {
            ExportFormat::Csv => formats::write_csv(&data, &path)?,
            ExportFormat::Json => formats::write_json(&data, &path, request.anonymize)?,
            ExportFormat::Excel => formats::write_excel(&data, &path)?,
        };

        export_jobs::update_progress(&self.pool, job_id, records, records.max(job.total_records))?;
        export_jobs::complete_job(&self.pool, job_id, &file_name, records)?;

        tracing::info!(
            export_id = job_id,
            records,
            file = %file_name,
            "export job completed"
        );

        if request.delivery == DeliveryMethod::Email
            && let Some(email) = &request.email
        {
            let download_url = format!(
                "{}/{}",
                self.config.download_base_url.trim_end_matches('/'),
                file_name
            );
            self.notifier.export_ready(email, &download_url);
        }

        Ok(())
    }

    async fn build_data(
        &self,
        ctx: TenantContext,
        funnel_id: i64,
        request: &ExportRequest,
        job_id: i64,
    ) -> Result<ExportData, AppError> {
        // Analytical sections are cacheable; raw event pages are not.
        let cache_key = export_cache_key(funnel_id, request);
        if request.export_type != ExportType::RawEvents
            && let Some(cached) = self.engine.cache().get::<ExportData>(&cache_key)
        {
            return Ok(cached);
        }

        let conversion_request = ConversionRequest {
            range: request.range.clone(),
            include_segments: false,
            include_time_series: false,
            time_series_granularity: crate::repository::Granularity::Daily,
            include_significance: false,
            include_peer_comparison: false,
        };
        let conversion = self.engine.conversion(ctx, funnel_id, &conversion_request)?;

        let mut data = ExportData {
            export_metadata: ExportMetadata {
                funnel_id: format_id(IdKind::Funnel, funnel_id),
                funnel_name: conversion.data.funnel_name.clone(),
                export_type: export_type_slug(request.export_type).to_string(),
                format: request.format.extension().to_string(),
                start_date: request.range.start_date.clone(),
                end_date: request.range.end_date.clone(),
                generated_at: Utc::now(),
            },
            summary: conversion.data.overall.clone(),
            step_data: conversion.data.steps.clone(),
            dropoff_analysis: None,
            timing_analysis: None,
            cohort_analysis: None,
            attribution_analysis: None,
            raw_events: None,
        };

        match request.export_type {
            ExportType::Summary => {}
            ExportType::Detailed => {
                let dropoff = self.engine.dropoff(
                    ctx,
                    funnel_id,
                    &DropoffRequest {
                        range: request.range.clone(),
                        include_exit_paths: true,
                        include_recommendations: true,
                    },
                )?;
                data.dropoff_analysis = Some(dropoff.data);

                let timing = self.engine.timing(
                    ctx,
                    funnel_id,
                    &TimingRequest {
                        range: request.range.clone(),
                        trend_granularity: crate::repository::Granularity::Daily,
                    },
                )?;
                data.timing_analysis = Some(timing.data);

                if request.include_cohorts {
                    let cohorts = self.engine.cohorts(
                        ctx,
                        funnel_id,
                        &CohortRequest {
                            range: request.range.clone(),
                            period: crate::repository::CohortPeriod::Weekly,
                            include_segments: false,
                            include_comparisons: true,
                        },
                    )?;
                    data.cohort_analysis = Some(cohorts.data);
                }

                if request.include_attribution {
                    let attribution = self.engine.attribution(
                        ctx,
                        funnel_id,
                        &AttributionRequest {
                            range: request.range.clone(),
                            models: vec![
                                crate::analytics::attribution::AttributionModel::FirstTouch,
                                crate::analytics::attribution::AttributionModel::LastTouch,
                                crate::analytics::attribution::AttributionModel::Linear,
                            ],
                            lookback_days: 90,
                            half_life_days: 7.0,
                            position_weights: None,
                            custom_weights: None,
                            top_n: 10,
                        },
                    )?;
                    data.attribution_analysis = Some(attribution.data);
                }
            }
            ExportType::RawEvents => {
                let range = parse_range(&request.range, crate::analytics::engine::MAX_EXTENDED_WINDOW_DAYS)?;
                let total = events::count_funnel_events(&self.pool, ctx, funnel_id, range)?;
                export_jobs::update_progress(&self.pool, job_id, 0, total)?;

                let mut rows = Vec::new();
                let mut offset = 0i64;
                loop {
                    let page = events::funnel_events_page(
                        &self.pool,
                        ctx,
                        funnel_id,
                        range,
                        RAW_EVENTS_PAGE_SIZE,
                        offset,
                    )?;
                    if page.is_empty() {
                        break;
                    }
                    offset += page.len() as i64;
                    rows.extend(page);
                    export_jobs::update_progress(&self.pool, job_id, offset, total)?;
                }

                if request.anonymize {
                    for row in &mut rows {
                        row.anonymous_id = anonymize::pseudonym(&row.anonymous_id);
                    }
                }
                data.raw_events = Some(rows);
            }
        }

        if request.export_type != ExportType::RawEvents {
            self.engine.cache().set(&cache_key, &data, CacheClass::ExportData);
        }

        Ok(data)
    }
}

fn export_type_slug(export_type: ExportType) -> &'static str {
    match export_type {
        ExportType::Summary => "summary",
        ExportType::Detailed => "detailed",
        ExportType::RawEvents => "raw_events",
    }
}

/// `export_data:{funnel}:{configHash}`, shared across jobs with the same
/// funnel and configuration.
fn export_cache_key(funnel_id: i64, request: &ExportRequest) -> String {
    let config = serde_json::to_string(request).unwrap_or_default();
    let digest = Sha256::digest(config.as_bytes());
    format!("export_data:{}:{}", funnel_id, &hex::encode(digest)[..16])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::engine::RequestedRange;

    fn request(export_type: ExportType) -> ExportRequest {
        ExportRequest {
            format: ExportFormat::Csv,
            export_type,
            range: RequestedRange {
                start_date: "2025-03-01".to_string(),
                end_date: "2025-03-31".to_string(),
            },
            delivery: DeliveryMethod::Download,
            email: None,
            anonymize: false,
            include_cohorts: false,
            include_attribution: false,
        }
    }

    #[test]
    fn cache_key_is_deterministic_per_config() {
        let a = export_cache_key(1, &request(ExportType::Summary));
        let b = export_cache_key(1, &request(ExportType::Summary));
        assert_eq!(a, b);
        assert!(a.starts_with("export_data:1:"));

        let other_type = export_cache_key(1, &request(ExportType::Detailed));
        assert_ne!(a, other_type);
        let other_funnel = export_cache_key(2, &request(ExportType::Summary));
        assert_ne!(a, other_funnel);
    }
}
