//! Artifact writers: CSV, JSON and the two-sheet Excel workbook.

use std::path::Path;

use chrono::{DateTime, Utc};
use rust_xlsxwriter::Workbook;
use serde::{Deserialize, Serialize};

use funnelcast_common::error::AppError;

use crate::analytics::attribution::AttributionAnalysis;
use crate::analytics::cohort::CohortAnalysis;
use crate::analytics::conversion::{OverallMetrics, StepMetrics};
use crate::analytics::dropoff::DropoffAnalysis;
use crate::analytics::timing::TimingAnalysis;
use crate::export::anonymize;
use crate::repository::events::RawEventRow;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportMetadata {
    pub funnel_id: String,
    pub funnel_name: String,
    pub export_type: String,
    pub format: String,
    pub start_date: String,
    pub end_date: String,
    pub generated_at: DateTime<Utc>,
}

/// Everything a writer may need; optional sections stay `None` for the
/// export types that do not include them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportData {
    pub export_metadata: ExportMetadata,
    pub summary: OverallMetrics,
    pub step_data: Vec<StepMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dropoff_analysis: Option<DropoffAnalysis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timing_analysis: Option<TimingAnalysis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cohort_analysis: Option<CohortAnalysis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attribution_analysis: Option<AttributionAnalysis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_events: Option<Vec<RawEventRow>>,
}

fn io_err(context: &str, err: impl std::fmt::Display) -> AppError {
    AppError::Internal(format!("{context}: {err}"))
}

/// Writes the CSV artifact. Per-step rows for summary/detailed exports;
/// one row per event for raw exports. Returns the record count.
pub fn write_csv(data: &ExportData, path: &Path) -> Result<i64, AppError> {
    let mut writer = csv::Writer::from_path(path).map_err(|e| io_err("failed to open csv", e))?;

    let records = if let Some(events) = &data.raw_events {
        writer
            .write_record([
                "event_id",
                "anonymous_id",
                "session_id",
                "event_name",
                "timestamp",
                "page_url",
                "utm_source",
                "utm_medium",
                "device_type",
                "geo_country",
            ])
            .map_err(|e| io_err("failed to write csv header", e))?;

        for event in events {
            writer
                .write_record([
                    event.event_id.as_str(),
                    event.anonymous_id.as_str(),
                    event.session_id.as_str(),
                    event.event_name.as_str(),
                    &event.occurred_at.to_rfc3339(),
                    event.page_url.as_deref().unwrap_or(""),
                    event.utm_source.as_deref().unwrap_or(""),
                    event.utm_medium.as_deref().unwrap_or(""),
                    event.device_type.as_deref().unwrap_or(""),
                    event.geo_country.as_deref().unwrap_or(""),
                ])
                .map_err(|e| io_err("failed to write csv row", e))?;
        }
        events.len() as i64
    } else {
        writer
            .write_record([
                "funnel_name",
                "step_order",
                "step_name",
                "unique_users",
                "conversion_rate_percent",
                "drop_off_percent",
                "avg_completion_minutes",
                "date_range",
            ])
            .map_err(|e| io_err("failed to write csv header", e))?;

        let date_range = format!(
            "{} - {}",
            data.export_metadata.start_date, data.export_metadata.end_date
        );

        for step in &data.step_data {
            writer
                .write_record([
                    data.export_metadata.funnel_name.as_str(),
                    &step.step_order.to_string(),
                    step.label.as_str(),
                    &step.total_users.to_string(),
                    &format!("{:.2}", step.conversion_rate_from_start),
                    &format!("{:.2}", step.drop_off_rate),
                    &format!("{:.2}", step.avg_step_time_seconds / 60.0),
                    &date_range,
                ])
                .map_err(|e| io_err("failed to write csv row", e))?;
        }
        data.step_data.len() as i64
    };

    writer.flush().map_err(|e| io_err("failed to flush csv", e))?;
    Ok(records)
}

/// Writes the JSON artifact, optionally anonymizing personal identifiers.
pub fn write_json(data: &ExportData, path: &Path, anonymize_fields: bool) -> Result<i64, AppError> {
    let mut doc = serde_json::to_value(data).map_err(|e| io_err("failed to serialise export", e))?;
    if anonymize_fields {
        anonymize::anonymize_value(&mut doc);
    }

    let body = serde_json::to_vec_pretty(&doc).map_err(|e| io_err("failed to render json", e))?;
    std::fs::write(path, body).map_err(|e| io_err("failed to write json", e))?;

    let records = data
        .raw_events
        .as_ref()
        .map(|events| events.len() as i64)
        .unwrap_or(data.step_data.len() as i64);
    Ok(records)
}

/// Writes the Excel workbook: a Summary sheet with the overall metrics, a
/// Step Metrics sheet mirroring the CSV columns, and a Raw Events sheet for
/// raw exports. Returns the record count of the sheet the export asked for.
pub fn write_excel(data: &ExportData, path: &Path) -> Result<i64, AppError> {
    let mut workbook = Workbook::new();

    {
        let sheet = workbook.add_worksheet();
        sheet.set_name("Summary").map_err(|e| io_err("failed to name sheet", e))?;

        let rows: &[(&str, String)] = &[
            ("Funnel", data.export_metadata.funnel_name.clone()),
            ("Date range", format!(
                "{} - {}",
                data.export_metadata.start_date, data.export_metadata.end_date
            )),
            ("Total entries", data.summary.total_entries.to_string()),
            ("Total conversions", data.summary.total_conversions.to_string()),
            ("Conversion rate %", format!("{:.2}", data.summary.conversion_rate)),
            (
                "Avg time to convert (min)",
                format!("{:.2}", data.summary.avg_time_to_convert_seconds / 60.0),
            ),
            (
                "Conversion velocity (per hour)",
                format!("{:.2}", data.summary.conversion_velocity_per_hour),
            ),
            ("Engagement score", format!("{:.0}", data.summary.engagement_score)),
        ];

        for (i, (label, value)) in rows.iter().enumerate() {
            let row = i as u32;
            sheet
                .write_string(row, 0, *label)
                .map_err(|e| io_err("failed to write summary sheet", e))?;
            sheet
                .write_string(row, 1, value)
                .map_err(|e| io_err("failed to write summary sheet", e))?;
        }
    }

    {
        let sheet = workbook.add_worksheet();
        sheet.set_name("Step Metrics").map_err(|e| io_err("failed to name sheet", e))?;

        let headers = [
            "Step order",
            "Step name",
            "Unique users",
            "Conversion rate %",
            "Drop-off %",
            "Avg completion (min)",
        ];
        for (col, header) in headers.iter().enumerate() {
            sheet
                .write_string(0, col as u16, *header)
                .map_err(|e| io_err("failed to write header", e))?;
        }

        for (i, step) in data.step_data.iter().enumerate() {
            let row = (i + 1) as u32;
            let write_err = |e| io_err("failed to write step row", e);
            sheet.write_number(row, 0, step.step_order as f64).map_err(write_err)?;
            sheet.write_string(row, 1, &step.label).map_err(write_err)?;
            sheet.write_number(row, 2, step.total_users as f64).map_err(write_err)?;
            sheet.write_number(row, 3, step.conversion_rate_from_start).map_err(write_err)?;
            sheet.write_number(row, 4, step.drop_off_rate).map_err(write_err)?;
            sheet.write_number(row, 5, step.avg_step_time_seconds / 60.0).map_err(write_err)?;
        }
    }

    if let Some(events) = &data.raw_events {
        let sheet = workbook.add_worksheet();
        sheet.set_name("Raw Events").map_err(|e| io_err("failed to name sheet", e))?;

        let headers = [
            "event_id",
            "anonymous_id",
            "session_id",
            "event_name",
            "timestamp",
            "page_url",
            "utm_source",
            "utm_medium",
            "device_type",
            "geo_country",
        ];
        for (col, header) in headers.iter().enumerate() {
            sheet
                .write_string(0, col as u16, *header)
                .map_err(|e| io_err("failed to write header", e))?;
        }

        for (i, event) in events.iter().enumerate() {
            let row = (i + 1) as u32;
            let columns = [
                event.event_id.as_str(),
                event.anonymous_id.as_str(),
                event.session_id.as_str(),
                event.event_name.as_str(),
                &event.occurred_at.to_rfc3339(),
                event.page_url.as_deref().unwrap_or(""),
                event.utm_source.as_deref().unwrap_or(""),
                event.utm_medium.as_deref().unwrap_or(""),
                event.device_type.as_deref().unwrap_or(""),
                event.geo_country.as_deref().unwrap_or(""),
            ];
            for (col, value) in columns.iter().enumerate() {
                sheet
                    .write_string(row, col as u16, *value)
                    .map_err(|e| io_err("failed to write event row", e))?;
            }
        }
    }

    workbook.save(path).map_err(|e| io_err("failed to save workbook", e))?;

    let records = data
        .raw_events
        .as_ref()
        .map(|events| events.len() as i64)
        .unwrap_or(data.step_data.len() as i64);
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use funnelcast_common::funnel::StepType;

    fn sample_data() -> ExportData {
        ExportData {
            export_metadata: ExportMetadata {
                funnel_id: "fn_1".to_string(),
                funnel_name: "Signup".to_string(),
                export_type: "summary".to_string(),
                format: "csv".to_string(),
                start_date: "2025-03-01".to_string(),
                end_date: "2025-03-31".to_string(),
                generated_at: Utc::now(),
            },
            summary: OverallMetrics {
                total_entries: 1000,
                total_conversions: 100,
                conversion_rate: 10.0,
                avg_time_to_convert_seconds: 600.0,
                median_time_to_convert_seconds: 500.0,
                conversion_velocity_per_hour: 0.14,
                engagement_score: 100.0,
            },
            step_data: vec![StepMetrics {
                step_order: 0,
                label: "Landing".to_string(),
                step_type: StepType::Start,
                total_users: 1000,
                conversion_rate_from_previous: 100.0,
                conversion_rate_from_start: 100.0,
                drop_off_rate: 0.0,
                drop_off_count: 0,
                is_bottleneck: false,
                severity: crate::analytics::conversion::Severity::Low,
                avg_step_time_seconds: 120.0,
                median_step_time_seconds: 100.0,
                percentile_estimates: None,
            }],
            dropoff_analysis: None,
            timing_analysis: None,
            cohort_analysis: None,
            attribution_analysis: None,
            raw_events: None,
        }
    }

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("funnelcast_fmt_{}_{}", std::process::id(), name))
    }

    fn raw_event(event_id: &str) -> RawEventRow {
        RawEventRow {
            event_id: event_id.to_string(),
            anonymous_id: "a_u1".to_string(),
            session_id: "s1".to_string(),
            event_name: "begin".to_string(),
            occurred_at: Utc::now(),
            page_url: None,
            utm_source: None,
            utm_medium: None,
            device_type: None,
            geo_country: None,
        }
    }

    #[test]
    fn csv_has_header_and_step_rows() {
        let path = temp_path("steps.csv");
        let records = write_csv(&sample_data(), &path).unwrap();
        assert_eq!(records, 1);

        let body = std::fs::read_to_string(&path).unwrap();
        assert!(body.starts_with("funnel_name,step_order"));
        assert!(body.contains("Signup,0,Landing,1000"));
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn csv_raw_events_mode() {
        let mut data = sample_data();
        data.raw_events = Some(vec![raw_event("e1")]);

        let path = temp_path("raw.csv");
        let records = write_csv(&data, &path).unwrap();
        assert_eq!(records, 1);

        let body = std::fs::read_to_string(&path).unwrap();
        assert!(body.starts_with("event_id,anonymous_id"));
        assert!(body.contains("begin"));
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn json_round_trips_and_anonymizes() {
        let mut data = sample_data();
        data.raw_events = Some(vec![raw_event("e1")]);

        let path = temp_path("export.json");
        write_json(&data, &path, true).unwrap();

        let doc: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(doc["export_metadata"]["funnel_id"], "fn_1");
        let anonymized = doc["raw_events"][0]["anonymous_id"].as_str().unwrap();
        assert!(anonymized.starts_with("anon_"));
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn excel_workbook_is_written() {
        let path = temp_path("export.xlsx");
        let records = write_excel(&sample_data(), &path).unwrap();
        assert_eq!(records, 1);
        assert!(std::fs::metadata(&path).unwrap().len() > 0);
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn excel_raw_events_mode_counts_events() {
        let mut data = sample_data();
        data.raw_events = Some(vec![raw_event("e1"), raw_event("e2"), raw_event("e3")]);

        let path = temp_path("raw.xlsx");
        let records = write_excel(&data, &path).unwrap();
        // The reported count is the raw-event rows, not the step rows.
        assert_eq!(records, 3);
        assert!(std::fs::metadata(&path).unwrap().len() > 0);
        std::fs::remove_file(path).ok();
    }
}
