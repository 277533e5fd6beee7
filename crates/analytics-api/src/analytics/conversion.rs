//! Conversion analysis: per-step funnel metrics, overall totals, optional
//! segment breakdowns, time-series, significance against the previous
//! window, and peer comparison.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use funnelcast_common::cache::CacheClass;
use funnelcast_common::error::AppError;
use funnelcast_common::funnel::{FunnelDefinition, StepType};
use funnelcast_common::ids::{IdKind, format_id};
use funnelcast_common::tenant::TenantContext;

use crate::analytics::engine::{Analyzed, AnalyticsEngine, MAX_WINDOW_DAYS, RequestedRange, parse_range};
use crate::analytics::stats;
use crate::repository::steps::{FunnelTotalsRow, StepCountRow};
use crate::repository::timeseries::TimeBucketRow;
use crate::repository::timing::StepTransitionRow;
use crate::repository::{DateRange, Granularity, SegmentDimension, segments, steps, timeseries, timing};

// ── Request ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct ConversionRequest {
    #[serde(flatten)]
    pub range: RequestedRange,
    #[serde(default)]
    pub include_segments: bool,
    #[serde(default)]
    pub include_time_series: bool,
    #[serde(default = "default_granularity")]
    pub time_series_granularity: Granularity,
    #[serde(default)]
    pub include_significance: bool,
    #[serde(default)]
    pub include_peer_comparison: bool,
}

fn default_granularity() -> Granularity {
    Granularity::Daily
}

// ── Response ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionAnalysis {
    pub funnel_id: String,
    pub funnel_name: String,
    pub date_range: DateRangeOut,
    pub overall: OverallMetrics,
    pub steps: Vec<StepMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segments: Option<SegmentBreakdown>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_series: Option<TimeSeries>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub significance: Option<SignificanceResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_comparison: Option<PeerComparison>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DateRangeOut {
    pub start: chrono::DateTime<Utc>,
    pub end: chrono::DateTime<Utc>,
}

impl From<DateRange> for DateRangeOut {
    fn from(range: DateRange) -> Self {
        Self { start: range.start, end: range.end }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverallMetrics {
    pub total_entries: i64,
    pub total_conversions: i64,
    pub conversion_rate: f64,
    pub avg_time_to_convert_seconds: f64,
    pub median_time_to_convert_seconds: f64,
    pub conversion_velocity_per_hour: f64,
    pub engagement_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepMetrics {
    pub step_order: i32,
    pub label: String,
    pub step_type: StepType,
    pub total_users: i64,
    pub conversion_rate_from_previous: f64,
    pub conversion_rate_from_start: f64,
    pub drop_off_rate: f64,
    pub drop_off_count: i64,
    pub is_bottleneck: bool,
    pub severity: Severity,
    pub avg_step_time_seconds: f64,
    pub median_step_time_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percentile_estimates: Option<PercentileEstimates>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    /// Drop-off severity buckets.
    pub fn from_drop_off_rate(rate: f64) -> Self {
        if rate >= 75.0 {
            Severity::Critical
        } else if rate > 60.0 {
            Severity::High
        } else if rate > 45.0 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

/// Step-time percentiles. When only the mean is observable these are derived
/// with fixed ratios and flagged `estimated`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PercentileEstimates {
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
    pub p95: f64,
    pub estimated: bool,
}

impl PercentileEstimates {
    pub fn from_mean(mean_seconds: f64) -> Self {
        Self {
            p25: stats::round2(mean_seconds * 0.75),
            p50: stats::round2(mean_seconds),
            p75: stats::round2(mean_seconds * 1.25),
            p90: stats::round2(mean_seconds * 1.5),
            p95: stats::round2(mean_seconds * 1.8),
            estimated: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentBreakdown {
    pub device: Vec<SegmentMetrics>,
    pub traffic_source: Vec<SegmentMetrics>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentMetrics {
    pub segment: String,
    pub entries: i64,
    pub conversions: i64,
    pub conversion_rate: f64,
    pub performance_vs_average: f64,
    pub confidence_interval_95: ConfidenceInterval,
    pub statistically_significant: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    pub lower: f64,
    pub upper: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSeries {
    pub granularity: Granularity,
    pub points: Vec<TimeSeriesPoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSeriesPoint {
    pub bucket: chrono::DateTime<Utc>,
    pub entries: i64,
    pub conversions: i64,
    pub conversion_rate: f64,
    pub moving_average: f64,
    pub trend_direction: TrendDirection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Up,
    Down,
    Stable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignificanceResult {
    pub previous_entries: i64,
    pub previous_conversions: i64,
    pub previous_rate: f64,
    pub current_rate: f64,
    pub improvement_percent: f64,
    pub z_score: f64,
    pub p_value: f64,
    pub is_significant: bool,
    pub confidence_level: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerComparison {
    pub percentile: f64,
    pub peer_average: f64,
    pub peer_count: usize,
}

// ── Engine entry point ──────────────────────────────────────────────

impl AnalyticsEngine {
    pub fn conversion(
        &self,
        ctx: TenantContext,
        funnel_id: i64,
        request: &ConversionRequest,
    ) -> Result<Analyzed<ConversionAnalysis>, AppError> {
        let key = Self::funnel_key(
            "funnel:conversion",
            ctx,
            funnel_id,
            &[
                ("end", request.range.end_date.clone()),
                ("granularity", format!("{:?}", request.time_series_granularity)),
                ("peers", request.include_peer_comparison.to_string()),
                ("segments", request.include_segments.to_string()),
                ("significance", request.include_significance.to_string()),
                ("start", request.range.start_date.clone()),
                ("timeseries", request.include_time_series.to_string()),
            ],
        );

        let range = parse_range(&request.range, MAX_WINDOW_DAYS)?;

        self.run_cached(&key, CacheClass::ConversionMetrics, || {
            self.compute_conversion(ctx, funnel_id, request, range)
        })
    }

    fn compute_conversion(
        &self,
        ctx: TenantContext,
        funnel_id: i64,
        request: &ConversionRequest,
        range: DateRange,
    ) -> Result<ConversionAnalysis, AppError> {
        let (funnel, definition) = self.resolve_funnel(ctx, funnel_id)?;
        let total_steps = definition.total_steps() as i32;

        let counts = steps::step_completions(self.pool(), ctx, funnel_id, total_steps, range)?;
        let totals = steps::funnel_totals(self.pool(), ctx, funnel_id, range)?;
        let transitions = timing::step_transitions(self.pool(), ctx, funnel_id, range)?;

        let step_metrics = build_step_metrics(&definition, &counts, &transitions);
        let overall = build_overall(&totals, range);

        let segments_out = if request.include_segments {
            let device = segments::segment_conversions(
                self.pool(),
                ctx,
                funnel_id,
                SegmentDimension::DeviceType,
                range,
            )?;
            let traffic = segments::segment_conversions(
                self.pool(),
                ctx,
                funnel_id,
                SegmentDimension::UtmSource,
                range,
            )?;
            Some(SegmentBreakdown {
                device: build_segment_metrics(&device, overall.conversion_rate),
                traffic_source: build_segment_metrics(&traffic, overall.conversion_rate),
            })
        } else {
            None
        };

        let time_series = if request.include_time_series {
            let rows = timeseries::conversion_series(
                self.pool(),
                ctx,
                funnel_id,
                request.time_series_granularity,
                range,
            )?;
            Some(TimeSeries {
                granularity: request.time_series_granularity,
                points: build_time_series(&rows),
            })
        } else {
            None
        };

        let significance = if request.include_significance {
            let previous = steps::funnel_totals(self.pool(), ctx, funnel_id, range.previous())?;
            build_significance(&totals, &previous)
        } else {
            None
        };

        let peer_comparison = if request.include_peer_comparison {
            let peers = steps::peer_funnel_metrics(
                self.pool(),
                ctx,
                Utc::now() - chrono::Duration::days(30),
            )?;
            let peer_rates: Vec<f64> = peers
                .iter()
                .filter(|p| p.funnel_id != funnel_id)
                .map(|p| rate(p.conversions, p.entries))
                .collect();
            Some(build_peer_comparison(overall.conversion_rate, &peer_rates))
        } else {
            None
        };

        Ok(ConversionAnalysis {
            funnel_id: format_id(IdKind::Funnel, funnel_id),
            funnel_name: funnel.name,
            date_range: range.into(),
            overall,
            steps: step_metrics,
            segments: segments_out,
            time_series,
            significance,
            peer_comparison,
        })
    }
}

// ── Pure builders ───────────────────────────────────────────────────

fn rate(part: i64, whole: i64) -> f64 {
    if whole <= 0 {
        0.0
    } else {
        stats::round2(part as f64 / whole as f64 * 100.0)
    }
}

pub(crate) fn build_step_metrics(
    definition: &FunnelDefinition,
    counts: &[StepCountRow],
    transitions: &[StepTransitionRow],
) -> Vec<StepMetrics> {
    let users_at = |order: i32| -> i64 {
        counts
            .iter()
            .find(|c| c.step_order == order)
            .map(|c| c.users)
            .unwrap_or(0)
    };
    let entered = users_at(0);

    definition
        .steps
        .iter()
        .map(|step| {
            let users = users_at(step.order_index);
            let previous_users = if step.order_index == 0 {
                users
            } else {
                users_at(step.order_index - 1)
            };

            let conversion_rate_from_previous = if step.order_index == 0 {
                100.0
            } else {
                rate(users, previous_users)
            };
            let drop_off_count = if step.order_index == 0 {
                0
            } else {
                (previous_users - users).max(0)
            };
            let drop_off_rate = if step.order_index == 0 {
                0.0
            } else {
                rate(drop_off_count, previous_users)
            };

            let transition = transitions.iter().find(|t| t.step_order == step.order_index);
            let avg_step_time_seconds = transition.map(|t| t.avg_seconds).unwrap_or(0.0);
            let median_step_time_seconds = transition.map(|t| t.median_seconds).unwrap_or(0.0);

            let percentile_estimates = if avg_step_time_seconds > 0.0 {
                Some(PercentileEstimates::from_mean(avg_step_time_seconds))
            } else {
                None
            };

            StepMetrics {
                step_order: step.order_index,
                label: step.label.clone(),
                step_type: step.step_type,
                total_users: users,
                conversion_rate_from_previous,
                conversion_rate_from_start: rate(users, entered),
                drop_off_rate,
                drop_off_count,
                is_bottleneck: drop_off_rate > 50.0,
                severity: Severity::from_drop_off_rate(drop_off_rate),
                avg_step_time_seconds: stats::round2(avg_step_time_seconds),
                median_step_time_seconds: stats::round2(median_step_time_seconds),
                percentile_estimates,
            }
        })
        .collect()
}

pub(crate) fn build_overall(totals: &FunnelTotalsRow, range: DateRange) -> OverallMetrics {
    let conversion_rate = rate(totals.conversions, totals.entries);
    let hours = range.hours().max(1e-9);

    OverallMetrics {
        total_entries: totals.entries,
        total_conversions: totals.conversions,
        conversion_rate,
        avg_time_to_convert_seconds: stats::round2(totals.avg_seconds_to_convert),
        median_time_to_convert_seconds: stats::round2(totals.median_seconds_to_convert),
        conversion_velocity_per_hour: stats::round2(totals.conversions as f64 / hours),
        engagement_score: stats::round2((conversion_rate * 10.0).clamp(0.0, 100.0)),
    }
}

pub(crate) fn build_segment_metrics(
    rows: &[segments::SegmentRow],
    average_rate: f64,
) -> Vec<SegmentMetrics> {
    rows.iter()
        .map(|row| {
            let conversion_rate = rate(row.conversions, row.entries);
            let performance_vs_average = if average_rate > 0.0 {
                stats::round2((conversion_rate - average_rate) / average_rate * 100.0)
            } else {
                0.0
            };

            // Approximate 95% CI: rate ± 5 percentage points, floored at 0.
            SegmentMetrics {
                segment: row.segment.clone(),
                entries: row.entries,
                conversions: row.conversions,
                conversion_rate,
                performance_vs_average,
                confidence_interval_95: ConfidenceInterval {
                    lower: stats::round2((conversion_rate - 5.0).max(0.0)),
                    upper: stats::round2((conversion_rate + 5.0).min(100.0)),
                },
                statistically_significant: row.entries > 100,
            }
        })
        .collect()
}

pub(crate) fn build_time_series(rows: &[TimeBucketRow]) -> Vec<TimeSeriesPoint> {
    let rates: Vec<f64> = rows
        .iter()
        .map(|r| if r.entries > 0 { r.conversions as f64 / r.entries as f64 * 100.0 } else { 0.0 })
        .collect();

    let mut points = Vec::with_capacity(rows.len());
    let mut previous_ma: Option<f64> = None;

    for (i, row) in rows.iter().enumerate() {
        let window_start = i.saturating_sub(6);
        let moving_average = stats::mean(&rates[window_start..=i]);

        // ±0.1 percentage-point dead band around the previous moving average.
        let trend_direction = match previous_ma {
            Some(prev) if moving_average - prev > 0.1 => TrendDirection::Up,
            Some(prev) if prev - moving_average > 0.1 => TrendDirection::Down,
            _ => TrendDirection::Stable,
        };
        previous_ma = Some(moving_average);

        points.push(TimeSeriesPoint {
            bucket: row.bucket,
            entries: row.entries,
            conversions: row.conversions,
            conversion_rate: stats::round2(rates[i]),
            moving_average: stats::round2(moving_average),
            trend_direction,
        });
    }

    points
}

pub(crate) fn build_significance(
    current: &FunnelTotalsRow,
    previous: &FunnelTotalsRow,
) -> Option<SignificanceResult> {
    let test = stats::two_proportion_test(
        current.conversions,
        current.entries,
        previous.conversions,
        previous.entries,
    )?;

    let current_rate = rate(current.conversions, current.entries);
    let previous_rate = rate(previous.conversions, previous.entries);
    let improvement_percent = if previous_rate > 0.0 {
        stats::round2((current_rate - previous_rate) / previous_rate * 100.0)
    } else {
        0.0
    };

    Some(SignificanceResult {
        previous_entries: previous.entries,
        previous_conversions: previous.conversions,
        previous_rate,
        current_rate,
        improvement_percent,
        z_score: stats::round2(test.z),
        p_value: test.p_value,
        is_significant: test.p_value < 0.05,
        confidence_level: stats::confidence_level(test.p_value),
    })
}

pub(crate) fn build_peer_comparison(own_rate: f64, peer_rates: &[f64]) -> PeerComparison {
    if peer_rates.is_empty() {
        return PeerComparison { percentile: 50.0, peer_average: 0.0, peer_count: 0 };
    }

    let below = peer_rates.iter().filter(|r| **r < own_rate).count();
    PeerComparison {
        percentile: stats::round2(below as f64 / peer_rates.len() as f64 * 100.0),
        peer_average: stats::round2(stats::mean(peer_rates)),
        peer_count: peer_rates.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use funnelcast_common::funnel::{StepDefinition, StepMatchRule};

    fn definition() -> FunnelDefinition {
        let step = |order: i32, step_type: StepType, label: &str| StepDefinition {
            order_index: order,
            step_type,
            label: label.to_string(),
            metadata: None,
            matches: vec![StepMatchRule::EventName { value: label.to_string() }],
        };
        FunnelDefinition {
            funnel_id: 1,
            funnel_version_id: 1,
            version: 1,
            window_days: 14,
            steps: vec![
                step(0, StepType::Start, "landing"),
                step(1, StepType::Page, "checkout"),
                step(2, StepType::Conversion, "purchase"),
            ],
        }
    }

    fn counts(users: &[i64]) -> Vec<StepCountRow> {
        users
            .iter()
            .enumerate()
            .map(|(i, u)| StepCountRow { step_order: i as i32, users: *u })
            .collect()
    }

    #[test]
    fn step_metrics_dropoff_is_consistent() {
        let metrics = build_step_metrics(&definition(), &counts(&[1000, 400, 100]), &[]);

        assert_eq!(metrics[0].conversion_rate_from_previous, 100.0);
        assert_eq!(metrics[0].drop_off_count, 0);

        // reached(0) - reached(1) = 600, 60% of the previous step.
        assert_eq!(metrics[1].drop_off_count, 600);
        assert_eq!(metrics[1].drop_off_rate, 60.0);
        assert!(metrics[1].is_bottleneck);
        assert_eq!(metrics[1].severity, Severity::Medium);

        // Step 2: 300 of 400 dropped, 75%.
        assert_eq!(metrics[2].drop_off_count, 300);
        assert_eq!(metrics[2].drop_off_rate, 75.0);
        assert_eq!(metrics[2].severity, Severity::Critical);
        assert_eq!(metrics[2].conversion_rate_from_start, 10.0);
    }

    #[test]
    fn severity_buckets() {
        assert_eq!(Severity::from_drop_off_rate(80.0), Severity::Critical);
        assert_eq!(Severity::from_drop_off_rate(65.0), Severity::High);
        assert_eq!(Severity::from_drop_off_rate(50.0), Severity::Medium);
        assert_eq!(Severity::from_drop_off_rate(20.0), Severity::Low);
    }

    #[test]
    fn percentile_estimates_use_fixed_ratios() {
        let est = PercentileEstimates::from_mean(100.0);
        assert_eq!(est.p25, 75.0);
        assert_eq!(est.p50, 100.0);
        assert_eq!(est.p75, 125.0);
        assert_eq!(est.p90, 150.0);
        assert_eq!(est.p95, 180.0);
        assert!(est.estimated);
    }

    #[test]
    fn overall_engagement_score_is_clamped() {
        let range = DateRange {
            start: Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2025, 3, 2, 0, 0, 0).unwrap(),
        };
        let totals = FunnelTotalsRow {
            entries: 100,
            conversions: 90,
            avg_seconds_to_convert: 120.0,
            median_seconds_to_convert: 100.0,
        };
        let overall = build_overall(&totals, range);
        assert_eq!(overall.conversion_rate, 90.0);
        assert_eq!(overall.engagement_score, 100.0);
        assert!((overall.conversion_velocity_per_hour - 90.0 / 24.0).abs() < 0.01);
    }

    #[test]
    fn significance_for_doubling_rate() {
        let current = FunnelTotalsRow {
            entries: 1000,
            conversions: 50,
            avg_seconds_to_convert: 0.0,
            median_seconds_to_convert: 0.0,
        };
        let previous = FunnelTotalsRow {
            entries: 1000,
            conversions: 25,
            avg_seconds_to_convert: 0.0,
            median_seconds_to_convert: 0.0,
        };

        let result = build_significance(&current, &previous).unwrap();
        assert_eq!(result.improvement_percent, 100.0);
        assert!(result.is_significant);
        assert_eq!(result.confidence_level, 99);
        assert!(result.p_value < 0.01);
    }

    #[test]
    fn time_series_moving_average_and_trend() {
        let base = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
        let rows: Vec<TimeBucketRow> = (0..10)
            .map(|i| TimeBucketRow {
                bucket: base + chrono::Duration::days(i),
                entries: 100,
                conversions: if i < 5 { 5 } else { 20 },
            })
            .collect();

        let points = build_time_series(&rows);
        assert_eq!(points.len(), 10);
        assert_eq!(points[0].trend_direction, TrendDirection::Stable);
        // The jump from 5% to 20% pushes the trailing average up.
        assert_eq!(points[5].trend_direction, TrendDirection::Up);
        assert!(points[9].moving_average > points[0].moving_average);
    }

    #[test]
    fn peer_percentile() {
        let comparison = build_peer_comparison(5.0, &[1.0, 2.0, 3.0, 9.0]);
        assert_eq!(comparison.percentile, 75.0);
        assert_eq!(comparison.peer_count, 4);
        assert!((comparison.peer_average - 3.75).abs() < 1e-9);
    }

    #[test]
    fn empty_data_yields_zeros() {
        let metrics = build_step_metrics(&definition(), &counts(&[0, 0, 0]), &[]);
        assert!(metrics.iter().all(|m| m.total_users == 0));
        assert!(metrics.iter().all(|m| m.drop_off_count == 0));
    }
}
