//! Bottleneck detection: conversion drops against a historical baseline,
//! time-stuck steps, and hourly-series anomalies (control limits + rolling
//! trend), with automated recommendations.

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};

use funnelcast_common::cache::CacheClass;
use funnelcast_common::error::AppError;
use funnelcast_common::ids::{IdKind, format_id};
use funnelcast_common::tenant::TenantContext;

use crate::analytics::engine::{Analyzed, AnalyticsEngine};
use crate::analytics::stats;
use crate::repository::steps::StepCountRow;
use crate::repository::{DateRange, Granularity, steps, timeseries};

// ── Request ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct BottleneckRequest {
    #[serde(default = "default_window_hours")]
    pub time_window_hours: i64,
    #[serde(default = "default_comparison_days")]
    pub comparison_period_days: i64,
    #[serde(default = "default_sensitivity")]
    pub sensitivity: Sensitivity,
}

fn default_window_hours() -> i64 {
    24
}

fn default_comparison_days() -> i64 {
    7
}

fn default_sensitivity() -> Sensitivity {
    Sensitivity::Medium
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sensitivity {
    Low,
    Medium,
    High,
}

impl Sensitivity {
    /// `(min_drop_pct, min_time_increase_pct, p_threshold)` presets.
    pub fn thresholds(self) -> (f64, f64, f64) {
        match self {
            Sensitivity::Low => (25.0, 50.0, 0.01),
            Sensitivity::Medium => (15.0, 30.0, 0.05),
            Sensitivity::High => (10.0, 20.0, 0.1),
        }
    }
}

// ── Response ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BottleneckAnalysis {
    pub funnel_id: String,
    pub funnel_name: String,
    pub time_window_hours: i64,
    pub comparison_period_days: i64,
    pub sensitivity: Sensitivity,
    pub bottlenecks: Vec<DetectedBottleneck>,
    pub anomalies: Vec<Anomaly>,
    pub recommendations: Vec<BottleneckRecommendation>,
    pub summary: BottleneckSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedBottleneck {
    pub kind: BottleneckKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_order: Option<i32>,
    pub current_value: f64,
    pub historical_value: f64,
    pub drop_percentage: f64,
    pub affected_users: i64,
    pub severity: BottleneckSeverity,
    pub severity_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p_value: Option<f64>,
    pub confidence_score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BottleneckKind {
    ConversionDrop,
    TimeStuck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BottleneckSeverity {
    Critical,
    High,
    Medium,
    Low,
}

impl BottleneckSeverity {
    /// Buckets over `drop_pct * log10(max(affected_users, 10))`.
    pub fn from_score(score: f64) -> Self {
        if score > 150.0 {
            BottleneckSeverity::Critical
        } else if score > 75.0 {
            BottleneckSeverity::High
        } else if score > 25.0 {
            BottleneckSeverity::Medium
        } else {
            BottleneckSeverity::Low
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    pub kind: AnomalyKind,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub magnitude: f64,
    pub confidence_score: f64,
    pub contextual_factors: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    SuddenDrop,
    GradualDecline,
    Spike,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BottleneckRecommendation {
    pub category: String,
    pub target: String,
    pub suggestion: String,
    pub expected_lift_percent: f64,
    pub confidence_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BottleneckSummary {
    pub total_bottlenecks: usize,
    pub critical_count: usize,
    pub anomaly_count: usize,
}

// ── Engine entry point ──────────────────────────────────────────────

impl AnalyticsEngine {
    pub fn bottlenecks(
        &self,
        ctx: TenantContext,
        funnel_id: i64,
        request: &BottleneckRequest,
    ) -> Result<Analyzed<BottleneckAnalysis>, AppError> {
        if !(1..=168).contains(&request.time_window_hours) {
            return Err(AppError::Validation(
                "time_window_hours must be between 1 and 168".to_string(),
            ));
        }
        if !(1..=30).contains(&request.comparison_period_days) {
            return Err(AppError::Validation(
                "comparison_period_days must be between 1 and 30".to_string(),
            ));
        }

        let key = Self::funnel_key(
            "funnel:bottlenecks",
            ctx,
            funnel_id,
            &[
                ("comparisonDays", request.comparison_period_days.to_string()),
                ("sensitivity", format!("{:?}", request.sensitivity)),
                ("windowHours", request.time_window_hours.to_string()),
            ],
        );

        self.run_cached(&key, CacheClass::LiveMetrics, || {
            self.compute_bottlenecks(ctx, funnel_id, request, Utc::now())
        })
    }

    fn compute_bottlenecks(
        &self,
        ctx: TenantContext,
        funnel_id: i64,
        request: &BottleneckRequest,
        now: DateTime<Utc>,
    ) -> Result<BottleneckAnalysis, AppError> {
        let (funnel, definition) = self.resolve_funnel(ctx, funnel_id)?;
        let total_steps = definition.total_steps() as i32;

        let current = DateRange {
            start: now - chrono::Duration::hours(request.time_window_hours),
            end: now,
        };
        let historical = DateRange {
            start: current.start - chrono::Duration::days(request.comparison_period_days),
            end: current.start,
        };

        let current_counts = steps::step_completions(self.pool(), ctx, funnel_id, total_steps, current)?;
        let historical_counts =
            steps::step_completions(self.pool(), ctx, funnel_id, total_steps, historical)?;
        let current_totals = steps::funnel_totals(self.pool(), ctx, funnel_id, current)?;
        let historical_totals = steps::funnel_totals(self.pool(), ctx, funnel_id, historical)?;

        let (min_drop, min_time_increase, p_threshold) = request.sensitivity.thresholds();

        let mut bottlenecks =
            detect_conversion_drops(&current_counts, &historical_counts, min_drop, p_threshold);

        if let Some(stuck) = detect_time_stuck(
            current_totals.avg_seconds_to_convert,
            historical_totals.avg_seconds_to_convert,
            current_totals.conversions,
            min_time_increase,
        ) {
            bottlenecks.push(stuck);
        }

        // Hourly series across both windows; the historical part sets the
        // control limits.
        let series_range = DateRange { start: historical.start, end: current.end };
        let series =
            timeseries::conversion_series(self.pool(), ctx, funnel_id, Granularity::Hourly, series_range)?;

        let points: Vec<(DateTime<Utc>, f64)> = series
            .iter()
            .map(|row| {
                let rate = if row.entries > 0 {
                    row.conversions as f64 / row.entries as f64 * 100.0
                } else {
                    0.0
                };
                (row.bucket, rate)
            })
            .collect();

        let baseline_len = points
            .iter()
            .filter(|(ts, _)| *ts < current.start)
            .count();
        let baseline: Vec<f64> = points[..baseline_len].iter().map(|(_, r)| *r).collect();

        let mut anomalies = Vec::new();
        if baseline.len() >= 2 {
            let mean = stats::mean(&baseline);
            let sigma = stats::stddev(&baseline);
            anomalies.extend(spc_anomalies(&points, mean, sigma));
        }
        anomalies.extend(trend_anomalies(&points));

        let recommendations = build_recommendations(&bottlenecks, &anomalies);

        let summary = BottleneckSummary {
            total_bottlenecks: bottlenecks.len(),
            critical_count: bottlenecks
                .iter()
                .filter(|b| b.severity == BottleneckSeverity::Critical)
                .count(),
            anomaly_count: anomalies.len(),
        };

        Ok(BottleneckAnalysis {
            funnel_id: format_id(IdKind::Funnel, funnel_id),
            funnel_name: funnel.name,
            time_window_hours: request.time_window_hours,
            comparison_period_days: request.comparison_period_days,
            sensitivity: request.sensitivity,
            bottlenecks,
            anomalies,
            recommendations,
            summary,
        })
    }
}

// ── Pure detection ──────────────────────────────────────────────────

/// Per-step conversion drop against the historical baseline. Emits a
/// bottleneck when the relative drop clears the sensitivity floor and the
/// pooled two-proportion test clears the p threshold.
pub(crate) fn detect_conversion_drops(
    current: &[StepCountRow],
    historical: &[StepCountRow],
    min_drop_pct: f64,
    p_threshold: f64,
) -> Vec<DetectedBottleneck> {
    let reached = |rows: &[StepCountRow], order: i32| -> i64 {
        rows.iter().find(|r| r.step_order == order).map(|r| r.users).unwrap_or(0)
    };

    let max_step = current.iter().map(|r| r.step_order).max().unwrap_or(0);
    let mut out = Vec::new();

    for step in 1..=max_step {
        let (cur_reached, cur_prev) = (reached(current, step), reached(current, step - 1));
        let (hist_reached, hist_prev) = (reached(historical, step), reached(historical, step - 1));
        if cur_prev == 0 || hist_prev == 0 {
            continue;
        }

        let cur_rate = cur_reached as f64 / cur_prev as f64 * 100.0;
        let hist_rate = hist_reached as f64 / hist_prev as f64 * 100.0;
        if hist_rate <= 0.0 || cur_rate >= hist_rate {
            continue;
        }

        let drop_pct = (hist_rate - cur_rate) / hist_rate * 100.0;
        let Some(test) = stats::two_proportion_test(cur_reached, cur_prev, hist_reached, hist_prev)
        else {
            continue;
        };

        if drop_pct >= min_drop_pct && test.p_value <= p_threshold {
            let affected_users = (cur_prev - cur_reached).max(0);
            let severity_score = drop_pct * (affected_users.max(10) as f64).log10();

            out.push(DetectedBottleneck {
                kind: BottleneckKind::ConversionDrop,
                step_order: Some(step),
                current_value: stats::round2(cur_rate),
                historical_value: stats::round2(hist_rate),
                drop_percentage: stats::round2(drop_pct),
                affected_users,
                severity: BottleneckSeverity::from_score(severity_score),
                severity_score: stats::round2(severity_score),
                p_value: Some(test.p_value),
                confidence_score: stats::round2((1.0 - test.p_value) * 100.0),
            });
        }
    }

    out.sort_by(|a, b| b.severity_score.total_cmp(&a.severity_score));
    out
}

/// Time-stuck detection: the current average completion time exceeds the
/// historical average by the sensitivity-specific percentage.
pub(crate) fn detect_time_stuck(
    current_avg_seconds: f64,
    historical_avg_seconds: f64,
    current_conversions: i64,
    min_increase_pct: f64,
) -> Option<DetectedBottleneck> {
    if historical_avg_seconds <= 0.0 || current_avg_seconds <= 0.0 {
        return None;
    }

    let threshold = historical_avg_seconds * (1.0 + min_increase_pct / 100.0);
    if current_avg_seconds <= threshold {
        return None;
    }

    let increase_pct = (current_avg_seconds - historical_avg_seconds) / historical_avg_seconds * 100.0;
    let severity_score = increase_pct * (current_conversions.max(10) as f64).log10();

    Some(DetectedBottleneck {
        kind: BottleneckKind::TimeStuck,
        step_order: None,
        current_value: stats::round2(current_avg_seconds),
        historical_value: stats::round2(historical_avg_seconds),
        drop_percentage: stats::round2(increase_pct),
        affected_users: current_conversions,
        severity: BottleneckSeverity::from_score(severity_score),
        severity_score: stats::round2(severity_score),
        p_value: None,
        confidence_score: stats::round2((increase_pct / (increase_pct + 100.0)) * 100.0),
    })
}

fn contextual_factors(ts: DateTime<Utc>) -> Vec<String> {
    let mut factors = Vec::new();
    let weekday = ts.weekday().num_days_from_monday();
    if weekday >= 5 {
        factors.push("weekend".to_string());
    }
    let hour = ts.hour();
    if (9..17).contains(&hour) {
        factors.push("business_hours".to_string());
    }
    factors
}

/// Statistical process control over the rate series: points beyond the
/// ±3σ limits form anomalies, and runs of consecutive anomalous points
/// (length ≥ 2) collapse into one. Magnitude is the run's mean distance
/// from the center line in sigmas; confidence is `min(100, magnitude·20)`.
pub(crate) fn spc_anomalies(
    points: &[(DateTime<Utc>, f64)],
    mean: f64,
    sigma: f64,
) -> Vec<Anomaly> {
    if sigma <= 0.0 {
        return Vec::new();
    }
    let lower = mean - 3.0 * sigma;
    let upper = mean + 3.0 * sigma;

    let mut anomalies = Vec::new();
    let mut run: Vec<(DateTime<Utc>, f64)> = Vec::new();
    let mut run_low = false;

    let mut flush = |run: &mut Vec<(DateTime<Utc>, f64)>, low: bool| {
        if run.len() >= 2 {
            let values: Vec<f64> = run.iter().map(|(_, v)| *v).collect();
            let magnitude = (mean - stats::mean(&values)).abs() / sigma;
            anomalies.push(Anomaly {
                kind: if low { AnomalyKind::SuddenDrop } else { AnomalyKind::Spike },
                start: run[0].0,
                end: run[run.len() - 1].0,
                magnitude: stats::round2(magnitude),
                confidence_score: (magnitude * 20.0).min(100.0),
                contextual_factors: contextual_factors(run[0].0),
            });
        }
        run.clear();
    };

    for (ts, value) in points {
        let is_low = *value < lower;
        let is_high = *value > upper;

        if is_low || is_high {
            if !run.is_empty() && run_low != is_low {
                flush(&mut run, run_low);
            }
            run_low = is_low;
            run.push((*ts, *value));
        } else {
            flush(&mut run, run_low);
        }
    }
    flush(&mut run, run_low);

    anomalies
}

/// Rolling linear-regression slopes over windows of `min(6, N/4)` points.
/// A sudden drop is a slope falling below -0.02 after losing more than 0.05
/// versus the previous window; a gradual decline is two consecutive windows
/// below -0.01.
pub(crate) fn trend_anomalies(points: &[(DateTime<Utc>, f64)]) -> Vec<Anomaly> {
    let n = points.len();
    let window = usize::min(6, n / 4).max(2);
    if n < window + 1 {
        return Vec::new();
    }

    // Slopes on the 0..1 rate scale keep the thresholds unit-stable.
    let values: Vec<f64> = points.iter().map(|(_, v)| v / 100.0).collect();

    let mut slopes: Vec<(usize, f64)> = Vec::new();
    for end in window..=n {
        let slope = stats::linear_slope(&values[end - window..end]);
        slopes.push((end - 1, slope));
    }

    let mut anomalies = Vec::new();
    for i in 1..slopes.len() {
        let (idx, slope) = slopes[i];
        let (_, previous) = slopes[i - 1];
        let delta = previous - slope;

        if slope < -0.02 && delta > 0.05 {
            anomalies.push(Anomaly {
                kind: AnomalyKind::SuddenDrop,
                start: points[idx + 1 - window].0,
                end: points[idx].0,
                magnitude: stats::round2(slope.abs() * 100.0),
                confidence_score: (delta * 1000.0).min(100.0),
                contextual_factors: contextual_factors(points[idx].0),
            });
        } else if slope < -0.01 && previous < -0.01 {
            anomalies.push(Anomaly {
                kind: AnomalyKind::GradualDecline,
                start: points[idx + 1 - window].0,
                end: points[idx].0,
                magnitude: stats::round2(slope.abs() * 100.0),
                confidence_score: (slope.abs() * 1000.0).min(100.0),
                contextual_factors: contextual_factors(points[idx].0),
            });
        }
    }

    // Adjacent windows flag the same decline; keep the first of each kind.
    anomalies.dedup_by(|a, b| a.kind == b.kind && a.start <= b.end);
    anomalies
}

pub(crate) fn build_recommendations(
    bottlenecks: &[DetectedBottleneck],
    anomalies: &[Anomaly],
) -> Vec<BottleneckRecommendation> {
    let confidence_label = |score: f64| -> String {
        if score >= 90.0 {
            "high".to_string()
        } else if score >= 70.0 {
            "medium".to_string()
        } else {
            "low".to_string()
        }
    };

    let mut recommendations = Vec::new();

    for bottleneck in bottlenecks {
        let (category, target, suggestion) = match bottleneck.kind {
            BottleneckKind::ConversionDrop => (
                "ux",
                bottleneck
                    .step_order
                    .map(|s| format!("step {s}"))
                    .unwrap_or_else(|| "funnel".to_string()),
                "review recent changes to this step; roll back or simplify the interaction".to_string(),
            ),
            BottleneckKind::TimeStuck => (
                "ux",
                "funnel".to_string(),
                "users take much longer than the baseline; look for new friction or slow responses".to_string(),
            ),
        };

        recommendations.push(BottleneckRecommendation {
            category: category.to_string(),
            target,
            suggestion,
            expected_lift_percent: stats::round2((bottleneck.drop_percentage * 0.7).min(25.0)),
            confidence_level: confidence_label(bottleneck.confidence_score),
        });
    }

    for anomaly in anomalies {
        recommendations.push(BottleneckRecommendation {
            category: "technical".to_string(),
            target: format!("{} to {}", anomaly.start, anomaly.end),
            suggestion: "check deploys, third-party scripts and infrastructure health in this interval"
                .to_string(),
            expected_lift_percent: stats::round2((anomaly.magnitude * 5.0).min(25.0)),
            confidence_level: confidence_label(anomaly.confidence_score),
        });
    }

    recommendations
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn counts(users: &[i64]) -> Vec<StepCountRow> {
        users
            .iter()
            .enumerate()
            .map(|(i, u)| StepCountRow { step_order: i as i32, users: *u })
            .collect()
    }

    #[test]
    fn conversion_drop_detected_with_significance() {
        // Step 0→1 conversion halves: 60% → 30% on solid volume.
        let current = counts(&[1000, 300, 100]);
        let historical = counts(&[1000, 600, 200]);

        let drops = detect_conversion_drops(&current, &historical, 15.0, 0.05);
        assert!(!drops.is_empty());
        let top = &drops[0];
        assert_eq!(top.step_order, Some(1));
        assert_eq!(top.drop_percentage, 50.0);
        assert!(top.p_value.unwrap() < 0.05);
        assert!(top.confidence_score > 95.0);
        assert_eq!(top.severity, BottleneckSeverity::Critical);
    }

    #[test]
    fn small_drops_are_ignored() {
        let current = counts(&[1000, 580]);
        let historical = counts(&[1000, 600]);
        let drops = detect_conversion_drops(&current, &historical, 15.0, 0.05);
        assert!(drops.is_empty());
    }

    #[test]
    fn time_stuck_requires_threshold_increase() {
        // +20% under the medium (30%) threshold: nothing.
        assert!(detect_time_stuck(1200.0, 1000.0, 50, 30.0).is_none());

        let stuck = detect_time_stuck(1500.0, 1000.0, 50, 30.0).unwrap();
        assert_eq!(stuck.kind, BottleneckKind::TimeStuck);
        assert_eq!(stuck.drop_percentage, 50.0);
    }

    // Control-limit scenario: mean 10, sigma 1, a run of points at 6.5
    // (beyond the lower limit of 7) collapses into one sudden-drop anomaly
    // with magnitude 3.5 and confidence 70.
    #[test]
    fn spc_groups_consecutive_points_into_one_anomaly() {
        let base = Utc.with_ymd_and_hms(2025, 3, 5, 0, 0, 0).unwrap();
        let mut points: Vec<(DateTime<Utc>, f64)> = (0..20)
            .map(|i| (base + chrono::Duration::hours(i), 10.0))
            .collect();
        for i in 10..20 {
            points[i].1 = 6.5;
        }

        let anomalies = spc_anomalies(&points, 10.0, 1.0);
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].kind, AnomalyKind::SuddenDrop);
        assert!((anomalies[0].magnitude - 3.5).abs() < 1e-9);
        assert!((anomalies[0].confidence_score - 70.0).abs() < 1e-9);
    }

    #[test]
    fn spc_single_point_is_not_an_anomaly() {
        let base = Utc.with_ymd_and_hms(2025, 3, 5, 0, 0, 0).unwrap();
        let mut points: Vec<(DateTime<Utc>, f64)> = (0..10)
            .map(|i| (base + chrono::Duration::hours(i), 10.0))
            .collect();
        points[4].1 = 5.0;

        assert!(spc_anomalies(&points, 10.0, 1.0).is_empty());
    }

    #[test]
    fn gradual_decline_over_sliding_windows() {
        let base = Utc.with_ymd_and_hms(2025, 3, 5, 0, 0, 0).unwrap();
        // Steady decline of 2.4 rate points per hour.
        let points: Vec<(DateTime<Utc>, f64)> = (0..24)
            .map(|i| (base + chrono::Duration::hours(i), 80.0 - 2.4 * i as f64))
            .collect();

        let anomalies = trend_anomalies(&points);
        assert!(anomalies.iter().any(|a| a.kind == AnomalyKind::GradualDecline));
    }

    #[test]
    fn weekend_and_business_hours_context() {
        // 2025-03-08 is a Saturday.
        let saturday_noon = Utc.with_ymd_and_hms(2025, 3, 8, 12, 0, 0).unwrap();
        let factors = contextual_factors(saturday_noon);
        assert!(factors.contains(&"weekend".to_string()));
        assert!(factors.contains(&"business_hours".to_string()));

        let tuesday_night = Utc.with_ymd_and_hms(2025, 3, 4, 22, 0, 0).unwrap();
        assert!(contextual_factors(tuesday_night).is_empty());
    }

    #[test]
    fn recommendations_cap_expected_lift() {
        let bottleneck = DetectedBottleneck {
            kind: BottleneckKind::ConversionDrop,
            step_order: Some(1),
            current_value: 10.0,
            historical_value: 60.0,
            drop_percentage: 83.3,
            affected_users: 900,
            severity: BottleneckSeverity::Critical,
            severity_score: 246.0,
            p_value: Some(0.0001),
            confidence_score: 99.99,
        };
        let recs = build_recommendations(&[bottleneck], &[]);
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].expected_lift_percent, 25.0);
        assert_eq!(recs[0].confidence_level, "high");
    }
}
