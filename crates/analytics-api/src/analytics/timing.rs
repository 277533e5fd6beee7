//! Timing analysis: how long conversion takes, where time is spent, and
//! which steps or segments are slow.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use funnelcast_common::cache::CacheClass;
use funnelcast_common::error::AppError;
use funnelcast_common::funnel::FunnelDefinition;
use funnelcast_common::ids::{IdKind, format_id};
use funnelcast_common::tenant::TenantContext;

use crate::analytics::conversion::DateRangeOut;
use crate::analytics::engine::{Analyzed, AnalyticsEngine, MAX_WINDOW_DAYS, RequestedRange, parse_range};
use crate::analytics::stats;
use crate::repository::steps::StepCountRow;
use crate::repository::timing::{SegmentTimingRow, StepTransitionRow, VelocityRow};
use crate::repository::{DateRange, Granularity, SegmentDimension, steps, timing};

// ── Request ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct TimingRequest {
    #[serde(flatten)]
    pub range: RequestedRange,
    #[serde(default = "default_granularity")]
    pub trend_granularity: Granularity,
}

fn default_granularity() -> Granularity {
    Granularity::Daily
}

// ── Response ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingAnalysis {
    pub funnel_id: String,
    pub funnel_name: String,
    pub date_range: DateRangeOut,
    pub distribution: TimingDistribution,
    pub step_timing: Vec<StepTiming>,
    pub velocity_trends: Vec<VelocityTrendPoint>,
    pub segment_timing: Vec<SegmentTimingOut>,
    pub bottlenecks: Vec<TimingBottleneck>,
    pub insights: Vec<TimingInsight>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingDistribution {
    pub statistics: TimingStatistics,
    pub buckets: Vec<DistributionBucket>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingStatistics {
    pub sample_size: usize,
    pub p10: f64,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub mean: f64,
    pub stddev: f64,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionBucket {
    pub label: String,
    pub count: usize,
    pub share: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepTiming {
    pub step_order: i32,
    pub label: String,
    pub users_at_step: i64,
    pub avg_seconds_to_next: f64,
    pub median_seconds_to_next: f64,
    pub p90_seconds_to_next: f64,
    pub abandonment_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VelocityTrendPoint {
    pub period: DateTime<Utc>,
    pub conversions: i64,
    pub avg_seconds: f64,
    pub median_seconds: f64,
    pub velocity_score: u8,
    pub trend_indicator: TrendIndicator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendIndicator {
    Improving,
    Declining,
    Stable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentTimingOut {
    pub dimension: SegmentDimension,
    pub segment: String,
    pub users: i64,
    pub avg_seconds: f64,
    pub performance_indicator: PerformanceIndicator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PerformanceIndicator {
    Fast,
    Average,
    Slow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingBottleneck {
    pub step_order: i32,
    pub kind: TimingBottleneckKind,
    pub severity: String,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimingBottleneckKind {
    SlowProgression,
    HighAbandonment,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingInsight {
    pub category: String,
    pub severity: String,
    pub message: String,
}

// ── Engine entry point ──────────────────────────────────────────────

impl AnalyticsEngine {
    pub fn timing(
        &self,
        ctx: TenantContext,
        funnel_id: i64,
        request: &TimingRequest,
    ) -> Result<Analyzed<TimingAnalysis>, AppError> {
        let key = Self::funnel_key(
            "funnel:timing",
            ctx,
            funnel_id,
            &[
                ("end", request.range.end_date.clone()),
                ("granularity", format!("{:?}", request.trend_granularity)),
                ("start", request.range.start_date.clone()),
            ],
        );

        let range = parse_range(&request.range, MAX_WINDOW_DAYS)?;

        self.run_cached(&key, CacheClass::DailyMetrics, || {
            self.compute_timing(ctx, funnel_id, request, range)
        })
    }

    fn compute_timing(
        &self,
        ctx: TenantContext,
        funnel_id: i64,
        request: &TimingRequest,
        range: DateRange,
    ) -> Result<TimingAnalysis, AppError> {
        let (funnel, definition) = self.resolve_funnel(ctx, funnel_id)?;
        let total_steps = definition.total_steps() as i32;

        let durations = timing::journey_durations(self.pool(), ctx, funnel_id, range)?;
        let transitions = timing::step_transitions(self.pool(), ctx, funnel_id, range)?;
        let counts = steps::step_completions(self.pool(), ctx, funnel_id, total_steps, range)?;
        let velocity = timing::velocity_trend(self.pool(), ctx, funnel_id, request.trend_granularity, range)?;

        let mut segment_timing = Vec::new();
        for dimension in [
            SegmentDimension::DeviceType,
            SegmentDimension::UtmSource,
            SegmentDimension::Platform,
        ] {
            let rows = timing::segment_timing(self.pool(), ctx, funnel_id, dimension, range)?;
            segment_timing.extend(build_segment_timing(dimension, &rows, stats::mean(&durations)));
        }

        let step_timing = build_step_timing(&definition, &counts, &transitions);
        let bottlenecks = detect_bottlenecks(&step_timing);
        let velocity_trends = build_velocity_trends(&velocity);
        let insights = build_insights(&durations, &bottlenecks, &velocity_trends, &segment_timing);

        Ok(TimingAnalysis {
            funnel_id: format_id(IdKind::Funnel, funnel_id),
            funnel_name: funnel.name,
            date_range: range.into(),
            distribution: build_distribution(&durations),
            step_timing,
            velocity_trends,
            segment_timing,
            bottlenecks,
            insights,
        })
    }
}

// ── Pure builders ───────────────────────────────────────────────────

const BUCKETS: &[(&str, f64)] = &[
    ("0-5m", 300.0),
    ("5-15m", 900.0),
    ("15-30m", 1800.0),
    ("30-60m", 3600.0),
    ("1-24h", 86_400.0),
    ("1-7d", 604_800.0),
    ("7d+", f64::INFINITY),
];

pub(crate) fn build_distribution(durations: &[f64]) -> TimingDistribution {
    let min = durations.iter().copied().fold(f64::INFINITY, f64::min);

    let statistics = TimingStatistics {
        sample_size: durations.len(),
        p10: stats::round2(stats::percentile(durations, 10.0)),
        p25: stats::round2(stats::percentile(durations, 25.0)),
        p50: stats::round2(stats::percentile(durations, 50.0)),
        p75: stats::round2(stats::percentile(durations, 75.0)),
        p90: stats::round2(stats::percentile(durations, 90.0)),
        p95: stats::round2(stats::percentile(durations, 95.0)),
        p99: stats::round2(stats::percentile(durations, 99.0)),
        mean: stats::round2(stats::mean(durations)),
        stddev: stats::round2(stats::stddev(durations)),
        min: if min.is_finite() { stats::round2(min) } else { 0.0 },
        max: stats::round2(durations.iter().copied().fold(0.0, f64::max)),
    };

    let mut buckets = Vec::with_capacity(BUCKETS.len());
    let mut lower = 0.0;
    for (label, upper) in BUCKETS {
        let count = durations.iter().filter(|d| **d >= lower && **d < *upper).count();
        buckets.push(DistributionBucket {
            label: (*label).to_string(),
            count,
            share: if durations.is_empty() {
                0.0
            } else {
                stats::round2(count as f64 / durations.len() as f64 * 100.0)
            },
        });
        lower = *upper;
    }

    TimingDistribution { statistics, buckets }
}

pub(crate) fn build_step_timing(
    definition: &FunnelDefinition,
    counts: &[StepCountRow],
    transitions: &[StepTransitionRow],
) -> Vec<StepTiming> {
    let reached = |order: i32| -> i64 {
        counts.iter().find(|c| c.step_order == order).map(|c| c.users).unwrap_or(0)
    };
    let last_step = definition.total_steps() as i32 - 1;

    definition
        .steps
        .iter()
        .filter(|step| step.order_index < last_step)
        .map(|step| {
            let users_at_step = reached(step.order_index);
            let proceeded = reached(step.order_index + 1);
            let abandonment_rate = if users_at_step > 0 {
                stats::round2((users_at_step - proceeded).max(0) as f64 / users_at_step as f64 * 100.0)
            } else {
                0.0
            };

            let transition = transitions.iter().find(|t| t.step_order == step.order_index);

            StepTiming {
                step_order: step.order_index,
                label: step.label.clone(),
                users_at_step,
                avg_seconds_to_next: stats::round2(transition.map(|t| t.avg_seconds).unwrap_or(0.0)),
                median_seconds_to_next: stats::round2(transition.map(|t| t.median_seconds).unwrap_or(0.0)),
                p90_seconds_to_next: stats::round2(transition.map(|t| t.p90_seconds).unwrap_or(0.0)),
                abandonment_rate,
            }
        })
        .collect()
}

/// Slow progression: a step whose average time to the next step exceeds
/// twice the cross-step mean (high severity beyond three times). High
/// abandonment: above 1.5x the mean abandonment AND above 20%.
pub(crate) fn detect_bottlenecks(step_timing: &[StepTiming]) -> Vec<TimingBottleneck> {
    let times: Vec<f64> = step_timing
        .iter()
        .map(|s| s.avg_seconds_to_next)
        .filter(|t| *t > 0.0)
        .collect();
    let mean_time = stats::mean(&times);

    let abandonments: Vec<f64> = step_timing.iter().map(|s| s.abandonment_rate).collect();
    let mean_abandonment = stats::mean(&abandonments);

    let mut bottlenecks = Vec::new();

    for step in step_timing {
        if mean_time > 0.0 && step.avg_seconds_to_next > 2.0 * mean_time {
            let severity = if step.avg_seconds_to_next > 3.0 * mean_time { "high" } else { "medium" };
            bottlenecks.push(TimingBottleneck {
                step_order: step.step_order,
                kind: TimingBottleneckKind::SlowProgression,
                severity: severity.to_string(),
                detail: format!(
                    "average {:.0}s to the next step against a {:.0}s step mean",
                    step.avg_seconds_to_next, mean_time
                ),
            });
        }

        if step.abandonment_rate > 1.5 * mean_abandonment && step.abandonment_rate > 20.0 {
            bottlenecks.push(TimingBottleneck {
                step_order: step.step_order,
                kind: TimingBottleneckKind::HighAbandonment,
                severity: "medium".to_string(),
                detail: format!(
                    "{:.1}% abandon here against a {:.1}% step mean",
                    step.abandonment_rate, mean_abandonment
                ),
            });
        }
    }

    bottlenecks
}

/// Velocity score buckets by average conversion time.
pub(crate) fn velocity_score(avg_seconds: f64) -> u8 {
    if avg_seconds <= 300.0 {
        100
    } else if avg_seconds <= 1800.0 {
        85
    } else if avg_seconds <= 3600.0 {
        70
    } else if avg_seconds <= 86_400.0 {
        50
    } else {
        25
    }
}

pub(crate) fn build_velocity_trends(rows: &[VelocityRow]) -> Vec<VelocityTrendPoint> {
    let mut points = Vec::with_capacity(rows.len());
    let mut previous_avg: Option<f64> = None;

    for row in rows {
        // A >10% drop in time is improving, a >10% rise declining.
        let trend_indicator = match previous_avg {
            Some(prev) if prev > 0.0 && row.avg_seconds < prev * 0.9 => TrendIndicator::Improving,
            Some(prev) if prev > 0.0 && row.avg_seconds > prev * 1.1 => TrendIndicator::Declining,
            _ => TrendIndicator::Stable,
        };
        previous_avg = Some(row.avg_seconds);

        points.push(VelocityTrendPoint {
            period: row.period,
            conversions: row.conversions,
            avg_seconds: stats::round2(row.avg_seconds),
            median_seconds: stats::round2(row.median_seconds),
            velocity_score: velocity_score(row.avg_seconds),
            trend_indicator,
        });
    }

    points
}

pub(crate) fn build_segment_timing(
    dimension: SegmentDimension,
    rows: &[SegmentTimingRow],
    overall_mean_seconds: f64,
) -> Vec<SegmentTimingOut> {
    rows.iter()
        .map(|row| {
            let performance_indicator = if overall_mean_seconds <= 0.0 {
                PerformanceIndicator::Average
            } else if row.avg_seconds < 0.8 * overall_mean_seconds {
                PerformanceIndicator::Fast
            } else if row.avg_seconds > 1.2 * overall_mean_seconds {
                PerformanceIndicator::Slow
            } else {
                PerformanceIndicator::Average
            };

            SegmentTimingOut {
                dimension,
                segment: row.segment.clone(),
                users: row.users,
                avg_seconds: stats::round2(row.avg_seconds),
                performance_indicator,
            }
        })
        .collect()
}

pub(crate) fn build_insights(
    durations: &[f64],
    bottlenecks: &[TimingBottleneck],
    velocity_trends: &[VelocityTrendPoint],
    segment_timing: &[SegmentTimingOut],
) -> Vec<TimingInsight> {
    let mut insights = Vec::new();

    if !durations.is_empty() {
        let median = stats::median(durations);
        insights.push(TimingInsight {
            category: "overall_speed".to_string(),
            severity: "info".to_string(),
            message: format!(
                "Median conversion takes {:.0} minutes (velocity score {})",
                median / 60.0,
                velocity_score(stats::mean(durations))
            ),
        });
    }

    if !bottlenecks.is_empty() {
        insights.push(TimingInsight {
            category: "bottlenecks".to_string(),
            severity: "warning".to_string(),
            message: format!("{} step(s) slow or bleed users beyond the funnel norm", bottlenecks.len()),
        });
    }

    // Two or more of the last three periods declining warrants an alert.
    let recent_declines = velocity_trends
        .iter()
        .rev()
        .take(3)
        .filter(|p| p.trend_indicator == TrendIndicator::Declining)
        .count();
    if recent_declines >= 2 {
        insights.push(TimingInsight {
            category: "velocity_trend".to_string(),
            severity: "medium".to_string(),
            message: "Conversion speed declined in most recent periods".to_string(),
        });
    }

    if let Some(slowest) = segment_timing
        .iter()
        .filter(|s| s.performance_indicator == PerformanceIndicator::Slow)
        .max_by(|a, b| a.avg_seconds.total_cmp(&b.avg_seconds))
    {
        insights.push(TimingInsight {
            category: "slow_segment".to_string(),
            severity: "info".to_string(),
            message: format!(
                "{} `{}` converts slowest at {:.0} minutes on average",
                slowest.dimension.as_str(),
                slowest.segment,
                slowest.avg_seconds / 60.0
            ),
        });
    }

    insights
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distribution_buckets_cover_all_durations() {
        let durations = [60.0, 600.0, 2000.0, 5000.0, 90_000.0, 700_000.0];
        let distribution = build_distribution(&durations);

        let total: usize = distribution.buckets.iter().map(|b| b.count).sum();
        assert_eq!(total, durations.len());
        assert_eq!(distribution.buckets[0].count, 1); // 0-5m
        assert_eq!(distribution.buckets.last().unwrap().count, 1); // 7d+
        assert_eq!(distribution.statistics.sample_size, 6);
        assert!(distribution.statistics.p50 > 0.0);
    }

    #[test]
    fn empty_distribution_is_zeroed() {
        let distribution = build_distribution(&[]);
        assert_eq!(distribution.statistics.sample_size, 0);
        assert_eq!(distribution.statistics.min, 0.0);
        assert!(distribution.buckets.iter().all(|b| b.count == 0));
    }

    #[test]
    fn velocity_score_buckets() {
        assert_eq!(velocity_score(200.0), 100);
        assert_eq!(velocity_score(1000.0), 85);
        assert_eq!(velocity_score(3000.0), 70);
        assert_eq!(velocity_score(40_000.0), 50);
        assert_eq!(velocity_score(200_000.0), 25);
    }

    #[test]
    fn trend_indicator_uses_ten_percent_band() {
        let base = chrono::Utc::now();
        let row = |avg: f64| VelocityRow {
            period: base,
            conversions: 10,
            avg_seconds: avg,
            median_seconds: avg,
        };
        let points = build_velocity_trends(&[row(100.0), row(80.0), row(95.0), row(96.0)]);
        assert_eq!(points[0].trend_indicator, TrendIndicator::Stable);
        assert_eq!(points[1].trend_indicator, TrendIndicator::Improving);
        assert_eq!(points[2].trend_indicator, TrendIndicator::Declining);
        assert_eq!(points[3].trend_indicator, TrendIndicator::Stable);
    }

    #[test]
    fn slow_progression_detection() {
        let timing = |order: i32, avg: f64, abandonment: f64| StepTiming {
            step_order: order,
            label: format!("step {order}"),
            users_at_step: 100,
            avg_seconds_to_next: avg,
            median_seconds_to_next: avg,
            p90_seconds_to_next: avg * 2.0,
            abandonment_rate: abandonment,
        };

        let bottlenecks = detect_bottlenecks(&[
            timing(0, 60.0, 10.0),
            timing(1, 70.0, 10.0),
            timing(2, 600.0, 10.0),
        ]);

        let slow: Vec<_> = bottlenecks
            .iter()
            .filter(|b| b.kind == TimingBottleneckKind::SlowProgression)
            .collect();
        assert_eq!(slow.len(), 1);
        assert_eq!(slow[0].step_order, 2);
        assert_eq!(slow[0].severity, "high");
    }

    #[test]
    fn abandonment_detection_requires_both_conditions() {
        let timing = |order: i32, abandonment: f64| StepTiming {
            step_order: order,
            label: format!("step {order}"),
            users_at_step: 100,
            avg_seconds_to_next: 60.0,
            median_seconds_to_next: 60.0,
            p90_seconds_to_next: 100.0,
            abandonment_rate: abandonment,
        };

        // 15% is 1.5x the 10% mean but below the 20% floor.
        let low = detect_bottlenecks(&[timing(0, 5.0), timing(1, 15.0)]);
        assert!(low.iter().all(|b| b.kind != TimingBottleneckKind::HighAbandonment));

        let high = detect_bottlenecks(&[timing(0, 10.0), timing(1, 40.0)]);
        assert!(high.iter().any(|b| b.kind == TimingBottleneckKind::HighAbandonment && b.step_order == 1));
    }

    #[test]
    fn segment_performance_classification() {
        let rows = vec![
            SegmentTimingRow { segment: "mobile".into(), users: 20, avg_seconds: 50.0 },
            SegmentTimingRow { segment: "desktop".into(), users: 30, avg_seconds: 100.0 },
            SegmentTimingRow { segment: "tablet".into(), users: 15, avg_seconds: 200.0 },
        ];
        let out = build_segment_timing(SegmentDimension::DeviceType, &rows, 100.0);
        assert_eq!(out[0].performance_indicator, PerformanceIndicator::Fast);
        assert_eq!(out[1].performance_indicator, PerformanceIndicator::Average);
        assert_eq!(out[2].performance_indicator, PerformanceIndicator::Slow);
    }
}
