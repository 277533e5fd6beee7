//! Cohort analysis: per-period cohorts, step progression, retention,
//! optional segment splits, and cross-cohort statistical comparison.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use funnelcast_common::cache::CacheClass;
use funnelcast_common::error::AppError;
use funnelcast_common::ids::{IdKind, format_id};
use funnelcast_common::tenant::TenantContext;

use crate::analytics::conversion::DateRangeOut;
use crate::analytics::engine::{Analyzed, AnalyticsEngine, MAX_WINDOW_DAYS, RequestedRange, parse_range};
use crate::analytics::stats;
use crate::repository::cohorts::{CohortRow, CohortStepRow, RetentionRow};
use crate::repository::{CohortPeriod, DateRange, SegmentDimension, cohorts};

// ── Request ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct CohortRequest {
    #[serde(flatten)]
    pub range: RequestedRange,
    #[serde(default = "default_period")]
    pub period: CohortPeriod,
    #[serde(default)]
    pub include_segments: bool,
    #[serde(default)]
    pub include_comparisons: bool,
}

fn default_period() -> CohortPeriod {
    CohortPeriod::Weekly
}

// ── Response ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CohortAnalysis {
    pub funnel_id: String,
    pub funnel_name: String,
    pub date_range: DateRangeOut,
    pub period: CohortPeriod,
    pub cohorts: Vec<Cohort>,
    /// Empty when fewer than two cohorts exist.
    pub cohort_comparison: Vec<CohortComparison>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segment_cohorts: Option<SegmentCohorts>,
    pub insights: Vec<CohortInsight>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cohort {
    pub cohort_start: DateTime<Utc>,
    pub cohort_size: i64,
    pub conversions: i64,
    pub conversion_rate: f64,
    pub avg_minutes_to_convert: f64,
    pub step_progression: Vec<CohortStepProgress>,
    pub retention: Vec<RetentionPoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CohortStepProgress {
    pub step_order: i32,
    pub reached: i64,
    /// Conversion from the previous step; the first step is always 100%.
    pub step_conversion_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionPoint {
    pub period_index: i32,
    pub retained: i64,
    pub retention_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CohortComparison {
    pub metric: String,
    pub best_cohort: DateTime<Utc>,
    pub worst_cohort: DateTime<Utc>,
    pub trend_direction: TrendLabel,
    /// Pearson |r| of the metric against cohort order.
    pub trend_strength: f64,
    /// Coefficient of variation across cohorts.
    pub volatility: f64,
    pub significant_variance: bool,
    /// Heuristic p-value from CV and sample count; bounded, not a true
    /// F-distribution tail.
    pub f_test_p_value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendLabel {
    Improving,
    Declining,
    Stable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentCohorts {
    pub device: Vec<SegmentCohortRow>,
    pub traffic_source: Vec<SegmentCohortRow>,
    pub geography: Vec<SegmentCohortRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentCohortRow {
    pub cohort_start: DateTime<Utc>,
    pub segment: String,
    pub users: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CohortInsight {
    pub category: String,
    pub severity: String,
    pub message: String,
}

// ── Engine entry point ──────────────────────────────────────────────

impl AnalyticsEngine {
    pub fn cohorts(
        &self,
        ctx: TenantContext,
        funnel_id: i64,
        request: &CohortRequest,
    ) -> Result<Analyzed<CohortAnalysis>, AppError> {
        let key = Self::funnel_key(
            "funnel:cohorts",
            ctx,
            funnel_id,
            &[
                ("comparisons", request.include_comparisons.to_string()),
                ("end", request.range.end_date.clone()),
                ("period", format!("{:?}", request.period)),
                ("segments", request.include_segments.to_string()),
                ("start", request.range.start_date.clone()),
            ],
        );

        let range = parse_range(&request.range, MAX_WINDOW_DAYS)?;

        self.run_cached(&key, CacheClass::CohortAnalysis, || {
            self.compute_cohorts(ctx, funnel_id, request, range)
        })
    }

    fn compute_cohorts(
        &self,
        ctx: TenantContext,
        funnel_id: i64,
        request: &CohortRequest,
        range: DateRange,
    ) -> Result<CohortAnalysis, AppError> {
        let (funnel, definition) = self.resolve_funnel(ctx, funnel_id)?;
        let total_steps = definition.total_steps() as i32;

        let cohort_rows = cohorts::cohorts_by_period(self.pool(), ctx, funnel_id, request.period, range)?;
        let progression =
            cohorts::cohort_progression(self.pool(), ctx, funnel_id, request.period, total_steps, range)?;
        let retention = cohorts::retention_curves(self.pool(), ctx, funnel_id, request.period, range)?;

        let built = build_cohorts(&cohort_rows, &progression, &retention);

        let comparison = if request.include_comparisons {
            build_comparisons(&built)
        } else {
            Vec::new()
        };

        let segment_cohorts = if request.include_segments {
            let load = |dimension: SegmentDimension| -> Result<Vec<SegmentCohortRow>, AppError> {
                Ok(cohorts::cohort_breakdown(self.pool(), ctx, funnel_id, request.period, dimension, range)?
                    .into_iter()
                    .map(|row| SegmentCohortRow {
                        cohort_start: row.cohort_start,
                        segment: row.dimension_value,
                        users: row.users,
                    })
                    .collect())
            };
            Some(SegmentCohorts {
                device: load(SegmentDimension::DeviceType)?,
                traffic_source: load(SegmentDimension::UtmSource)?,
                geography: load(SegmentDimension::Geography)?,
            })
        } else {
            None
        };

        let insights = build_insights(&built, &comparison);

        Ok(CohortAnalysis {
            funnel_id: format_id(IdKind::Funnel, funnel_id),
            funnel_name: funnel.name,
            date_range: range.into(),
            period: request.period,
            cohorts: built,
            cohort_comparison: comparison,
            segment_cohorts,
            insights,
        })
    }
}

// ── Pure builders ───────────────────────────────────────────────────

pub(crate) fn build_cohorts(
    cohort_rows: &[CohortRow],
    progression: &[CohortStepRow],
    retention: &[RetentionRow],
) -> Vec<Cohort> {
    cohort_rows
        .iter()
        .map(|row| {
            let steps: Vec<&CohortStepRow> = progression
                .iter()
                .filter(|p| p.cohort_start == row.cohort_start)
                .collect();

            let step_progression = steps
                .iter()
                .map(|step| {
                    let previous = if step.step_order == 0 {
                        step.reached
                    } else {
                        steps
                            .iter()
                            .find(|p| p.step_order == step.step_order - 1)
                            .map(|p| p.reached)
                            .unwrap_or(0)
                    };
                    let step_conversion_rate = if step.step_order == 0 {
                        100.0
                    } else if previous > 0 {
                        stats::round2(step.reached as f64 / previous as f64 * 100.0)
                    } else {
                        0.0
                    };
                    CohortStepProgress {
                        step_order: step.step_order,
                        reached: step.reached,
                        step_conversion_rate,
                    }
                })
                .collect();

            let retention_points = retention
                .iter()
                .filter(|r| r.cohort_start == row.cohort_start)
                .map(|r| RetentionPoint {
                    period_index: r.period_index,
                    retained: r.retained,
                    retention_rate: if row.cohort_size > 0 {
                        stats::round2(r.retained as f64 / row.cohort_size as f64 * 100.0)
                    } else {
                        0.0
                    },
                })
                .collect();

            Cohort {
                cohort_start: row.cohort_start,
                cohort_size: row.cohort_size,
                conversions: row.conversions,
                conversion_rate: if row.cohort_size > 0 {
                    stats::round2(row.conversions as f64 / row.cohort_size as f64 * 100.0)
                } else {
                    0.0
                },
                avg_minutes_to_convert: stats::round2(row.avg_minutes_to_convert),
                step_progression,
                retention: retention_points,
            }
        })
        .collect()
}

fn compare_metric(
    cohorts: &[Cohort],
    metric: &str,
    values: Vec<f64>,
    lower_is_better: bool,
) -> Option<CohortComparison> {
    if cohorts.len() < 2 {
        return None;
    }

    let pick = |best: bool| -> DateTime<Utc> {
        let mut indexed: Vec<(usize, f64)> = values.iter().copied().enumerate().collect();
        indexed.sort_by(|a, b| a.1.total_cmp(&b.1));
        let idx = if best != lower_is_better {
            indexed.last().map(|(i, _)| *i).unwrap_or(0)
        } else {
            indexed.first().map(|(i, _)| *i).unwrap_or(0)
        };
        cohorts[idx].cohort_start
    };

    let order: Vec<f64> = (0..values.len()).map(|i| i as f64).collect();
    let r = stats::pearson_r(&order, &values);
    let slope_improves = if lower_is_better { r < 0.0 } else { r > 0.0 };

    let trend_direction = if r.abs() < 0.3 {
        TrendLabel::Stable
    } else if slope_improves {
        TrendLabel::Improving
    } else {
        TrendLabel::Declining
    };

    let volatility = stats::coefficient_of_variation(&values);
    let sample: i64 = cohorts.iter().map(|c| c.cohort_size).sum();

    Some(CohortComparison {
        metric: metric.to_string(),
        best_cohort: pick(true),
        worst_cohort: pick(false),
        trend_direction,
        trend_strength: stats::round2(r.abs()),
        volatility: stats::round2(volatility),
        significant_variance: volatility > 0.2,
        f_test_p_value: f_test_heuristic(volatility, sample),
    })
}

/// Bounded heuristic standing in for an F-test tail: high variation over a
/// large sample drives the value toward 0, no variation keeps it at 1.
fn f_test_heuristic(cv: f64, sample_size: i64) -> f64 {
    let n = (sample_size.max(1)) as f64;
    (1.0 / (1.0 + cv * cv * n)).clamp(0.0, 1.0)
}

pub(crate) fn build_comparisons(cohorts: &[Cohort]) -> Vec<CohortComparison> {
    if cohorts.len() < 2 {
        return Vec::new();
    }

    let rates: Vec<f64> = cohorts.iter().map(|c| c.conversion_rate).collect();
    let times: Vec<f64> = cohorts.iter().map(|c| c.avg_minutes_to_convert).collect();

    [
        compare_metric(cohorts, "conversion_rate", rates, false),
        compare_metric(cohorts, "time_to_convert", times, true),
    ]
    .into_iter()
    .flatten()
    .collect()
}

pub(crate) fn build_insights(
    cohorts: &[Cohort],
    comparisons: &[CohortComparison],
) -> Vec<CohortInsight> {
    let mut insights = Vec::new();
    if cohorts.is_empty() {
        return insights;
    }

    let rates: Vec<f64> = cohorts.iter().map(|c| c.conversion_rate).collect();
    let overall = stats::mean(&rates);
    insights.push(CohortInsight {
        category: "overall_performance".to_string(),
        severity: "info".to_string(),
        message: format!(
            "{} cohorts averaging a {:.1}% conversion rate",
            cohorts.len(),
            overall
        ),
    });

    // Trend: first third vs last third of the cohort series.
    if cohorts.len() >= 3 {
        let third = (cohorts.len() / 3).max(1);
        let first = stats::mean(&rates[..third]);
        let last = stats::mean(&rates[rates.len() - third..]);
        if first > 0.0 {
            let shift = (last - first) / first * 100.0;
            if shift.abs() >= 5.0 {
                let direction = if shift > 0.0 { "improved" } else { "declined" };
                insights.push(CohortInsight {
                    category: "trend".to_string(),
                    severity: if shift < 0.0 { "warning" } else { "info" }.to_string(),
                    message: format!(
                        "Recent cohorts have {} by {:.1}% versus early cohorts",
                        direction,
                        shift.abs()
                    ),
                });
            }
        }
    }

    // Gap between best and worst cohorts.
    if let (Some(best), Some(worst)) = (
        rates.iter().copied().reduce(f64::max),
        rates.iter().copied().reduce(f64::min),
    ) && best - worst > 10.0
    {
        insights.push(CohortInsight {
            category: "cohort_gap".to_string(),
            severity: "warning".to_string(),
            message: format!(
                "Best and worst cohorts differ by {:.1} percentage points",
                best - worst
            ),
        });
    }

    for comparison in comparisons {
        if comparison.significant_variance {
            insights.push(CohortInsight {
                category: "variance".to_string(),
                severity: "warning".to_string(),
                message: format!(
                    "{} varies significantly across cohorts (CV {:.2})",
                    comparison.metric, comparison.volatility
                ),
            });
        }
    }

    insights
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, day, 0, 0, 0).unwrap()
    }

    fn cohort_row(day: u32, size: i64, conversions: i64) -> CohortRow {
        CohortRow {
            cohort_start: ts(day),
            cohort_size: size,
            conversions,
            avg_minutes_to_convert: 30.0,
        }
    }

    #[test]
    fn step_conversion_rates_chain_from_previous() {
        let rows = vec![cohort_row(1, 100, 10)];
        let progression = vec![
            CohortStepRow { cohort_start: ts(1), step_order: 0, reached: 100 },
            CohortStepRow { cohort_start: ts(1), step_order: 1, reached: 40 },
            CohortStepRow { cohort_start: ts(1), step_order: 2, reached: 10 },
        ];
        let cohorts = build_cohorts(&rows, &progression, &[]);

        let steps = &cohorts[0].step_progression;
        assert_eq!(steps[0].step_conversion_rate, 100.0);
        assert_eq!(steps[1].step_conversion_rate, 40.0);
        assert_eq!(steps[2].step_conversion_rate, 25.0);
        assert_eq!(cohorts[0].conversion_rate, 10.0);
    }

    #[test]
    fn retention_rates_are_relative_to_cohort_size() {
        let rows = vec![cohort_row(1, 200, 20)];
        let retention = vec![
            RetentionRow { cohort_start: ts(1), period_index: 0, retained: 200 },
            RetentionRow { cohort_start: ts(1), period_index: 1, retained: 50 },
        ];
        let cohorts = build_cohorts(&rows, &[], &retention);
        assert_eq!(cohorts[0].retention[0].retention_rate, 100.0);
        assert_eq!(cohorts[0].retention[1].retention_rate, 25.0);
    }

    #[test]
    fn fewer_than_two_cohorts_yields_empty_comparison() {
        let cohorts = build_cohorts(&[cohort_row(1, 100, 10)], &[], &[]);
        assert!(build_comparisons(&cohorts).is_empty());
    }

    #[test]
    fn comparison_finds_best_and_worst() {
        let rows = vec![
            cohort_row(1, 100, 5),
            cohort_row(8, 100, 10),
            cohort_row(15, 100, 20),
        ];
        let cohorts = build_cohorts(&rows, &[], &[]);
        let comparisons = build_comparisons(&cohorts);

        let rate = comparisons.iter().find(|c| c.metric == "conversion_rate").unwrap();
        assert_eq!(rate.best_cohort, ts(15));
        assert_eq!(rate.worst_cohort, ts(1));
        assert_eq!(rate.trend_direction, TrendLabel::Improving);
        assert!(rate.trend_strength > 0.9);
        assert!(rate.f_test_p_value >= 0.0 && rate.f_test_p_value <= 1.0);
    }

    #[test]
    fn gap_insight_fires_beyond_ten_points() {
        let rows = vec![cohort_row(1, 100, 5), cohort_row(8, 100, 20)];
        let cohorts = build_cohorts(&rows, &[], &[]);
        let insights = build_insights(&cohorts, &[]);
        assert!(insights.iter().any(|i| i.category == "cohort_gap"));
    }
}
