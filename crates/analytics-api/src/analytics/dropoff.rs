//! Drop-off analysis: where users leave, how fast they leave, and which
//! steps deserve attention first.

use serde::{Deserialize, Serialize};

use funnelcast_common::cache::CacheClass;
use funnelcast_common::error::AppError;
use funnelcast_common::funnel::{FunnelDefinition, StepType};
use funnelcast_common::ids::{IdKind, format_id};
use funnelcast_common::tenant::TenantContext;

use crate::analytics::conversion::{DateRangeOut, Severity};
use crate::analytics::engine::{Analyzed, AnalyticsEngine, MAX_WINDOW_DAYS, RequestedRange, parse_range};
use crate::analytics::stats;
use crate::repository::steps::DropoffRow;
use crate::repository::{DateRange, steps};

// ── Request ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct DropoffRequest {
    #[serde(flatten)]
    pub range: RequestedRange,
    #[serde(default)]
    pub include_exit_paths: bool,
    #[serde(default)]
    pub include_recommendations: bool,
}

// ── Response ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DropoffAnalysis {
    pub funnel_id: String,
    pub funnel_name: String,
    pub date_range: DateRangeOut,
    pub steps: Vec<StepDropoff>,
    pub critical_bottlenecks: Vec<BottleneckStep>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_paths: Option<Vec<ExitPath>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendations: Option<Vec<Recommendation>>,
    pub summary: DropoffSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDropoff {
    pub step_order: i32,
    pub label: String,
    pub step_type: StepType,
    pub entries: i64,
    pub exits: i64,
    pub drop_off_rate: f64,
    pub avg_seconds_before_exit: f64,
    pub exit_velocity: ExitVelocity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitVelocity {
    Immediate,
    Quick,
    Delayed,
    Hesitant,
}

impl ExitVelocity {
    pub fn classify(avg_seconds: f64) -> Self {
        if avg_seconds < 30.0 {
            ExitVelocity::Immediate
        } else if avg_seconds < 300.0 {
            ExitVelocity::Quick
        } else if avg_seconds < 1800.0 {
            ExitVelocity::Delayed
        } else {
            ExitVelocity::Hesitant
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BottleneckStep {
    pub step_order: i32,
    pub label: String,
    pub severity_score: f64,
    pub severity: Severity,
    pub drop_off_rate: f64,
    pub impact_percent: f64,
    pub likely_causes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitPath {
    pub step_order: i32,
    pub label: String,
    pub immediate_bounces: i64,
    pub delayed_exits: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    pub step_order: i32,
    pub category: String,
    pub suggestion: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DropoffSummary {
    pub total_drop_offs: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub biggest_bottleneck_step: Option<i32>,
    pub optimization_potential: f64,
}

// ── Engine entry point ──────────────────────────────────────────────

impl AnalyticsEngine {
    pub fn dropoff(
        &self,
        ctx: TenantContext,
        funnel_id: i64,
        request: &DropoffRequest,
    ) -> Result<Analyzed<DropoffAnalysis>, AppError> {
        let key = Self::funnel_key(
            "funnel:dropoff",
            ctx,
            funnel_id,
            &[
                ("end", request.range.end_date.clone()),
                ("exitPaths", request.include_exit_paths.to_string()),
                ("recommendations", request.include_recommendations.to_string()),
                ("start", request.range.start_date.clone()),
            ],
        );

        let range = parse_range(&request.range, MAX_WINDOW_DAYS)?;

        self.run_cached(&key, CacheClass::ConversionMetrics, || {
            self.compute_dropoff(ctx, funnel_id, request, range)
        })
    }

    fn compute_dropoff(
        &self,
        ctx: TenantContext,
        funnel_id: i64,
        request: &DropoffRequest,
        range: DateRange,
    ) -> Result<DropoffAnalysis, AppError> {
        let (funnel, definition) = self.resolve_funnel(ctx, funnel_id)?;
        let total_steps = definition.total_steps() as i32;

        let rows = steps::dropoff_rows(self.pool(), ctx, funnel_id, total_steps, range)?;

        let step_dropoffs = build_step_dropoffs(&definition, &rows);
        let bottlenecks = build_bottlenecks(&definition, &rows);

        let exit_paths = request.include_exit_paths.then(|| build_exit_paths(&definition, &rows));
        let recommendations = request
            .include_recommendations
            .then(|| build_recommendations(&step_dropoffs, &bottlenecks));

        let summary = build_summary(&rows, &bottlenecks);

        Ok(DropoffAnalysis {
            funnel_id: format_id(IdKind::Funnel, funnel_id),
            funnel_name: funnel.name,
            date_range: range.into(),
            steps: step_dropoffs,
            critical_bottlenecks: bottlenecks,
            exit_paths,
            recommendations,
            summary,
        })
    }
}

// ── Pure builders ───────────────────────────────────────────────────

fn step_label(definition: &FunnelDefinition, order: i32) -> (String, StepType) {
    definition
        .step(order)
        .map(|s| (s.label.clone(), s.step_type))
        .unwrap_or_else(|| (format!("step {order}"), StepType::Event))
}

pub(crate) fn build_step_dropoffs(
    definition: &FunnelDefinition,
    rows: &[DropoffRow],
) -> Vec<StepDropoff> {
    rows.iter()
        .map(|row| {
            let (label, step_type) = step_label(definition, row.step_order);
            StepDropoff {
                step_order: row.step_order,
                label,
                step_type,
                entries: row.entries,
                exits: row.exits,
                drop_off_rate: drop_rate(rows, row.step_order),
                avg_seconds_before_exit: stats::round2(row.avg_seconds_before_exit),
                exit_velocity: ExitVelocity::classify(row.avg_seconds_before_exit),
            }
        })
        .collect()
}

/// Drop-off rate at a step: the share of users who reached the previous step
/// but not this one. Step 0 has no predecessor and drops nobody.
fn drop_rate(rows: &[DropoffRow], step_order: i32) -> f64 {
    if step_order == 0 {
        return 0.0;
    }
    let reached = |order: i32| rows.iter().find(|r| r.step_order == order).map(|r| r.entries).unwrap_or(0);
    let previous = reached(step_order - 1);
    let current = reached(step_order);
    if previous <= 0 {
        return 0.0;
    }
    stats::round2((previous - current).max(0) as f64 / previous as f64 * 100.0)
}

/// Bottlenecks are attributed to the step users failed to reach: the drop
/// into step s is `reached(s-1) - reached(s)`. Severity score is
/// `drop_rate * (entries_to_transition / total_entries) * 2`, clamped to
/// 100; impact is the share of all entrants lost on that transition.
/// Ranking is by drop-off rate, so a late step bleeding most of its
/// remaining users outranks an early broad-but-shallow one.
pub(crate) fn build_bottlenecks(
    definition: &FunnelDefinition,
    rows: &[DropoffRow],
) -> Vec<BottleneckStep> {
    let reached = |order: i32| -> i64 {
        rows.iter().find(|r| r.step_order == order).map(|r| r.entries).unwrap_or(0)
    };
    let total_entries = reached(0);
    if total_entries <= 0 {
        return Vec::new();
    }

    let mut bottlenecks: Vec<BottleneckStep> = Vec::new();
    for row in rows.iter().filter(|r| r.step_order > 0) {
        let previous = reached(row.step_order - 1);
        let dropped = (previous - row.entries).max(0);
        if previous <= 0 || dropped == 0 {
            continue;
        }

        let drop_off_rate = dropped as f64 / previous as f64 * 100.0;
        let weight = previous as f64 / total_entries as f64;
        let severity_score = (drop_off_rate * weight * 2.0).clamp(0.0, 100.0);

        // Time-before-exit belongs to the step the dropped users were stuck on.
        let stuck_row = rows.iter().find(|r| r.step_order == row.step_order - 1);
        let avg_stuck_seconds = stuck_row.map(|r| r.avg_seconds_before_exit).unwrap_or(0.0);
        let (label, step_type) = step_label(definition, row.step_order);

        bottlenecks.push(BottleneckStep {
            step_order: row.step_order,
            label,
            severity_score: stats::round2(severity_score),
            severity: Severity::from_drop_off_rate(drop_off_rate),
            drop_off_rate: stats::round2(drop_off_rate),
            impact_percent: stats::round2(dropped as f64 / total_entries as f64 * 100.0),
            likely_causes: likely_causes(step_type, avg_stuck_seconds),
        });
    }

    bottlenecks.sort_by(|a, b| {
        b.drop_off_rate
            .total_cmp(&a.drop_off_rate)
            .then(b.severity_score.total_cmp(&a.severity_score))
    });
    bottlenecks
}

fn likely_causes(step_type: StepType, avg_seconds_before_exit: f64) -> Vec<String> {
    let mut causes = Vec::new();

    match ExitVelocity::classify(avg_seconds_before_exit) {
        ExitVelocity::Immediate => {
            causes.push("users bounce immediately; the step may not match expectations".to_string());
        }
        ExitVelocity::Quick => {
            causes.push("users leave within minutes; unclear next action or weak call to action".to_string());
        }
        ExitVelocity::Delayed => {
            causes.push("users spend time before leaving; friction inside the step content".to_string());
        }
        ExitVelocity::Hesitant => {
            causes.push("long hesitation before abandoning; the commitment asked for may be too large".to_string());
        }
    }

    match step_type {
        StepType::Page => causes.push("page load or layout issues can suppress progression".to_string()),
        StepType::Decision => causes.push("too many competing options at a decision point".to_string()),
        StepType::Conversion => causes.push("checkout or submission friction at the final step".to_string()),
        StepType::Start | StepType::Event => {}
    }

    causes
}

pub(crate) fn build_exit_paths(definition: &FunnelDefinition, rows: &[DropoffRow]) -> Vec<ExitPath> {
    rows.iter()
        .filter(|row| row.exits > 0)
        .map(|row| {
            let (label, _) = step_label(definition, row.step_order);
            ExitPath {
                step_order: row.step_order,
                label,
                immediate_bounces: row.immediate_bounces,
                delayed_exits: row.delayed_exits(),
            }
        })
        .collect()
}

fn build_recommendations(
    steps: &[StepDropoff],
    bottlenecks: &[BottleneckStep],
) -> Vec<Recommendation> {
    let mut recommendations = Vec::new();

    for bottleneck in bottlenecks.iter().take(3) {
        let velocity = steps
            .iter()
            .find(|s| s.step_order == bottleneck.step_order)
            .map(|s| s.exit_velocity)
            .unwrap_or(ExitVelocity::Quick);

        let (category, suggestion) = match velocity {
            ExitVelocity::Immediate => (
                "content",
                "align the step's first screen with what users clicked to get here",
            ),
            ExitVelocity::Quick => (
                "ux",
                "surface a single clear next action above the fold",
            ),
            ExitVelocity::Delayed => (
                "ux",
                "shorten the step; split long forms and defer optional input",
            ),
            ExitVelocity::Hesitant => (
                "trust",
                "add reassurance near the commitment point (pricing clarity, guarantees)",
            ),
        };

        recommendations.push(Recommendation {
            step_order: bottleneck.step_order,
            category: category.to_string(),
            suggestion: suggestion.to_string(),
        });
    }

    recommendations
}

pub(crate) fn build_summary(rows: &[DropoffRow], bottlenecks: &[BottleneckStep]) -> DropoffSummary {
    let total_drop_offs = rows.iter().map(|r| r.exits).sum();
    let severities: Vec<f64> = bottlenecks.iter().map(|b| b.severity_score).collect();

    DropoffSummary {
        total_drop_offs,
        biggest_bottleneck_step: bottlenecks.first().map(|b| b.step_order),
        optimization_potential: stats::round2(stats::mean(&severities).clamp(0.0, 100.0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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

    fn row(step_order: i32, entries: i64, exits: i64, avg: f64, bounces: i64) -> DropoffRow {
        DropoffRow {
            step_order,
            entries,
            exits,
            avg_seconds_before_exit: avg,
            immediate_bounces: bounces,
        }
    }

    // Funnel reaching [1000, 400, 100]: 60% drop into step 1, 75% into
    // step 2; the final step is the biggest bottleneck.
    fn scenario_rows() -> Vec<DropoffRow> {
        vec![
            row(0, 1000, 600, 20.0, 400),
            row(1, 400, 300, 400.0, 50),
            row(2, 100, 0, 0.0, 0),
        ]
    }

    #[test]
    fn drop_rates_match_reached_counts() {
        let dropoffs = build_step_dropoffs(&definition(), &scenario_rows());
        assert_eq!(dropoffs[0].drop_off_rate, 0.0);
        assert_eq!(dropoffs[1].drop_off_rate, 60.0);
        assert_eq!(dropoffs[2].drop_off_rate, 75.0);
    }

    #[test]
    fn biggest_bottleneck_is_the_late_step() {
        let bottlenecks = build_bottlenecks(&definition(), &scenario_rows());
        assert_eq!(bottlenecks[0].step_order, 2);
        assert_eq!(bottlenecks[0].severity, Severity::Critical);

        let summary = build_summary(&scenario_rows(), &bottlenecks);
        assert_eq!(summary.biggest_bottleneck_step, Some(2));
        assert_eq!(summary.total_drop_offs, 900);
        assert!(summary.optimization_potential > 0.0);
        assert!(summary.optimization_potential <= 100.0);
    }

    #[test]
    fn exit_velocity_classes() {
        assert_eq!(ExitVelocity::classify(5.0), ExitVelocity::Immediate);
        assert_eq!(ExitVelocity::classify(120.0), ExitVelocity::Quick);
        assert_eq!(ExitVelocity::classify(900.0), ExitVelocity::Delayed);
        assert_eq!(ExitVelocity::classify(7200.0), ExitVelocity::Hesitant);
    }

    #[test]
    fn exit_paths_split_bounces() {
        let paths = build_exit_paths(&definition(), &scenario_rows());
        assert_eq!(paths.len(), 2);
        assert_eq!(paths[0].immediate_bounces, 400);
        assert_eq!(paths[0].delayed_exits, 200);
    }

    #[test]
    fn empty_funnel_has_no_bottlenecks() {
        let rows = vec![row(0, 0, 0, 0.0, 0), row(1, 0, 0, 0.0, 0)];
        let bottlenecks = build_bottlenecks(&definition(), &rows);
        assert!(bottlenecks.is_empty());

        let summary = build_summary(&rows, &bottlenecks);
        assert_eq!(summary.total_drop_offs, 0);
        assert_eq!(summary.biggest_bottleneck_step, None);
        assert_eq!(summary.optimization_potential, 0.0);
    }

    #[test]
    fn recommendations_follow_velocity() {
        let dropoffs = build_step_dropoffs(&definition(), &scenario_rows());
        let bottlenecks = build_bottlenecks(&definition(), &scenario_rows());
        let recs = build_recommendations(&dropoffs, &bottlenecks);
        assert!(!recs.is_empty());
        assert!(recs.len() <= 3);
    }
}
