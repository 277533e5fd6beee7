//! Path analysis: the routes users actually take, ranked by volume, scored
//! for efficiency, and compared pairwise.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use funnelcast_common::cache::CacheClass;
use funnelcast_common::error::AppError;
use funnelcast_common::ids::{IdKind, format_id};
use funnelcast_common::tenant::TenantContext;

use crate::analytics::conversion::DateRangeOut;
use crate::analytics::engine::{Analyzed, AnalyticsEngine, MAX_WINDOW_DAYS, RequestedRange, parse_range};
use crate::analytics::stats;
use crate::analytics::timing::velocity_score;
use crate::repository::journeys::JourneyEventRow;
use crate::repository::{DateRange, journeys};

// ── Request ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct PathRequest {
    #[serde(flatten)]
    pub range: RequestedRange,
    #[serde(default = "default_max_path_length")]
    pub max_path_length: usize,
    #[serde(default = "default_min_path_volume")]
    pub min_path_volume: usize,
}

fn default_max_path_length() -> usize {
    20
}

fn default_min_path_volume() -> usize {
    10
}

// ── Response ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathAnalysis {
    pub funnel_id: String,
    pub funnel_name: String,
    pub date_range: DateRangeOut,
    pub total_journeys: usize,
    pub paths: Vec<PathMetrics>,
    pub alternative_paths: Vec<AlternativePath>,
    pub branching: BranchingAnalysis,
    pub comparison_matrix: Vec<PathComparison>,
    pub optimization_opportunities: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathMetrics {
    pub rank: usize,
    pub classification: PathClass,
    pub signature: Vec<String>,
    pub users: usize,
    pub conversions: usize,
    pub conversion_rate: f64,
    pub avg_completion_seconds: f64,
    pub median_completion_seconds: f64,
    pub dropout_rate: f64,
    pub abandonment_points: Vec<AbandonmentPoint>,
    pub velocity_score: u8,
    pub efficiency_score: u8,
    pub success_indicators: Vec<SuccessIndicator>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathClass {
    Primary,
    Alternative,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbandonmentPoint {
    pub identifier: String,
    pub users: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuccessIndicator {
    HighConversion,
    FastCompletion,
    LowDropout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlternativePath {
    pub signature: Vec<String>,
    pub users: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge_point: Option<String>,
    pub skipped_steps: Vec<String>,
    pub extra_steps: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchingAnalysis {
    pub decision_points: Vec<String>,
    pub merge_points: Vec<String>,
    pub flow: Vec<FlowEdge>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowEdge {
    pub from: String,
    pub to: String,
    pub users: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathComparison {
    pub path_a: usize,
    pub path_b: usize,
    pub rate_difference: f64,
    pub z_score: f64,
    pub p_value: f64,
    pub is_significant: bool,
}

// ── Journey assembly ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub(crate) struct Journey {
    pub signature: Vec<String>,
    pub converted: bool,
    pub duration_seconds: f64,
}

/// One signature element per event: pages keyed by URL, everything else by
/// event name.
fn signature_element(row: &JourneyEventRow) -> String {
    match &row.page_url {
        Some(url) if !url.is_empty() => format!("page:{url}"),
        _ => format!("event:{}", row.event_name),
    }
}

pub(crate) fn assemble_journeys(rows: &[JourneyEventRow], max_path_length: usize) -> Vec<Journey> {
    let mut journeys: Vec<Journey> = Vec::new();
    let mut current_user: Option<&str> = None;
    let mut elements: Vec<String> = Vec::new();
    let mut first_at = None;
    let mut last_at = None;
    let mut converted = false;

    let mut flush = |elements: &mut Vec<String>,
                     first_at: &mut Option<chrono::DateTime<chrono::Utc>>,
                     last_at: &mut Option<chrono::DateTime<chrono::Utc>>,
                     converted: bool,
                     journeys: &mut Vec<Journey>| {
        if !elements.is_empty() {
            let duration = match (&*first_at, &*last_at) {
                (Some(first), Some(last)) => (*last - *first).num_seconds().max(0) as f64,
                _ => 0.0,
            };
            journeys.push(Journey {
                signature: std::mem::take(elements),
                converted,
                duration_seconds: duration,
            });
        }
        *first_at = None;
        *last_at = None;
    };

    for row in rows {
        if current_user != Some(row.anonymous_id.as_str()) {
            flush(&mut elements, &mut first_at, &mut last_at, converted, &mut journeys);
            current_user = Some(row.anonymous_id.as_str());
            converted = row.user_status == "completed";
        }

        if elements.len() < max_path_length {
            elements.push(signature_element(row));
            if first_at.is_none() {
                first_at = Some(row.occurred_at);
            }
            last_at = Some(row.occurred_at);
        }
    }
    flush(&mut elements, &mut first_at, &mut last_at, converted, &mut journeys);

    journeys
}

// ── Engine entry point ──────────────────────────────────────────────

impl AnalyticsEngine {
    pub fn paths(
        &self,
        ctx: TenantContext,
        funnel_id: i64,
        request: &PathRequest,
    ) -> Result<Analyzed<PathAnalysis>, AppError> {
        if request.min_path_volume > 100 {
            return Err(AppError::Validation(
                "min_path_volume must be at most 100".to_string(),
            ));
        }

        let key = Self::funnel_key(
            "funnel:paths",
            ctx,
            funnel_id,
            &[
                ("end", request.range.end_date.clone()),
                ("maxLen", request.max_path_length.to_string()),
                ("minVolume", request.min_path_volume.to_string()),
                ("start", request.range.start_date.clone()),
            ],
        );

        let range = parse_range(&request.range, MAX_WINDOW_DAYS)?;

        self.run_cached(&key, CacheClass::PathAnalysis, || {
            self.compute_paths(ctx, funnel_id, request, range)
        })
    }

    fn compute_paths(
        &self,
        ctx: TenantContext,
        funnel_id: i64,
        request: &PathRequest,
        range: DateRange,
    ) -> Result<PathAnalysis, AppError> {
        let (funnel, _definition) = self.resolve_funnel(ctx, funnel_id)?;

        let rows = journeys::user_journey_events(self.pool(), ctx, funnel_id, range)?;
        let all_journeys = assemble_journeys(&rows, request.max_path_length.max(1));

        let paths = build_path_metrics(&all_journeys, request.min_path_volume.max(1));
        let alternative_paths = build_alternative_paths(&paths);
        let branching = build_branching(&all_journeys);
        let comparison_matrix = build_comparison_matrix(&paths);
        let optimization_opportunities = build_opportunities(&paths);

        Ok(PathAnalysis {
            funnel_id: format_id(IdKind::Funnel, funnel_id),
            funnel_name: funnel.name,
            date_range: range.into(),
            total_journeys: all_journeys.len(),
            paths,
            alternative_paths,
            branching,
            comparison_matrix,
            optimization_opportunities,
        })
    }
}

// ── Pure builders ───────────────────────────────────────────────────

pub(crate) fn build_path_metrics(journeys: &[Journey], min_path_volume: usize) -> Vec<PathMetrics> {
    let mut groups: BTreeMap<Vec<String>, Vec<&Journey>> = BTreeMap::new();
    for journey in journeys {
        groups.entry(journey.signature.clone()).or_default().push(journey);
    }

    let mut grouped: Vec<(Vec<String>, Vec<&Journey>)> = groups
        .into_iter()
        .filter(|(_, members)| members.len() >= min_path_volume)
        .collect();
    grouped.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then(a.0.cmp(&b.0)));

    grouped
        .into_iter()
        .enumerate()
        .map(|(rank, (signature, members))| {
            let users = members.len();
            let conversions = members.iter().filter(|j| j.converted).count();
            let conversion_rate = stats::round2(conversions as f64 / users as f64 * 100.0);
            let dropout_rate = stats::round2(100.0 - conversion_rate);

            let converted_durations: Vec<f64> = members
                .iter()
                .filter(|j| j.converted)
                .map(|j| j.duration_seconds)
                .collect();
            let avg_completion = stats::mean(&converted_durations);
            let median_completion = stats::median(&converted_durations);

            // Non-converters abandon at their last visited element.
            let mut abandonments: BTreeMap<String, usize> = BTreeMap::new();
            for journey in members.iter().filter(|j| !j.converted) {
                if let Some(last) = journey.signature.last() {
                    *abandonments.entry(last.clone()).or_default() += 1;
                }
            }
            let mut abandonment_points: Vec<AbandonmentPoint> = abandonments
                .into_iter()
                .map(|(identifier, users)| AbandonmentPoint { identifier, users })
                .collect();
            abandonment_points.sort_by(|a, b| b.users.cmp(&a.users));

            let mut success_indicators = Vec::new();
            if conversion_rate > 15.0 {
                success_indicators.push(SuccessIndicator::HighConversion);
            }
            if avg_completion > 0.0 && avg_completion < 300.0 {
                success_indicators.push(SuccessIndicator::FastCompletion);
            }
            if dropout_rate < 20.0 {
                success_indicators.push(SuccessIndicator::LowDropout);
            }

            PathMetrics {
                rank: rank + 1,
                classification: if rank == 0 { PathClass::Primary } else { PathClass::Alternative },
                efficiency_score: efficiency_score(conversion_rate, avg_completion, signature.len()),
                signature,
                users,
                conversions,
                conversion_rate,
                avg_completion_seconds: stats::round2(avg_completion),
                median_completion_seconds: stats::round2(median_completion),
                dropout_rate,
                abandonment_points,
                velocity_score: velocity_score(avg_completion),
                success_indicators,
            }
        })
        .collect()
}

/// Weighted blend of conversion, speed and simplicity, scaled to [0, 100].
pub(crate) fn efficiency_score(conversion_rate: f64, avg_seconds: f64, steps: usize) -> u8 {
    let conversion_component = (conversion_rate / 100.0).clamp(0.0, 1.0);
    let speed_component = (1.0 - avg_seconds / 3600.0).max(0.0);
    let simplicity_component = (1.0 - steps as f64 / 20.0).max(0.0);

    let score = 0.4 * conversion_component + 0.3 * speed_component + 0.3 * simplicity_component;
    (score * 100.0).round().clamp(0.0, 100.0) as u8
}

pub(crate) fn build_alternative_paths(paths: &[PathMetrics]) -> Vec<AlternativePath> {
    let Some(primary) = paths.first() else {
        return Vec::new();
    };

    paths
        .iter()
        .filter(|p| p.classification == PathClass::Alternative)
        .map(|path| {
            let merge_point = path
                .signature
                .iter()
                .find(|element| primary.signature.contains(element))
                .cloned();

            let skipped_steps = primary
                .signature
                .iter()
                .filter(|element| !path.signature.contains(element))
                .cloned()
                .collect();

            let extra_steps = path
                .signature
                .iter()
                .filter(|element| !primary.signature.contains(element))
                .cloned()
                .collect();

            AlternativePath {
                signature: path.signature.clone(),
                users: path.users,
                merge_point,
                skipped_steps,
                extra_steps,
            }
        })
        .collect()
}

pub(crate) fn build_branching(journeys: &[Journey]) -> BranchingAnalysis {
    let mut edges: BTreeMap<(String, String), usize> = BTreeMap::new();
    for journey in journeys {
        for pair in journey.signature.windows(2) {
            *edges.entry((pair[0].clone(), pair[1].clone())).or_default() += 1;
        }
    }

    let mut successors: BTreeMap<&str, usize> = BTreeMap::new();
    let mut predecessors: BTreeMap<&str, usize> = BTreeMap::new();
    for (from, to) in edges.keys() {
        *successors.entry(from.as_str()).or_default() += 1;
        *predecessors.entry(to.as_str()).or_default() += 1;
    }

    let decision_points = successors
        .iter()
        .filter(|(_, n)| **n > 1)
        .map(|(element, _)| (*element).to_string())
        .collect();
    let merge_points = predecessors
        .iter()
        .filter(|(_, n)| **n > 1)
        .map(|(element, _)| (*element).to_string())
        .collect();

    let mut flow: Vec<FlowEdge> = edges
        .into_iter()
        .map(|((from, to), users)| FlowEdge { from, to, users })
        .collect();
    flow.sort_by(|a, b| b.users.cmp(&a.users));

    BranchingAnalysis { decision_points, merge_points, flow }
}

pub(crate) fn build_comparison_matrix(paths: &[PathMetrics]) -> Vec<PathComparison> {
    let mut matrix = Vec::new();

    for i in 0..paths.len() {
        for j in (i + 1)..paths.len() {
            let a = &paths[i];
            let b = &paths[j];
            let Some(test) = stats::two_proportion_test(
                a.conversions as i64,
                a.users as i64,
                b.conversions as i64,
                b.users as i64,
            ) else {
                continue;
            };

            matrix.push(PathComparison {
                path_a: a.rank,
                path_b: b.rank,
                rate_difference: stats::round2(a.conversion_rate - b.conversion_rate),
                z_score: stats::round2(test.z),
                p_value: test.p_value,
                is_significant: test.p_value < 0.05,
            });
        }
    }

    matrix
}

fn build_opportunities(paths: &[PathMetrics]) -> Vec<String> {
    let mut opportunities = Vec::new();
    let Some(primary) = paths.first() else {
        return opportunities;
    };

    if let Some(better) = paths
        .iter()
        .skip(1)
        .find(|p| p.conversion_rate > primary.conversion_rate)
    {
        opportunities.push(format!(
            "An alternative path converts at {:.1}% against the primary's {:.1}%; consider steering users toward it",
            better.conversion_rate, primary.conversion_rate
        ));
    }

    if let Some(shortest_converter) = paths
        .iter()
        .filter(|p| p.conversions > 0)
        .min_by_key(|p| p.signature.len())
        && shortest_converter.signature.len() < primary.signature.len()
    {
        opportunities.push(format!(
            "Users convert through as few as {} steps; the primary path takes {}",
            shortest_converter.signature.len(),
            primary.signature.len()
        ));
    }

    for path in paths.iter().filter(|p| p.dropout_rate > 80.0) {
        opportunities.push(format!(
            "Path #{} loses {:.0}% of its users; its top abandonment point deserves review",
            path.rank, path.dropout_rate
        ));
    }

    opportunities
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn journey(signature: &[&str], converted: bool, duration: f64) -> Journey {
        Journey {
            signature: signature.iter().map(|s| s.to_string()).collect(),
            converted,
            duration_seconds: duration,
        }
    }

    fn bulk(signature: &[&str], converted: usize, total: usize, duration: f64) -> Vec<Journey> {
        (0..total)
            .map(|i| journey(signature, i < converted, duration))
            .collect()
    }

    #[test]
    fn assembles_journeys_per_user_with_cap() {
        let base = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
        let row = |user: &str, name: &str, minutes: i64, status: &str| JourneyEventRow {
            anonymous_id: user.to_string(),
            event_name: name.to_string(),
            occurred_at: base + chrono::Duration::minutes(minutes),
            page_url: None,
            user_status: status.to_string(),
        };

        let rows = vec![
            row("a_u1", "begin", 0, "completed"),
            row("a_u1", "browse", 5, "completed"),
            row("a_u1", "purchase", 10, "completed"),
            row("a_u2", "begin", 0, "active"),
            row("a_u2", "browse", 2, "active"),
        ];

        let journeys = assemble_journeys(&rows, 2);
        assert_eq!(journeys.len(), 2);
        // Length cap trims the first user's third event.
        assert_eq!(journeys[0].signature, vec!["event:begin", "event:browse"]);
        assert!(journeys[0].converted);
        assert_eq!(journeys[0].duration_seconds, 300.0);
        assert!(!journeys[1].converted);
    }

    #[test]
    fn groups_below_volume_threshold_are_dropped() {
        let mut journeys = bulk(&["event:a", "event:b"], 5, 12, 60.0);
        journeys.extend(bulk(&["event:a", "event:c"], 1, 3, 60.0));

        let paths = build_path_metrics(&journeys, 10);
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].classification, PathClass::Primary);
        assert_eq!(paths[0].users, 12);
    }

    #[test]
    fn primary_is_highest_volume() {
        let mut journeys = bulk(&["event:a", "event:b"], 2, 20, 120.0);
        journeys.extend(bulk(&["event:a", "event:c", "event:b"], 8, 15, 60.0));

        let paths = build_path_metrics(&journeys, 10);
        assert_eq!(paths[0].users, 20);
        assert_eq!(paths[0].classification, PathClass::Primary);
        assert_eq!(paths[1].classification, PathClass::Alternative);
    }

    #[test]
    fn efficiency_score_blend() {
        // Perfect conversion, instant, single step.
        assert_eq!(efficiency_score(100.0, 0.0, 1), 99);
        // Worthless path.
        assert_eq!(efficiency_score(0.0, 7200.0, 40), 0);
        // Mid path: 50% conversion, 30 minutes, 5 steps.
        let mid = efficiency_score(50.0, 1800.0, 5);
        assert!(mid > 40 && mid < 70);
    }

    #[test]
    fn success_indicators_thresholds() {
        let journeys = bulk(&["event:a", "event:b"], 10, 12, 100.0);
        let paths = build_path_metrics(&journeys, 10);
        let indicators = &paths[0].success_indicators;
        assert!(indicators.contains(&SuccessIndicator::HighConversion));
        assert!(indicators.contains(&SuccessIndicator::FastCompletion));
        assert!(indicators.contains(&SuccessIndicator::LowDropout));
    }

    #[test]
    fn alternative_paths_detect_merge_and_extras() {
        let mut journeys = bulk(&["event:a", "event:b", "event:d"], 5, 20, 60.0);
        journeys.extend(bulk(&["event:a", "event:c", "event:d"], 5, 12, 60.0));

        let paths = build_path_metrics(&journeys, 10);
        let alternatives = build_alternative_paths(&paths);
        assert_eq!(alternatives.len(), 1);
        assert_eq!(alternatives[0].merge_point.as_deref(), Some("event:a"));
        assert_eq!(alternatives[0].skipped_steps, vec!["event:b"]);
        assert_eq!(alternatives[0].extra_steps, vec!["event:c"]);
    }

    #[test]
    fn branching_finds_decision_and_merge_points() {
        let mut journeys = bulk(&["event:a", "event:b", "event:d"], 0, 3, 60.0);
        journeys.extend(bulk(&["event:a", "event:c", "event:d"], 0, 3, 60.0));

        let branching = build_branching(&journeys);
        assert_eq!(branching.decision_points, vec!["event:a"]);
        assert_eq!(branching.merge_points, vec!["event:d"]);
        assert_eq!(branching.flow.len(), 4);
    }

    #[test]
    fn comparison_matrix_is_pairwise() {
        let mut journeys = bulk(&["event:a", "event:b"], 40, 200, 60.0);
        journeys.extend(bulk(&["event:a", "event:c"], 10, 200, 60.0));

        let paths = build_path_metrics(&journeys, 10);
        let matrix = build_comparison_matrix(&paths);
        assert_eq!(matrix.len(), 1);
        assert!(matrix[0].is_significant);
        assert!(matrix[0].rate_difference.abs() > 10.0);
    }
}
