//! Funnel comparison and A/B testing: pairwise significance with
//! multiple-comparison correction, an overall chi-square, rankings, and an
//! optional winner declaration.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use funnelcast_common::cache::CacheClass;
use funnelcast_common::error::AppError;
use funnelcast_common::ids::{IdKind, format_id};
use funnelcast_common::tenant::TenantContext;

use crate::analytics::conversion::DateRangeOut;
use crate::analytics::engine::{
    Analyzed, AnalyticsEngine, MAX_EXTENDED_WINDOW_DAYS, RequestedRange, parse_range,
};
use crate::analytics::stats;
use crate::analytics::timing::velocity_score;
use crate::repository::{DateRange, steps};

// ── Request ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct ComparisonRequest {
    #[serde(flatten)]
    pub range: RequestedRange,
    #[serde(default)]
    pub baseline_funnel_id: Option<String>,
    #[serde(default)]
    pub ab_test_configuration: Option<AbTestConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbTestConfig {
    pub name: String,
    #[serde(default)]
    pub hypothesis: Option<String>,
    pub confidence_level: u8,
    pub minimum_sample_size: i64,
    pub expected_effect_size: f64,
}

impl AbTestConfig {
    pub fn validate(&self) -> Result<(), AppError> {
        if ![90, 95, 99].contains(&self.confidence_level) {
            return Err(AppError::Validation(
                "confidence_level must be one of 90, 95, 99".to_string(),
            ));
        }
        if !(100..=100_000).contains(&self.minimum_sample_size) {
            return Err(AppError::Validation(
                "minimum_sample_size must be between 100 and 100000".to_string(),
            ));
        }
        if !(self.expected_effect_size > 0.0 && self.expected_effect_size <= 1.0) {
            return Err(AppError::Validation(
                "expected_effect_size must be in (0, 1]".to_string(),
            ));
        }
        Ok(())
    }

    pub fn alpha(&self) -> f64 {
        match self.confidence_level {
            99 => 0.01,
            95 => 0.05,
            _ => 0.10,
        }
    }
}

// ── Response ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonAnalysis {
    pub comparison_id: String,
    pub date_range: DateRangeOut,
    pub funnels: Vec<FunnelComparison>,
    pub pairwise: Vec<PairwiseResult>,
    pub overall_chi_square: ChiSquareResult,
    pub rankings: Vec<Ranking>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ab_test: Option<AbTestResult>,
    pub insights: Vec<String>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunnelComparison {
    pub funnel_id: String,
    pub funnel_name: String,
    pub entries: i64,
    pub conversions: i64,
    pub conversion_rate: f64,
    pub avg_seconds_to_convert: f64,
    pub median_seconds_to_convert: f64,
    pub velocity_score: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairwiseResult {
    pub funnel_a: String,
    pub funnel_b: String,
    pub rate_difference: f64,
    pub z_score: f64,
    pub p_value: f64,
    pub adjusted_p_value: f64,
    pub confidence_interval_95: DifferenceInterval,
    pub effect_size_cohens_h: f64,
    pub is_significant: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DifferenceInterval {
    pub lower: f64,
    pub upper: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChiSquareResult {
    pub statistic: f64,
    pub degrees_of_freedom: usize,
    pub p_value: f64,
    pub is_significant: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ranking {
    pub rank: usize,
    pub funnel_id: String,
    pub conversion_rate: f64,
    pub efficiency_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbTestResult {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hypothesis: Option<String>,
    pub outcome: AbTestOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lift_percent: Option<f64>,
    pub p_value: f64,
    pub total_sample: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbTestOutcome {
    WinnerDeclared,
    ContinueTesting,
}

// ── Engine entry point ──────────────────────────────────────────────

impl AnalyticsEngine {
    pub fn compare(
        &self,
        ctx: TenantContext,
        funnel_ids: &[i64],
        request: &ComparisonRequest,
    ) -> Result<Analyzed<ComparisonAnalysis>, AppError> {
        if funnel_ids.len() > 5 {
            return Err(AppError::PayloadTooLarge(
                "comparison supports at most 5 funnels".to_string(),
            ));
        }
        if funnel_ids.len() < 2 {
            return Err(AppError::Validation(
                "comparison requires at least 2 funnels".to_string(),
            ));
        }
        if let Some(config) = &request.ab_test_configuration {
            config.validate()?;
        }

        let range = parse_range(&request.range, MAX_EXTENDED_WINDOW_DAYS)?;
        let comparison_id = comparison_id(funnel_ids, &request.range);

        let key = funnelcast_common::cache::AnalyticsCache::workspace_scoped_key(
            "funnel:comparison",
            ctx.tenant_id,
            ctx.workspace_id,
            &[("comparisonId", comparison_id.clone())],
        );

        self.run_cached(&key, CacheClass::Comparison, || {
            self.compute_comparison(ctx, funnel_ids, request, range, comparison_id.clone())
        })
    }

    fn compute_comparison(
        &self,
        ctx: TenantContext,
        funnel_ids: &[i64],
        request: &ComparisonRequest,
        range: DateRange,
        comparison_id: String,
    ) -> Result<ComparisonAnalysis, AppError> {
        let mut funnels = Vec::with_capacity(funnel_ids.len());
        for &funnel_id in funnel_ids {
            let (row, _definition) = self.resolve_funnel(ctx, funnel_id)?;
            let totals = steps::funnel_totals(self.pool(), ctx, funnel_id, range)?;

            funnels.push(FunnelComparison {
                funnel_id: format_id(IdKind::Funnel, funnel_id),
                funnel_name: row.name,
                entries: totals.entries,
                conversions: totals.conversions,
                conversion_rate: if totals.entries > 0 {
                    stats::round2(totals.conversions as f64 / totals.entries as f64 * 100.0)
                } else {
                    0.0
                },
                avg_seconds_to_convert: stats::round2(totals.avg_seconds_to_convert),
                median_seconds_to_convert: stats::round2(totals.median_seconds_to_convert),
                velocity_score: velocity_score(totals.avg_seconds_to_convert),
            });
        }

        let pairwise = build_pairwise(&funnels);
        let overall_chi_square = build_chi_square(&funnels);
        let rankings = build_rankings(&funnels);

        let baseline_external = request.baseline_funnel_id.clone();
        let ab_test = request
            .ab_test_configuration
            .as_ref()
            .map(|config| build_ab_test(config, &funnels, &pairwise, baseline_external.as_deref()));

        let insights = build_insights(&funnels, &pairwise, &overall_chi_square);
        let recommendations = build_recommendations(&rankings, &funnels);

        Ok(ComparisonAnalysis {
            comparison_id,
            date_range: range.into(),
            funnels,
            pairwise,
            overall_chi_square,
            rankings,
            ab_test,
            insights,
            recommendations,
        })
    }
}

/// Deterministic id over the sorted funnel set and the window.
pub(crate) fn comparison_id(funnel_ids: &[i64], range: &RequestedRange) -> String {
    let mut sorted = funnel_ids.to_vec();
    sorted.sort_unstable();

    let mut hasher = Sha256::new();
    for id in &sorted {
        hasher.update(id.to_le_bytes());
    }
    hasher.update(range.start_date.as_bytes());
    hasher.update(range.end_date.as_bytes());

    let digest = hasher.finalize();
    format!("cmp_{}", &hex::encode(digest)[..16])
}

// ── Pure builders ───────────────────────────────────────────────────

pub(crate) fn build_pairwise(funnels: &[FunnelComparison]) -> Vec<PairwiseResult> {
    let mut raw: Vec<(usize, usize, stats::TwoProportionTest)> = Vec::new();

    for i in 0..funnels.len() {
        for j in (i + 1)..funnels.len() {
            if let Some(test) = stats::two_proportion_test(
                funnels[i].conversions,
                funnels[i].entries,
                funnels[j].conversions,
                funnels[j].entries,
            ) {
                raw.push((i, j, test));
            }
        }
    }

    let p_values: Vec<f64> = raw.iter().map(|(_, _, t)| t.p_value).collect();
    let adjusted = stats::benjamini_hochberg(&p_values);

    raw.into_iter()
        .zip(adjusted)
        .map(|((i, j, test), adjusted_p)| {
            let a = &funnels[i];
            let b = &funnels[j];
            let p1 = a.conversion_rate / 100.0;
            let p2 = b.conversion_rate / 100.0;
            let difference = p1 - p2;
            let half_width = stats::difference_ci_95(p1, a.entries, p2, b.entries);

            PairwiseResult {
                funnel_a: a.funnel_id.clone(),
                funnel_b: b.funnel_id.clone(),
                rate_difference: stats::round2(difference * 100.0),
                z_score: stats::round2(test.z),
                p_value: test.p_value,
                adjusted_p_value: adjusted_p,
                confidence_interval_95: DifferenceInterval {
                    lower: stats::round2((difference - half_width) * 100.0),
                    upper: stats::round2((difference + half_width) * 100.0),
                },
                effect_size_cohens_h: stats::round2(stats::cohens_h(p1, p2)),
                is_significant: adjusted_p < 0.05,
            }
        })
        .collect()
}

/// Chi-square over the k×2 conversion table, df = k − 1.
pub(crate) fn build_chi_square(funnels: &[FunnelComparison]) -> ChiSquareResult {
    let total_entries: i64 = funnels.iter().map(|f| f.entries).sum();
    let total_conversions: i64 = funnels.iter().map(|f| f.conversions).sum();
    let degrees_of_freedom = funnels.len().saturating_sub(1);

    if total_entries == 0 || total_conversions == 0 || total_conversions == total_entries {
        return ChiSquareResult {
            statistic: 0.0,
            degrees_of_freedom,
            p_value: 1.0,
            is_significant: false,
        };
    }

    let overall_rate = total_conversions as f64 / total_entries as f64;
    let mut statistic = 0.0;
    for funnel in funnels {
        if funnel.entries == 0 {
            continue;
        }
        let expected_conv = funnel.entries as f64 * overall_rate;
        let expected_non = funnel.entries as f64 * (1.0 - overall_rate);
        let observed_conv = funnel.conversions as f64;
        let observed_non = (funnel.entries - funnel.conversions) as f64;

        statistic += (observed_conv - expected_conv).powi(2) / expected_conv;
        statistic += (observed_non - expected_non).powi(2) / expected_non;
    }

    let p_value = stats::chi_square_survival(statistic, degrees_of_freedom.max(1));

    ChiSquareResult {
        statistic: stats::round2(statistic),
        degrees_of_freedom,
        p_value,
        is_significant: p_value < 0.05,
    }
}

pub(crate) fn build_rankings(funnels: &[FunnelComparison]) -> Vec<Ranking> {
    let mut indexed: Vec<&FunnelComparison> = funnels.iter().collect();
    indexed.sort_by(|a, b| b.conversion_rate.total_cmp(&a.conversion_rate));

    indexed
        .into_iter()
        .enumerate()
        .map(|(i, funnel)| Ranking {
            rank: i + 1,
            funnel_id: funnel.funnel_id.clone(),
            conversion_rate: funnel.conversion_rate,
            // Conversion weighted by speed: a fast funnel at the same rate
            // ranks as more efficient.
            efficiency_score: stats::round2(
                funnel.conversion_rate * funnel.velocity_score as f64 / 100.0,
            ),
        })
        .collect()
}

pub(crate) fn build_ab_test(
    config: &AbTestConfig,
    funnels: &[FunnelComparison],
    pairwise: &[PairwiseResult],
    baseline_external: Option<&str>,
) -> AbTestResult {
    let total_sample: i64 = funnels.iter().map(|f| f.entries).sum();

    let best = funnels
        .iter()
        .max_by(|a, b| a.conversion_rate.total_cmp(&b.conversion_rate));
    let Some(best) = best else {
        return AbTestResult {
            name: config.name.clone(),
            hypothesis: config.hypothesis.clone(),
            outcome: AbTestOutcome::ContinueTesting,
            winner: None,
            lift_percent: None,
            p_value: 1.0,
            total_sample,
        };
    };

    // Reference: the configured baseline, or the best contender otherwise.
    let reference = funnels
        .iter()
        .filter(|f| f.funnel_id != best.funnel_id)
        .filter(|f| baseline_external.is_none_or(|b| f.funnel_id == b))
        .max_by(|a, b| a.conversion_rate.total_cmp(&b.conversion_rate))
        .or_else(|| funnels.iter().find(|f| f.funnel_id != best.funnel_id));

    let p_value = reference
        .and_then(|reference| {
            pairwise
                .iter()
                .find(|p| {
                    (p.funnel_a == best.funnel_id && p.funnel_b == reference.funnel_id)
                        || (p.funnel_b == best.funnel_id && p.funnel_a == reference.funnel_id)
                })
                .map(|p| p.p_value)
        })
        .unwrap_or(1.0);

    let lift_percent = reference.and_then(|reference| {
        if reference.conversion_rate > 0.0 {
            Some(stats::round2(
                (best.conversion_rate - reference.conversion_rate) / reference.conversion_rate
                    * 100.0,
            ))
        } else {
            None
        }
    });

    if p_value < config.alpha() && total_sample >= config.minimum_sample_size {
        AbTestResult {
            name: config.name.clone(),
            hypothesis: config.hypothesis.clone(),
            outcome: AbTestOutcome::WinnerDeclared,
            winner: Some(best.funnel_id.clone()),
            lift_percent,
            p_value,
            total_sample,
        }
    } else {
        AbTestResult {
            name: config.name.clone(),
            hypothesis: config.hypothesis.clone(),
            outcome: AbTestOutcome::ContinueTesting,
            winner: None,
            lift_percent,
            p_value,
            total_sample,
        }
    }
}

fn build_insights(
    funnels: &[FunnelComparison],
    pairwise: &[PairwiseResult],
    chi: &ChiSquareResult,
) -> Vec<String> {
    let mut insights = Vec::new();

    if let (Some(best), Some(worst)) = (
        funnels.iter().max_by(|a, b| a.conversion_rate.total_cmp(&b.conversion_rate)),
        funnels.iter().min_by(|a, b| a.conversion_rate.total_cmp(&b.conversion_rate)),
    ) && best.funnel_id != worst.funnel_id
    {
        insights.push(format!(
            "`{}` leads at {:.1}% conversion; `{}` trails at {:.1}%",
            best.funnel_name, best.conversion_rate, worst.funnel_name, worst.conversion_rate
        ));
    }

    let significant = pairwise.iter().filter(|p| p.is_significant).count();
    if significant > 0 {
        insights.push(format!(
            "{significant} of {} pairwise differences remain significant after correction",
            pairwise.len()
        ));
    }

    if chi.is_significant {
        insights.push("Overall funnel performance differs beyond chance".to_string());
    } else {
        insights.push("No overall difference beyond chance was detected".to_string());
    }

    insights
}

fn build_recommendations(rankings: &[Ranking], funnels: &[FunnelComparison]) -> Vec<String> {
    let mut recommendations = Vec::new();

    if let Some(top) = rankings.first() {
        recommendations.push(format!(
            "Adopt the step structure of {} as the reference variant",
            top.funnel_id
        ));
    }

    if let Some(slowest) = funnels.iter().max_by(|a, b| {
        a.avg_seconds_to_convert.total_cmp(&b.avg_seconds_to_convert)
    }) && slowest.avg_seconds_to_convert > 0.0
    {
        recommendations.push(format!(
            "{} converts slowest ({:.0} minutes on average); review its longest steps",
            slowest.funnel_id,
            slowest.avg_seconds_to_convert / 60.0
        ));
    }

    recommendations
}

#[cfg(test)]
mod tests {
    use super::*;

    fn funnel(id: i64, name: &str, entries: i64, conversions: i64) -> FunnelComparison {
        FunnelComparison {
            funnel_id: format_id(IdKind::Funnel, id),
            funnel_name: name.to_string(),
            entries,
            conversions,
            conversion_rate: stats::round2(conversions as f64 / entries as f64 * 100.0),
            avg_seconds_to_convert: 600.0,
            median_seconds_to_convert: 500.0,
            velocity_score: 85,
        }
    }

    // A/B scenario: 2000/100 (5%) vs 2000/140 (7%) declares the 7% variant
    // the winner with ~40% lift.
    #[test]
    fn ab_test_declares_winner() {
        let funnels = vec![funnel(1, "A", 2000, 100), funnel(2, "B", 2000, 140)];
        let pairwise = build_pairwise(&funnels);

        assert_eq!(pairwise.len(), 1);
        assert!((pairwise[0].z_score.abs() - 2.66).abs() < 0.05);
        assert!((pairwise[0].p_value - 0.008).abs() < 0.002);

        let config = AbTestConfig {
            name: "checkout-test".to_string(),
            hypothesis: None,
            confidence_level: 95,
            minimum_sample_size: 1000,
            expected_effect_size: 0.2,
        };
        let result = build_ab_test(&config, &funnels, &pairwise, None);
        assert_eq!(result.outcome, AbTestOutcome::WinnerDeclared);
        assert_eq!(result.winner.as_deref(), Some("fn_2"));
        assert_eq!(result.lift_percent, Some(40.0));
    }

    #[test]
    fn ab_test_continues_on_insufficient_sample() {
        let funnels = vec![funnel(1, "A", 2000, 100), funnel(2, "B", 2000, 140)];
        let pairwise = build_pairwise(&funnels);
        let config = AbTestConfig {
            name: "t".to_string(),
            hypothesis: None,
            confidence_level: 95,
            minimum_sample_size: 10_000,
            expected_effect_size: 0.2,
        };
        let result = build_ab_test(&config, &funnels, &pairwise, None);
        assert_eq!(result.outcome, AbTestOutcome::ContinueTesting);
        assert!(result.winner.is_none());
    }

    #[test]
    fn pairwise_ci_uses_unpooled_se() {
        let funnels = vec![funnel(1, "A", 2000, 100), funnel(2, "B", 2000, 140)];
        let pairwise = build_pairwise(&funnels);
        let ci = &pairwise[0].confidence_interval_95;
        // Difference is -2pp; the interval straddles it symmetrically.
        assert!(ci.lower < -2.0 && -2.0 < ci.upper);
        assert!(pairwise[0].effect_size_cohens_h < 0.0);
    }

    #[test]
    fn chi_square_detects_heterogeneity() {
        let same = vec![funnel(1, "A", 1000, 50), funnel(2, "B", 1000, 52)];
        let result = build_chi_square(&same);
        assert!(!result.is_significant);
        assert_eq!(result.degrees_of_freedom, 1);

        let different = vec![
            funnel(1, "A", 1000, 30),
            funnel(2, "B", 1000, 80),
            funnel(3, "C", 1000, 120),
        ];
        let result = build_chi_square(&different);
        assert_eq!(result.degrees_of_freedom, 2);
        assert!(result.is_significant);
    }

    #[test]
    fn rankings_order_by_rate() {
        let funnels = vec![
            funnel(1, "A", 1000, 50),
            funnel(2, "B", 1000, 90),
            funnel(3, "C", 1000, 70),
        ];
        let rankings = build_rankings(&funnels);
        assert_eq!(rankings[0].funnel_id, "fn_2");
        assert_eq!(rankings[1].funnel_id, "fn_3");
        assert_eq!(rankings[2].funnel_id, "fn_1");
    }

    #[test]
    fn comparison_id_is_deterministic_and_order_independent() {
        let range = RequestedRange {
            start_date: "2025-03-01".to_string(),
            end_date: "2025-03-31".to_string(),
        };
        let a = comparison_id(&[1, 2, 3], &range);
        let b = comparison_id(&[3, 1, 2], &range);
        assert_eq!(a, b);
        assert!(a.starts_with("cmp_"));

        let other = comparison_id(&[1, 2, 4], &range);
        assert_ne!(a, other);
    }

    #[test]
    fn benjamini_hochberg_is_applied() {
        let funnels = vec![
            funnel(1, "A", 2000, 100),
            funnel(2, "B", 2000, 140),
            funnel(3, "C", 2000, 104),
        ];
        let pairwise = build_pairwise(&funnels);
        assert_eq!(pairwise.len(), 3);
        for pair in &pairwise {
            assert!(pair.adjusted_p_value >= pair.p_value);
        }
    }
}
