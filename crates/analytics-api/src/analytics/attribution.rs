//! Attribution analysis: distributing conversion credit across marketing
//! touchpoints under several models, with cross-model agreement and journey
//! complexity metrics.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use funnelcast_common::cache::CacheClass;
use funnelcast_common::error::AppError;
use funnelcast_common::ids::{IdKind, format_id};
use funnelcast_common::tenant::TenantContext;

use crate::analytics::conversion::DateRangeOut;
use crate::analytics::engine::{
    Analyzed, AnalyticsEngine, MAX_EXTENDED_WINDOW_DAYS, RequestedRange, parse_range,
};
use crate::analytics::stats;
use crate::repository::journeys::TouchpointEventRow;
use crate::repository::{DateRange, journeys};

/// Per-journey touchpoint cap.
pub const MAX_TOUCHPOINTS: usize = 20;

// ── Request ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct AttributionRequest {
    #[serde(flatten)]
    pub range: RequestedRange,
    #[serde(default = "default_models")]
    pub models: Vec<AttributionModel>,
    #[serde(default = "default_lookback_days")]
    pub lookback_days: i32,
    #[serde(default = "default_half_life_days")]
    pub half_life_days: f64,
    #[serde(default)]
    pub position_weights: Option<PositionWeights>,
    #[serde(default)]
    pub custom_weights: Option<Vec<f64>>,
    #[serde(default = "default_top_n")]
    pub top_n: usize,
}

fn default_models() -> Vec<AttributionModel> {
    vec![
        AttributionModel::FirstTouch,
        AttributionModel::LastTouch,
        AttributionModel::Linear,
        AttributionModel::TimeDecay,
        AttributionModel::PositionBased,
    ]
}

fn default_lookback_days() -> i32 {
    90
}

fn default_half_life_days() -> f64 {
    7.0
}

fn default_top_n() -> usize {
    10
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributionModel {
    FirstTouch,
    LastTouch,
    Linear,
    TimeDecay,
    PositionBased,
    Custom,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PositionWeights {
    pub first: f64,
    pub middle: f64,
    pub last: f64,
}

impl Default for PositionWeights {
    fn default() -> Self {
        Self { first: 0.4, middle: 0.2, last: 0.4 }
    }
}

// ── Response ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributionAnalysis {
    pub funnel_id: String,
    pub funnel_name: String,
    pub date_range: DateRangeOut,
    pub lookback_days: i32,
    pub total_conversions: usize,
    pub models: Vec<ModelResult>,
    /// Average pairwise rank agreement between models, in [0, 1].
    pub model_agreement: f64,
    pub journey_complexity: JourneyComplexity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelResult {
    pub model: AttributionModel,
    pub touchpoints: Vec<TouchpointCredit>,
    pub credit_by_position: CreditByPosition,
    pub credit_by_stage: CreditByStage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TouchpointCredit {
    pub touchpoint_id: String,
    pub channel: Channel,
    pub credit: f64,
    pub share_percent: f64,
    pub conversions_touched: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditByPosition {
    pub first: f64,
    pub middle: f64,
    pub last: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditByStage {
    pub early: f64,
    pub mid: f64,
    pub late: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JourneyComplexity {
    pub avg_touchpoints: f64,
    pub avg_duration_days: f64,
    pub multi_channel_percent: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    PaidSearch,
    OrganicSearch,
    Direct,
    Social,
    Referral,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::PaidSearch => "paid_search",
            Channel::OrganicSearch => "organic_search",
            Channel::Direct => "direct",
            Channel::Social => "social",
            Channel::Referral => "referral",
        }
    }
}

// ── Touchpoint journeys ─────────────────────────────────────────────

#[derive(Debug, Clone)]
pub(crate) struct Touchpoint {
    pub id: String,
    pub channel: Channel,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub(crate) struct TouchpointJourney {
    pub touchpoints: Vec<Touchpoint>,
    pub converted_at: DateTime<Utc>,
}

const SEARCH_ENGINES: &[&str] = &["google.", "bing.", "yahoo.", "duckduckgo."];
const SOCIAL_SOURCES: &[&str] = &["facebook", "fb", "instagram", "twitter", "x", "linkedin", "tiktok"];
const PAID_MEDIUMS: &[&str] = &["cpc", "ppc", "paid", "paidsearch", "display"];

pub(crate) fn classify_channel(
    utm_source: Option<&str>,
    utm_medium: Option<&str>,
    referrer: Option<&str>,
) -> Channel {
    let medium = utm_medium.unwrap_or("").to_ascii_lowercase();
    let source = utm_source.unwrap_or("").to_ascii_lowercase();

    if PAID_MEDIUMS.contains(&medium.as_str()) {
        return Channel::PaidSearch;
    }
    if medium == "social" || SOCIAL_SOURCES.contains(&source.as_str()) {
        return Channel::Social;
    }
    if medium == "organic" {
        return Channel::OrganicSearch;
    }

    if let Some(referrer) = referrer {
        let referrer = referrer.to_ascii_lowercase();
        if !referrer.is_empty() {
            if SEARCH_ENGINES.iter().any(|engine| referrer.contains(engine)) {
                return Channel::OrganicSearch;
            }
            return Channel::Referral;
        }
    }

    if !source.is_empty() {
        return Channel::Referral;
    }

    Channel::Direct
}

fn touchpoint_id(channel: Channel, utm_source: Option<&str>, utm_medium: Option<&str>) -> String {
    format!(
        "{}_{}_{}",
        channel.as_str(),
        utm_source.filter(|s| !s.is_empty()).unwrap_or("direct"),
        utm_medium.filter(|m| !m.is_empty()).unwrap_or("none"),
    )
}

pub(crate) fn assemble_touchpoint_journeys(rows: &[TouchpointEventRow]) -> Vec<TouchpointJourney> {
    let mut journeys: Vec<TouchpointJourney> = Vec::new();
    let mut current_user: Option<&str> = None;

    for row in rows {
        if current_user != Some(row.anonymous_id.as_str()) {
            current_user = Some(row.anonymous_id.as_str());
            journeys.push(TouchpointJourney {
                touchpoints: Vec::new(),
                converted_at: row.converted_at,
            });
        }

        let journey = journeys.last_mut().expect("journey pushed above");
        if journey.touchpoints.len() >= MAX_TOUCHPOINTS {
            continue;
        }

        let channel = classify_channel(
            row.utm_source.as_deref(),
            row.utm_medium.as_deref(),
            row.referrer.as_deref(),
        );
        journey.touchpoints.push(Touchpoint {
            id: touchpoint_id(channel, row.utm_source.as_deref(), row.utm_medium.as_deref()),
            channel,
            occurred_at: row.occurred_at,
        });
    }

    journeys.retain(|j| !j.touchpoints.is_empty());
    journeys
}

// ── Credit models ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub(crate) struct ModelConfig {
    pub half_life_days: f64,
    pub position_weights: PositionWeights,
    pub custom_weights: Option<Vec<f64>>,
}

/// Credit per touchpoint for one journey. The returned vector always sums to
/// 1.0 (±1e-6): every journey distributes exactly one conversion's worth of
/// credit, and each position contributes at most once.
pub(crate) fn model_credits(
    model: AttributionModel,
    journey: &TouchpointJourney,
    config: &ModelConfig,
) -> Vec<f64> {
    let k = journey.touchpoints.len();
    if k == 0 {
        return Vec::new();
    }
    if k == 1 {
        return vec![1.0];
    }

    match model {
        AttributionModel::FirstTouch => {
            let mut credits = vec![0.0; k];
            credits[0] = 1.0;
            credits
        }
        AttributionModel::LastTouch => {
            let mut credits = vec![0.0; k];
            credits[k - 1] = 1.0;
            credits
        }
        AttributionModel::Linear => vec![1.0 / k as f64; k],
        AttributionModel::TimeDecay => {
            let half_life = config.half_life_days.max(f64::EPSILON);
            let weights: Vec<f64> = journey
                .touchpoints
                .iter()
                .map(|t| {
                    let age_days =
                        (journey.converted_at - t.occurred_at).num_seconds().max(0) as f64 / 86_400.0;
                    0.5_f64.powf(age_days / half_life)
                })
                .collect();
            normalize(weights)
        }
        AttributionModel::PositionBased => {
            let w = config.position_weights;
            let mut credits = vec![0.0; k];
            if k == 2 {
                credits[0] = w.first;
                credits[1] = w.last;
            } else {
                credits[0] = w.first;
                credits[k - 1] = w.last;
                let middle_each = w.middle / (k - 2) as f64;
                for credit in credits.iter_mut().take(k - 1).skip(1) {
                    *credit = middle_each;
                }
            }
            normalize(credits)
        }
        AttributionModel::Custom => {
            let weights = config.custom_weights.clone().unwrap_or_else(|| vec![1.0 / k as f64; k]);
            let mut credits = vec![0.0; k];
            for (i, credit) in credits.iter_mut().enumerate() {
                *credit = weights.get(i).copied().unwrap_or(0.0);
            }
            normalize(credits)
        }
    }
}

fn normalize(weights: Vec<f64>) -> Vec<f64> {
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        let k = weights.len();
        return vec![1.0 / k as f64; k];
    }
    weights.into_iter().map(|w| w / total).collect()
}

pub(crate) fn validate_custom_weights(weights: &[f64]) -> Result<(), AppError> {
    if weights.is_empty() || weights.len() > MAX_TOUCHPOINTS {
        return Err(AppError::Validation(format!(
            "custom_weights must contain between 1 and {MAX_TOUCHPOINTS} entries"
        )));
    }
    if weights.iter().any(|w| !(0.0..=1.0).contains(w)) {
        return Err(AppError::Validation(
            "custom_weights entries must be within [0, 1]".to_string(),
        ));
    }
    let sum: f64 = weights.iter().sum();
    if (sum - 1.0).abs() > 0.01 {
        return Err(AppError::Validation(
            "custom_weights must sum to 1.0 (±0.01)".to_string(),
        ));
    }
    Ok(())
}

// ── Engine entry point ──────────────────────────────────────────────

impl AnalyticsEngine {
    pub fn attribution(
        &self,
        ctx: TenantContext,
        funnel_id: i64,
        request: &AttributionRequest,
    ) -> Result<Analyzed<AttributionAnalysis>, AppError> {
        if !(1..=365).contains(&request.lookback_days) {
            return Err(AppError::Validation(
                "lookback_days must be between 1 and 365".to_string(),
            ));
        }
        if request.models.is_empty() {
            return Err(AppError::Validation(
                "at least one attribution model is required".to_string(),
            ));
        }
        if request.models.contains(&AttributionModel::Custom) {
            match &request.custom_weights {
                Some(weights) => validate_custom_weights(weights)?,
                None => {
                    return Err(AppError::Validation(
                        "custom model requires custom_weights".to_string(),
                    ));
                }
            }
        }
        if let Some(w) = &request.position_weights
            && (w.first + w.middle + w.last - 1.0).abs() > 0.01
        {
            return Err(AppError::Validation(
                "position_weights must sum to 1.0 (±0.01)".to_string(),
            ));
        }

        let key = Self::funnel_key(
            "funnel:attribution",
            ctx,
            funnel_id,
            &[
                ("end", request.range.end_date.clone()),
                ("halfLife", request.half_life_days.to_string()),
                ("lookback", request.lookback_days.to_string()),
                ("models", format!("{:?}", request.models)),
                ("start", request.range.start_date.clone()),
                ("topN", request.top_n.to_string()),
            ],
        );

        let range = parse_range(&request.range, MAX_EXTENDED_WINDOW_DAYS)?;

        self.run_cached(&key, CacheClass::PathAnalysis, || {
            self.compute_attribution(ctx, funnel_id, request, range)
        })
    }

    fn compute_attribution(
        &self,
        ctx: TenantContext,
        funnel_id: i64,
        request: &AttributionRequest,
        range: DateRange,
    ) -> Result<AttributionAnalysis, AppError> {
        let (funnel, _definition) = self.resolve_funnel(ctx, funnel_id)?;

        let rows =
            journeys::touchpoint_events(self.pool(), ctx, funnel_id, range, request.lookback_days)?;
        let journeys = assemble_touchpoint_journeys(&rows);

        let config = ModelConfig {
            half_life_days: request.half_life_days,
            position_weights: request.position_weights.unwrap_or_default(),
            custom_weights: request.custom_weights.clone(),
        };

        let models: Vec<ModelResult> = request
            .models
            .iter()
            .map(|model| aggregate_model(*model, &journeys, &config, request.top_n))
            .collect();

        Ok(AttributionAnalysis {
            funnel_id: format_id(IdKind::Funnel, funnel_id),
            funnel_name: funnel.name,
            date_range: range.into(),
            lookback_days: request.lookback_days,
            total_conversions: journeys.len(),
            model_agreement: model_agreement(&models),
            journey_complexity: journey_complexity(&journeys),
            models,
        })
    }
}

// ── Aggregation ─────────────────────────────────────────────────────

pub(crate) fn aggregate_model(
    model: AttributionModel,
    journeys: &[TouchpointJourney],
    config: &ModelConfig,
    top_n: usize,
) -> ModelResult {
    let mut credit_by_id: BTreeMap<String, (Channel, f64, usize)> = BTreeMap::new();
    let mut by_position = CreditByPosition { first: 0.0, middle: 0.0, last: 0.0 };
    let mut by_stage = CreditByStage { early: 0.0, mid: 0.0, late: 0.0 };

    for journey in journeys {
        let credits = model_credits(model, journey, config);
        let k = journey.touchpoints.len();

        for (i, (touchpoint, credit)) in journey.touchpoints.iter().zip(&credits).enumerate() {
            let entry = credit_by_id
                .entry(touchpoint.id.clone())
                .or_insert((touchpoint.channel, 0.0, 0));
            entry.1 += credit;
            entry.2 += 1;

            if i == 0 {
                by_position.first += credit;
            } else if i == k - 1 {
                by_position.last += credit;
            } else {
                by_position.middle += credit;
            }

            // Journey thirds: early / mid / late stage of the journey.
            let stage = i * 3 / k.max(1);
            match stage {
                0 => by_stage.early += credit,
                1 => by_stage.mid += credit,
                _ => by_stage.late += credit,
            }
        }
    }

    let total_credit: f64 = credit_by_id.values().map(|(_, credit, _)| credit).sum();

    let mut touchpoints: Vec<TouchpointCredit> = credit_by_id
        .into_iter()
        .map(|(id, (channel, credit, touched))| TouchpointCredit {
            touchpoint_id: id,
            channel,
            credit: stats::round2(credit),
            share_percent: if total_credit > 0.0 {
                stats::round2(credit / total_credit * 100.0)
            } else {
                0.0
            },
            conversions_touched: touched,
        })
        .collect();
    touchpoints.sort_by(|a, b| b.credit.total_cmp(&a.credit).then(a.touchpoint_id.cmp(&b.touchpoint_id)));
    touchpoints.truncate(top_n);

    ModelResult {
        model,
        touchpoints,
        credit_by_position: CreditByPosition {
            first: stats::round2(by_position.first),
            middle: stats::round2(by_position.middle),
            last: stats::round2(by_position.last),
        },
        credit_by_stage: CreditByStage {
            early: stats::round2(by_stage.early),
            mid: stats::round2(by_stage.mid),
            late: stats::round2(by_stage.late),
        },
    }
}

/// Kendall tau-a between two credit rankings over the union of touchpoints,
/// mapped from [-1, 1] into [0, 1].
fn kendall_agreement(a: &ModelResult, b: &ModelResult) -> f64 {
    let mut ids: Vec<&str> = a
        .touchpoints
        .iter()
        .chain(&b.touchpoints)
        .map(|t| t.touchpoint_id.as_str())
        .collect();
    ids.sort_unstable();
    ids.dedup();

    if ids.len() < 2 {
        return 1.0;
    }

    let credit_in = |result: &ModelResult, id: &str| -> f64 {
        result
            .touchpoints
            .iter()
            .find(|t| t.touchpoint_id == id)
            .map(|t| t.credit)
            .unwrap_or(0.0)
    };

    let mut concordant = 0i64;
    let mut discordant = 0i64;
    for i in 0..ids.len() {
        for j in (i + 1)..ids.len() {
            let da = credit_in(a, ids[i]) - credit_in(a, ids[j]);
            let db = credit_in(b, ids[i]) - credit_in(b, ids[j]);
            let product = da * db;
            if product > 0.0 {
                concordant += 1;
            } else if product < 0.0 {
                discordant += 1;
            }
        }
    }

    let pairs = (ids.len() * (ids.len() - 1) / 2) as f64;
    let tau = (concordant - discordant) as f64 / pairs;
    ((tau + 1.0) / 2.0).clamp(0.0, 1.0)
}

pub(crate) fn model_agreement(models: &[ModelResult]) -> f64 {
    if models.len() < 2 {
        return 1.0;
    }

    let mut total = 0.0;
    let mut pairs = 0usize;
    for i in 0..models.len() {
        for j in (i + 1)..models.len() {
            total += kendall_agreement(&models[i], &models[j]);
            pairs += 1;
        }
    }
    stats::round2(total / pairs as f64)
}

pub(crate) fn journey_complexity(journeys: &[TouchpointJourney]) -> JourneyComplexity {
    if journeys.is_empty() {
        return JourneyComplexity {
            avg_touchpoints: 0.0,
            avg_duration_days: 0.0,
            multi_channel_percent: 0.0,
        };
    }

    let touchpoint_counts: Vec<f64> = journeys.iter().map(|j| j.touchpoints.len() as f64).collect();

    let durations: Vec<f64> = journeys
        .iter()
        .filter_map(|j| {
            j.touchpoints.first().map(|first| {
                (j.converted_at - first.occurred_at).num_seconds().max(0) as f64 / 86_400.0
            })
        })
        .collect();

    let multi_channel = journeys
        .iter()
        .filter(|j| {
            let mut channels: Vec<Channel> = j.touchpoints.iter().map(|t| t.channel).collect();
            channels.sort_unstable();
            channels.dedup();
            channels.len() > 1
        })
        .count();

    JourneyComplexity {
        avg_touchpoints: stats::round2(stats::mean(&touchpoint_counts)),
        avg_duration_days: stats::round2(stats::mean(&durations)),
        multi_channel_percent: stats::round2(multi_channel as f64 / journeys.len() as f64 * 100.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, hour, 0, 0).unwrap()
    }

    fn config() -> ModelConfig {
        ModelConfig {
            half_life_days: 7.0,
            position_weights: PositionWeights::default(),
            custom_weights: None,
        }
    }

    // Journey with three channels: google/cpc, direct, fb/social, all on
    // the same day, ending in a conversion.
    fn scenario_journey() -> TouchpointJourney {
        TouchpointJourney {
            touchpoints: vec![
                Touchpoint {
                    id: "paid_search_google_cpc".to_string(),
                    channel: Channel::PaidSearch,
                    occurred_at: ts(9),
                },
                Touchpoint {
                    id: "direct_direct_none".to_string(),
                    channel: Channel::Direct,
                    occurred_at: ts(12),
                },
                Touchpoint {
                    id: "social_fb_social".to_string(),
                    channel: Channel::Social,
                    occurred_at: ts(15),
                },
            ],
            converted_at: ts(16),
        }
    }

    fn assert_conserved(credits: &[f64]) {
        let total: f64 = credits.iter().sum();
        assert!((total - 1.0).abs() <= 1e-6, "credits sum to {total}");
    }

    #[test]
    fn first_and_last_touch() {
        let journey = scenario_journey();
        let first = model_credits(AttributionModel::FirstTouch, &journey, &config());
        assert_eq!(first, vec![1.0, 0.0, 0.0]);
        let last = model_credits(AttributionModel::LastTouch, &journey, &config());
        assert_eq!(last, vec![0.0, 0.0, 1.0]);
    }

    #[test]
    fn linear_splits_evenly() {
        let credits = model_credits(AttributionModel::Linear, &scenario_journey(), &config());
        assert_conserved(&credits);
        for credit in &credits {
            assert!((credit - 1.0 / 3.0).abs() < 1e-9);
        }
    }

    #[test]
    fn time_decay_same_day_is_nearly_even() {
        let credits = model_credits(AttributionModel::TimeDecay, &scenario_journey(), &config());
        assert_conserved(&credits);
        // All touches within hours of conversion with a 7-day half-life:
        // weights are all ~1 and normalize to ~1/3.
        for credit in &credits {
            assert!((credit - 1.0 / 3.0).abs() < 0.02);
        }
        // Later touches never get less than earlier ones.
        assert!(credits[2] >= credits[0]);
    }

    #[test]
    fn time_decay_halves_per_half_life() {
        let journey = TouchpointJourney {
            touchpoints: vec![
                Touchpoint {
                    id: "a".to_string(),
                    channel: Channel::Direct,
                    occurred_at: ts(12) - chrono::Duration::days(7),
                },
                Touchpoint { id: "b".to_string(), channel: Channel::Direct, occurred_at: ts(12) },
            ],
            converted_at: ts(12),
        };
        let credits = model_credits(AttributionModel::TimeDecay, &journey, &config());
        assert_conserved(&credits);
        // Old touch carries weight 0.5 against 1.0.
        assert!((credits[0] - 1.0 / 3.0).abs() < 1e-6);
        assert!((credits[1] - 2.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn position_based_forty_twenty_forty() {
        let credits = model_credits(AttributionModel::PositionBased, &scenario_journey(), &config());
        assert_conserved(&credits);
        assert!((credits[0] - 0.4).abs() < 1e-9);
        assert!((credits[1] - 0.2).abs() < 1e-9);
        assert!((credits[2] - 0.4).abs() < 1e-9);
    }

    #[test]
    fn single_touchpoint_gets_everything_in_all_models() {
        let journey = TouchpointJourney {
            touchpoints: vec![Touchpoint {
                id: "only".to_string(),
                channel: Channel::Direct,
                occurred_at: ts(10),
            }],
            converted_at: ts(12),
        };

        for model in default_models() {
            assert_eq!(model_credits(model, &journey, &config()), vec![1.0]);
        }
    }

    #[test]
    fn custom_weights_validation() {
        assert!(validate_custom_weights(&[0.5, 0.3, 0.2]).is_ok());
        assert!(validate_custom_weights(&[0.5, 0.6]).is_err());
        assert!(validate_custom_weights(&[1.2, -0.2]).is_err());
        assert!(validate_custom_weights(&[]).is_err());
    }

    #[test]
    fn channel_classification() {
        assert_eq!(classify_channel(Some("google"), Some("cpc"), None), Channel::PaidSearch);
        assert_eq!(classify_channel(Some("fb"), Some("social"), None), Channel::Social);
        assert_eq!(
            classify_channel(None, None, Some("https://www.google.com/search")),
            Channel::OrganicSearch
        );
        assert_eq!(
            classify_channel(None, None, Some("https://news.ycombinator.com")),
            Channel::Referral
        );
        assert_eq!(classify_channel(None, None, None), Channel::Direct);
    }

    #[test]
    fn aggregation_shares_sum_to_hundred() {
        let journeys = vec![scenario_journey(), scenario_journey()];
        let result = aggregate_model(AttributionModel::Linear, &journeys, &config(), 10);

        let share_total: f64 = result.touchpoints.iter().map(|t| t.share_percent).sum();
        assert!((share_total - 100.0).abs() < 0.1);

        let position_total = result.credit_by_position.first
            + result.credit_by_position.middle
            + result.credit_by_position.last;
        assert!((position_total - 2.0).abs() < 0.01);
    }

    #[test]
    fn agreement_is_bounded_and_high_for_identical_models() {
        let journeys = vec![scenario_journey()];
        let a = aggregate_model(AttributionModel::Linear, &journeys, &config(), 10);
        let b = aggregate_model(AttributionModel::Linear, &journeys, &config(), 10);
        let c = aggregate_model(AttributionModel::FirstTouch, &journeys, &config(), 10);

        let same = model_agreement(&[a.clone(), b]);
        let different = model_agreement(&[a, c]);
        assert!(same >= different);
        assert!((0.0..=1.0).contains(&different));
    }

    #[test]
    fn complexity_metrics() {
        let journeys = vec![scenario_journey()];
        let complexity = journey_complexity(&journeys);
        assert_eq!(complexity.avg_touchpoints, 3.0);
        assert_eq!(complexity.multi_channel_percent, 100.0);
        assert!(complexity.avg_duration_days < 1.0);
    }
}
