//! Live funnel counters: active sessions, trailing-hour volumes, step
//! distribution, per-minute trends and realtime anomaly signals.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use funnelcast_common::cache::CacheClass;
use funnelcast_common::error::AppError;
use funnelcast_common::ids::{IdKind, format_id};
use funnelcast_common::tenant::TenantContext;

use crate::analytics::engine::{Analyzed, AnalyticsEngine};
use crate::analytics::stats;
use crate::repository::{DateRange, live, steps};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveAnalysis {
    pub funnel_id: String,
    pub funnel_name: String,
    pub basic: LiveBasics,
    pub step_distribution: Vec<LiveStep>,
    pub minute_trends: Vec<MinutePoint>,
    pub anomalies: LiveAnomalies,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveBasics {
    pub active_sessions: i64,
    pub entries_last_hour: i64,
    pub conversions_last_hour: i64,
    pub current_conversion_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveStep {
    pub step_order: i32,
    pub label: String,
    pub users: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinutePoint {
    pub bucket: DateTime<Utc>,
    pub entries: i64,
    pub conversions: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveAnomalies {
    pub rate_last_24h: f64,
    pub conversion_rate_change_percent: f64,
    pub stuck_steps: Vec<StuckStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StuckStep {
    pub step_order: i32,
    pub label: String,
    pub stuck_users: i64,
}

impl AnalyticsEngine {
    pub fn live(&self, ctx: TenantContext, funnel_id: i64) -> Result<Analyzed<LiveAnalysis>, AppError> {
        let key = Self::funnel_key("funnel:live", ctx, funnel_id, &[]);

        self.run_cached(&key, CacheClass::LiveMetrics, || {
            self.compute_live(ctx, funnel_id, Utc::now())
        })
    }

    fn compute_live(
        &self,
        ctx: TenantContext,
        funnel_id: i64,
        now: DateTime<Utc>,
    ) -> Result<LiveAnalysis, AppError> {
        let (funnel, definition) = self.resolve_funnel(ctx, funnel_id)?;

        let basic = live::live_basic(self.pool(), ctx, funnel_id, now)?;
        let distribution = live::active_step_distribution(self.pool(), ctx, funnel_id, now)?;
        let trends = live::minute_trend(self.pool(), ctx, funnel_id, now)?;
        let stuck = live::stuck_users_by_step(self.pool(), ctx, funnel_id, now)?;

        let day_totals = steps::funnel_totals(
            self.pool(),
            ctx,
            funnel_id,
            DateRange { start: now - chrono::Duration::hours(24), end: now },
        )?;

        let current_rate = if basic.entries_last_hour > 0 {
            basic.conversions_last_hour as f64 / basic.entries_last_hour as f64 * 100.0
        } else {
            0.0
        };
        let rate_24h = if day_totals.entries > 0 {
            day_totals.conversions as f64 / day_totals.entries as f64 * 100.0
        } else {
            0.0
        };
        let change = if rate_24h > 0.0 {
            (current_rate - rate_24h) / rate_24h * 100.0
        } else {
            0.0
        };

        let label_of = |order: i32| {
            definition
                .step(order)
                .map(|s| s.label.clone())
                .unwrap_or_else(|| format!("step {order}"))
        };

        Ok(LiveAnalysis {
            funnel_id: format_id(IdKind::Funnel, funnel_id),
            funnel_name: funnel.name,
            basic: LiveBasics {
                active_sessions: basic.active_sessions,
                entries_last_hour: basic.entries_last_hour,
                conversions_last_hour: basic.conversions_last_hour,
                current_conversion_rate: stats::round2(current_rate),
            },
            step_distribution: distribution
                .into_iter()
                .map(|row| LiveStep {
                    step_order: row.step_order,
                    label: label_of(row.step_order),
                    users: row.users,
                })
                .collect(),
            minute_trends: trends
                .into_iter()
                .map(|row| MinutePoint {
                    bucket: row.bucket,
                    entries: row.entries,
                    conversions: row.conversions,
                })
                .collect(),
            anomalies: LiveAnomalies {
                rate_last_24h: stats::round2(rate_24h),
                conversion_rate_change_percent: stats::round2(change),
                stuck_steps: stuck
                    .into_iter()
                    .map(|row| StuckStep {
                        step_order: row.step_order,
                        label: label_of(row.step_order),
                        stuck_users: row.stuck_users,
                    })
                    .collect(),
            },
        })
    }
}
