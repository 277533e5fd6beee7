//! Shared analysis envelope.
//!
//! Every analysis goes through the same sequence: build a deterministic cache
//! key, check the cache, validate the window, resolve the funnel, compute,
//! cache the result with the class TTL, and report timing.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use funnelcast_common::cache::{AnalyticsCache, CacheClass};
use funnelcast_common::db::DbPool;
use funnelcast_common::error::AppError;
use funnelcast_common::funnel::FunnelDefinition;
use funnelcast_common::tenant::TenantContext;

use crate::db::funnels as funnel_store;
use crate::db::models::FunnelRow;
use crate::repository::DateRange;

/// Window cap for conversion, drop-off, cohort, timing and path analyses.
pub const MAX_WINDOW_DAYS: i64 = 90;

/// Window cap for attribution and comparison analyses.
pub const MAX_EXTENDED_WINDOW_DAYS: i64 = 180;

/// Response envelope shared by every analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analyzed<T> {
    #[serde(flatten)]
    pub data: T,
    pub cache_hit: bool,
    pub cache_duration_seconds: u64,
    pub processing_time_ms: u64,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AnalyticsEngine {
    pool: DbPool,
    cache: Arc<AnalyticsCache>,
    deadline: Option<Instant>,
}

impl AnalyticsEngine {
    pub fn new(pool: DbPool, cache: Arc<AnalyticsCache>) -> Self {
        Self { pool, cache, deadline: None }
    }

    /// A view of the engine that refuses to start past `deadline` and
    /// abandons cache writes attempted after it.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        Self {
            pool: self.pool.clone(),
            cache: Arc::clone(&self.cache),
            deadline: Some(deadline),
        }
    }

    fn deadline_exceeded(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn cache(&self) -> &Arc<AnalyticsCache> {
        &self.cache
    }

    /// Cache-or-compute. On a hit the stored envelope is returned with
    /// `cache_hit` flipped to true; on a miss the computation runs, is
    /// wrapped with its timing, and is stored under the class TTL.
    pub(crate) fn run_cached<T, F>(
        &self,
        key: &str,
        class: CacheClass,
        compute: F,
    ) -> Result<Analyzed<T>, AppError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T, AppError>,
    {
        if self.deadline_exceeded() {
            return Err(AppError::Timeout("analysis deadline exceeded".to_string()));
        }

        if let Some(mut hit) = self.cache.get::<Analyzed<T>>(key) {
            hit.cache_hit = true;
            return Ok(hit);
        }

        let started = Instant::now();
        let data = compute()?;

        let result = Analyzed {
            data,
            cache_hit: false,
            cache_duration_seconds: class.ttl().as_secs(),
            processing_time_ms: started.elapsed().as_millis() as u64,
            generated_at: Utc::now(),
        };

        // A write after the deadline would outlive the request that paid for
        // it; the caller has already received `timeout`.
        if !self.deadline_exceeded() {
            self.cache.set(key, &result, class);
        }
        Ok(result)
    }

    /// Resolves the definition analytics run against (non-archived,
    /// tenant-scoped, latest publication).
    pub(crate) fn resolve_funnel(
        &self,
        ctx: TenantContext,
        funnel_id: i64,
    ) -> Result<(FunnelRow, FunnelDefinition), AppError> {
        funnel_store::resolve_published(&self.pool, ctx, funnel_id)
    }

    /// Builds the canonical cache key for a funnel-scoped analysis: the
    /// tenant/funnel scope leads as a fixed prefix so
    /// [`AnalyticsCache::invalidate_funnel`] can match it, with the request
    /// params appended after.
    pub(crate) fn funnel_key(
        category: &str,
        ctx: TenantContext,
        funnel_id: i64,
        extra: &[(&str, String)],
    ) -> String {
        AnalyticsCache::funnel_scoped_key(category, funnel_id, ctx.tenant_id, ctx.workspace_id, extra)
    }
}

// ── Window parsing ──────────────────────────────────────────────────

/// Serde shape for a requested analysis window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestedRange {
    pub start_date: String,
    pub end_date: String,
}

fn parse_timestamp(value: &str, end_of_day: bool) -> Result<DateTime<Utc>, AppError> {
    if let Ok(ts) = value.parse::<DateTime<Utc>>() {
        return Ok(ts);
    }
    if let Ok(date) = value.parse::<NaiveDate>() {
        let time = if end_of_day {
            NaiveTime::from_hms_opt(23, 59, 59).unwrap_or_default()
        } else {
            NaiveTime::default()
        };
        return Ok(date.and_time(time).and_utc());
    }
    Err(AppError::Validation(format!(
        "Invalid date `{value}`; expected ISO-8601 timestamp or YYYY-MM-DD"
    )))
}

/// Parses and validates a requested window: both bounds parseable,
/// `start < end`, and span within `max_days`.
pub fn parse_range(range: &RequestedRange, max_days: i64) -> Result<DateRange, AppError> {
    let start = parse_timestamp(&range.start_date, false)?;
    let end = parse_timestamp(&range.end_date, true)?;

    if start >= end {
        return Err(AppError::Validation(
            "start_date must be strictly before end_date".to_string(),
        ));
    }

    if end - start > chrono::Duration::days(max_days) {
        return Err(AppError::Validation(format!(
            "Date range exceeds the maximum of {max_days} days for this analysis"
        )));
    }

    Ok(DateRange { start, end })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranged(start: &str, end: &str) -> RequestedRange {
        RequestedRange {
            start_date: start.to_string(),
            end_date: end.to_string(),
        }
    }

    #[test]
    fn parses_dates_and_timestamps() {
        let range = parse_range(&ranged("2025-03-01", "2025-03-31"), MAX_WINDOW_DAYS).unwrap();
        assert_eq!(range.start.to_rfc3339(), "2025-03-01T00:00:00+00:00");
        assert_eq!(range.end.to_rfc3339(), "2025-03-31T23:59:59+00:00");

        let range = parse_range(
            &ranged("2025-03-01T08:30:00Z", "2025-03-02T08:30:00Z"),
            MAX_WINDOW_DAYS,
        )
        .unwrap();
        assert_eq!(range.duration().num_hours(), 24);
    }

    #[test]
    fn rejects_inverted_range() {
        let err = parse_range(&ranged("2025-03-31", "2025-03-01"), MAX_WINDOW_DAYS).unwrap_err();
        assert_eq!(err.code(), "invalid_schema");
    }

    #[test]
    fn rejects_equal_bounds() {
        let err = parse_range(
            &ranged("2025-03-01T00:00:00Z", "2025-03-01T00:00:00Z"),
            MAX_WINDOW_DAYS,
        )
        .unwrap_err();
        assert_eq!(err.code(), "invalid_schema");
    }

    #[test]
    fn rejects_oversized_window() {
        let err = parse_range(&ranged("2025-01-01", "2025-06-15"), MAX_WINDOW_DAYS).unwrap_err();
        assert_eq!(err.code(), "invalid_schema");
        // The same window is fine under the extended cap.
        assert!(parse_range(&ranged("2025-01-01", "2025-06-15"), MAX_EXTENDED_WINDOW_DAYS).is_ok());
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_range(&ranged("yesterday", "today"), MAX_WINDOW_DAYS).is_err());
    }

    #[test]
    fn previous_window_has_same_duration() {
        let range = parse_range(&ranged("2025-03-11", "2025-03-20"), MAX_WINDOW_DAYS).unwrap();
        let prev = range.previous();
        assert_eq!(prev.end, range.start);
        assert_eq!(prev.duration(), range.duration());
    }
}
