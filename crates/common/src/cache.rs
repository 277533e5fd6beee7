//! Process-wide analytics cache.
//!
//! One keyed store backs both the domain-shaped funnel cache and generic
//! keyed values. Every entry carries its [`CacheClass`] tag and an absolute
//! expiry; expiry is enforced at read time so a stale entry is never served,
//! even if no sweeper has run.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Fixed TTL classes for cached values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheClass {
    FunnelConfig,
    FunnelList,
    ConversionMetrics,
    DailyMetrics,
    LiveMetrics,
    UserState,
    CohortAnalysis,
    PathAnalysis,
    ExportData,
    Comparison,
}

impl CacheClass {
    pub fn ttl(self) -> Duration {
        match self {
            CacheClass::FunnelConfig => Duration::from_secs(5 * 60),
            CacheClass::FunnelList => Duration::from_secs(2 * 60),
            CacheClass::ConversionMetrics => Duration::from_secs(15 * 60),
            CacheClass::DailyMetrics => Duration::from_secs(60 * 60),
            // Hard ceiling: live metrics must never outlive 30 seconds.
            CacheClass::LiveMetrics => Duration::from_secs(30),
            CacheClass::UserState => Duration::from_secs(60),
            CacheClass::CohortAnalysis => Duration::from_secs(60 * 60),
            CacheClass::PathAnalysis => Duration::from_secs(30 * 60),
            CacheClass::ExportData => Duration::from_secs(5 * 60),
            CacheClass::Comparison => Duration::from_secs(30 * 60),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CacheClass::FunnelConfig => "funnel_config",
            CacheClass::FunnelList => "funnel_list",
            CacheClass::ConversionMetrics => "conversion_metrics",
            CacheClass::DailyMetrics => "daily_metrics",
            CacheClass::LiveMetrics => "live_metrics",
            CacheClass::UserState => "user_state",
            CacheClass::CohortAnalysis => "cohort_analysis",
            CacheClass::PathAnalysis => "path_analysis",
            CacheClass::ExportData => "export_data",
            CacheClass::Comparison => "comparison",
        }
    }
}

#[derive(Debug)]
struct CacheEntry {
    payload: serde_json::Value,
    #[allow(dead_code)]
    class: CacheClass,
    expires_at: Instant,
}

/// Keyed TTL cache shared by the analytics engine, the funnel store, and the
/// realtime tracker. Clone-cheap via `Arc` in callers; `DashMap` shards the
/// lock internally.
#[derive(Debug, Default)]
pub struct AnalyticsCache {
    entries: DashMap<String, CacheEntry>,
}

impl AnalyticsCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn append_sorted_params(key: &mut String, params: &[(&str, String)]) {
        let mut pairs: Vec<&(&str, String)> = params.iter().collect();
        pairs.sort_by(|a, b| a.0.cmp(b.0));

        for (name, value) in pairs {
            key.push(':');
            key.push_str(name);
            key.push('=');
            key.push_str(value);
        }
    }

    /// Builds a deterministic cache key: `category:k1=v1:k2=v2` with pairs
    /// sorted by key name.
    pub fn key_for(category: &str, params: &[(&str, String)]) -> String {
        let mut key = String::from(category);
        Self::append_sorted_params(&mut key, params);
        key
    }

    /// Leading segment of every workspace-scoped key. The scope is a fixed
    /// prefix, never mixed into the sorted request params, so invalidation
    /// can match it without knowing which params a request carried.
    pub fn workspace_scope_prefix(category: &str, tenant_id: i64, workspace_id: i64) -> String {
        format!("{category}:tenantId={tenant_id}:workspaceId={workspace_id}")
    }

    /// Workspace-scoped key: fixed scope prefix plus sorted request params.
    pub fn workspace_scoped_key(
        category: &str,
        tenant_id: i64,
        workspace_id: i64,
        params: &[(&str, String)],
    ) -> String {
        let mut key = Self::workspace_scope_prefix(category, tenant_id, workspace_id);
        Self::append_sorted_params(&mut key, params);
        key
    }

    /// Leading segment of every funnel-scoped key.
    pub fn funnel_scope_prefix(
        category: &str,
        funnel_id: i64,
        tenant_id: i64,
        workspace_id: i64,
    ) -> String {
        format!("{category}:funnelId={funnel_id}:tenantId={tenant_id}:workspaceId={workspace_id}")
    }

    /// Funnel-scoped key: fixed scope prefix plus sorted request params.
    pub fn funnel_scoped_key(
        category: &str,
        funnel_id: i64,
        tenant_id: i64,
        workspace_id: i64,
        params: &[(&str, String)],
    ) -> String {
        let mut key = Self::funnel_scope_prefix(category, funnel_id, tenant_id, workspace_id);
        Self::append_sorted_params(&mut key, params);
        key
    }

    /// Typed read. Expired entries are removed and reported as a miss.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let expired = {
            let entry = self.entries.get(key)?;
            if entry.expires_at <= Instant::now() {
                true
            } else {
                return serde_json::from_value(entry.payload.clone()).ok();
            }
        };

        if expired {
            self.entries.remove(key);
        }
        None
    }

    /// Typed write using the class's fixed TTL.
    pub fn set<T: Serialize>(&self, key: &str, value: &T, class: CacheClass) {
        self.set_with_ttl(key, value, class, class.ttl());
    }

    /// Typed write with an explicit TTL. Live-metrics entries are clamped to
    /// the class ceiling. A `null` payload with a zero TTL is the deletion
    /// sentinel. Serialization failures degrade to a no-op; the cache never
    /// fails a request.
    pub fn set_with_ttl<T: Serialize>(&self, key: &str, value: &T, class: CacheClass, ttl: Duration) {
        let Ok(payload) = serde_json::to_value(value) else {
            tracing::warn!(key, "failed to serialise cache payload, skipping");
            return;
        };

        if payload.is_null() && ttl.is_zero() {
            self.entries.remove(key);
            return;
        }

        let ttl = if class == CacheClass::LiveMetrics {
            ttl.min(class.ttl())
        } else {
            ttl
        };

        self.entries.insert(
            key.to_string(),
            CacheEntry {
                payload,
                class,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn delete(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Removes every entry whose key starts with `prefix`.
    pub fn invalidate_prefix(&self, prefix: &str) {
        self.entries.retain(|key, _| !key.starts_with(prefix));
    }

    /// Drops everything derived from one funnel: its config, conversion and
    /// live entries (including request-parameterised variants) plus the
    /// workspace's funnel list. Matches on the fixed scope prefix, so it
    /// catches keys regardless of which request params they carry.
    pub fn invalidate_funnel(&self, funnel_id: i64, tenant_id: i64, workspace_id: i64) {
        for category in ["funnel:config", "funnel:conversion", "funnel:live"] {
            let prefix = Self::funnel_scope_prefix(category, funnel_id, tenant_id, workspace_id);
            self.entries.remove(&prefix);
            self.invalidate_prefix(&prefix);
        }

        let list_prefix = Self::workspace_scope_prefix("funnel:list", tenant_id, workspace_id);
        self.invalidate_prefix(&list_prefix);
    }

    /// TTL the given class applies to new entries; callers use this to keep
    /// `cache_duration_seconds` in responses accurate.
    pub fn ttl(class: CacheClass) -> Duration {
        class.ttl()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Domain-shaped view over the shared cache used by the realtime tracker.
#[derive(Debug, Clone)]
pub struct FunnelCache {
    inner: Arc<AnalyticsCache>,
}

impl FunnelCache {
    pub fn new(inner: Arc<AnalyticsCache>) -> Self {
        Self { inner }
    }

    pub fn user_state_key(tenant_id: i64, workspace_id: i64, funnel_id: i64, anonymous_id: &str) -> String {
        AnalyticsCache::funnel_scoped_key(
            "user_state",
            funnel_id,
            tenant_id,
            workspace_id,
            &[("anonymousId", anonymous_id.to_string())],
        )
    }

    pub fn get_user_state<T: DeserializeOwned>(
        &self,
        tenant_id: i64,
        workspace_id: i64,
        funnel_id: i64,
        anonymous_id: &str,
    ) -> Option<T> {
        self.inner
            .get(&Self::user_state_key(tenant_id, workspace_id, funnel_id, anonymous_id))
    }

    pub fn put_user_state<T: Serialize>(
        &self,
        tenant_id: i64,
        workspace_id: i64,
        funnel_id: i64,
        anonymous_id: &str,
        state: &T,
    ) {
        self.inner.set(
            &Self::user_state_key(tenant_id, workspace_id, funnel_id, anonymous_id),
            state,
            CacheClass::UserState,
        );
    }

    /// Invalidates the live-metrics entries for a funnel after a significant
    /// realtime transition.
    pub fn invalidate_live(&self, tenant_id: i64, workspace_id: i64, funnel_id: i64) {
        let prefix =
            AnalyticsCache::funnel_scope_prefix("funnel:live", funnel_id, tenant_id, workspace_id);
        self.inner.delete(&prefix);
        self.inner.invalidate_prefix(&prefix);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_for_sorts_params() {
        let key = AnalyticsCache::key_for(
            "funnel:conversion",
            &[
                ("workspaceId", "2".to_string()),
                ("funnelId", "9".to_string()),
                ("tenantId", "1".to_string()),
            ],
        );
        assert_eq!(key, "funnel:conversion:funnelId=9:tenantId=1:workspaceId=2");
    }

    #[test]
    fn scoped_keys_lead_with_the_scope() {
        // Request params that sort alphabetically before "funnelId" must not
        // displace the scope segment, or prefix invalidation cannot find
        // the entry.
        let key = AnalyticsCache::funnel_scoped_key(
            "funnel:conversion",
            9,
            1,
            2,
            &[
                ("start", "2025-03-01".to_string()),
                ("end", "2025-03-31".to_string()),
            ],
        );
        assert_eq!(
            key,
            "funnel:conversion:funnelId=9:tenantId=1:workspaceId=2:end=2025-03-31:start=2025-03-01"
        );
        assert!(key.starts_with(&AnalyticsCache::funnel_scope_prefix("funnel:conversion", 9, 1, 2)));

        let list_key = AnalyticsCache::workspace_scoped_key(
            "funnel:list",
            1,
            2,
            &[("limit", "20".to_string()), ("page", "1".to_string())],
        );
        assert!(list_key.starts_with(&AnalyticsCache::workspace_scope_prefix("funnel:list", 1, 2)));
    }

    #[test]
    fn typed_round_trip() {
        let cache = AnalyticsCache::new();
        cache.set("k", &vec![1u32, 2, 3], CacheClass::ConversionMetrics);
        let got: Vec<u32> = cache.get("k").unwrap();
        assert_eq!(got, vec![1, 2, 3]);
    }

    #[test]
    fn expired_entries_are_never_served() {
        let cache = AnalyticsCache::new();
        cache.set_with_ttl("k", &1u32, CacheClass::LiveMetrics, Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.get::<u32>("k"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn live_metrics_ttl_is_clamped() {
        let cache = AnalyticsCache::new();
        // Requesting a longer TTL than the live ceiling must not extend it;
        // we can only observe the clamp indirectly, so assert the entry is
        // still readable right away.
        cache.set_with_ttl("live", &7u32, CacheClass::LiveMetrics, Duration::from_secs(600));
        assert_eq!(cache.get::<u32>("live"), Some(7));
    }

    #[test]
    fn null_with_zero_ttl_deletes() {
        let cache = AnalyticsCache::new();
        cache.set("k", &42u32, CacheClass::UserState);
        cache.set_with_ttl("k", &serde_json::Value::Null, CacheClass::UserState, Duration::ZERO);
        assert_eq!(cache.get::<u32>("k"), None);
    }

    #[test]
    fn invalidate_funnel_scopes_to_one_funnel() {
        let cache = AnalyticsCache::new();
        // Keys carry request params, the way the analytics engine builds
        // them; invalidation must still catch them via the scope prefix.
        let scoped = |fid: i64| {
            AnalyticsCache::funnel_scoped_key(
                "funnel:conversion",
                fid,
                1,
                2,
                &[
                    ("end", "2025-03-31".to_string()),
                    ("segments", "true".to_string()),
                    ("start", "2025-03-01".to_string()),
                ],
            )
        };
        let list_key = AnalyticsCache::workspace_scoped_key(
            "funnel:list",
            1,
            2,
            &[("limit", "20".to_string()), ("page", "1".to_string())],
        );
        let config_key = AnalyticsCache::funnel_scoped_key("funnel:config", 9, 1, 2, &[]);

        cache.set(&scoped(9), &1u32, CacheClass::ConversionMetrics);
        cache.set(&scoped(10), &2u32, CacheClass::ConversionMetrics);
        cache.set(&list_key, &3u32, CacheClass::FunnelList);
        cache.set(&config_key, &4u32, CacheClass::FunnelConfig);

        cache.invalidate_funnel(9, 1, 2);

        assert_eq!(cache.get::<u32>(&scoped(9)), None);
        assert_eq!(cache.get::<u32>(&config_key), None);
        assert_eq!(cache.get::<u32>(&list_key), None);
        // Another funnel's entries survive.
        assert_eq!(cache.get::<u32>(&scoped(10)), Some(2));
    }
}
