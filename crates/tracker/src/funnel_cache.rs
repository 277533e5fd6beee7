//! In-memory cache of active funnel definitions per workspace.
//!
//! Bounded resource owned by the worker: loaded on first use per
//! `(tenant, workspace)`, refreshed after the TTL, guarded by a
//! reader-writer lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use funnelcast_common::db::DbPool;
use funnelcast_common::error::AppError;
use funnelcast_common::funnel::FunnelDefinition;
use funnelcast_common::tenant::TenantContext;

use crate::store;

struct CachedWorkspace {
    definitions: Arc<Vec<FunnelDefinition>>,
    loaded_at: Instant,
}

pub struct ActiveFunnelCache {
    ttl: Duration,
    entries: RwLock<HashMap<(i64, i64), CachedWorkspace>>,
}

impl ActiveFunnelCache {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, entries: RwLock::new(HashMap::new()) }
    }

    /// Returns the workspace's active definitions, loading from the store
    /// when missing or stale.
    pub async fn get_or_load(
        &self,
        pool: &DbPool,
        ctx: TenantContext,
    ) -> Result<Arc<Vec<FunnelDefinition>>, AppError> {
        let key = (ctx.tenant_id, ctx.workspace_id);

        {
            let entries = self.entries.read().await;
            if let Some(cached) = entries.get(&key)
                && cached.loaded_at.elapsed() < self.ttl
            {
                return Ok(Arc::clone(&cached.definitions));
            }
        }

        let definitions = Arc::new(store::load_active_definitions(pool, ctx)?);

        let mut entries = self.entries.write().await;
        entries.insert(
            key,
            CachedWorkspace { definitions: Arc::clone(&definitions), loaded_at: Instant::now() },
        );

        Ok(definitions)
    }

    /// Drops a workspace's cached definitions (used after publish/archive).
    pub async fn invalidate(&self, ctx: TenantContext) {
        let mut entries = self.entries.write().await;
        entries.remove(&(ctx.tenant_id, ctx.workspace_id));
    }
}
