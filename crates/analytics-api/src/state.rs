use std::sync::Arc;

use funnelcast_common::cache::AnalyticsCache;
use funnelcast_common::config::AnalyticsConfig;
use funnelcast_common::db::DbPool;
use funnelcast_tracker::TrackerHandle;

use crate::export::ExportManager;
use crate::orchestrator::Orchestrator;

#[derive(Clone)]
pub struct AppState {
    pub db_pool: DbPool,
    pub cache: Arc<AnalyticsCache>,
    pub orchestrator: Orchestrator,
    pub export_manager: ExportManager,
    pub tracker: TrackerHandle,
    pub config: Arc<AnalyticsConfig>,
}
