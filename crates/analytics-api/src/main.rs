mod analytics;
mod db;
mod export;
mod handlers;
mod middleware;
mod orchestrator;
mod repository;
mod routes;
mod state;

use std::sync::Arc;
use std::time::Duration;

use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use funnelcast_common::cache::AnalyticsCache;
use funnelcast_common::config::AnalyticsConfig;
use funnelcast_common::db::create_pool;
use funnelcast_common::funnel::{StepDefinition, StepMatchRule, StepType};
use funnelcast_common::telemetry::init_telemetry;
use funnelcast_common::tenant::TenantContext;
use funnelcast_tracker::TrackerWorker;

use crate::analytics::AnalyticsEngine;
use crate::export::manager::{ExportConfig, LogNotifier};
use crate::export::{ExportManager, ExportWorker};
use crate::orchestrator::Orchestrator;
use crate::state::AppState;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("../../migrations");

fn run_migrations(pool: &funnelcast_common::db::DbPool) {
    let mut conn = pool
        .get()
        .expect("Failed to get DB connection for migrations");
    conn.run_pending_migrations(MIGRATIONS)
        .expect("Failed to run database migrations");
    info!("Database migrations completed successfully");
}

fn build_cors_layer(config: &AnalyticsConfig) -> CorsLayer {
    use axum::http::{Method, header};

    let origins = &config.cors_allowed_origins;

    let allow_origin = if origins == "*" {
        AllowOrigin::any()
    } else {
        let parsed: Vec<_> = origins
            .split(',')
            .filter_map(|s| s.trim().parse().ok())
            .collect();
        AllowOrigin::list(parsed)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
}

/// Demo data for local development: a published three-step purchase funnel
/// under tenant 1 / workspace 1.
fn seed(pool: &funnelcast_common::db::DbPool) -> anyhow::Result<()> {
    info!("Running seed...");

    let ctx = TenantContext::new(1, 1);
    let step = |order: i32, step_type: StepType, label: &str, rule: StepMatchRule| StepDefinition {
        order_index: order,
        step_type,
        label: label.to_string(),
        metadata: None,
        matches: vec![rule],
    };

    let detail = db::funnels::create_funnel(
        pool,
        ctx,
        db::funnels::NewFunnelInput {
            name: "Purchase funnel".to_string(),
            description: Some("Seeded demo funnel".to_string()),
            steps: vec![
                step(0, StepType::Start, "Landing", StepMatchRule::EventName { value: "begin".to_string() }),
                step(1, StepType::Page, "Checkout", StepMatchRule::PageUrl { pattern: "/checkout".to_string() }),
                step(2, StepType::Conversion, "Purchase", StepMatchRule::EventName { value: "purchase".to_string() }),
            ],
        },
    )?;
    info!("Created funnel: {} (fn_{})", detail.funnel.name, detail.funnel.id);

    let publication = db::funnels::publish_funnel(pool, ctx, detail.funnel.id, 1, 30, None)?;
    info!("Published version 1 (publication fp_{})", publication.id);

    info!("Seed completed");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Load config
    let config = AnalyticsConfig::from_env()?;

    // Init telemetry
    init_telemetry("analytics-api");

    info!("Starting analytics-api");

    // Create DB pool
    let db_pool = create_pool(&config.database_url, config.db_disable_prepared_statements)?;

    // Run migrations
    run_migrations(&db_pool);

    // Check for --seed argument
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--seed") {
        seed(&db_pool)?;
        return Ok(());
    }

    // Process-wide analytics cache shared by the engine, the export worker
    // and the realtime tracker.
    let cache = Arc::new(AnalyticsCache::new());
    let engine = AnalyticsEngine::new(db_pool.clone(), Arc::clone(&cache));

    // Shutdown signal fan-out for the background workers.
    let (cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);

    // Realtime tracker
    let (tracker_handle, tracker_worker, _tracker_metrics) = TrackerWorker::new(
        db_pool.clone(),
        Arc::clone(&cache),
        config.tracker_channel_capacity,
        Duration::from_secs(config.funnel_cache_ttl_secs),
    );
    let tracker_task = tokio::spawn(tracker_worker.run(cancel_rx.clone()));

    // Export manager + worker
    let export_config = ExportConfig {
        directory: config.export_directory.clone(),
        download_base_url: config.export_download_base_url.clone(),
    };
    let (export_manager, export_receiver) = ExportManager::new(db_pool.clone(), export_config.clone());
    let export_worker = ExportWorker::new(
        db_pool.clone(),
        engine.clone(),
        export_receiver,
        export_config,
        Arc::new(LogNotifier),
    );
    let export_task = tokio::spawn(export_worker.run(cancel_rx.clone()));

    // Orchestrator with the per-request deadline
    let orchestrator = Orchestrator::new(
        engine.clone(),
        db_pool.clone(),
        Duration::from_secs(config.request_timeout_secs),
    );

    // Build CORS layer
    let cors = build_cors_layer(&config);

    // Record start time for health checks
    handlers::health::record_start_time();

    // Build app state
    let state = AppState {
        db_pool,
        cache,
        orchestrator,
        export_manager,
        tracker: tracker_handle,
        config: Arc::new(config.clone()),
    };

    // Build router
    let app = routes::create_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    // Bind and serve
    let addr = format!("0.0.0.0:{}", config.port());
    info!("Listening on {}", addr);
    let listener = TcpListener::bind(&addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop background workers and let them drain.
    cancel_tx.send(true).ok();
    let _ = tracker_task.await;
    let _ = export_task.await;

    info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install CTRL+C handler");
    info!("Received shutdown signal");
}
