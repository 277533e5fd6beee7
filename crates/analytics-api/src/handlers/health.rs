use std::collections::HashMap;
use std::time::Instant;

use axum::{Json, extract::State, response::IntoResponse};

use funnelcast_common::error::AppError;
use funnelcast_common::health::HealthStatus;

use crate::state::AppState;

static START_TIME: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

/// Call once at startup to record the boot time.
pub fn record_start_time() {
    START_TIME.get_or_init(Instant::now);
}

pub async fn health(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let mut deps = HashMap::new();

    // Check Postgres
    let pg_status = {
        let pool = state.db_pool.clone();
        match pool.get() {
            Ok(mut conn) => {
                use diesel::prelude::*;
                use diesel::sql_query;
                match sql_query("SELECT 1").execute(&mut conn) {
                    Ok(_) => "ok".to_string(),
                    Err(e) => format!("error: {}", e),
                }
            }
            Err(e) => format!("error: {}", e),
        }
    };
    deps.insert("postgres".to_string(), pg_status);

    deps.insert("cache_entries".to_string(), state.cache.len().to_string());

    let all_ok = deps.get("postgres").is_some_and(|v| v == "ok");

    let uptime = START_TIME.get().map(|t| t.elapsed().as_secs()).unwrap_or(0);

    let status = HealthStatus {
        status: if all_ok {
            "healthy".to_string()
        } else {
            "degraded".to_string()
        },
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: uptime,
        dependencies: deps,
    };

    Ok(Json(status))
}
