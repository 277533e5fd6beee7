use axum::{
    Router, middleware,
    routing::get,
};

use crate::state::AppState;

async fn plain() -> &'static str { "hi" }

pub fn create_router(state: AppState) -> Router {
    let api_routes = Router::<AppState>::new()
        .route("/health", get(plain))
        .route_layer(middleware::from_fn(crate::middleware::tenant_context::tenant_context))
        .with_state(state.clone());

    Router::new().merge(api_routes)
}
